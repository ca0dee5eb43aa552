//! Deterministic fakes for exercising the actor/orchestrator scenarios of
//! §8 without a real chat transport or LLM. Exposed behind the `testing`
//! feature so downstream crates can reuse these fixtures in their own
//! integration tests, mirroring how the teacher inlines fake fixtures in
//! its own test modules.

use crate::actor::{Agent, AgentEvent};
use crate::chat::{ChatAdapter, RateLimitError, SentMessage, SentMessageDyn, Thread, ThreadDyn};
use crate::compaction::Summarizer;
use crate::AgentMessage;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// One post/edit recorded against a [`FakeThread`]/[`FakeSentMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub id: String,
    pub text: String,
}

/// Shared recording surface for a [`FakeChatAdapter`] and everything it hands
/// out, so tests can assert on post/edit/delete order after a run.
#[derive(Clone, Default)]
pub struct FakeChatLog {
    pub posts: Arc<Mutex<Vec<RecordedMessage>>>,
    pub edits: Arc<Mutex<Vec<RecordedMessage>>>,
    pub deletes: Arc<Mutex<Vec<String>>>,
}

/// A chat adapter backed entirely by in-memory state.
pub struct FakeChatAdapter {
    pub name: String,
    pub log: FakeChatLog,
    next_id: Arc<AtomicU64>,
    /// Test hook for S2 (rate-limited edit): message id -> remaining
    /// `RateLimitError` failures before an edit is allowed to succeed.
    pub edit_failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl FakeChatAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: FakeChatLog::default(),
            next_id: Arc::new(AtomicU64::new(0)),
            edit_failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arrange for the next `count` edits against `message_id` to fail with
    /// `RateLimitError` before succeeding.
    pub fn fail_next_edits(&self, message_id: &str, count: u32) {
        self.edit_failures.lock().unwrap().insert(message_id.to_string(), count);
    }

    fn thread(&self, thread_id: &str) -> FakeThread {
        FakeThread {
            thread_id: thread_id.to_string(),
            log: self.log.clone(),
            next_id: self.next_id.clone(),
            edit_failures: self.edit_failures.clone(),
        }
    }
}

impl ChatAdapter for FakeChatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_thread(
        &self,
        thread_id: &str,
    ) -> impl Future<Output = anyhow::Result<Box<dyn ThreadDyn>>> + Send {
        let thread = self.thread(thread_id);
        async move { Ok(Box::new(thread) as Box<dyn ThreadDyn>) }
    }

    fn post_to_channel(
        &self,
        channel_key: &str,
        text: &str,
    ) -> impl Future<Output = anyhow::Result<(String, Box<dyn SentMessageDyn>)>> + Send {
        let thread_id = format!("{channel_key}:auto-thread");
        let thread = self.thread(&thread_id);
        let text = text.to_string();
        async move {
            let sent = Thread::post(&thread, &text).await?;
            Ok((thread_id, sent))
        }
    }
}

/// A thread handle backed by [`FakeChatLog`].
pub struct FakeThread {
    pub thread_id: String,
    log: FakeChatLog,
    next_id: Arc<AtomicU64>,
    edit_failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Thread for FakeThread {
    fn post(&self, text: &str) -> impl Future<Output = anyhow::Result<Box<dyn SentMessageDyn>>> + Send {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let log = self.log.clone();
        let edit_failures = self.edit_failures.clone();
        let text = text.to_string();
        async move {
            log.posts.lock().unwrap().push(RecordedMessage { id: id.clone(), text: text.clone() });
            Ok(Box::new(FakeSentMessage {
                id,
                log,
                edit_failures,
                last_text: Arc::new(Mutex::new(text)),
            }) as Box<dyn SentMessageDyn>)
        }
    }
}

/// A sent-message handle backed by [`FakeChatLog`], with a configurable
/// rate-limit failure countdown for testing `with_transport_retry`.
pub struct FakeSentMessage {
    id: String,
    log: FakeChatLog,
    edit_failures: Arc<Mutex<HashMap<String, u32>>>,
    last_text: Arc<Mutex<String>>,
}

impl SentMessage for FakeSentMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn text(&self) -> impl Future<Output = anyhow::Result<String>> + Send {
        let last_text = self.last_text.clone();
        async move { Ok(last_text.lock().unwrap().clone()) }
    }

    fn edit(&self, text: &str) -> impl Future<Output = anyhow::Result<()>> + Send {
        let id = self.id.clone();
        let log = self.log.clone();
        let edit_failures = self.edit_failures.clone();
        let last_text = self.last_text.clone();
        let text = text.to_string();
        async move {
            let mut failures = edit_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RateLimitError { retry_after_ms: Some(10) }.into());
                }
            }
            drop(failures);
            log.edits.lock().unwrap().push(RecordedMessage { id, text: text.clone() });
            *last_text.lock().unwrap() = text;
            Ok(())
        }
    }

    fn delete(&self) -> impl Future<Output = anyhow::Result<()>> + Send {
        let id = self.id.clone();
        let log = self.log.clone();
        async move {
            log.deletes.lock().unwrap().push(id);
            Ok(())
        }
    }
}

/// A scripted `prompt()` outcome for [`FakeAgent`].
pub enum PromptOutcome {
    /// Succeed, replacing the agent's message list with this value.
    Ok(Vec<AgentMessage>),
    /// Fail `prompt` with this error text.
    Err(String),
}

/// A minimal `Agent` whose `prompt()` behavior is scripted call-by-call,
/// so tests can exercise the actor's drain loop deterministically. Clone
/// shares all inner state, so a factory closure can hand out clones while
/// the test keeps the original for assertions.
#[derive(Clone)]
pub struct FakeAgent {
    messages: Arc<Mutex<Vec<AgentMessage>>>,
    events_tx: broadcast::Sender<AgentEvent>,
    pub prompt_calls: Arc<Mutex<Vec<String>>>,
    pub steer_calls: Arc<Mutex<Vec<String>>>,
    pub abort_calls: Arc<AtomicU64>,
    script: Arc<Mutex<VecDeque<PromptOutcome>>>,
    context_window: Option<u64>,
}

impl FakeAgent {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            events_tx,
            prompt_calls: Arc::new(Mutex::new(Vec::new())),
            steer_calls: Arc::new(Mutex::new(Vec::new())),
            abort_calls: Arc::new(AtomicU64::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            context_window: None,
        }
    }

    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = Some(window);
        self
    }

    /// Queue the outcome of the next `prompt()` call.
    pub fn push_outcome(&self, outcome: PromptOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for FakeAgent {
    fn replace_messages(&self, messages: Vec<AgentMessage>) -> impl Future<Output = ()> + Send {
        let shared = self.messages.clone();
        async move {
            *shared.lock().unwrap() = messages;
        }
    }

    fn prompt(
        &self,
        text: String,
        _images: Vec<(String, String)>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        self.prompt_calls.lock().unwrap().push(text);
        let script = self.script.clone();
        let messages = self.messages.clone();
        async move {
            match script.lock().unwrap().pop_front() {
                Some(PromptOutcome::Ok(msgs)) => {
                    *messages.lock().unwrap() = msgs;
                    Ok(())
                }
                Some(PromptOutcome::Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok(()),
            }
        }
    }

    fn steer(&self, text: String) -> impl Future<Output = ()> + Send {
        self.steer_calls.lock().unwrap().push(text);
        async {}
    }

    fn abort(&self) -> impl Future<Output = ()> + Send {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        async {}
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    fn messages(&self) -> impl Future<Output = Vec<AgentMessage>> + Send {
        let shared = self.messages.clone();
        async move { shared.lock().unwrap().clone() }
    }

    fn context_window(&self) -> Option<u64> {
        self.context_window
    }
}

/// A summarizer that echoes a fixed, recognizable body — sufficient for
/// asserting compaction ran without depending on real LLM output.
pub struct FakeSummarizer;

impl Summarizer for FakeSummarizer {
    fn summarize(&self, prompt: String) -> impl Future<Output = anyhow::Result<String>> + Send {
        async move { Ok(format!("## Goal\nsummary of {} chars", prompt.len())) }
    }
}
