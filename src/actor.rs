//! Thread Actor (§4.5): one actor per thread, serializing prompts through a
//! bounded mailbox while immediate control messages (`steer`/`abort`) bypass
//! it entirely and act on whatever agent is currently live.

use crate::chat::{ChatAdapterDyn, RateLimitError, SentMessageDyn, ThreadDyn};
use crate::compaction::{CompactionEngine, SummarizerDyn};
use crate::config::Settings;
use crate::store::{PromptAttachments, ThreadStore};
use crate::thread_id::{ChannelBoundary, ThreadMeta, parse_thread_id};
use crate::{AgentMessage, AssistantBlock, StopReason};
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// The LLM agent contract consumed per-thread (§6). One concrete
/// implementation exists per deployment, so this is a generic type
/// parameter rather than a trait object — unlike [`ChatAdapter`](crate::chat::ChatAdapter),
/// which varies across platforms within the same process.
pub trait Agent: Send + Sync + 'static {
    fn replace_messages(&self, messages: Vec<AgentMessage>) -> impl Future<Output = ()> + Send;

    /// Run one turn. Failure is reported by returning `Err`, not by an
    /// `AgentEvent` — callers retry once on context-overflow errors.
    fn prompt(
        &self,
        text: String,
        images: Vec<(String, String)>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn steer(&self, text: String) -> impl Future<Output = ()> + Send;

    fn abort(&self) -> impl Future<Output = ()> + Send;

    /// Subscribe to this agent's event stream. Called once per agent
    /// lifetime by [`ThreadActor`], not once per prompt.
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;

    fn messages(&self) -> impl Future<Output = Vec<AgentMessage>> + Send;

    /// The model's context window in tokens, when known. Feeds
    /// `CompactionEngine::should_compact`; agents that can't report this
    /// leave compaction to settings-configured defaults.
    fn context_window(&self) -> Option<u64> {
        None
    }
}

/// Agent events handled while a run is active; everything else collapses to
/// `Other` (§4.5 "others are observed but ignored").
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    ToolExecutionStart {
        tool_name: String,
        label: Option<String>,
    },
    ToolExecutionEnd {
        tool_name: String,
        is_error: bool,
        result_text: String,
    },
    Other,
}

static CONTEXT_OVERFLOW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)context.?length|too long|token.?limit|prompt is too long|exceeds.*context").unwrap()
});

/// Whether a raw error message indicates the model rejected the prompt for
/// exceeding its context window — used both by `describe_error` and by the
/// run loop's compact-then-retry-once logic.
pub fn is_context_overflow_error(message: &str) -> bool {
    CONTEXT_OVERFLOW_PATTERN.is_match(message)
}

type Describe = fn(&str) -> String;

static ERROR_PATTERNS: LazyLock<Vec<(Regex, Describe)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)rate.?limit|429|quota").unwrap(),
            (|_: &str| "I'm being rate-limited by my AI provider. Please try again in a moment.".to_string())
                as Describe,
        ),
        (
            Regex::new(r"(?i)overloaded|503|capacity").unwrap(),
            (|_: &str| "My AI provider is currently overloaded. Please try again shortly.".to_string()) as Describe,
        ),
        (
            Regex::new(r"(?i)timeout|ECONNRESET|ETIMEDOUT|network").unwrap(),
            (|_: &str| "I lost connection to my AI provider. Please try sending your message again.".to_string())
                as Describe,
        ),
        (
            Regex::new(r"(?i)context.?length|too long|token.?limit|prompt is too long|exceeds.*context").unwrap(),
            (|_: &str| {
                "Our conversation got too long for me to process, even after compacting. \
                 Please try again, or start a new thread."
                    .to_string()
            }) as Describe,
        ),
        (
            Regex::new(r"(?i)abort|cancelled").unwrap(),
            (|_: &str| "My response was interrupted.".to_string()) as Describe,
        ),
    ]
});

/// Turn a raw agent/transport error into the user-facing text a run's
/// status message finishes with (§4.5 `describeError`).
pub fn describe_error(raw: &str) -> String {
    for (pattern, describe) in ERROR_PATTERNS.iter() {
        if pattern.is_match(raw) {
            return describe(raw);
        }
    }
    format!("Something went wrong: `{raw}`. Try sending your message again.")
}

/// Retry a fallible operation up to 3 times past the first attempt, but
/// only when the failure looks transient: a [`RateLimitError`] (honoring
/// its `retry_after_ms` when present) or a transport error matching a
/// small transient-failure pattern. Anything else is returned immediately.
pub(crate) async fn with_transport_retry<T, F, Fut>(mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    const MAX_RETRIES: u32 = 3;
    static TRANSIENT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)network|ECONNRESET|ETIMEDOUT|5\d{2}|service.?unavailable").unwrap());

    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retry_after_ms = err.downcast_ref::<RateLimitError>().map(|e| e.retry_after_ms);
                let retryable = retry_after_ms.is_some() || TRANSIENT.is_match(&err.to_string());
                if !retryable || attempt >= MAX_RETRIES {
                    return Err(err);
                }
                let delay_ms = retry_after_ms.flatten().unwrap_or_else(|| 1000 * 2u64.pow(attempt));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// One item in a [`ThreadActor`]'s mailbox. `sent_message` is set when the
/// caller has already posted the status surface for this prompt (e.g. the
/// orchestrator's channel-dispatch path, which posts into a fresh thread
/// before handing it to the actor) rather than leaving the run to post its
/// own "thinking" message.
pub struct PromptItem {
    pub text: String,
    pub message_id: Option<String>,
    pub sent_message: Option<Box<dyn SentMessageDyn>>,
}

/// A run's live status surface: one message that gets posted once and
/// edited thereafter, with writes serialized via explicit join-handle
/// chaining so out-of-order completions can never clobber a later edit
/// with an earlier one (§9: "a serial task queue whose next task awaits
/// the previous one's completion, success or swallowed failure").
#[derive(Clone)]
struct RunMessage {
    thread: Arc<dyn ThreadDyn>,
    state: Arc<StdMutex<Option<Box<dyn SentMessageDyn>>>>,
    tail: Arc<StdMutex<Option<JoinHandle<()>>>>,
    /// Lines appended over the run's lifetime (`_Thinking_`, `_→ tool_`,
    /// `_Error: ..._`), joined and shown with a trailing ellipsis while the
    /// run is still in flight. `finish`/`error` replace the display outright
    /// rather than appending to this history.
    status_lines: Arc<StdMutex<Vec<String>>>,
}

impl RunMessage {
    fn new(thread: Arc<dyn ThreadDyn>, existing: Option<Box<dyn SentMessageDyn>>) -> Self {
        Self {
            thread,
            state: Arc::new(StdMutex::new(existing)),
            tail: Arc::new(StdMutex::new(None)),
            status_lines: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn enqueue(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let previous = self.tail.lock().unwrap().take();
        let tail = self.tail.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            fut.await;
        });
        *tail.lock().unwrap() = Some(handle);
    }

    fn set_text(&self, text: String) {
        let thread = self.thread.clone();
        let state = self.state.clone();
        self.enqueue(async move {
            let existing = state.lock().unwrap().take();
            let result = match existing {
                Some(sent) => with_transport_retry(|| sent.edit_dyn(&text)).await.map(|_| sent),
                None => with_transport_retry(|| thread.post_dyn(&text)).await,
            };
            match result {
                Ok(sent) => *state.lock().unwrap() = Some(sent),
                Err(err) => tracing::warn!(%err, "failed to post or edit run status message"),
            }
        });
    }

    /// Append a status line to the running history and redisplay the
    /// accumulated lines joined by newlines, with a trailing ellipsis
    /// marking the run as still in progress.
    fn push_status_line(&self, line: String) {
        let display = {
            let mut lines = self.status_lines.lock().unwrap();
            lines.push(line);
            format!("{} …", lines.join("\n"))
        };
        self.set_text(display);
    }

    fn thinking(&self) {
        self.push_status_line("_Thinking_".to_string());
    }

    fn tool_start(&self, label: &str) {
        self.push_status_line(format!("_→ {label}_"));
    }

    fn tool_error(&self, text: &str) {
        let truncated: String = text.chars().take(200).collect();
        self.push_status_line(format!("_Error: {truncated}_"));
    }

    /// Replace the whole message with `text`, no status-line indicator.
    fn finish(&self, text: String) {
        self.set_text(text);
    }

    fn error(&self, message: &str) {
        self.finish(format!("_Error: {message}_"));
    }

    /// Discard the status message entirely — used for `[SILENT]` turns,
    /// where the agent chose not to respond at all.
    fn discard(&self) {
        let state = self.state.clone();
        self.enqueue(async move {
            let existing = state.lock().unwrap().take();
            if let Some(sent) = existing
                && let Err(err) = with_transport_retry(|| sent.delete_dyn()).await
            {
                tracing::warn!(%err, "failed to delete discarded status message");
            }
        });
    }

    /// Wait for every queued write to land before returning.
    async fn flush(&self) {
        let handle = self.tail.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Forwards `ChatAdapterDyn::channel_id_from_thread_id` through a borrowed
/// reference so it can stand in for `&dyn ChannelBoundary` without relying
/// on trait-object-to-trait-object coercion between unrelated traits.
struct AdapterBoundary<'a>(&'a dyn ChatAdapterDyn);

impl ChannelBoundary for AdapterBoundary<'_> {
    fn channel_id_from_thread_id(&self, composite: &str) -> Option<String> {
        self.0.channel_id_from_thread_id(composite)
    }
}

/// A live agent plus its one long-lived event subscription, created lazily
/// on a thread actor's first prompt and reused for the agent's whole
/// lifetime so events are never subscribed twice or missed between runs.
pub struct AgentHandle<A: Agent> {
    agent: Arc<A>,
    events: Arc<AsyncMutex<broadcast::Receiver<AgentEvent>>>,
}

impl<A: Agent> Clone for AgentHandle<A> {
    fn clone(&self) -> Self {
        Self {
            agent: self.agent.clone(),
            events: self.events.clone(),
        }
    }
}

/// Shared collaborators for every thread actor in a process.
pub struct ActorDeps<A: Agent> {
    pub chat_adapter: Arc<dyn ChatAdapterDyn>,
    pub store: Arc<ThreadStore>,
    pub settings: Arc<Settings>,
    pub summarizer: Option<Arc<dyn SummarizerDyn>>,
    pub agent_factory: Arc<dyn Fn(&str) -> A + Send + Sync>,
}

// Written by hand rather than `#[derive(Clone)]`: the derive would add a
// spurious `A: Clone` bound, but `A` only ever appears behind
// `Arc<dyn Fn(&str) -> A + ...>`, never as a stored value.
impl<A: Agent> Clone for ActorDeps<A> {
    fn clone(&self) -> Self {
        Self {
            chat_adapter: self.chat_adapter.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
            summarizer: self.summarizer.clone(),
            agent_factory: self.agent_factory.clone(),
        }
    }
}

/// The final text extracted from a completed run (§4.5 "final-text
/// extraction"): a tail-scan for the most recent assistant turn.
enum FinalText {
    Text(String),
    /// The assistant produced the literal `[SILENT]` marker — the run's
    /// status message is deleted rather than finished.
    Silent,
}

fn extract_final_text(messages: &[AgentMessage]) -> FinalText {
    for message in messages.iter().rev() {
        let AgentMessage::Assistant { content, stop_reason, error_message, .. } = message else {
            continue;
        };
        let text = match stop_reason {
            StopReason::Aborted => "_Stopped_".to_string(),
            StopReason::Error => describe_error(error_message.as_deref().unwrap_or("unknown error")),
            _ => {
                let joined: String = content
                    .iter()
                    .filter_map(|block| match block {
                        AssistantBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if joined.trim().is_empty() {
                    "_No response_".to_string()
                } else {
                    joined
                }
            }
        };
        if text.trim() == "[SILENT]" {
            return FinalText::Silent;
        }
        return FinalText::Text(text);
    }
    FinalText::Text("_No response_".to_string())
}

/// Stops the background task forwarding one agent's events into one run's
/// status message, scoping forwarding to exactly the run's duration while
/// the underlying subscription outlives it.
struct EventForwarder {
    stop: Option<oneshot::Sender<()>>,
}

impl EventForwarder {
    fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn forward_events<A: Agent>(handle: Arc<AgentHandle<A>>, run: RunMessage) -> EventForwarder {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut receiver = handle.events.lock().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = receiver.recv() => match event {
                    Ok(AgentEvent::ToolExecutionStart { tool_name, label }) => {
                        run.tool_start(&label.unwrap_or(tool_name));
                    }
                    Ok(AgentEvent::ToolExecutionEnd { is_error, result_text, .. }) => {
                        if is_error {
                            run.tool_error(&result_text);
                        }
                    }
                    Ok(AgentEvent::AgentStart | AgentEvent::Other) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
    EventForwarder { stop: Some(stop_tx) }
}

/// One actor per thread: a bounded mailbox draining prompts one at a time,
/// plus a lazily-created agent reused across prompts.
pub struct ThreadActor<A: Agent> {
    thread_id: String,
    mailbox: mpsc::Sender<PromptItem>,
    chat_adapter: Arc<dyn ChatAdapterDyn>,
    current_agent: Arc<arc_swap::ArcSwap<Option<Arc<AgentHandle<A>>>>>,
    drain_task: JoinHandle<()>,
}

impl<A: Agent> ThreadActor<A> {
    pub fn spawn(thread_id: String, deps: ActorDeps<A>) -> Self {
        let capacity = (**deps.settings.max_queue_depth.load()).max(1);
        let (mailbox, receiver) = mpsc::channel(capacity);
        let current_agent: Arc<arc_swap::ArcSwap<Option<Arc<AgentHandle<A>>>>> =
            Arc::new(arc_swap::ArcSwap::from_pointee(None));
        let chat_adapter = deps.chat_adapter.clone();
        let drain_task = tokio::spawn(Self::drain_loop(thread_id.clone(), deps, receiver, current_agent.clone()));
        Self {
            thread_id,
            mailbox,
            chat_adapter,
            current_agent,
            drain_task,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Enqueue a prompt. On mailbox overflow (§8 S1), the item is dropped
    /// and a notice is posted directly rather than routed through a run.
    pub async fn prompt(&self, item: PromptItem) {
        match self.mailbox.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                match self.chat_adapter.get_thread_dyn(&self.thread_id).await {
                    Ok(thread) => {
                        if let Err(err) = thread.post_dyn("Too many queued messages — please wait.").await {
                            tracing::warn!(%err, thread_id = %self.thread_id, "failed to post mailbox-overflow notice");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, thread_id = %self.thread_id, "failed to resolve thread for overflow notice");
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(thread_id = %self.thread_id, "prompt dropped: actor mailbox closed");
            }
        }
    }

    /// Steer the in-flight run, or do nothing if no agent has been created
    /// yet (§4.5 control messages bypass the mailbox).
    pub async fn steer(&self, text: String) {
        if let Some(handle) = self.load_agent() {
            handle.agent.steer(text).await;
        }
    }

    pub async fn abort(&self) {
        if let Some(handle) = self.load_agent() {
            handle.agent.abort().await;
        }
    }

    pub async fn destroy(self) {
        self.abort().await;
        self.drain_task.abort();
    }

    fn load_agent(&self) -> Option<Arc<AgentHandle<A>>> {
        (**self.current_agent.load()).clone()
    }

    async fn drain_loop(
        thread_id: String,
        deps: ActorDeps<A>,
        mut mailbox: mpsc::Receiver<PromptItem>,
        current_agent: Arc<arc_swap::ArcSwap<Option<Arc<AgentHandle<A>>>>>,
    ) {
        let adapter_name = thread_id.split(':').next().unwrap_or_default().to_string();
        let boundary = AdapterBoundary(deps.chat_adapter.as_ref());
        let meta = parse_thread_id(&adapter_name, &thread_id, Some(&boundary));

        while let Some(item) = mailbox.recv().await {
            if let Err(err) = Self::run_one(&deps, &meta, &current_agent, item).await {
                tracing::error!(%err, thread_id = %thread_id, "thread actor run failed");
            }
        }
    }

    fn get_or_create_agent(
        deps: &ActorDeps<A>,
        meta: &ThreadMeta,
        current_agent: &Arc<arc_swap::ArcSwap<Option<Arc<AgentHandle<A>>>>>,
    ) -> Arc<AgentHandle<A>> {
        if let Some(handle) = (**current_agent.load()).clone() {
            return handle;
        }
        let agent = Arc::new((deps.agent_factory)(&meta.thread_id));
        let events = Arc::new(AsyncMutex::new(agent.subscribe()));
        let handle = Arc::new(AgentHandle { agent, events });
        current_agent.store(Arc::new(Some(handle.clone())));
        handle
    }

    /// The run loop's 8 steps (§4.5): dequeue (done by the caller), create
    /// the status message, lazily create+subscribe the agent, load context,
    /// pre-prompt compaction, load attachments, prompt (with one
    /// context-overflow retry), persist context, extract and publish the
    /// final text.
    async fn run_one(
        deps: &ActorDeps<A>,
        meta: &ThreadMeta,
        current_agent: &Arc<arc_swap::ArcSwap<Option<Arc<AgentHandle<A>>>>>,
        item: PromptItem,
    ) -> anyhow::Result<()> {
        let thread: Arc<dyn ThreadDyn> = Arc::from(deps.chat_adapter.get_thread_dyn(&meta.thread_id).await?);
        let run = RunMessage::new(thread, item.sent_message);
        run.thinking();

        let handle = Self::get_or_create_agent(deps, meta, current_agent);

        let context = deps.store.load_context(meta).await;
        handle.agent.replace_messages(context.clone()).await;

        let compaction_settings = **deps.settings.compaction.load();
        if CompactionEngine::should_compact(&context, &compaction_settings, handle.agent.context_window())
            && let Some(summarizer) = deps.summarizer.as_deref()
        {
            let compacted = CompactionEngine::compact(context, &compaction_settings, summarizer).await;
            handle.agent.replace_messages(compacted).await;
        }

        let attachments = match &item.message_id {
            Some(message_id) => deps.store.load_attachments(meta, message_id).await,
            None => PromptAttachments::default(),
        };

        let mut prompt_text = item.text;
        if !attachments.file_paths.is_empty() {
            prompt_text.push_str("\n\n<attachments>\n");
            for path in &attachments.file_paths {
                prompt_text.push_str(&path.display().to_string());
                prompt_text.push('\n');
            }
            prompt_text.push_str("</attachments>");
        }

        let forwarder = forward_events(handle.clone(), run.clone());

        let mut result = handle.agent.prompt(prompt_text.clone(), attachments.images.clone()).await;
        if let Err(err) = &result
            && is_context_overflow_error(&err.to_string())
            && let Some(summarizer) = deps.summarizer.as_deref()
        {
            let messages = handle.agent.messages().await;
            let compacted = CompactionEngine::compact(messages.clone(), &compaction_settings, summarizer).await;
            if compacted != messages {
                handle.agent.replace_messages(compacted).await;
                result = handle.agent.prompt(prompt_text, attachments.images).await;
            }
            // Compaction was a no-op (no cut point, or it failed internally
            // and fell back to the original list) — re-throw the original
            // context-overflow error rather than retrying into the same wall.
        }

        forwarder.stop();

        let messages = handle.agent.messages().await;
        deps.store.save_context(meta, &messages).await?;

        match result {
            Ok(()) => match extract_final_text(&messages) {
                FinalText::Silent => run.discard(),
                FinalText::Text(text) => {
                    deps.store.log_bot_response(meta, &text).await?;
                    let inspect_guard = deps.settings.inspect.load();
                    let inspect_link = crate::inspect::inspect_url((**inspect_guard).as_ref(), &meta.thread_id);
                    let full_text = match inspect_link {
                        Some(url) => format!("{text}\n\n[inspect]({url})"),
                        None => text,
                    };
                    run.finish(full_text);
                }
            },
            Err(err) => run.error(&describe_error(&err.to_string())),
        }

        run.flush().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Usage;
    use crate::testing::{FakeAgent, FakeChatAdapter, FakeSummarizer, PromptOutcome};
    use crate::thread_id::parse_thread_id;

    fn assistant_text(text: &str) -> AgentMessage {
        AgentMessage::Assistant {
            content: vec![AssistantBlock::Text { text: text.to_string() }],
            model: "m".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
            error_message: None,
        }
    }

    fn test_deps(chat_adapter: Arc<FakeChatAdapter>, agent: FakeAgent, data_dir: &std::path::Path) -> ActorDeps<FakeAgent> {
        let factory_agent = agent;
        ActorDeps {
            chat_adapter: chat_adapter as Arc<dyn ChatAdapterDyn>,
            store: Arc::new(ThreadStore::new(data_dir.to_path_buf())),
            settings: Arc::new(Settings::with_data_dir(data_dir.to_path_buf())),
            summarizer: Some(Arc::new(FakeSummarizer) as Arc<dyn SummarizerDyn>),
            agent_factory: Arc::new(move |_: &str| factory_agent.clone()),
        }
    }

    #[test]
    fn describe_error_matches_known_patterns_in_order() {
        assert!(describe_error("429 too many requests").contains("rate-limited"));
        assert!(describe_error("503 Service Unavailable").contains("overloaded"));
        assert!(describe_error("ETIMEDOUT").contains("lost connection"));
        assert!(describe_error("context_length_exceeded").contains("too long"));
        assert!(describe_error("request was aborted").contains("interrupted"));
        assert!(describe_error("some unknown failure").contains("Something went wrong"));
    }

    #[test]
    fn extract_final_text_prefers_most_recent_assistant_turn() {
        let messages = vec![assistant_text("stale"), assistant_text("fresh")];
        match extract_final_text(&messages) {
            FinalText::Text(text) => assert_eq!(text, "fresh"),
            FinalText::Silent => panic!("expected text"),
        }
    }

    #[test]
    fn extract_final_text_detects_silent_marker() {
        let messages = vec![assistant_text("[SILENT]")];
        assert!(matches!(extract_final_text(&messages), FinalText::Silent));
    }

    #[test]
    fn extract_final_text_maps_aborted_and_error_stop_reasons() {
        let aborted = AgentMessage::Assistant {
            content: vec![],
            model: "m".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Aborted,
            error_message: None,
        };
        match extract_final_text(&[aborted]) {
            FinalText::Text(text) => assert_eq!(text, "_Stopped_"),
            FinalText::Silent => panic!("expected text"),
        }

        let errored = AgentMessage::Assistant {
            content: vec![],
            model: "m".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Error,
            error_message: Some("429 rate limited".to_string()),
        };
        match extract_final_text(&[errored]) {
            FinalText::Text(text) => assert!(text.contains("rate-limited")),
            FinalText::Silent => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn run_message_status_lines_accumulate_with_ellipsis() {
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));
        let thread: Arc<dyn ThreadDyn> = Arc::from(chat_adapter.get_thread_dyn("fake:C:T").await.unwrap());
        let run = RunMessage::new(thread, None);

        run.thinking();
        run.tool_start("searching docs");
        run.flush().await;

        let edits = chat_adapter.log.edits.lock().unwrap();
        let posts = chat_adapter.log.posts.lock().unwrap();
        let last = edits.last().map(|m| m.text.as_str()).unwrap_or_else(|| posts.last().unwrap().text.as_str());
        assert_eq!(last, "_Thinking_\n_→ searching docs_ …");
    }

    #[tokio::test]
    async fn run_message_finish_replaces_accumulated_status_lines() {
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));
        let thread: Arc<dyn ThreadDyn> = Arc::from(chat_adapter.get_thread_dyn("fake:C:T").await.unwrap());
        let run = RunMessage::new(thread, None);

        run.thinking();
        run.finish("final answer".to_string());
        run.flush().await;

        let edits = chat_adapter.log.edits.lock().unwrap();
        assert_eq!(edits.last().unwrap().text, "final answer");
    }

    #[tokio::test]
    async fn with_transport_retry_retries_rate_limit_then_succeeds() {
        let attempts = Arc::new(StdMutex::new(0u32));
        let result = with_transport_retry(|| {
            let attempts = attempts.clone();
            async move {
                let mut guard = attempts.lock().unwrap();
                *guard += 1;
                if *guard < 3 {
                    Err(RateLimitError { retry_after_ms: Some(1) }.into())
                } else {
                    Ok(*guard)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn with_transport_retry_gives_up_on_non_transient_error() {
        let attempts = Arc::new(StdMutex::new(0u32));
        let result: anyhow::Result<()> = with_transport_retry(|| {
            let attempts = attempts.clone();
            async move {
                *attempts.lock().unwrap() += 1;
                Err(anyhow::anyhow!("totally unrelated failure"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn mailbox_full_posts_overflow_notice_and_drops_message() {
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(PromptItem { text: "first".into(), message_id: None, sent_message: None })
            .unwrap();

        let actor = ThreadActor::<FakeAgent> {
            thread_id: "fake:C:T".to_string(),
            mailbox: tx,
            chat_adapter: chat_adapter.clone() as Arc<dyn ChatAdapterDyn>,
            current_agent: Arc::new(arc_swap::ArcSwap::from_pointee(None)),
            drain_task: tokio::spawn(async {}),
        };

        actor.prompt(PromptItem { text: "second".into(), message_id: None, sent_message: None }).await;

        let posts = chat_adapter.log.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].text.contains("Too many queued messages"));
    }

    #[tokio::test]
    async fn rate_limited_edit_is_retried_until_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));
        chat_adapter.fail_next_edits("msg-0", 2);

        let agent = FakeAgent::new();
        agent.push_outcome(PromptOutcome::Ok(vec![assistant_text("done")]));

        let meta = parse_thread_id("fake", "fake:C:T", None);
        let deps = test_deps(chat_adapter.clone(), agent, dir.path());
        let current_agent = Arc::new(arc_swap::ArcSwap::from_pointee(None));
        let item = PromptItem { text: "hi".into(), message_id: None, sent_message: None };

        ThreadActor::<FakeAgent>::run_one(&deps, &meta, &current_agent, item).await.unwrap();

        let edits = chat_adapter.log.edits.lock().unwrap();
        assert!(edits.iter().any(|e| e.text == "done"));
    }

    #[tokio::test]
    async fn silent_final_text_discards_status_message() {
        let dir = tempfile::tempdir().unwrap();
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));

        let agent = FakeAgent::new();
        agent.push_outcome(PromptOutcome::Ok(vec![assistant_text("[SILENT]")]));

        let meta = parse_thread_id("fake", "fake:C:T", None);
        let deps = test_deps(chat_adapter.clone(), agent, dir.path());
        let current_agent = Arc::new(arc_swap::ArcSwap::from_pointee(None));
        let item = PromptItem { text: "hi".into(), message_id: None, sent_message: None };

        ThreadActor::<FakeAgent>::run_one(&deps, &meta, &current_agent, item).await.unwrap();

        let posts = chat_adapter.log.posts.lock().unwrap();
        let deletes = chat_adapter.log.deletes.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(*deletes, vec![posts[0].id.clone()]);
    }

    #[tokio::test]
    async fn context_overflow_error_triggers_compaction_and_one_retry() {
        let dir = tempfile::tempdir().unwrap();
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));

        let agent = FakeAgent::new();
        agent.push_outcome(PromptOutcome::Err("context_length_exceeded".to_string()));
        agent.push_outcome(PromptOutcome::Ok(vec![assistant_text("recovered")]));

        let meta = parse_thread_id("fake", "fake:C:T", None);
        let deps = test_deps(chat_adapter.clone(), agent.clone(), dir.path());
        // Force a real cut point so compaction actually changes the message
        // list and the retry path is exercised, not skipped as a no-op.
        deps.settings.set_compaction(crate::config::CompactionSettings {
            enabled: true,
            reserve_tokens: 100,
            keep_recent_tokens: 10,
            context_window: Some(1000),
        });
        let big = "x".repeat(2000);
        let seed_messages = vec![
            AgentMessage::User { content: crate::UserContent::Text(big.clone()) },
            assistant_text(&big),
            AgentMessage::User { content: crate::UserContent::Text("hi".to_string()) },
        ];
        deps.store.save_context(&meta, &seed_messages).await.unwrap();
        let current_agent = Arc::new(arc_swap::ArcSwap::from_pointee(None));
        let item = PromptItem { text: "hi".into(), message_id: None, sent_message: None };

        ThreadActor::<FakeAgent>::run_one(&deps, &meta, &current_agent, item).await.unwrap();

        assert_eq!(agent.prompt_calls.lock().unwrap().len(), 2);
        let edits = chat_adapter.log.edits.lock().unwrap();
        assert!(edits.iter().any(|e| e.text == "recovered"));
    }

    #[tokio::test]
    async fn context_overflow_compaction_noop_rethrows_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));

        let agent = FakeAgent::new();
        // Only one outcome queued: a retry would exhaust the script and panic.
        agent.push_outcome(PromptOutcome::Err("context_length_exceeded".to_string()));

        let meta = parse_thread_id("fake", "fake:C:T", None);
        let deps = test_deps(chat_adapter.clone(), agent.clone(), dir.path());
        // Default settings + an empty/short context: find_cut_point has
        // nothing to cut, so compaction is a guaranteed no-op.
        let current_agent = Arc::new(arc_swap::ArcSwap::from_pointee(None));
        let item = PromptItem { text: "hi".into(), message_id: None, sent_message: None };

        ThreadActor::<FakeAgent>::run_one(&deps, &meta, &current_agent, item).await.unwrap();

        assert_eq!(agent.prompt_calls.lock().unwrap().len(), 1);
        let edits = chat_adapter.log.edits.lock().unwrap();
        assert!(edits.last().unwrap().text.contains("too long"));
    }

    #[tokio::test]
    async fn prompt_error_finishes_run_with_described_message() {
        let dir = tempfile::tempdir().unwrap();
        let chat_adapter = Arc::new(FakeChatAdapter::new("fake"));

        let agent = FakeAgent::new();
        agent.push_outcome(PromptOutcome::Err("totally broken".to_string()));

        let meta = parse_thread_id("fake", "fake:C:T", None);
        let deps = test_deps(chat_adapter.clone(), agent, dir.path());
        let current_agent = Arc::new(arc_swap::ArcSwap::from_pointee(None));
        let item = PromptItem { text: "hi".into(), message_id: None, sent_message: None };

        ThreadActor::<FakeAgent>::run_one(&deps, &meta, &current_agent, item).await.unwrap();

        let edits = chat_adapter.log.edits.lock().unwrap();
        assert!(edits.last().unwrap().text.starts_with("_Error: "));
    }
}
