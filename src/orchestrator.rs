//! Orchestrator (§4.6): a registry of [`ThreadActor`]s keyed by composite
//! thread ID, plus the routing a chat-platform front-end or the event bus
//! dispatches through.
//!
//! Actors never reference each other; the orchestrator is the only thing
//! that holds more than one at a time, and it only ever forwards messages
//! by key. No cycles, no shared mutable actor state (§9 "Back-references in
//! the registry").

use crate::actor::{Agent, ActorDeps, PromptItem, ThreadActor};
use crate::chat::ChatAdapterDyn;
use crate::{EventTarget, GuppyEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A control message that bypasses an actor's mailbox and acts on whatever
/// agent is currently live (§4.5). Distinct from [`PromptItem`], which is
/// always routed through `send_prompt` rather than broadcast — a prompt
/// carries a non-cloneable status-message handle, so it makes no sense to
/// fan one out to every actor in a channel.
#[derive(Debug, Clone)]
pub enum ActorCommand {
    Steer(String),
    Abort,
}

/// A parsed slash command, resolved against the small command map of §4.6
/// (only `stop` is wired to a command today; `steer` is left as an
/// extension point per the design notes' open question).
#[derive(Debug, Clone)]
pub struct SlashCommandEvent {
    /// Prefixed channel id the command was issued in, e.g. `"slack:C1"`.
    pub channel_id: String,
    pub command: String,
    #[allow(dead_code)]
    pub text: String,
}

fn command_for(name: &str) -> Option<ActorCommand> {
    match name {
        "stop" => Some(ActorCommand::Abort),
        _ => None,
    }
}

/// Registry of per-thread actors plus the collaborators needed to create
/// one lazily on first contact.
pub struct Orchestrator<A: Agent> {
    actors: Mutex<HashMap<String, Arc<ThreadActor<A>>>>,
    deps: ActorDeps<A>,
    chat_adapter: Arc<dyn ChatAdapterDyn>,
}

impl<A: Agent> Orchestrator<A> {
    pub fn new(deps: ActorDeps<A>) -> Self {
        let chat_adapter = deps.chat_adapter.clone();
        Self {
            actors: Mutex::new(HashMap::new()),
            deps,
            chat_adapter,
        }
    }

    pub fn actor_count(&self) -> usize {
        self.actors.lock().unwrap().len()
    }

    fn get_or_create(&self, thread_id: &str) -> Arc<ThreadActor<A>> {
        let mut actors = self.actors.lock().unwrap();
        if let Some(actor) = actors.get(thread_id) {
            return actor.clone();
        }
        let actor = Arc::new(ThreadActor::spawn(thread_id.to_string(), self.deps.clone()));
        actors.insert(thread_id.to_string(), actor.clone());
        actor
    }

    fn get(&self, thread_id: &str) -> Option<Arc<ThreadActor<A>>> {
        self.actors.lock().unwrap().get(thread_id).cloned()
    }

    /// Get-or-create the actor for `thread_id` and enqueue a prompt.
    pub async fn send_prompt(&self, thread_id: &str, item: PromptItem) {
        let actor = self.get_or_create(thread_id);
        actor.prompt(item).await;
    }

    /// Forward a control message only if an actor already exists for
    /// `thread_id`. Returns whether one did — used by e.g. `/stop` so the
    /// caller can report "nothing to stop" instead of silently no-op'ing.
    pub async fn send_command(&self, thread_id: &str, command: ActorCommand) -> bool {
        let Some(actor) = self.get(thread_id) else {
            return false;
        };
        Self::dispatch_command(&actor, command).await;
        true
    }

    /// Forward a control message to every actor whose thread ID starts with
    /// `channel_prefix` (e.g. `"discord:123:"`). Returns how many received it.
    pub async fn broadcast_command(&self, channel_prefix: &str, command: ActorCommand) -> usize {
        let targets: Vec<Arc<ThreadActor<A>>> = {
            let actors = self.actors.lock().unwrap();
            actors
                .iter()
                .filter(|(id, _)| id.starts_with(channel_prefix))
                .map(|(_, actor)| actor.clone())
                .collect()
        };
        let count = targets.len();
        for actor in targets {
            Self::dispatch_command(&actor, command.clone()).await;
        }
        count
    }

    async fn dispatch_command(actor: &ThreadActor<A>, command: ActorCommand) {
        match command {
            ActorCommand::Steer(text) => actor.steer(text).await,
            ActorCommand::Abort => actor.abort().await,
        }
    }

    /// Route a scheduled event (§4.4 `dispatch`) to its target: an existing
    /// thread gets a prompt directly; a channel gets posted to first, and
    /// the resulting thread's actor adopts that post as its run's status
    /// surface.
    pub async fn dispatch_event(&self, target: EventTarget, text: String) {
        match target {
            EventTarget::Thread { thread_id } => {
                self.send_prompt(&thread_id, PromptItem { text, message_id: None, sent_message: None })
                    .await;
            }
            EventTarget::Channel { channel_id } => {
                self.post_and_route(&channel_id, text).await;
            }
        }
    }

    /// Post `text` into a channel, creating a new thread on the platform,
    /// then hand that thread's actor a prompt whose status surface is the
    /// message just posted (so the run edits it in place rather than
    /// posting a second "thinking" message).
    async fn post_and_route(&self, channel_id: &str, text: String) {
        match self.chat_adapter.post_to_channel_dyn(channel_id, &text).await {
            Ok((thread_id, sent_message)) => {
                self.send_prompt(
                    &thread_id,
                    PromptItem { text, message_id: None, sent_message: Some(sent_message) },
                )
                .await;
            }
            Err(err) => {
                tracing::warn!(%err, channel_id, "failed to post event to channel");
            }
        }
    }

    /// Fire-and-forget post into a channel outside of any scheduled event
    /// (§4.6 `sendToChannel`); errors are logged, not propagated.
    pub async fn send_to_channel(&self, channel_id: &str, text: &str) {
        if let Err(err) = self.chat_adapter.post_to_channel_dyn(channel_id, text).await {
            tracing::warn!(%err, channel_id, "failed to send to channel");
        }
    }

    /// Parse a slash command against the command map and, if recognized,
    /// broadcast it to every actor in the issuing channel. Returns whether
    /// the command both parsed and reached at least one actor.
    pub async fn handle_slash_command(&self, event: SlashCommandEvent) -> bool {
        let Some(command) = command_for(&event.command) else {
            return false;
        };
        let prefix = format!("{}:", event.channel_id);
        self.broadcast_command(&prefix, command).await > 0
    }

    /// Abort and tear down every actor, clearing the registry. Actors
    /// created after this call returns are unaffected — this does not stop
    /// new threads from being created.
    pub async fn shutdown(&self) {
        let actors: Vec<(String, Arc<ThreadActor<A>>)> = {
            let mut guard = self.actors.lock().unwrap();
            guard.drain().collect()
        };
        for (thread_id, actor) in actors {
            match Arc::try_unwrap(actor) {
                Ok(actor) => actor.destroy().await,
                Err(actor) => {
                    tracing::warn!(thread_id, "actor still referenced at shutdown, aborting in place");
                    actor.abort().await;
                }
            }
        }
    }
}

/// Build the `[EVENT:...]` dispatch closure an [`crate::events::EventBus`]
/// can be started with, routing every fired event through `orchestrator`.
pub fn event_dispatch_fn<A: Agent>(orchestrator: Arc<Orchestrator<A>>) -> crate::events::DispatchFn {
    Arc::new(move |target, text| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            orchestrator.dispatch_event(target, text).await;
        })
    })
}

/// Schedule info plus target extracted from a raw [`GuppyEvent`], in case a
/// caller wants to inspect an event before it fires rather than go through
/// the bus (e.g. an admin "preview next event" command).
pub fn preview(event: &GuppyEvent) -> (EventTarget, String) {
    (event.target().clone(), event.text().to_string())
}
