//! The chat-platform contract (§6): a thin trait boundary the runtime core
//! prompts through without knowing which platform (Slack, Discord, a CLI
//! shim, ...) is on the other end.

use std::pin::Pin;

/// Raised by a [`SentMessage`] edit/post when the platform asks for backoff.
#[derive(Debug, thiserror::Error)]
#[error("rate limited, retry after {retry_after_ms:?}ms")]
pub struct RateLimitError {
    pub retry_after_ms: Option<u64>,
}

/// A message the core has posted or is updating — the live status surface
/// a [`ThreadActor`](crate::actor::ThreadActor) writes `thinking`/`tool
/// start`/`finish` text into as a run progresses.
pub trait SentMessage: Send + Sync {
    fn id(&self) -> &str;

    fn text(&self) -> impl std::future::Future<Output = anyhow::Result<String>> + Send;

    fn edit(&self, text: &str) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    fn delete(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Object-safe companion to [`SentMessage`].
pub trait SentMessageDyn: Send + Sync {
    fn id(&self) -> &str;
    fn text_dyn<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send + 'a>>;
    fn edit_dyn<'a>(&'a self, text: &'a str) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>>;
    fn delete_dyn<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

impl<T: SentMessage> SentMessageDyn for T {
    fn id(&self) -> &str {
        SentMessage::id(self)
    }

    fn text_dyn<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(SentMessage::text(self))
    }

    fn edit_dyn<'a>(&'a self, text: &'a str) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(SentMessage::edit(self, text))
    }

    fn delete_dyn<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(SentMessage::delete(self))
    }
}

/// A thread handle capable of posting new messages.
pub trait Thread: Send + Sync {
    fn post(&self, text: &str) -> impl std::future::Future<Output = anyhow::Result<Box<dyn SentMessageDyn>>> + Send;
}

/// Object-safe companion to [`Thread`].
pub trait ThreadDyn: Send + Sync {
    fn post_dyn<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<Box<dyn SentMessageDyn>>> + Send + 'a>>;
}

impl<T: Thread> ThreadDyn for T {
    fn post_dyn<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<Box<dyn SentMessageDyn>>> + Send + 'a>> {
        Box::pin(Thread::post(self, text))
    }
}

/// The chat-platform adapter contract. Adapters resolve threads and
/// channels by composite thread ID and know how to post into them; they do
/// not know anything about agents, compaction, or the event bus.
pub trait ChatAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn get_thread(
        &self,
        thread_id: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<Box<dyn ThreadDyn>>> + Send;

    /// Derive a channel id from a composite thread id, when the adapter has
    /// a boundary rule other than the default second-colon split (§4.1).
    fn channel_id_from_thread_id(&self, _thread_id: &str) -> Option<String> {
        None
    }

    /// Best-effort channel metadata fetch, used to enrich `meta.json`
    /// asynchronously after the first message in a channel is logged.
    fn fetch_channel_info(
        &self,
        _channel_id: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<ChannelInfo>>> + Send {
        async { Ok(None) }
    }

    /// Post into a channel (not a specific thread), creating a new thread on
    /// the platform — the `channel(channelId).post(text) -> {threadId}`
    /// contract of §6, used by `Orchestrator::dispatch_event`'s channel
    /// branch and by `send_to_channel`. Returns the resulting composite
    /// thread id plus the sent message, so the caller can adopt it as a
    /// `ThreadActor` run's status surface.
    fn post_to_channel(
        &self,
        channel_key: &str,
        text: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<(String, Box<dyn SentMessageDyn>)>> + Send;
}

/// Object-safe companion to [`ChatAdapter`].
pub trait ChatAdapterDyn: Send + Sync {
    fn name(&self) -> &str;

    fn get_thread_dyn<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<Box<dyn ThreadDyn>>> + Send + 'a>>;

    fn channel_id_from_thread_id(&self, thread_id: &str) -> Option<String>;

    fn fetch_channel_info_dyn<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<Option<ChannelInfo>>> + Send + 'a>>;

    fn post_to_channel_dyn<'a>(
        &'a self,
        channel_key: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<(String, Box<dyn SentMessageDyn>)>> + Send + 'a>>;
}

impl<T: ChatAdapter> ChatAdapterDyn for T {
    fn name(&self) -> &str {
        ChatAdapter::name(self)
    }

    fn get_thread_dyn<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<Box<dyn ThreadDyn>>> + Send + 'a>> {
        Box::pin(ChatAdapter::get_thread(self, thread_id))
    }

    fn channel_id_from_thread_id(&self, thread_id: &str) -> Option<String> {
        ChatAdapter::channel_id_from_thread_id(self, thread_id)
    }

    fn fetch_channel_info_dyn<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<Option<ChannelInfo>>> + Send + 'a>> {
        Box::pin(ChatAdapter::fetch_channel_info(self, channel_id))
    }

    fn post_to_channel_dyn<'a>(
        &'a self,
        channel_key: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<(String, Box<dyn SentMessageDyn>)>> + Send + 'a>> {
        Box::pin(ChatAdapter::post_to_channel(self, channel_key, text))
    }
}

/// Channel metadata resolved asynchronously by an adapter.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: Option<String>,
    pub is_dm: Option<bool>,
}

impl crate::thread_id::ChannelBoundary for dyn ChatAdapterDyn + '_ {
    fn channel_id_from_thread_id(&self, composite: &str) -> Option<String> {
        ChatAdapterDyn::channel_id_from_thread_id(self, composite)
    }
}
