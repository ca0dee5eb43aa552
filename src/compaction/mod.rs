//! Compaction Engine (§4.3): decides when a thread's context has grown too
//! large and rewrites it into a synthetic summary message plus a kept tail.

pub mod cutpoint;
pub mod summarize;
pub mod tokens;

use crate::config::CompactionSettings;
use crate::error::CompactionError;
use crate::{AgentMessage, UserContent};
use cutpoint::find_cut_point;
use std::future::Future;
use std::pin::Pin;
use summarize::{
    FileOps, extract_previous_summary, fresh_summary_prompt, render_summary_body,
    render_transcript, turn_prefix_prompt, update_summary_prompt,
};
use tokens::context_tokens_estimate;

/// External collaborator that turns a prompt into summary text. Implemented
/// by whatever drives the LLM calls; the compaction engine only knows the
/// prompt-in, text-out contract.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, prompt: String) -> impl Future<Output = anyhow::Result<String>> + Send;
}

/// Object-safe companion to [`Summarizer`] so the engine can hold a
/// `dyn Summarizer` behind an `Arc`.
pub trait SummarizerDyn: Send + Sync {
    fn summarize_dyn<'a>(
        &'a self,
        prompt: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}

impl<T: Summarizer + Send + Sync> SummarizerDyn for T {
    fn summarize_dyn<'a>(
        &'a self,
        prompt: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(self.summarize(prompt))
    }
}

/// Ties the token estimator, cut-point algorithm, and summarizer together
/// into the thread actor's pre-prompt compaction check.
pub struct CompactionEngine;

impl CompactionEngine {
    /// True once estimated context tokens exceed `context_window -
    /// reserve_tokens`. Without a known context window (neither the agent
    /// nor settings report one), there is nothing to compare the estimate
    /// against, so this returns `false` — compaction is left to the
    /// context-overflow retry path in the run loop instead.
    pub fn should_compact(
        messages: &[AgentMessage],
        settings: &CompactionSettings,
        context_window: Option<u64>,
    ) -> bool {
        if !settings.enabled {
            return false;
        }
        let window = context_window.or(settings.context_window);
        let Some(window) = window else {
            return false;
        };
        let threshold = window.saturating_sub(settings.reserve_tokens);
        context_tokens_estimate(messages) > threshold
    }

    /// Compact `messages` down to a synthetic summary message followed by
    /// the kept tail. Never fails: any internal error is logged and the
    /// original list is returned unchanged.
    pub async fn compact(
        messages: Vec<AgentMessage>,
        settings: &CompactionSettings,
        summarizer: &dyn SummarizerDyn,
    ) -> Vec<AgentMessage> {
        match Self::try_compact(&messages, settings, summarizer).await {
            Ok(compacted) => compacted,
            Err(err) => {
                tracing::warn!(%err, "compaction failed, keeping context unchanged");
                messages
            }
        }
    }

    async fn try_compact(
        messages: &[AgentMessage],
        settings: &CompactionSettings,
        summarizer: &dyn SummarizerDyn,
    ) -> anyhow::Result<Vec<AgentMessage>> {
        let cut = find_cut_point(messages, settings.keep_recent_tokens);
        if cut.index == 0 {
            return Ok(messages.to_vec());
        }

        let previous = extract_previous_summary(messages);
        let history_start = if previous.is_some() { 1 } else { 0 };

        let mut file_ops = FileOps::seeded_from(previous.as_ref());
        let history_end = cut.turn_start.unwrap_or(cut.index);
        file_ops.record(&messages[history_start..history_end]);
        if let Some(turn_start) = cut.turn_start {
            file_ops.record(&messages[turn_start..cut.index]);
        }

        let history_max_tokens = (settings.reserve_tokens as f64 * 0.8) as u64;
        let history_transcript = render_transcript(&messages[history_start..history_end]);
        let history_prompt = match &previous {
            Some(previous) => update_summary_prompt(&previous.body, &history_transcript),
            None => fresh_summary_prompt(&history_transcript),
        };
        let _ = history_max_tokens; // budget is advisory to the caller's model params, not enforced here

        let body = if let Some(turn_start) = cut.turn_start {
            let turn_transcript = render_transcript(&messages[turn_start..cut.index]);
            let turn_prompt = turn_prefix_prompt(&turn_transcript);
            let (history_summary, turn_summary) = tokio::try_join!(
                summarizer.summarize_dyn(history_prompt),
                summarizer.summarize_dyn(turn_prompt),
            )
            .map_err(|err| CompactionError::SummarizationFailed(err.to_string()))?;
            format!("{history_summary}\n\n## Turn Context (split turn)\n{turn_summary}")
        } else {
            summarizer
                .summarize_dyn(history_prompt)
                .await
                .map_err(|err| CompactionError::SummarizationFailed(err.to_string()))?
        };

        let summary_text = render_summary_body(&body, &file_ops);
        let summary_message = AgentMessage::User {
            content: UserContent::Text(summary_text),
        };

        let mut result = Vec::with_capacity(1 + messages.len() - cut.index);
        result.push(summary_message);
        result.extend_from_slice(&messages[cut.index..]);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AssistantBlock;

    struct EchoSummarizer;

    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, prompt: String) -> anyhow::Result<String> {
            Ok(format!("## Goal\nsummary of {} chars", prompt.len()))
        }
    }

    struct FailingSummarizer;

    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _prompt: String) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("model unavailable"))
        }
    }

    fn user(text: &str) -> AgentMessage {
        AgentMessage::User {
            content: UserContent::Text(text.to_string()),
        }
    }

    fn assistant(text: &str) -> AgentMessage {
        AgentMessage::Assistant {
            content: vec![AssistantBlock::Text { text: text.to_string() }],
            model: "m".to_string(),
            usage: crate::Usage::default(),
            stop_reason: crate::StopReason::EndTurn,
            error_message: None,
        }
    }

    fn settings() -> CompactionSettings {
        CompactionSettings {
            enabled: true,
            reserve_tokens: 100,
            keep_recent_tokens: 10,
            context_window: Some(1000),
        }
    }

    #[test]
    fn should_compact_respects_enabled_flag() {
        let mut settings = settings();
        settings.enabled = false;
        assert!(!CompactionEngine::should_compact(&[], &settings, Some(1000)));
    }

    #[test]
    fn should_compact_false_without_known_window() {
        let mut settings = settings();
        settings.context_window = None;
        assert!(!CompactionEngine::should_compact(&[], &settings, None));
    }

    #[tokio::test]
    async fn compact_returns_unchanged_when_no_cut_point() {
        let messages = vec![user("hi"), assistant("hello")];
        let summarizer = EchoSummarizer;
        let result =
            CompactionEngine::compact(messages.clone(), &settings(), &summarizer).await;
        assert_eq!(result, messages);
    }

    #[tokio::test]
    async fn compact_produces_summary_plus_kept_tail() {
        let big = "x".repeat(2000);
        let messages = vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant("recent reply"),
        ];
        let summarizer = EchoSummarizer;
        let result = CompactionEngine::compact(messages, &settings(), &summarizer).await;
        assert!(matches!(result[0], AgentMessage::User { .. }));
        if let AgentMessage::User { content } = &result[0] {
            assert!(content.text().contains("<compaction-summary>"));
        }
        assert!(result.len() >= 2);
    }

    #[tokio::test]
    async fn try_compact_wraps_summarizer_failure() {
        let big = "x".repeat(2000);
        let messages = vec![user(&big), assistant(&big), user(&big), assistant("recent reply")];
        let summarizer = FailingSummarizer;
        let err = CompactionEngine::try_compact(&messages, &settings(), &summarizer).await.unwrap_err();
        assert!(err.downcast_ref::<CompactionError>().is_some_and(|e| matches!(e, CompactionError::SummarizationFailed(_))));
    }

    #[tokio::test]
    async fn compacting_twice_updates_summary_instead_of_nesting() {
        let big = "x".repeat(2000);
        let messages = vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant("recent reply"),
        ];
        let summarizer = EchoSummarizer;
        let once = CompactionEngine::compact(messages, &settings(), &summarizer).await;

        let big2 = "y".repeat(2000);
        let mut twice_input = once.clone();
        twice_input.push(user(&big2));
        twice_input.push(assistant(&big2));
        twice_input.push(user(&big2));
        twice_input.push(assistant("even more recent"));

        let twice = CompactionEngine::compact(twice_input, &settings(), &summarizer).await;
        let AgentMessage::User { content } = &twice[0] else {
            panic!("expected leading summary message");
        };
        let text = content.text();
        assert_eq!(text.matches("<compaction-summary>").count(), 1);
    }
}
