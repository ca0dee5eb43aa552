//! Token estimation (§4.3): a char-count heuristic, chars/4 rounded up.

use crate::{AgentMessage, AssistantBlock, ToolResultBlock};

/// Per-image flat token cost for `toolResult` image blocks.
const IMAGE_CHAR_EQUIVALENT: usize = 4800;

fn chars_to_tokens(chars: usize) -> u64 {
    ((chars + 3) / 4) as u64
}

fn char_count(message: &AgentMessage) -> usize {
    match message {
        AgentMessage::User { content } => content.text().chars().count(),
        AgentMessage::Assistant { content, .. } => content
            .iter()
            .map(|block| match block {
                AssistantBlock::Text { text } | AssistantBlock::Thinking { text } => {
                    text.chars().count()
                }
                AssistantBlock::ToolCall { name, args, .. } => {
                    name.chars().count()
                        + serde_json::to_string(args)
                            .map(|s| s.chars().count())
                            .unwrap_or(0)
                }
            })
            .sum(),
        AgentMessage::ToolResult { content, .. } => content
            .iter()
            .map(|block| match block {
                ToolResultBlock::Text { text } => text.chars().count(),
                ToolResultBlock::Image { .. } => IMAGE_CHAR_EQUIVALENT,
            })
            .sum(),
    }
}

/// Estimated token cost of a single message.
pub fn estimate_tokens(message: &AgentMessage) -> u64 {
    chars_to_tokens(char_count(message))
}

/// Estimate the total context-token cost of `messages` per §4.3: scanning
/// from the tail, the first assistant message with completed (non-error,
/// non-aborted) usage contributes its reported usage total plus the
/// per-message estimate of everything after it. If no such assistant
/// exists, every message is estimated individually and summed.
pub fn context_tokens_estimate(messages: &[AgentMessage]) -> u64 {
    let mut tail_sum = 0u64;
    for message in messages.iter().rev() {
        if let Some(usage) = message.completed_usage() {
            let reported = if usage.total_tokens > 0 {
                usage.total_tokens
            } else {
                usage.input + usage.output + usage.cache_read + usage.cache_write
            };
            return reported + tail_sum;
        }
        tail_sum += estimate_tokens(message);
    }
    tail_sum
}
