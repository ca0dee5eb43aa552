//! Cut-point algorithm (§4.3, §8 "Cut-point validity").

use super::tokens::estimate_tokens;
use crate::AgentMessage;

/// Result of [`find_cut_point`]: `messages[index..]` is the portion to keep
/// verbatim; everything before `index` is summarized. `is_split_turn`
/// indicates the kept tail starts partway through an in-progress
/// user→assistant exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutPoint {
    pub index: usize,
    pub is_split_turn: bool,
    /// Set only when `is_split_turn`: where the split turn's user message
    /// begins — `messages[turn_start..index]` is the "turn prefix" that
    /// must be summarized alongside the history.
    pub turn_start: Option<usize>,
}

impl CutPoint {
    fn no_cut() -> Self {
        Self {
            index: 0,
            is_split_turn: false,
            turn_start: None,
        }
    }
}

/// Walk `messages` from the tail accumulating per-message token estimates.
/// Once the accumulator reaches `keep_recent_tokens`, slide forward
/// (toward the tail) to the nearest `user`/`assistant` message — cutting on
/// a `toolResult` would separate a tool call from its result. If that
/// landing message is an `assistant`, the turn is split: walk backward to
/// the most recent `user` message to mark where the turn (to be partially
/// summarized) began.
pub fn find_cut_point(messages: &[AgentMessage], keep_recent_tokens: u64) -> CutPoint {
    if messages.is_empty() {
        return CutPoint::no_cut();
    }

    let mut accumulated = 0u64;
    let mut candidate = None;
    for i in (0..messages.len()).rev() {
        accumulated += estimate_tokens(&messages[i]);
        if accumulated >= keep_recent_tokens {
            candidate = Some(i);
            break;
        }
    }

    let Some(mut idx) = candidate else {
        return CutPoint::no_cut();
    };

    while idx < messages.len() && messages[idx].is_tool_result() {
        idx += 1;
    }
    if idx >= messages.len() {
        return CutPoint::no_cut();
    }

    if messages[idx].is_assistant() {
        let mut turn_start = idx;
        while turn_start > 0 && !messages[turn_start].is_user() {
            turn_start -= 1;
        }
        return CutPoint {
            index: idx,
            is_split_turn: true,
            turn_start: Some(turn_start),
        };
    }

    CutPoint {
        index: idx,
        is_split_turn: false,
        turn_start: None,
    }
}
