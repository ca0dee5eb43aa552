//! Summarization prompts and file-operation tracking (§4.3).

use crate::{AgentMessage, AssistantBlock, UserContent};
use std::collections::BTreeSet;

const SUMMARY_OPEN: &str = "<compaction-summary>";
const SUMMARY_CLOSE: &str = "</compaction-summary>";
const READ_FILES_OPEN: &str = "<read-files>";
const READ_FILES_CLOSE: &str = "</read-files>";
const MODIFIED_FILES_OPEN: &str = "<modified-files>";
const MODIFIED_FILES_CLOSE: &str = "</modified-files>";

/// A previously-written compaction summary, parsed back out of the first
/// message of a context so a new compaction can update it in place rather
/// than nesting (§8 "Compaction idempotence").
#[derive(Debug, Clone, Default)]
pub struct PreviousSummary {
    pub body: String,
    pub read_files: BTreeSet<String>,
    pub modified_files: BTreeSet<String>,
}

/// If `messages[0]` is a `user` message whose text contains a
/// `<compaction-summary>` wrapper, parse it out.
pub fn extract_previous_summary(messages: &[AgentMessage]) -> Option<PreviousSummary> {
    let AgentMessage::User { content } = messages.first()? else {
        return None;
    };
    let text = match content {
        UserContent::Text(s) => s.clone(),
        UserContent::Blocks(_) => content.text(),
    };
    let start = text.find(SUMMARY_OPEN)? + SUMMARY_OPEN.len();
    let end = text.find(SUMMARY_CLOSE)?;
    if end < start {
        return None;
    }
    let inner = &text[start..end];

    let read_files = extract_list_block(inner, READ_FILES_OPEN, READ_FILES_CLOSE);
    let modified_files = extract_list_block(inner, MODIFIED_FILES_OPEN, MODIFIED_FILES_CLOSE);
    let body = strip_block(inner, READ_FILES_OPEN, READ_FILES_CLOSE);
    let body = strip_block(&body, MODIFIED_FILES_OPEN, MODIFIED_FILES_CLOSE);

    Some(PreviousSummary {
        body: body.trim().to_string(),
        read_files,
        modified_files,
    })
}

fn extract_list_block(text: &str, open: &str, close: &str) -> BTreeSet<String> {
    let Some(start) = text.find(open) else {
        return BTreeSet::new();
    };
    let Some(end) = text[start..].find(close).map(|i| start + i) else {
        return BTreeSet::new();
    };
    text[start + open.len()..end]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_start_matches('-').trim().to_string())
        .collect()
}

fn strip_block(text: &str, open: &str, close: &str) -> String {
    let Some(start) = text.find(open) else {
        return text.to_string();
    };
    let Some(end) = text[start..].find(close).map(|i| start + i + close.len()) else {
        return text.to_string();
    };
    format!("{}{}", &text[..start], &text[end..])
}

/// File paths touched by `read`/`write`/`edit` tool calls across `messages`.
#[derive(Debug, Clone, Default)]
pub struct FileOps {
    pub read: BTreeSet<String>,
    pub write: BTreeSet<String>,
    pub edit: BTreeSet<String>,
}

impl FileOps {
    pub fn seeded_from(previous: Option<&PreviousSummary>) -> Self {
        let mut ops = Self::default();
        if let Some(previous) = previous {
            ops.read.extend(previous.read_files.iter().cloned());
            // Previously modified files were a union of write/edit; we no
            // longer know which, so seed both as "write" — it only affects
            // which of the two source sets they land in, not the final
            // modified-files union.
            ops.write.extend(previous.modified_files.iter().cloned());
        }
        ops
    }

    pub fn record(&mut self, messages: &[AgentMessage]) {
        for message in messages {
            let AgentMessage::Assistant { content, .. } = message else {
                continue;
            };
            for block in content {
                let AssistantBlock::ToolCall { name, args, .. } = block else {
                    continue;
                };
                let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
                    continue;
                };
                match name.as_str() {
                    "read" => {
                        self.read.insert(path.to_string());
                    }
                    "write" => {
                        self.write.insert(path.to_string());
                    }
                    "edit" => {
                        self.edit.insert(path.to_string());
                    }
                    _ => {}
                }
            }
        }
    }

    /// Files read but never later written or edited (sorted).
    pub fn read_only(&self) -> Vec<String> {
        self.read
            .iter()
            .filter(|p| !self.write.contains(*p) && !self.edit.contains(*p))
            .cloned()
            .collect()
    }

    /// Union of written and edited files (sorted, `BTreeSet` iteration order).
    pub fn modified(&self) -> Vec<String> {
        self.write.union(&self.edit).cloned().collect()
    }
}

/// Render a message list as a plain-text transcript for feeding to a
/// summarization prompt.
pub fn render_transcript(messages: &[AgentMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        match message {
            AgentMessage::User { content } => {
                out.push_str("User: ");
                out.push_str(&content.text());
                out.push('\n');
            }
            AgentMessage::Assistant { content, .. } => {
                out.push_str("Assistant: ");
                for block in content {
                    match block {
                        AssistantBlock::Text { text } => out.push_str(text),
                        AssistantBlock::Thinking { text } => {
                            out.push_str("[thinking] ");
                            out.push_str(text);
                        }
                        AssistantBlock::ToolCall { name, args, .. } => {
                            out.push_str(&format!("[tool call {name}({args})]"));
                        }
                    }
                }
                out.push('\n');
            }
            AgentMessage::ToolResult { content, is_error, .. } => {
                out.push_str(if *is_error { "ToolError: " } else { "ToolResult: " });
                for block in content {
                    if let crate::ToolResultBlock::Text { text } = block {
                        out.push_str(text);
                    }
                }
                out.push('\n');
            }
        }
    }
    out
}

/// The strict Markdown structure every summarization prompt demands.
const SUMMARY_STRUCTURE: &str = concat!(
    "Respond with Markdown using exactly these headings, in order: ",
    "## Goal, ## Constraints, ## Progress (### Done, ### In Progress, ### Blocked), ",
    "## Key Decisions, ## Next Steps, ## Critical Context."
);

/// Prompt for summarizing history with no previous summary to build on.
pub fn fresh_summary_prompt(transcript: &str) -> String {
    format!(
        "Summarize the following conversation history for future reference.\n\n{SUMMARY_STRUCTURE}\n\n---\n{transcript}"
    )
}

/// Prompt for updating an existing summary with newly-summarized history.
pub fn update_summary_prompt(previous_summary: &str, transcript: &str) -> String {
    format!(
        "Update the following previous summary with the additional conversation history below. \
         Produce a single merged summary, not two.\n\n{SUMMARY_STRUCTURE}\n\n\
         <previous-summary>\n{previous_summary}\n</previous-summary>\n\n---\n{transcript}"
    )
}

/// Prompt for summarizing the prefix of an in-progress turn being split.
pub fn turn_prefix_prompt(transcript: &str) -> String {
    format!(
        "Summarize the following in-progress conversation turn. It will be prepended to a \
         separate history summary.\n\n{SUMMARY_STRUCTURE}\n\n---\n{transcript}"
    )
}

/// Assemble the final synthetic summary message body, appending the
/// read-files/modified-files blocks.
pub fn render_summary_body(body: &str, file_ops: &FileOps) -> String {
    let mut out = String::new();
    out.push_str(SUMMARY_OPEN);
    out.push('\n');
    out.push_str(body.trim());
    out.push('\n');

    let read_only = file_ops.read_only();
    if !read_only.is_empty() {
        out.push_str(READ_FILES_OPEN);
        out.push('\n');
        for path in read_only {
            out.push_str(&format!("- {path}\n"));
        }
        out.push_str(READ_FILES_CLOSE);
        out.push('\n');
    }

    let modified = file_ops.modified();
    if !modified.is_empty() {
        out.push_str(MODIFIED_FILES_OPEN);
        out.push('\n');
        for path in modified {
            out.push_str(&format!("- {path}\n"));
        }
        out.push_str(MODIFIED_FILES_CLOSE);
        out.push('\n');
    }

    out.push_str(SUMMARY_CLOSE);
    out
}
