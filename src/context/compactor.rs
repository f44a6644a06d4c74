//! Summarizing compaction of the message log.
//!
//! The log is split into system messages (kept verbatim when
//! `preserve_system` is set), the oldest messages (summarized), and the most
//! recent `preserve_recent` non-system messages (kept verbatim). The result is
//! `[system] + [summary] + [recent]`.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;

use super::tokens::estimate_messages;
use crate::provider::{ChatProvider, Message, Role};

/// Prefix of the assistant message that replaces the summarized range.
pub const SUMMARY_PREFIX: &str = "[Context Summary]";

const SUMMARIZER_PROMPT: &str = "You are a context summarizer. Your task is to create a concise \
summary of the conversation history.
Focus on:
1. Key decisions made
2. Important information discovered
3. Tasks completed
4. Current state and pending work

Keep the summary brief and informative. Use bullet points if helpful.";

/// Outcome of one compaction, reported to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactResult {
    pub summary: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// Whether the structural fallback was used instead of a model summary.
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compactor {
    pub preserve_recent: usize,
    pub preserve_system: bool,
}

impl Default for Compactor {
    fn default() -> Self {
        Self {
            preserve_recent: 10,
            preserve_system: true,
        }
    }
}

struct Split {
    system: Vec<Message>,
    old: Vec<Message>,
    recent: Vec<Message>,
}

impl Compactor {
    pub fn new(preserve_recent: usize) -> Self {
        Self {
            preserve_recent,
            ..Self::default()
        }
    }

    fn split(&self, messages: &[Message]) -> Option<Split> {
        let (system, rest): (Vec<Message>, Vec<Message>) = if self.preserve_system {
            messages.iter().cloned().partition(|m| m.role == Role::System)
        } else {
            (Vec::new(), messages.to_vec())
        };

        if rest.len() <= self.preserve_recent {
            return None;
        }
        let cut = rest.len() - self.preserve_recent;
        let mut old = rest;
        let recent = old.split_off(cut);
        Some(Split {
            system,
            old,
            recent,
        })
    }

    /// Compact `messages`. Returns `None` when there is nothing to summarize.
    ///
    /// A provider failure or an empty summary falls back to
    /// [`fallback_summary`]; compaction itself never fails.
    pub async fn compact(
        &self,
        messages: &[Message],
        provider: &dyn ChatProvider,
        cancel: &CancellationToken,
    ) -> Option<(Vec<Message>, CompactResult)> {
        if messages.len() <= self.preserve_recent {
            return None;
        }
        let Split {
            system,
            old,
            recent,
        } = self.split(messages)?;

        let original_tokens = estimate_messages(messages);
        let (summary, fallback) = summarize(&old, provider, cancel).await;

        let mut compacted = system;
        compacted.push(Message::assistant(format!("{SUMMARY_PREFIX}\n{summary}")));
        compacted.extend(recent);

        let compressed_tokens = estimate_messages(&compacted);
        tracing::info!(
            original_tokens,
            compressed_tokens,
            summarized = old.len(),
            fallback,
            "Context compacted"
        );

        Some((
            compacted,
            CompactResult {
                summary,
                original_tokens,
                compressed_tokens,
                fallback,
            },
        ))
    }
}

async fn summarize(
    old: &[Message],
    provider: &dyn ChatProvider,
    cancel: &CancellationToken,
) -> (String, bool) {
    let prompt = vec![
        Message::system(SUMMARIZER_PROMPT),
        Message::user(format!(
            "Please summarize the following conversation history:\n\n{}",
            format_for_summary(old)
        )),
    ];

    match provider.chat(&prompt, &[], cancel).await {
        Ok(reply) if !reply.content.trim().is_empty() => (reply.content, false),
        Ok(_) => {
            tracing::warn!("Summarizer returned empty text, using structural summary");
            (fallback_summary(old), true)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to generate summary, using structural summary");
            (fallback_summary(old), true)
        }
    }
}

/// Render messages as summarizer input, truncating each by role.
pub fn format_for_summary(messages: &[Message]) -> String {
    let mut parts = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::System => parts.push(format!("[System]: {}", truncate(&msg.content, 300))),
            Role::User => parts.push(format!("[User]: {}", truncate(&msg.content, 500))),
            Role::Assistant if msg.has_tool_calls() => {
                let names: Vec<&str> = msg.tool_calls.iter().map(|tc| tc.name.as_str()).collect();
                parts.push(format!("[Assistant]: Used tools: {}", names.join(", ")));
                if !msg.content.is_empty() {
                    parts.push(format!("  Response: {}", truncate(&msg.content, 200)));
                }
            }
            Role::Assistant => {
                parts.push(format!("[Assistant]: {}", truncate(&msg.content, 500)))
            }
            Role::Tool => parts.push(format!("[Tool Result]: {}", truncate(&msg.content, 200))),
        }
    }
    parts.join("\n")
}

/// Deterministic summary from message counts and tool names.
pub fn fallback_summary(messages: &[Message]) -> String {
    let count = |role: Role| messages.iter().filter(|m| m.role == role).count();
    let tools: BTreeSet<&str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|tc| tc.name.as_str()))
        .collect();

    let mut summary = format!(
        "Previous conversation: {} user messages, {} assistant responses, {} tool calls.",
        count(Role::User),
        count(Role::Assistant),
        count(Role::Tool)
    );
    if !tools.is_empty() {
        let names: Vec<&str> = tools.into_iter().collect();
        summary.push_str(&format!("\nTools used: {}.", names.join(", ")));
    }
    summary
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{StreamChunk, ToolCall};
    use crate::tools::ToolDefinition;
    use async_trait::async_trait;

    struct FixedSummary(Result<String, ProviderError>);

    #[async_trait]
    impl ChatProvider for FixedSummary {
        async fn chat(
            &self,
            _: &[Message],
            _: &[ToolDefinition],
            _: &CancellationToken,
        ) -> Result<Message, ProviderError> {
            self.0.clone().map(Message::assistant)
        }

        async fn chat_stream(
            &self,
            messages: &[Message],
            tools: &[ToolDefinition],
            cancel: &CancellationToken,
            _: &mut (dyn for<'c> FnMut(&'c StreamChunk) + Send),
        ) -> Result<Message, ProviderError> {
            self.chat(messages, tools, cancel).await
        }
    }

    fn log(n: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("rules")];
        for i in 0..n {
            messages.push(Message::user(format!("question {i}")));
            messages.push(Message::assistant_with_tools(
                format!("answer {i}"),
                vec![ToolCall::new(format!("c{i}"), "file_read", "{}")],
            ));
            messages.push(Message::tool(format!("c{i}"), "contents"));
        }
        messages
    }

    #[tokio::test]
    async fn keeps_system_and_recent_tail() {
        let input = log(5);
        let provider = FixedSummary(Ok("short summary".into()));
        let (out, result) = Compactor::new(4)
            .compact(&input, &provider, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out[0], Message::system("rules"));
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[1].content, "[Context Summary]\nshort summary");
        assert_eq!(&out[2..], &input[input.len() - 4..]);
        assert!(!result.fallback);
        assert!(result.compressed_tokens < result.original_tokens);
    }

    #[tokio::test]
    async fn provider_failure_uses_structural_summary() {
        let input = log(3);
        let provider = FixedSummary(Err(ProviderError::Timeout));
        let (_, result) = Compactor::new(2)
            .compact(&input, &provider, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.fallback);
        assert!(result.summary.starts_with("Previous conversation: 3 user messages"));
        assert!(result.summary.contains("Tools used: file_read."));
    }

    #[tokio::test]
    async fn short_log_is_left_alone() {
        let input = log(1);
        let provider = FixedSummary(Ok("unused".into()));
        assert!(
            Compactor::new(10)
                .compact(&input, &provider, &CancellationToken::new())
                .await
                .is_none()
        );
    }

    #[test]
    fn summary_input_is_truncated_by_role() {
        let long = "x".repeat(1000);
        let text = format_for_summary(&[Message::tool("c1", long.clone()), Message::user(long)]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0].len(), "[Tool Result]: ".len() + 200);
        assert!(lines[0].ends_with("..."));
        assert_eq!(lines[1].len(), "[User]: ".len() + 500);
    }

    #[test]
    fn fallback_counts_roles() {
        let summary = fallback_summary(&[Message::user("a"), Message::assistant("b")]);
        assert_eq!(
            summary,
            "Previous conversation: 1 user messages, 1 assistant responses, 0 tool calls."
        );
    }
}
