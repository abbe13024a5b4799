//! Context-window management pipeline.
//!
//! Runs before every upstream call: optional history-turn limiting, then
//! tool-result truncation against the resolved window. All passes are
//! copy-on-write — the caller's slice is never mutated — and the whole
//! pipeline is idempotent for an unchanged budget.
//!
//! Token counts here are heuristics (length/4) used for pre-flight
//! decisions, never exact accounting; the authoritative signal is the
//! provider's context-overflow error, which the orchestrator repairs by
//! re-limiting and then LLM-summarizing the middle of the transcript.

use hivebot_core::types::{Message, MessageContent};
use hivebot_providers::{ChatProvider, LlmRequestConfig, ProviderError};
use tracing::{debug, info};

/// Appended to any tool result the pipeline cuts down.
pub const TRUNCATION_SUFFIX: &str =
    "[Content truncated — original was too large for the model's context window.]";

/// Prefix of the synthetic message produced by compaction.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary]:";

/// Window used when neither the agent nor the profile declares one.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// Tokens reserved for the system prompt and the response.
pub const RESERVED_TOKENS: u32 = 4096;

/// Tool results may use at most this fraction of the window.
const TOOL_RESULT_WINDOW_FRACTION: f64 = 0.3;

/// Floor for the tool-result budget, in tokens.
const TOOL_RESULT_FLOOR_TOKENS: usize = 500;

/// Fixed token overhead charged per non-text block.
const NON_TEXT_BLOCK_OVERHEAD: usize = 50;

/// Messages kept verbatim at the head during compaction.
const COMPACT_HEAD_KEEP: usize = 1;

/// Messages kept verbatim at the tail during compaction.
const COMPACT_TAIL_KEEP: usize = 12;

// ─────────────────────────────────────────────
// Estimation
// ─────────────────────────────────────────────

/// Estimate the token cost of one message: text length / 4 with a floor
/// of 1, plus a fixed overhead per non-text block.
pub fn estimate_message_tokens(msg: &Message) -> usize {
    let mut tokens = 0usize;
    match msg {
        Message::System { content } => tokens += content.len() / 4,
        Message::User { content } => match content {
            MessageContent::Text(text) => tokens += text.len() / 4,
            MessageContent::Parts(parts) => {
                for part in parts {
                    match part {
                        hivebot_core::types::ContentPart::Text { text } => tokens += text.len() / 4,
                        hivebot_core::types::ContentPart::ImageUrl { .. } => {
                            tokens += NON_TEXT_BLOCK_OVERHEAD
                        }
                    }
                }
            }
        },
        Message::Assistant {
            content,
            tool_calls,
            reasoning_content,
        } => {
            if let Some(text) = content {
                tokens += text.len() / 4;
            }
            if let Some(thinking) = reasoning_content {
                tokens += thinking.len() / 4;
            }
            for call in tool_calls.iter().flatten() {
                tokens += NON_TEXT_BLOCK_OVERHEAD + call.function.arguments.len() / 4;
            }
        }
        Message::Tool { content, .. } => tokens += content.len() / 4,
    }
    tokens.max(1)
}

/// Estimate total tokens across messages.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Resolve the effective window: `min(agent, profile)` with 0 meaning
/// unspecified on either side, defaulting to 128k, minus the reserve.
pub fn resolve_context_window(agent_tokens: u32, profile_tokens: u32) -> u32 {
    let window = match (agent_tokens, profile_tokens) {
        (0, 0) => DEFAULT_CONTEXT_WINDOW,
        (a, 0) => a,
        (0, p) => p,
        (a, p) => a.min(p),
    };
    window.saturating_sub(RESERVED_TOKENS).max(1)
}

// ─────────────────────────────────────────────
// Pipeline passes
// ─────────────────────────────────────────────

/// Keep only the last `max_turns` user turns, each with the assistant and
/// tool messages that follow it. Leading system messages are always kept.
pub fn limit_history_turns(messages: &[Message], max_turns: usize) -> Vec<Message> {
    let system_end = messages
        .iter()
        .position(|m| !matches!(m, Message::System { .. }))
        .unwrap_or(messages.len());

    if max_turns == 0 {
        return messages[..system_end].to_vec();
    }

    let user_positions: Vec<usize> = messages[system_end..]
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m, Message::User { .. }))
        .map(|(i, _)| i + system_end)
        .collect();

    if user_positions.len() <= max_turns {
        return messages.to_vec();
    }

    let cut = user_positions[user_positions.len() - max_turns];
    let mut result = messages[..system_end].to_vec();
    result.extend_from_slice(&messages[cut..]);
    debug!(
        dropped = cut - system_end,
        kept_turns = max_turns,
        "history limited"
    );
    result
}

/// Truncate oversized tool results against the window. Returns a new
/// vector; untouched messages are cloned as-is. Already-truncated results
/// (suffix present) are left alone, which keeps the pass idempotent.
pub fn truncate_tool_results(messages: &[Message], context_window: u32) -> Vec<Message> {
    let budget_tokens = ((context_window as f64 * TOOL_RESULT_WINDOW_FRACTION) as usize)
        .max(TOOL_RESULT_FLOOR_TOKENS);
    let budget_chars = budget_tokens * 4;

    messages
        .iter()
        .map(|msg| match msg {
            Message::Tool {
                content,
                tool_call_id,
                tool_name,
            } if content.len() > budget_chars && !content.ends_with(TRUNCATION_SUFFIX) => {
                let keep = budget_chars.saturating_sub(TRUNCATION_SUFFIX.len() + 1);
                let cut = floor_char_boundary(content, keep);
                let truncated = format!("{}\n{}", &content[..cut], TRUNCATION_SUFFIX);
                debug!(
                    tool_call_id = %tool_call_id,
                    original_len = content.len(),
                    truncated_len = truncated.len(),
                    "tool result truncated"
                );
                Message::Tool {
                    content: truncated,
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                }
            }
            other => other.clone(),
        })
        .collect()
}

/// Largest index ≤ `at` that lands on a char boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut idx = at;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// The per-turn context pipeline.
#[derive(Clone, Debug)]
pub struct ContextPipeline {
    /// Keep only the last N user turns (None = unlimited).
    pub max_history_turns: Option<usize>,
    /// Effective context window in tokens (already net of the reserve).
    pub context_window: u32,
}

impl ContextPipeline {
    /// Apply the pipeline: history limit, then tool-result truncation.
    pub fn prepare(&self, messages: &[Message]) -> Vec<Message> {
        let limited = match self.max_history_turns {
            Some(n) => limit_history_turns(messages, n),
            None => messages.to_vec(),
        };
        truncate_tool_results(&limited, self.context_window)
    }

    /// Estimated tokens after preparation.
    pub fn estimate(&self, messages: &[Message]) -> usize {
        estimate_tokens(&self.prepare(messages))
    }
}

// ─────────────────────────────────────────────
// Compaction (LLM summarization of the middle)
// ─────────────────────────────────────────────

/// Summarize the middle of the transcript into one synthetic user message,
/// keeping the head and the last few messages verbatim.
pub async fn compact_messages(
    provider: &dyn ChatProvider,
    model: &str,
    config: &LlmRequestConfig,
    messages: &[Message],
) -> Result<Vec<Message>, ProviderError> {
    if messages.len() <= COMPACT_HEAD_KEEP + COMPACT_TAIL_KEEP {
        return Ok(messages.to_vec());
    }

    let middle = &messages[COMPACT_HEAD_KEEP..messages.len() - COMPACT_TAIL_KEEP];
    let mut transcript = String::new();
    for msg in middle {
        let text = msg.text().unwrap_or("(non-text content)");
        transcript.push_str(msg.role());
        transcript.push_str(": ");
        transcript.push_str(text);
        transcript.push('\n');
    }

    let prompt = format!(
        "Summarize the following conversation segment. Preserve decisions, \
         facts, open tasks, and tool outcomes the assistant may still need. \
         Be concise.\n\n{transcript}"
    );
    let summary_request = vec![
        Message::system("You compress conversation history into faithful summaries."),
        Message::user(prompt),
    ];

    let response = provider
        .chat(&summary_request, None, model, config)
        .await?;
    let summary = response.content.unwrap_or_default();

    let mut result = messages[..COMPACT_HEAD_KEEP].to_vec();
    result.push(Message::user(format!("{SUMMARY_PREFIX} {summary}")));
    result.extend_from_slice(&messages[messages.len() - COMPACT_TAIL_KEEP..]);

    info!(
        before = messages.len(),
        after = result.len(),
        "transcript compacted"
    );
    Ok(result)
}

// ─────────────────────────────────────────────
// Optimizer (pre-flight compression by priority)
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

fn priority_of(messages: &[Message], index: usize) -> Priority {
    let msg = &messages[index];
    match msg {
        Message::System { .. } => Priority::Critical,
        _ if index + 3 >= messages.len() => Priority::High,
        Message::Tool { .. } => Priority::High,
        Message::Assistant {
            tool_calls: Some(calls),
            ..
        } if !calls.is_empty() => Priority::High,
        Message::User { .. } => Priority::Medium,
        _ => Priority::Low,
    }
}

/// Compress a known-over-budget transcript before the first call:
/// drop reasoning, truncate long texts, then drop lowest-priority
/// messages until the budget is met. The last user message survives
/// unconditionally.
pub fn optimize_messages(messages: &[Message], budget_tokens: usize) -> Vec<Message> {
    if estimate_tokens(messages) <= budget_tokens {
        return messages.to_vec();
    }

    // Pass 1: drop reasoning side-channels.
    let mut result: Vec<Message> = messages
        .iter()
        .map(|m| match m {
            Message::Assistant {
                content,
                tool_calls,
                reasoning_content: Some(_),
            } => Message::Assistant {
                content: content.clone(),
                tool_calls: tool_calls.clone(),
                reasoning_content: None,
            },
            other => other.clone(),
        })
        .collect();

    // Pass 2: truncate long texts.
    if estimate_tokens(&result) > budget_tokens {
        result = result
            .iter()
            .map(|m| match m {
                Message::User {
                    content: MessageContent::Text(text),
                } if text.len() >= 500 => {
                    Message::user(format!("{}… [truncated]", &text[..floor_char_boundary(text, 500)]))
                }
                Message::Tool {
                    content,
                    tool_call_id,
                    tool_name,
                } if content.len() >= 500 => Message::Tool {
                    content: format!(
                        "{}… [truncated]",
                        &content[..floor_char_boundary(content, 500)]
                    ),
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                },
                Message::Assistant {
                    content: Some(text),
                    tool_calls,
                    reasoning_content,
                } if text.len() >= 500 => Message::Assistant {
                    content: Some(format!(
                        "{}… [truncated]",
                        &text[..floor_char_boundary(text, 500)]
                    )),
                    tool_calls: tool_calls.clone(),
                    reasoning_content: reasoning_content.clone(),
                },
                other => other.clone(),
            })
            .collect();
    }

    // Pass 3: drop lowest priority first until within budget.
    let last_user = result
        .iter()
        .rposition(|m| matches!(m, Message::User { .. }));
    for level in [Priority::Low, Priority::Medium, Priority::High] {
        while estimate_tokens(&result) > budget_tokens {
            let victim = result
                .iter()
                .enumerate()
                .position(|(i, _)| priority_of(&result, i) == level && Some(i) != last_user_pos(&result, last_user));
            match victim {
                Some(i) => {
                    result.remove(i);
                }
                None => break,
            }
        }
        if estimate_tokens(&result) <= budget_tokens {
            break;
        }
    }

    result
}

/// Recompute where the protected last user message sits after removals.
fn last_user_pos(messages: &[Message], original: Option<usize>) -> Option<usize> {
    original?;
    messages
        .iter()
        .rposition(|m| matches!(m, Message::User { .. }))
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hivebot_core::types::{LlmResponse, ToolCall, ToolDefinition};

    #[test]
    fn test_estimate_floor() {
        assert_eq!(estimate_message_tokens(&Message::user("")), 1);
        assert_eq!(estimate_message_tokens(&Message::user("ab")), 1);
    }

    #[test]
    fn test_estimate_text_length() {
        let msg = Message::user("a".repeat(400));
        assert_eq!(estimate_message_tokens(&msg), 100);
    }

    #[test]
    fn test_estimate_non_text_overhead() {
        let msg = Message::assistant_with_calls(None, vec![ToolCall::new("t", "now", "{}")]);
        assert!(estimate_message_tokens(&msg) >= 50);
    }

    #[test]
    fn test_resolve_window() {
        assert_eq!(resolve_context_window(0, 0), 128_000 - 4096);
        assert_eq!(resolve_context_window(64_000, 0), 64_000 - 4096);
        assert_eq!(resolve_context_window(0, 32_000), 32_000 - 4096);
        assert_eq!(resolve_context_window(64_000, 32_000), 32_000 - 4096);
    }

    #[test]
    fn test_history_limit_keeps_following_messages() {
        let messages = vec![
            Message::system("sys"),
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant_with_calls(None, vec![ToolCall::new("t1", "now", "{}")]),
            Message::tool_result("t1", "now", "12:00"),
            Message::assistant("a2"),
            Message::user("q3"),
            Message::assistant("a3"),
        ];

        let limited = limit_history_turns(&messages, 2);
        // system + (q2, tool-call turn) + (q3 turn)
        assert_eq!(limited[0].text(), Some("sys"));
        assert_eq!(limited[1].text(), Some("q2"));
        let users = limited
            .iter()
            .filter(|m| matches!(m, Message::User { .. }))
            .count();
        assert_eq!(users, 2);
        // Every message following each kept user message is preserved.
        assert_eq!(limited.len(), 8);
    }

    #[test]
    fn test_history_limit_under_max_is_identity() {
        let messages = vec![Message::user("q1"), Message::assistant("a1")];
        let limited = limit_history_turns(&messages, 5);
        assert_eq!(limited, messages);
    }

    #[test]
    fn test_truncation_short_result_unchanged() {
        let messages = vec![Message::tool_result("t1", "now", "short output")];
        let result = truncate_tool_results(&messages, 128_000);
        assert_eq!(result, messages);
    }

    #[test]
    fn test_truncation_long_result_gets_suffix() {
        let long = "x".repeat(3_000);
        let messages = vec![Message::tool_result("t1", "read", long)];
        // Window of 1000 tokens → floor kicks in at 500 tokens = 2000 chars.
        let result = truncate_tool_results(&messages, 1_000);
        let content = result[0].text().unwrap();
        assert!(content.ends_with(TRUNCATION_SUFFIX));
        assert!(content.len() <= 2_000);
    }

    #[test]
    fn test_truncation_floor_of_500_tokens() {
        // Tiny window still allows 500 tokens (2000 chars) of tool result.
        let content = "y".repeat(1_900);
        let messages = vec![Message::tool_result("t1", "read", content)];
        let result = truncate_tool_results(&messages, 100);
        assert_eq!(result, messages);
    }

    #[test]
    fn test_truncation_does_not_mutate_input() {
        let long = "z".repeat(10_000);
        let messages = vec![Message::tool_result("t1", "read", long.clone())];
        let _ = truncate_tool_results(&messages, 1_000);
        assert_eq!(messages[0].text().unwrap(), long);
    }

    #[test]
    fn test_pipeline_idempotent() {
        let pipeline = ContextPipeline {
            max_history_turns: Some(3),
            context_window: 1_000,
        };
        let mut messages = vec![Message::system("sys")];
        for i in 0..10 {
            messages.push(Message::user(format!("question {i}")));
            messages.push(Message::assistant_with_calls(
                None,
                vec![ToolCall::new(format!("t{i}"), "read", "{}")],
            ));
            messages.push(Message::tool_result(
                format!("t{i}"),
                "read",
                "w".repeat(5_000),
            ));
            messages.push(Message::assistant(format!("answer {i}")));
        }

        let once = pipeline.prepare(&messages);
        let twice = pipeline.prepare(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_floor_char_boundary_multibyte() {
        let s = "日本語テキスト";
        let idx = floor_char_boundary(s, 4);
        assert!(s.is_char_boundary(idx));
        assert!(idx <= 4);
    }

    // ── Compaction ──

    struct SummaryProvider;

    #[async_trait]
    impl ChatProvider for SummaryProvider {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> Result<LlmResponse, ProviderError> {
            // The summarization request is a fresh 2-message prompt.
            assert_eq!(messages.len(), 2);
            Ok(LlmResponse {
                content: Some("the gist of it".into()),
                ..Default::default()
            })
        }

        fn default_model(&self) -> &str {
            "sum"
        }

        fn display_name(&self) -> &str {
            "Summary"
        }
    }

    #[tokio::test]
    async fn test_compact_replaces_middle() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..20 {
            messages.push(Message::user(format!("q{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }
        let original_len = messages.len(); // 41

        let compacted = compact_messages(
            &SummaryProvider,
            "sum",
            &LlmRequestConfig::default(),
            &messages,
        )
        .await
        .unwrap();

        // head(1) + summary(1) + tail(12)
        assert_eq!(compacted.len(), 14);
        assert_eq!(compacted[0].text(), Some("sys"));
        let summary = compacted[1].text().unwrap();
        assert!(summary.starts_with(SUMMARY_PREFIX));
        assert!(summary.contains("the gist of it"));
        // Tail preserved verbatim.
        assert_eq!(
            compacted[13].text(),
            messages[original_len - 1].text()
        );
    }

    #[tokio::test]
    async fn test_compact_short_transcript_untouched() {
        let messages = vec![
            Message::system("sys"),
            Message::user("q"),
            Message::assistant("a"),
        ];
        let compacted = compact_messages(
            &SummaryProvider,
            "sum",
            &LlmRequestConfig::default(),
            &messages,
        )
        .await
        .unwrap();
        assert_eq!(compacted, messages);
    }

    // ── Optimizer ──

    #[test]
    fn test_optimizer_under_budget_is_identity() {
        let messages = vec![Message::user("short")];
        assert_eq!(optimize_messages(&messages, 10_000), messages);
    }

    #[test]
    fn test_optimizer_drops_reasoning_first() {
        let messages = vec![
            Message::system("sys"),
            Message::Assistant {
                content: Some("visible".into()),
                tool_calls: None,
                reasoning_content: Some("x".repeat(4_000)),
            },
            Message::user("q"),
        ];
        let optimized = optimize_messages(&messages, 50);
        for msg in &optimized {
            if let Message::Assistant {
                reasoning_content, ..
            } = msg
            {
                assert!(reasoning_content.is_none());
            }
        }
    }

    #[test]
    fn test_optimizer_preserves_last_user_message() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..30 {
            messages.push(Message::user(format!("filler {} {}", i, "f".repeat(600))));
        }
        messages.push(Message::user("the final question"));

        let optimized = optimize_messages(&messages, 60);
        assert!(optimized
            .iter()
            .any(|m| m.text() == Some("the final question")));
    }

    #[test]
    fn test_optimizer_keeps_system() {
        let mut messages = vec![Message::system("sys prompt")];
        for _ in 0..20 {
            messages.push(Message::user("p".repeat(600)));
        }
        let optimized = optimize_messages(&messages, 100);
        assert!(matches!(optimized[0], Message::System { .. }));
    }
}
