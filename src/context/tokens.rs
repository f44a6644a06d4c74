//! Character-count token heuristic.
//!
//! Not a tokenizer. CJK characters count half a token each, everything else a
//! quarter, rounded up; each message adds a fixed overhead and each tool call
//! adds its name and argument text. The estimate is deterministic and never
//! decreases when text is appended.

use crate::provider::Message;

/// Fixed per-message overhead (role, separators).
pub const MESSAGE_OVERHEAD: usize = 4;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{3040}'..='\u{30ff}'
        | '\u{ac00}'..='\u{d7af}'
    )
}

/// `ceil(cjk / 2 + other / 4)`.
pub fn estimate_text(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    (2 * cjk + other).div_ceil(4)
}

pub fn estimate_message(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|tc| estimate_text(&tc.name) + estimate_text(&tc.arguments))
        .sum();
    MESSAGE_OVERHEAD + estimate_text(&message.content) + calls
}

pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolCall;

    #[test]
    fn ascii_is_a_quarter_token_per_char() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
    }

    #[test]
    fn cjk_is_half_a_token_per_char() {
        assert_eq!(estimate_text("你好"), 1);
        assert_eq!(estimate_text("你好世界"), 2);
        assert_eq!(estimate_text("你a"), 1);
    }

    #[test]
    fn message_includes_overhead_and_tool_calls() {
        let plain = Message::user("abcd");
        assert_eq!(estimate_message(&plain), MESSAGE_OVERHEAD + 1);

        let with_call = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("1", "list_dir", "{}")],
        );
        assert_eq!(estimate_message(&with_call), MESSAGE_OVERHEAD + 2 + 1);
    }

    #[test]
    fn estimate_is_monotonic_over_prefixes() {
        let full = "Mixed text 混合文本 with tool output ...";
        let chars: Vec<char> = full.chars().collect();
        let mut last = 0;
        for end in 0..=chars.len() {
            let prefix: String = chars[..end].iter().collect();
            let estimate = estimate_messages(&[Message::system("sys"), Message::user(prefix)]);
            assert!(estimate >= last, "estimate dropped at prefix length {end}");
            last = estimate;
        }
    }
}
