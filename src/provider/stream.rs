//! Incremental decoding of the chat-completions event stream.
//!
//! The HTTP body arrives as arbitrary byte chunks. [`SseDecoder`] splits it
//! into `data:` lines (keeping any partial line until the next read), and
//! [`StreamAccumulator`] folds the decoded deltas into the assistant's text
//! and tool calls.

use std::collections::BTreeMap;

use super::types::{Message, StreamFrame, ToolCall};

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// One decoded line of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Payload of a `data:` line, prefix stripped.
    Data(String),
    /// The literal terminator frame.
    Done,
}

/// Line splitter for the event stream with carry-over across reads.
///
/// Bytes are buffered rather than text so a multi-byte character split across
/// two network reads is decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    carry: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every complete event found so far.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.carry.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.carry[consumed..].iter().position(|b| *b == b'\n') {
            let line = &self.carry[consumed..consumed + pos];
            if let Some(event) = parse_line(&String::from_utf8_lossy(line)) {
                events.push(event);
            }
            consumed += pos + 1;
        }
        self.carry.drain(..consumed);
        events
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.carry);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let trimmed = line.trim();
    let payload = trimmed.strip_prefix(DATA_PREFIX)?.trim_start();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_MARKER {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(payload.to_string()))
}

/// A partial tool call as it arrives on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Incremental unit handed to stream observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    ToolCall(ToolCallFragment),
    Finish(String),
}

/// Decode one `data:` payload into chunks.
///
/// Returns `None` for payloads that are not valid frames; the caller logs and
/// drops those rather than failing the stream.
pub fn decode_frame(payload: &str) -> Option<Vec<StreamChunk>> {
    let frame: StreamFrame = serde_json::from_str(payload).ok()?;
    let mut chunks = Vec::new();
    let Some(choice) = frame.choices.into_iter().next() else {
        return Some(chunks);
    };

    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
        chunks.push(StreamChunk::Text(content));
    }

    for (position, fragment) in choice.delta.tool_calls.into_iter().flatten().enumerate() {
        let (name, arguments) = match fragment.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        chunks.push(StreamChunk::ToolCall(ToolCallFragment {
            index: fragment.index.unwrap_or(position),
            id: fragment.id,
            name,
            arguments,
        }));
    }

    if let Some(reason) = choice.finish_reason {
        chunks.push(StreamChunk::Finish(reason));
    }

    Some(chunks)
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds stream chunks into the final assistant message.
///
/// Tool-call fragments sharing an index are merged in arrival order: the id
/// and name are taken from the first fragment that carries them, argument
/// text is concatenated.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<usize, PendingToolCall>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => self.content.push_str(text),
            StreamChunk::ToolCall(fragment) => self.apply_fragment(fragment),
            StreamChunk::Finish(reason) => self.finish_reason = Some(reason.clone()),
        }
    }

    fn apply_fragment(&mut self, fragment: &ToolCallFragment) {
        let starts_call = fragment.id.is_some() || fragment.name.is_some();
        if !starts_call && !self.tool_calls.contains_key(&fragment.index) {
            tracing::warn!(
                index = fragment.index,
                "Dropping tool-call fragment with no preceding call"
            );
            return;
        }

        let pending = self.tool_calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id.as_ref().filter(|id| !id.is_empty()) {
            if pending.id.is_empty() {
                pending.id = id.clone();
            }
        }
        if let Some(name) = fragment.name.as_ref().filter(|n| !n.is_empty()) {
            if pending.name.is_empty() {
                pending.name = name.clone();
            }
        }
        if let Some(args) = &fragment.arguments {
            pending.arguments.push_str(args);
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Produce the assistant message. Calls that never received a name are
    /// dropped; calls without an id get a positional one.
    pub fn into_message(self) -> Message {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .filter_map(|(index, pending)| {
                if pending.name.is_empty() {
                    tracing::warn!(index, "Dropping tool call without a name");
                    return None;
                }
                if serde_json::from_str::<serde_json::Value>(&pending.arguments).is_err()
                    && !pending.arguments.trim().is_empty()
                {
                    tracing::warn!(
                        index,
                        name = %pending.name,
                        "Tool call arguments are not valid JSON"
                    );
                }
                let id = if pending.id.is_empty() {
                    format!("call_{index}")
                } else {
                    pending.id
                };
                Some(ToolCall::new(id, pending.name, pending.arguments))
            })
            .collect();
        Message::assistant_with_tools(self.content, tool_calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_carries_partial_lines_across_reads() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        let events = decoder.feed(b":1}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]
        );
    }

    #[test]
    fn decoder_keeps_split_multibyte_characters() {
        let mut decoder = SseDecoder::new();
        let line = "data: 你好\n".as_bytes();
        let (head, tail) = line.split_at(8);
        assert!(decoder.feed(head).is_empty());
        assert_eq!(decoder.feed(tail), vec![SseEvent::Data("你好".into())]);
    }

    #[test]
    fn decoder_ignores_non_data_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\nevent: ping\n\ndata: x\n");
        assert_eq!(events, vec![SseEvent::Data("x".into())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(SseEvent::Done));
    }

    #[test]
    fn decode_frame_extracts_content_and_fragments() {
        let payload = r#"{"choices":[{"delta":{"content":"hi","tool_calls":[{"index":0,"id":"c1","function":{"name":"file_read","arguments":"{\"pa"}}]}}]}"#;
        let chunks = decode_frame(payload).unwrap();
        assert_eq!(chunks[0], StreamChunk::Text("hi".into()));
        match &chunks[1] {
            StreamChunk::ToolCall(f) => {
                assert_eq!(f.index, 0);
                assert_eq!(f.name.as_deref(), Some("file_read"));
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn decode_frame_rejects_garbage() {
        assert!(decode_frame("not json").is_none());
    }

    #[test]
    fn accumulator_concatenates_arguments_by_index() {
        let mut acc = StreamAccumulator::new();
        let frag = |index, id: Option<&str>, name: Option<&str>, args: &str| {
            StreamChunk::ToolCall(ToolCallFragment {
                index,
                id: id.map(String::from),
                name: name.map(String::from),
                arguments: Some(args.to_string()),
            })
        };
        acc.apply(&frag(0, Some("c1"), Some("file_read"), "{\"path\":"));
        acc.apply(&frag(1, Some("c2"), Some("list_dir"), "{}"));
        acc.apply(&frag(0, None, None, "\"a.txt\"}"));
        acc.apply(&StreamChunk::Text("ok".into()));

        let msg = acc.into_message();
        assert_eq!(msg.content, "ok");
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].arguments, "{\"path\":\"a.txt\"}");
        assert_eq!(msg.tool_calls[1].name, "list_dir");
    }

    #[test]
    fn accumulator_drops_orphan_fragments() {
        let mut acc = StreamAccumulator::new();
        acc.apply(&StreamChunk::ToolCall(ToolCallFragment {
            index: 3,
            id: None,
            name: None,
            arguments: Some("{}".into()),
        }));
        assert!(acc.into_message().tool_calls.is_empty());
    }
}
