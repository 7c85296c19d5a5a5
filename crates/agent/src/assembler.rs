//! Incremental assembly of a model turn.
//!
//! Two things happen to every streamed chunk:
//! - text is line-buffered so complete lines can be shown as they arrive
//! - tool-call deltas are merged per index into complete calls
//!
//! For providers that put tool calls inline as token markers instead of
//! structured deltas, [`parse_token_markers`] recovers them from the text.
//! It only runs when structured reconstruction produced nothing.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use regex::Regex;
use switchboard_core::chat::{ChatMessage, ToolCall};
use switchboard_core::provider::{FINISH_STOP, FINISH_TOOL_CALLS, StreamChunk, ToolCallDelta};
use tracing::{debug, trace};

/// Buffered text longer than this is delivered even without a newline.
pub const FLUSH_THRESHOLD: usize = 100;

/// Splits streamed text into complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: String,
    threshold: usize,
}

impl LineBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: String::new(),
            threshold,
        }
    }

    /// Append `delta` and return every piece ready for delivery: each
    /// complete line (newline included), then the partial remainder if it
    /// grew past the threshold.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut ready = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(pos + 1);
            ready.push(std::mem::replace(&mut self.buffer, rest));
        }

        if self.buffer.chars().count() > self.threshold {
            ready.push(std::mem::take(&mut self.buffer));
        }
        ready
    }

    /// Whatever is still buffered.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(FLUSH_THRESHOLD)
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Index-keyed accumulator of streamed tool-call fragments.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    /// Merge one delta. `id` and `name` overwrite; argument text appends.
    pub fn apply(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();

        if let Some(id) = &delta.id {
            call.id = id.clone();
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                call.name = name.clone();
            }
            if let Some(fragment) = &function.arguments {
                call.arguments.push_str(fragment);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// The reconstructed calls ordered by index. Clears the accumulator.
    pub fn take(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|c| ToolCall::new(c.id, c.name, c.arguments))
            .collect()
    }

    /// Drop every partial call.
    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

/// A finished model turn, ready for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledResponse {
    /// Response text. For tool-call turns, the JSON array of the calls.
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

impl AssembledResponse {
    /// Assemble a non-streamed response.
    pub fn from_message(message: ChatMessage, finish_reason: Option<String>) -> Self {
        let finish_reason = finish_reason.unwrap_or_else(|| {
            let reason = if message.tool_calls.is_empty() { FINISH_STOP } else { FINISH_TOOL_CALLS };
            reason.to_string()
        });
        finalize(message.content.unwrap_or_default(), message.tool_calls, finish_reason)
    }

    pub fn is_tool_call(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

fn finalize(text: String, mut tool_calls: Vec<ToolCall>, finish_reason: String) -> AssembledResponse {
    if tool_calls.is_empty() {
        tool_calls = parse_token_markers(&text);
        if !tool_calls.is_empty() {
            debug!(count = tool_calls.len(), "Recovered tool calls from token markers");
        }
    }

    let text = if tool_calls.is_empty() {
        text
    } else {
        serde_json::to_string(&tool_calls).unwrap_or_default()
    };

    AssembledResponse {
        text,
        tool_calls,
        finish_reason,
    }
}

/// Streaming assembler for one model turn.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    text: String,
    lines: LineBuffer,
    calls: ToolCallAccumulator,
    finish_reason: Option<String>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the text pieces ready for stream callbacks.
    pub fn push(&mut self, chunk: &StreamChunk) -> Vec<String> {
        for delta in &chunk.tool_calls {
            trace!(index = delta.index, "Tool call delta");
            self.calls.apply(delta);
        }

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason.clone();
        }

        match chunk.content.as_deref() {
            Some(content) if !content.is_empty() => {
                self.text.push_str(content);
                self.lines.push(content)
            }
            _ => Vec::new(),
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// End the stream. Returns the force-flushed remainder, if any, and the
    /// assembled response. Tool calls are only taken from the accumulator
    /// when the stream finished for tool calls; the accumulator is cleared
    /// either way.
    pub fn finish(mut self) -> (Option<String>, AssembledResponse) {
        let remainder = self.lines.flush();
        let finish_reason = self.finish_reason.take().unwrap_or_else(|| FINISH_STOP.to_string());

        let tool_calls = if finish_reason == FINISH_TOOL_CALLS {
            self.calls.take()
        } else {
            if !self.calls.is_empty() {
                debug!(%finish_reason, "Discarding tool call fragments");
            }
            self.calls.clear();
            Vec::new()
        };

        (remainder, finalize(self.text, tool_calls, finish_reason))
    }
}

static TOOL_CALL_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("tool call tag regex must compile")
});

static TOOL_CALL_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<\|tool_call_begin\|>\s*(.*?)\s*<\|tool_call_argument_begin\|>\s*(.*?)\s*<\|tool_call_end\|>")
        .expect("tool call token regex must compile")
});

/// Recover tool calls written into the text as token markers.
///
/// Recognizes `<tool_call>{"name": ..., "arguments": ...}</tool_call>` and
/// `<|tool_call_begin|>name<|tool_call_argument_begin|>{...}<|tool_call_end|>`.
/// Arguments are a best guess: the outermost `{...}` of the argument text.
pub fn parse_token_markers(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for caps in TOOL_CALL_TAG.captures_iter(text) {
        let body = caps.get(1).map_or("", |m| m.as_str());
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json_blob(body)) else {
            continue;
        };
        let Some(name) = value.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        let arguments = match value.get("arguments").or_else(|| value.get("parameters")) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "{}".to_string(),
        };
        calls.push(ToolCall::new(format!("call_{}", calls.len()), name, arguments));
    }

    for caps in TOOL_CALL_TOKENS.captures_iter(text) {
        let raw_name = caps.get(1).map_or("", |m| m.as_str());
        let name = normalize_marker_name(raw_name);
        if name.is_empty() {
            continue;
        }
        let arguments = json_blob(caps.get(2).map_or("", |m| m.as_str()));
        calls.push(ToolCall::new(format!("call_{}", calls.len()), name, arguments));
    }

    calls
}

/// `functions.get_weather:0` → `get_weather`
fn normalize_marker_name(raw: &str) -> &str {
    let name = raw.trim();
    let name = name.strip_prefix("functions.").unwrap_or(name);
    match name.rsplit_once(':') {
        Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

/// The outermost `{...}` of `text`, or `{}` when there is none.
fn json_blob(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => "{}",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(buffer: &mut LineBuffer, pieces: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for piece in pieces {
            out.extend(buffer.push(piece));
        }
        out.extend(buffer.flush());
        out
    }

    #[test]
    fn lines_are_delivered_whole_for_any_split() {
        let splits: &[&[&str]] = &[
            &["ab\ncd\nef"],
            &["a", "b", "\n", "c", "d\ne", "f"],
            &["ab\nc", "d\nef"],
            &["ab", "\ncd\n", "ef"],
        ];
        for split in splits {
            let mut buffer = LineBuffer::default();
            assert_eq!(deliver(&mut buffer, split), vec!["ab\n", "cd\n", "ef"], "split {split:?}");
        }
    }

    #[test]
    fn long_partial_line_is_force_flushed() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&"x".repeat(100)).is_empty());
        let out = buffer.push("y");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 101);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn interleaved_deltas_reconstruct_two_calls() {
        let chunks = vec![
            StreamChunk {
                tool_calls: vec![ToolCallDelta::start(0, "call_a", "search")],
                ..StreamChunk::default()
            },
            StreamChunk {
                tool_calls: vec![ToolCallDelta::start(1, "call_b", "calc"), ToolCallDelta::arguments(0, "{\"q\":")],
                ..StreamChunk::default()
            },
            StreamChunk {
                tool_calls: vec![ToolCallDelta::arguments(1, "{\"expr\":\"1+1\"}")],
                ..StreamChunk::default()
            },
            StreamChunk {
                tool_calls: vec![ToolCallDelta::arguments(0, "\"rust\"}")],
                ..StreamChunk::default()
            },
            StreamChunk::finish(FINISH_TOOL_CALLS),
        ];

        let mut assembler = StreamAssembler::new();
        for chunk in &chunks {
            assembler.push(chunk);
        }
        let (_, response) = assembler.finish();

        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].id, "call_a");
        assert_eq!(response.tool_calls[0].function.name, "search");
        assert_eq!(response.tool_calls[0].function.arguments, "{\"q\":\"rust\"}");
        assert_eq!(response.tool_calls[1].function.name, "calc");
        assert_eq!(response.tool_calls[1].function.arguments, "{\"expr\":\"1+1\"}");
    }

    #[test]
    fn tool_call_turn_replaces_leading_prose() {
        let mut assembler = StreamAssembler::new();
        assembler.push(&StreamChunk::text("Let me check that.\n"));
        assembler.push(&StreamChunk {
            tool_calls: vec![ToolCallDelta::start(0, "call_1", "search"), ToolCallDelta::arguments(0, "{}")],
            finish_reason: Some(FINISH_TOOL_CALLS.into()),
            ..StreamChunk::default()
        });
        let (_, response) = assembler.finish();

        let parsed: Vec<ToolCall> = serde_json::from_str(&response.text).unwrap();
        assert_eq!(parsed, response.tool_calls);
        assert!(!response.text.contains("Let me check"));
    }

    #[test]
    fn fragments_without_tool_calls_finish_are_discarded() {
        let mut assembler = StreamAssembler::new();
        assembler.push(&StreamChunk {
            tool_calls: vec![ToolCallDelta::start(0, "call_1", "search")],
            ..StreamChunk::default()
        });
        assembler.push(&StreamChunk::text("done"));
        assembler.push(&StreamChunk::finish(FINISH_STOP));
        let (remainder, response) = assembler.finish();

        assert_eq!(remainder.as_deref(), Some("done"));
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.text, "done");
    }

    #[test]
    fn tag_markers_are_recovered() {
        let text = r#"Sure. <tool_call>{"name": "get_weather", "arguments": {"city": "Oslo"}}</tool_call>"#;
        let calls = parse_token_markers(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].parsed_arguments().unwrap()["city"], "Oslo");
    }

    #[test]
    fn token_markers_are_recovered() {
        let text = "<|tool_calls_section_begin|><|tool_call_begin|>functions.get_weather:0<|tool_call_argument_begin|>{\"city\": \"Paris\"}<|tool_call_end|><|tool_calls_section_end|>";
        let calls = parse_token_markers(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"city\": \"Paris\"}");
    }

    #[test]
    fn markers_never_override_structured_calls() {
        let message = ChatMessage {
            content: Some(r#"<tool_call>{"name": "other", "arguments": {}}</tool_call>"#.into()),
            ..ChatMessage::assistant_tool_calls(vec![ToolCall::new("call_1", "search", "{}")])
        };
        let response = AssembledResponse::from_message(message, None);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.name, "search");
        assert_eq!(response.finish_reason, FINISH_TOOL_CALLS);
    }

    #[test]
    fn plain_text_has_no_markers() {
        assert!(parse_token_markers("just an answer").is_empty());
        let response = AssembledResponse::from_message(ChatMessage::assistant("hi"), None);
        assert_eq!(response.text, "hi");
        assert!(!response.is_tool_call());
    }
}
