use serde::Deserialize;
use types::{FinishReason, StreamEvent, ToolCallDelta};

pub(crate) const DONE_SENTINEL: &str = "[DONE]";

/// Splits a raw SSE byte stream into `data:` payloads.
///
/// Lines may be split across chunks at any byte, including inside a
/// multi-byte character. Comment lines, `event:`/`id:` fields and blank
/// separators are dropped. Each `data:` line is yielded on its own; the
/// upstream sends one JSON object per line.
#[derive(Debug, Default)]
pub struct SseDataParser {
    line_buffer: Vec<u8>,
}

impl SseDataParser {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                process_line(&line, &mut payloads);
            } else {
                self.line_buffer.push(*byte);
            }
        }
        payloads
    }

    /// Flushes a trailing line that never received its newline.
    pub fn finish(mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            process_line(&line, &mut payloads);
        }
        payloads
    }
}

fn process_line(line: &[u8], payloads: &mut Vec<String>) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() || line.starts_with(b":") {
        return;
    }

    let Some(mut data) = line.strip_prefix(b"data:") else {
        return;
    };
    if data.starts_with(b" ") {
        data = &data[1..];
    }
    match std::str::from_utf8(data) {
        Ok(data) => payloads.push(data.to_owned()),
        Err(error) => {
            tracing::debug!(%error, "skipping SSE data line with invalid UTF-8");
        }
    }
}

/// Outcome of decoding one `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPayload {
    Done,
    Skip,
    Events(Vec<StreamEvent>),
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Decodes one payload into typed events.
///
/// Events come out in a fixed order per choice: content, reasoning, one
/// `ToolCallDelta` per fragment as received, then the finish signal.
/// Payloads that are not JSON or carry no recognizable delta are skipped.
pub fn parse_stream_payload(payload: &str) -> StreamPayload {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return StreamPayload::Skip;
    }
    if trimmed == DONE_SENTINEL {
        return StreamPayload::Done;
    }

    let chunk = match serde_json::from_str::<ChatCompletionChunk>(trimmed) {
        Ok(chunk) => chunk,
        Err(error) => {
            tracing::debug!(%error, "skipping malformed stream payload");
            return StreamPayload::Skip;
        }
    };

    let recognizable = chunk
        .choices
        .iter()
        .any(|choice| choice.delta.is_some() || choice.finish_reason.is_some());
    if !recognizable {
        return StreamPayload::Skip;
    }

    let mut events = Vec::new();
    for choice in chunk.choices {
        let delta = choice.delta.unwrap_or_default();
        if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
            events.push(StreamEvent::ContentDelta(content));
        }
        if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
            events.push(StreamEvent::ReasoningDelta(reasoning));
        }
        for tool_call in delta.tool_calls.unwrap_or_default() {
            let function = tool_call.function.unwrap_or_default();
            if tool_call.id.is_none() && function.name.is_none() && function.arguments.is_none() {
                continue;
            }
            events.push(StreamEvent::ToolCallDelta(ToolCallDelta {
                index: tool_call.index,
                id: tool_call.id,
                name: function.name,
                arguments: function.arguments,
            }));
        }
        if let Some(reason) = choice.finish_reason.filter(|reason| !reason.is_empty()) {
            events.push(StreamEvent::TurnFinished(FinishReason::from_wire(&reason)));
        }
    }

    StreamPayload::Events(events)
}

/// Byte-level front end of one response stream: SSE framing plus payload
/// decoding. Once the `[DONE]` sentinel has been seen all further input is
/// ignored.
#[derive(Debug, Default)]
pub struct StreamParser {
    sse: SseDataParser,
    done: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Returns the events decoded from `chunk` and whether the sentinel has
    /// been observed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> (Vec<StreamEvent>, bool) {
        if self.done {
            return (Vec::new(), true);
        }
        let payloads = self.sse.push_chunk(chunk);
        let events = self.decode(payloads);
        (events, self.done)
    }

    /// Drains a trailing unterminated line once the transport has closed.
    pub fn finish(mut self) -> (Vec<StreamEvent>, bool) {
        if self.done {
            return (Vec::new(), true);
        }
        let sse = std::mem::take(&mut self.sse);
        let payloads = sse.finish();
        let events = self.decode(payloads);
        (events, self.done)
    }

    fn decode(&mut self, payloads: Vec<String>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for payload in payloads {
            match parse_stream_payload(&payload) {
                StreamPayload::Done => {
                    self.done = true;
                    break;
                }
                StreamPayload::Skip => {}
                StreamPayload::Events(decoded) => events.extend(decoded),
            }
        }
        events
    }
}
