//! Incremental decoder for the agent's `stream-json` output
//!
//! The agent prints one JSON record per line on stdout. Output arrives in
//! chunks that need not line up with record boundaries, so the decoder keeps
//! the trailing partial line between calls. This is the only place that knows
//! the shape of the agent's records.

use serde_json::Value;
use tracing::trace;

use super::StreamEvent;

/// Events decoded from a single output record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRecord {
    /// The conversation id the record reports, if any
    pub session_id: Option<String>,
    /// Events mapped from the record, in block order
    pub events: Vec<StreamEvent>,
}

/// Line-buffered decoder for newline-delimited JSON records
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw output and return the events of every completed line
    #[allow(dead_code)]
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<StreamEvent> {
        self.feed_records(chunk)
            .into_iter()
            .flat_map(|record| record.events)
            .collect()
    }

    /// Feed a chunk of raw output and return one entry per decoded record
    ///
    /// Lines that are not JSON objects are skipped.
    pub fn feed_records(&mut self, chunk: impl AsRef<[u8]>) -> Vec<DecodedRecord> {
        // Bytes already buffered hold no newline
        let scanned = self.buffer.len();
        self.buffer.extend_from_slice(chunk.as_ref());

        let Some(last_newline) = self.buffer[scanned..]
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| scanned + i)
        else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Decode whatever is left in the buffer as a final, unterminated line
    pub fn finish(&mut self) -> Vec<DecodedRecord> {
        let remaining = std::mem::take(&mut self.buffer);
        decode_line(&remaining).into_iter().collect()
    }

    /// Drop any buffered partial line
    #[allow(dead_code)]
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for a line terminator
    #[allow(dead_code)]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<DecodedRecord> {
    let line = match std::str::from_utf8(line) {
        Ok(s) => s.trim(),
        Err(e) => {
            trace!("Skipping non-UTF-8 output line: {}", e);
            return None;
        }
    };
    if line.is_empty() {
        return None;
    }

    let record: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            trace!("Skipping unparseable output line ({}): {}", e, line);
            return None;
        }
    };
    if !record.is_object() {
        trace!("Skipping non-object record: {}", line);
        return None;
    }

    Some(DecodedRecord {
        session_id: record
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        events: map_record(&record),
    })
}

/// Map one record to zero or more events
fn map_record(record: &Value) -> Vec<StreamEvent> {
    match record.get("type").and_then(Value::as_str) {
        Some("assistant") => content_blocks(record)
            .iter()
            .filter_map(map_assistant_block)
            .collect(),
        Some("user") => content_blocks(record)
            .iter()
            .filter(|block| block_type(block) == Some("tool_result"))
            .map(|block| {
                StreamEvent::tool_result(block.get("content").cloned().unwrap_or(Value::Null))
            })
            .collect(),
        Some("error") => vec![StreamEvent::error(error_message(record))],
        Some("result") if record.get("is_error").and_then(Value::as_bool) == Some(true) => {
            let message = record
                .get("result")
                .and_then(Value::as_str)
                .or_else(|| record.get("subtype").and_then(Value::as_str))
                .unwrap_or("Agent reported an error");
            vec![StreamEvent::error(message)]
        }
        _ => Vec::new(),
    }
}

fn content_blocks(record: &Value) -> &[Value] {
    record
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(Value::as_str)
}

fn map_assistant_block(block: &Value) -> Option<StreamEvent> {
    let text_field = |field: &str| block.get(field).and_then(Value::as_str);

    match block_type(block)? {
        "thinking" => text_field("thinking").map(StreamEvent::thinking),
        "text" => text_field("text").map(StreamEvent::message),
        "tool_use" => {
            let name = text_field("name")?;
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            Some(StreamEvent::tool_use(name, input))
        }
        _ => None,
    }
}

fn error_message(record: &Value) -> String {
    match record.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(error)) => error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Agent reported an error")
            .to_string(),
        _ => record
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Agent reported an error")
            .to_string(),
    }
}
