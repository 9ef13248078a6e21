//! Streaming parser for the agent's stdout protocol.
//!
//! The in-container agent emits concatenated JSON objects, one per event,
//! possibly interleaved with plain log lines and shell noise. Chunks arrive
//! from a pipe with arbitrary fragmentation, so a record can be split at any
//! byte. This parser turns that byte stream into an ordered sequence of
//! typed [`AgentMessage`] values.
//!
//! The scanner balances braces while tracking JSON string state, so braces
//! inside string values do not affect nesting depth. Bytes preceding the
//! first opener are discarded as noise; a record that fails to decode is
//! dropped without disturbing the records after it.

use bytes::{Buf, BytesMut};
use serde_json::Value;

/// Token counts reported by the agent in its terminal record.
///
/// Both `input_tokens`/`output_tokens` and their camel-cased variants are
/// accepted on input; serialization is always snake-cased.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    fn from_value(v: Option<&Value>) -> Self {
        let Some(v) = v else {
            return Self::default();
        };
        Self {
            input_tokens: field_u64(v, "input_tokens", "inputTokens"),
            output_tokens: field_u64(v, "output_tokens", "outputTokens"),
        }
    }
}

/// Outcome of a turn as reported by the terminal record's `subtype`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultSubtype {
    Success,
    Error,
}

/// The terminal record of a turn, with the fields the host cares about
/// pulled out of the raw payload.
#[derive(Clone, Debug)]
pub struct ResultRecord {
    pub subtype: ResultSubtype,
    /// Final text produced by the agent, if any.
    pub result: Option<String>,
    pub usage: TokenUsage,
    pub duration_ms: Option<u64>,
    /// Agent-level session identifier, reported so a later turn can resume
    /// the same agent context.
    pub session_id: Option<String>,
    /// The decoded record as received, kept for republication.
    pub payload: Value,
}

impl ResultRecord {
    fn from_value(payload: Value) -> Self {
        let subtype = match payload.get("subtype").and_then(Value::as_str) {
            Some("error") => ResultSubtype::Error,
            _ => ResultSubtype::Success,
        };
        Self {
            subtype,
            result: payload
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: TokenUsage::from_value(payload.get("usage")),
            duration_ms: opt_field_u64(&payload, "duration_ms", "durationMs"),
            session_id: field_str(&payload, "session_id", "sessionId"),
            payload,
        }
    }

    pub fn is_error(&self) -> bool {
        self.subtype == ResultSubtype::Error
    }
}

/// One parsed record from the agent's output stream, tagged by its `type`
/// field. `Result` is the terminal record of a turn; everything else is
/// streamed to subscribers as it arrives.
#[derive(Clone, Debug)]
pub enum AgentMessage {
    Assistant(Value),
    ToolUse(Value),
    ToolResult(Value),
    System(Value),
    Error(Value),
    Result(ResultRecord),
}

impl AgentMessage {
    /// The wire tag for this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Assistant(_) => "assistant",
            AgentMessage::ToolUse(_) => "tool_use",
            AgentMessage::ToolResult(_) => "tool_result",
            AgentMessage::System(_) => "system",
            AgentMessage::Error(_) => "error",
            AgentMessage::Result(_) => "result",
        }
    }

    /// True for the record that ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentMessage::Result(_))
    }

    /// The record as received, for republication on the output channel.
    pub fn payload(&self) -> &Value {
        match self {
            AgentMessage::Assistant(v)
            | AgentMessage::ToolUse(v)
            | AgentMessage::ToolResult(v)
            | AgentMessage::System(v)
            | AgentMessage::Error(v) => v,
            AgentMessage::Result(r) => &r.payload,
        }
    }
}

/// Classify an already-decoded record into a message, or `None` when the
/// record carries no recognized `type`.
///
/// A `message` envelope is unwrapped first: the inner `type` wins.
pub fn classify(value: Value) -> Option<AgentMessage> {
    let tag = effective_type(&value)?.to_string();
    match tag.as_str() {
        "assistant" => Some(AgentMessage::Assistant(value)),
        "tool_use" => Some(AgentMessage::ToolUse(value)),
        "tool_result" => Some(AgentMessage::ToolResult(value)),
        "system" => Some(AgentMessage::System(value)),
        "error" => Some(AgentMessage::Error(value)),
        "result" => Some(AgentMessage::Result(ResultRecord::from_value(value))),
        _ => None,
    }
}

fn effective_type(v: &Value) -> Option<&str> {
    let tag = v.get("type")?.as_str()?;
    if tag == "message" {
        v.get("message")?.get("type")?.as_str()
    } else {
        Some(tag)
    }
}

fn field_u64(v: &Value, snake: &str, camel: &str) -> u64 {
    opt_field_u64(v, snake, camel).unwrap_or(0)
}

fn opt_field_u64(v: &Value, snake: &str, camel: &str) -> Option<u64> {
    v.get(snake)
        .or_else(|| v.get(camel))
        .and_then(Value::as_u64)
}

fn field_str(v: &Value, snake: &str, camel: &str) -> Option<String> {
    v.get(snake)
        .or_else(|| v.get(camel))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Incremental brace-balancing scanner over a byte stream.
///
/// Feed chunks as they arrive; each call returns the messages completed by
/// that chunk, in stream order. State between calls is a rolling buffer,
/// the string/escape flags, the current nesting depth, and a scan cursor so
/// a feed only ever examines new bytes.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: BytesMut,
    /// True once an opener has been seen and the record is still open.
    inside: bool,
    depth: u32,
    in_string: bool,
    escaped: bool,
    /// First byte not yet examined for balancing.
    scan_pos: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AgentMessage> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            if !self.inside {
                // Discard noise bytes up to the first opener.
                match self.buf.iter().position(|&b| b == b'{') {
                    Some(i) => {
                        self.buf.advance(i);
                        self.inside = true;
                        self.depth = 0;
                        self.in_string = false;
                        self.escaped = false;
                        self.scan_pos = 0;
                    }
                    None => {
                        self.buf.clear();
                        return out;
                    }
                }
            }

            match self.scan_for_close() {
                Some(end) => {
                    let record = self.buf.split_to(end + 1);
                    self.inside = false;
                    self.scan_pos = 0;
                    if let Some(msg) = decode_record(&record) {
                        out.push(msg);
                    }
                    // Tail may hold more records or noise; keep scanning.
                }
                None => {
                    self.scan_pos = self.buf.len();
                    return out;
                }
            }
        }
    }

    /// Scan from the cursor, updating depth and string state. Returns the
    /// index of the byte that closes the record, if reached.
    fn scan_for_close(&mut self) -> Option<usize> {
        let mut i = self.scan_pos;
        while i < self.buf.len() {
            let b = self.buf[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            return Some(i);
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        None
    }

    /// True while a started record has not yet closed.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop buffered bytes and scanning state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.inside = false;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.scan_pos = 0;
    }
}

fn decode_record(bytes: &[u8]) -> Option<AgentMessage> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => classify(value),
        Err(e) => {
            log::debug!("discarding undecodable record ({} bytes): {e}", bytes.len());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(text: &str) -> String {
        json!({"type": "assistant", "content": text}).to_string()
    }

    #[test]
    fn test_single_record() {
        let mut parser = StreamParser::new();
        let msgs = parser.feed(assistant("hello").as_bytes());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "assistant");
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_noise_before_and_between_records() {
        let mut parser = StreamParser::new();
        let input = format!(
            "booting agent...\n{}\nsome log line\n{}\n",
            assistant("a"),
            assistant("b")
        );
        let msgs = parser.feed(input.as_bytes());
        assert_eq!(msgs.len(), 2);
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_split_at_every_byte() {
        // feed(a ++ b) must equal feed(a); feed(b) for any split point.
        let record = assistant("fragmented");
        let input = format!("garbage{record}");
        for split in 0..input.len() {
            let mut parser = StreamParser::new();
            let mut msgs = parser.feed(&input.as_bytes()[..split]);
            msgs.extend(parser.feed(&input.as_bytes()[split..]));
            assert_eq!(msgs.len(), 1, "split at {split}");
            assert_eq!(msgs[0].kind(), "assistant");
            assert!(!parser.has_pending(), "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let record = assistant("one byte at a time");
        let input = format!("x{record}");
        let mut parser = StreamParser::new();
        let mut msgs = Vec::new();
        for b in input.as_bytes() {
            msgs.extend(parser.feed(&[*b]));
        }
        assert_eq!(msgs.len(), 1);
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_braces_inside_strings() {
        let mut parser = StreamParser::new();
        let record = json!({"type": "assistant", "content": "code: {x} } {{"}).to_string();
        let msgs = parser.feed(record.as_bytes());
        assert_eq!(msgs.len(), 1);
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let mut parser = StreamParser::new();
        let record = r#"{"type": "assistant", "content": "she said \"}\" loudly"}"#;
        let msgs = parser.feed(record.as_bytes());
        assert_eq!(msgs.len(), 1);
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_nested_objects() {
        let mut parser = StreamParser::new();
        let record = json!({
            "type": "tool_use",
            "input": {"nested": {"deep": {"deeper": 1}}}
        })
        .to_string();
        let msgs = parser.feed(record.as_bytes());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "tool_use");
    }

    #[test]
    fn test_decode_failure_does_not_poison_stream() {
        let mut parser = StreamParser::new();
        // Balanced braces but invalid JSON; the next record must survive.
        let input = format!("{{oops}}{}", assistant("survivor"));
        let msgs = parser.feed(input.as_bytes());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "assistant");
    }

    #[test]
    fn test_unterminated_record_leaves_pending() {
        let mut parser = StreamParser::new();
        let msgs = parser.feed(br#"{"type": "assistant", "content": "never clo"#);
        assert!(msgs.is_empty());
        assert!(parser.has_pending());
        parser.reset();
        assert!(!parser.has_pending());
        // After a reset the parser accepts fresh records again.
        let msgs = parser.feed(assistant("fresh").as_bytes());
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_pure_noise_is_dropped() {
        let mut parser = StreamParser::new();
        let msgs = parser.feed(b"no json here at all\n");
        assert!(msgs.is_empty());
        assert!(!parser.has_pending());
    }

    #[test]
    fn test_message_envelope_unwraps_inner_type() {
        let mut parser = StreamParser::new();
        let record = json!({
            "type": "message",
            "message": {"type": "tool_result", "output": "ok"}
        })
        .to_string();
        let msgs = parser.feed(record.as_bytes());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "tool_result");
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let mut parser = StreamParser::new();
        let input = format!(
            "{}{}",
            json!({"type": "telemetry", "x": 1}),
            assistant("kept")
        );
        let msgs = parser.feed(input.as_bytes());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "assistant");
    }

    #[test]
    fn test_result_extraction_snake_case() {
        let mut parser = StreamParser::new();
        let record = json!({
            "type": "result",
            "subtype": "success",
            "result": "hello",
            "usage": {"input_tokens": 3, "output_tokens": 1},
            "duration_ms": 42,
            "session_id": "abc-123"
        })
        .to_string();
        let msgs = parser.feed(record.as_bytes());
        assert_eq!(msgs.len(), 1);
        let AgentMessage::Result(r) = &msgs[0] else {
            panic!("expected result record");
        };
        assert_eq!(r.subtype, ResultSubtype::Success);
        assert_eq!(r.result.as_deref(), Some("hello"));
        assert_eq!(r.usage.input_tokens, 3);
        assert_eq!(r.usage.output_tokens, 1);
        assert_eq!(r.duration_ms, Some(42));
        assert_eq!(r.session_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_result_extraction_camel_case() {
        let value = json!({
            "type": "result",
            "subtype": "error",
            "usage": {"inputTokens": 7, "outputTokens": 9},
            "durationMs": 100,
            "sessionId": "xyz"
        });
        let Some(AgentMessage::Result(r)) = classify(value) else {
            panic!("expected result record");
        };
        assert!(r.is_error());
        assert_eq!(r.usage.input_tokens, 7);
        assert_eq!(r.usage.output_tokens, 9);
        assert_eq!(r.duration_ms, Some(100));
        assert_eq!(r.session_id.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_result_missing_usage_is_zero_filled() {
        let value = json!({"type": "result", "subtype": "success"});
        let Some(AgentMessage::Result(r)) = classify(value) else {
            panic!("expected result record");
        };
        assert_eq!(r.usage, TokenUsage::default());
        assert!(r.result.is_none());
        assert!(r.duration_ms.is_none());
    }

    #[test]
    fn test_order_preserved_across_chunked_feeds() {
        let records: Vec<String> = (0..5).map(|i| assistant(&format!("m{i}"))).collect();
        let input = records.join("noise");
        // Chunk in threes to force mid-record splits.
        let mut parser = StreamParser::new();
        let mut msgs = Vec::new();
        for chunk in input.as_bytes().chunks(3) {
            msgs.extend(parser.feed(chunk));
        }
        assert_eq!(msgs.len(), 5);
        for (i, msg) in msgs.iter().enumerate() {
            assert_eq!(msg.payload()["content"], format!("m{i}"));
        }
    }
}
