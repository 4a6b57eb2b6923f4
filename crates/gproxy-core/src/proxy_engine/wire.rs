use bytes::Bytes;

use serde_json;

use gproxy_protocol::sse::{SseEvent, SseParser};
use gproxy_provider_core::{Proto, StreamEvent, StreamFormat};

/// Extracts complete top-level JSON objects out of a byte stream that wraps
/// them in a (possibly never-closed) top-level array, e.g.
/// `[{"a":1},\n{"b":2}` arriving across arbitrarily many chunks. Gemini's
/// non-SSE streaming mode emits exactly this shape, so framing on newlines
/// alone is wrong whenever an object's own JSON is pretty-printed or a
/// string value happens to contain one.
///
/// Tracks just enough state to find the brace that closes each top-level
/// object: depth of `{`/`}` nesting, and whether we're inside a quoted
/// string (so braces inside string values don't perturb the count).
#[derive(Debug, Default)]
struct JsonObjectScanner {
    buf: String,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectScanner {
    fn push_str(&mut self, s: &str, out: &mut Vec<String>) {
        for c in s.chars() {
            if self.depth == 0 {
                // Between top-level objects: skip whitespace, commas, and the
                // enclosing array brackets. Anything else that isn't the start
                // of an object is noise we can't make sense of; drop it.
                if c == '{' {
                    self.buf.push(c);
                    self.depth = 1;
                }
                continue;
            }

            self.buf.push(c);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(std::mem::take(&mut self.buf));
                    }
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug)]
pub struct StreamDecoder {
    proto: Proto,
    format: StreamFormat,
    sse: SseParser,
    json_scanner: JsonObjectScanner,
    // Bytes held back because they ended mid-UTF8-codepoint at a chunk boundary.
    pending_bytes: Vec<u8>,
}

impl StreamDecoder {
    pub fn new(proto: Proto, format: StreamFormat) -> Self {
        Self {
            proto,
            format,
            sse: SseParser::new(),
            json_scanner: JsonObjectScanner::default(),
            pending_bytes: Vec::new(),
        }
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        match self.format {
            StreamFormat::SseDataOnly => {
                for ev in self.sse.push_bytes(chunk) {
                    if let Some(item) = decode_sse_event(self.proto, &ev) {
                        out.push(item);
                    }
                }
            }
            StreamFormat::JsonStream => {
                // 1) Try SSE framing (some upstreams use SSE even for "JSON object stream").
                for ev in self.sse.push_bytes(chunk) {
                    if let Some(item) = decode_sse_event(self.proto, &ev) {
                        out.push(item);
                    }
                }
                // 2) Scan the raw bytes for top-level JSON objects.
                self.pending_bytes.extend_from_slice(chunk);
                let valid_len = match std::str::from_utf8(&self.pending_bytes) {
                    Ok(s) => s.len(),
                    Err(e) => e.valid_up_to(),
                };
                if valid_len > 0 {
                    let decodable =
                        String::from_utf8_lossy(&self.pending_bytes[..valid_len]).into_owned();
                    self.pending_bytes.drain(..valid_len);

                    let mut objects = Vec::new();
                    self.json_scanner.push_str(&decodable, &mut objects);
                    for object in &objects {
                        if let Some(item) = decode_json_line(self.proto, object) {
                            out.push(item);
                        }
                    }
                }
            }
        }

        out
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for ev in self.sse.finish() {
            if let Some(item) = decode_sse_event(self.proto, &ev) {
                out.push(item);
            }
        }
        // Any bytes still buffered at this point are either trailing array
        // whitespace/brackets or a truncated object; neither decodes.
        self.pending_bytes.clear();
        out
    }
}

pub fn encode_stream_event(dst_proto: Proto, event: &StreamEvent) -> Option<Bytes> {
    match (dst_proto, event) {
        (Proto::OpenAI, StreamEvent::OpenAI(ev)) => {
            let data = serde_json::to_string(ev).ok()?;
            Some(encode_sse(None, &data))
        }
        (Proto::Gemini, StreamEvent::Gemini(ev)) => {
            let mut data = serde_json::to_vec(ev).ok()?;
            data.push(b'\n');
            Some(Bytes::from(data))
        }
        _ => None,
    }
}

pub fn encode_openai_chat_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// A keep-alive heartbeat chunk: an OpenAI-shaped stream chunk carrying an
/// empty delta, sent while the upstream call is still in flight so that
/// clients and intermediate proxies don't treat the connection as idle.
pub fn encode_openai_heartbeat_chunk() -> Bytes {
    let data = serde_json::json!({
        "id": "",
        "object": "chat.completion.chunk",
        "created": 0,
        "model": "",
        "choices": [{"index": 0, "delta": {}, "finish_reason": null}],
    });
    encode_sse(None, &data.to_string())
}

/// Wraps an already-rendered JSON error body as a single SSE error chunk
/// followed by the stream terminator, for the case where a keep-alive
/// stream's upstream call fails outright.
pub fn encode_sse_error_and_done(error_body: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(error_body);
    let mut out = encode_sse(None, &text).to_vec();
    out.extend_from_slice(&encode_openai_chat_done());
    Bytes::from(out)
}

pub fn content_type_for_stream(proto: Proto) -> &'static str {
    match proto {
        Proto::Gemini => "application/json",
        Proto::OpenAI => "text/event-stream",
    }
}

fn decode_sse_event(proto: Proto, ev: &SseEvent) -> Option<StreamEvent> {
    let data = ev.data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return None;
    }

    match proto {
        Proto::OpenAI => serde_json::from_str(data).ok().map(StreamEvent::OpenAI),
        Proto::Gemini => serde_json::from_str(data).ok().map(StreamEvent::Gemini),
    }
}

fn decode_json_line(proto: Proto, line: &str) -> Option<StreamEvent> {
    match proto {
        Proto::Gemini => serde_json::from_str(line).ok().map(StreamEvent::Gemini),
        Proto::OpenAI => None,
    }
}

fn encode_sse(event: Option<&str>, data: &str) -> Bytes {
    // Minimal SSE encoding: `event:` is optional. For multi-line data, each line gets `data:`.
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_scanner_splits_array_wrapped_objects() {
        let mut scanner = JsonObjectScanner::default();
        let mut out = Vec::new();
        scanner.push_str(r#"[{"a":1},{"b":2}]"#, &mut out);
        assert_eq!(out, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
    }

    #[test]
    fn json_object_scanner_handles_chunk_boundaries_mid_object() {
        let mut scanner = JsonObjectScanner::default();
        let mut out = Vec::new();
        scanner.push_str(r#"[{"a":"hel"#, &mut out);
        assert!(out.is_empty());
        scanner.push_str(r#"lo, world"},{"b":2}]"#, &mut out);
        assert_eq!(
            out,
            vec![r#"{"a":"hello, world"}"#.to_string(), r#"{"b":2}"#.to_string()]
        );
    }

    #[test]
    fn json_object_scanner_ignores_braces_inside_strings() {
        let mut scanner = JsonObjectScanner::default();
        let mut out = Vec::new();
        scanner.push_str(r#"[{"text":"{not an object}"}]"#, &mut out);
        assert_eq!(out, vec![r#"{"text":"{not an object}"}"#.to_string()]);
    }

    #[test]
    fn json_object_scanner_handles_escaped_quotes() {
        let mut scanner = JsonObjectScanner::default();
        let mut out = Vec::new();
        scanner.push_str(r#"[{"text":"say \"hi\""}]"#, &mut out);
        assert_eq!(out, vec![r#"{"text":"say \"hi\""}"#.to_string()]);
    }

    #[test]
    fn stream_decoder_decodes_gemini_array_stream_across_chunks() {
        let mut decoder = StreamDecoder::new(Proto::Gemini, StreamFormat::JsonStream);
        let first = Bytes::from_static(br#"[{"candidates":[],"modelVersion":"x"#);
        let second = Bytes::from_static(br#"yz"}"#);
        let mut events = decoder.push_bytes(&first);
        assert!(events.is_empty());
        events.extend(decoder.push_bytes(&second));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Gemini(resp) => {
                assert_eq!(resp.model_version.as_deref(), Some("xyz"));
            }
            _ => panic!("expected a Gemini stream event"),
        }
    }
}
