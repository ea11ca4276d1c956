use serde_json::Value;

use crate::types::EventEnvelope;

/// Incremental parser for SSE text streams.
///
/// Frames are split on blank lines; `data:` lines of one frame are joined with
/// newlines and parsed as JSON. Comment lines (`:` prefix, used for keepalive)
/// and non-`data` fields are ignored.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete envelopes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<EventEnvelope> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((split, separator_len)) = find_frame_end(&self.buffer) {
            let frame = String::from_utf8_lossy(&self.buffer[..split]).into_owned();
            self.buffer.drain(0..split + separator_len);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" {
                continue;
            }

            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => match envelope_from_value(value) {
                    Some(envelope) => events.push(envelope),
                    None => tracing::warn!("skipping SSE frame whose payload is not a JSON object"),
                },
                Err(error) => tracing::warn!(%error, "skipping malformed SSE frame"),
            }
        }

        events
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<EventEnvelope> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes())
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    let payload = data_lines.join("\n");
    if payload.trim().is_empty() {
        None
    } else {
        Some(payload)
    }
}

fn envelope_from_value(value: Value) -> Option<EventEnvelope> {
    let Value::Object(mut object) = value else {
        return None;
    };
    let event_type = object
        .get("type")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let properties = object.remove("properties").unwrap_or(Value::Null);

    Some(EventEnvelope {
        event_type,
        properties,
    })
}
