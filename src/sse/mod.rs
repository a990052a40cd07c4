//! SSE stream decoding
//!
//! Turns the raw byte stream of a `text/event-stream` response into discrete
//! JSON event payloads. Chunks arrive in arbitrary sizes and may split a
//! logical line (or a multi-byte UTF-8 sequence), so the decoder keeps a
//! byte-level residual buffer and only ever decodes complete lines.

use serde::Deserialize;

/// Prefix marking a meaningful event line.
const EVENT_PREFIX: &str = "data:";

/// Sentinel payload that ends the stream.
const END_SENTINEL: &str = "[DONE]";

/// A decoded server event. Any combination of fields may be present; an
/// event is applied to session state and then discarded.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamEvent {
    /// Incremental answer text, appended to the cumulative reply.
    #[serde(default)]
    pub answer: Option<String>,
    /// Server-side conversation identifier.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Follow-up questions suggested by the backend.
    #[serde(default)]
    pub suggested_questions: Option<Vec<String>>,
}

/// Incremental SSE frame decoder.
///
/// Tied to one underlying byte stream: feed chunks as they arrive, then call
/// [`SseDecoder::finish`] once to flush a final unterminated line. Malformed
/// frames are dropped silently so one garbled line never aborts the turn.
#[derive(Debug, Default)]
pub struct SseDecoder {
    residual: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.residual.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.residual.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.residual.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if let Some(event) = Self::decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush the residual buffer as a final line; streams routinely end
    /// without a trailing newline.
    pub fn finish(self) -> Option<StreamEvent> {
        if self.residual.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.residual).into_owned();
        Self::decode_line(&line)
    }

    fn decode_line(line: &str) -> Option<StreamEvent> {
        let payload = line.strip_prefix(EVENT_PREFIX)?.trim();
        if payload.is_empty() || payload == END_SENTINEL {
            return None;
        }
        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::debug!(error = %err, "dropping unparseable stream frame");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_with_splits(raw: &[u8], split_at: &[usize]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        let mut start = 0;
        for &end in split_at {
            events.extend(decoder.feed(&raw[start..end]));
            start = end;
        }
        events.extend(decoder.feed(&raw[start..]));
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn decodes_answer_and_metadata_fields() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: {\"answer\":\"hi\",\"conversation_id\":\"c-1\"}\n\
              data: {\"suggested_questions\":[\"next?\"]}\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].answer.as_deref(), Some("hi"));
        assert_eq!(events[0].conversation_id.as_deref(), Some("c-1"));
        assert_eq!(
            events[1].suggested_questions.as_deref(),
            Some(&["next?".to_string()][..])
        );
    }

    #[test]
    fn identical_events_for_every_chunking() {
        // Multi-byte content so splits can land inside a UTF-8 sequence.
        let raw = "data: {\"answer\":\"涨幅 10%\"}\ndata: {\"answer\":\"继续\"}\ndata: [DONE]\n"
            .as_bytes();
        let whole = decode_with_splits(raw, &[]);
        assert_eq!(whole.len(), 2);
        for end in 1..raw.len() {
            assert_eq!(whole, decode_with_splits(raw, &[end]), "split at {end}");
        }
        // A pathological one-byte-at-a-time arrival.
        let trickle: Vec<usize> = (1..raw.len()).collect();
        assert_eq!(whole, decode_with_splits(raw, &trickle));
    }

    #[test]
    fn skips_sentinel_blank_and_malformed_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: [DONE]\n\
              data:\n\
              : keep-alive comment\n\
              event: ping\n\
              data: {not json\n\
              data: {\"answer\":\"ok\"}\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].answer.as_deref(), Some("ok"));
    }

    #[test]
    fn finish_flushes_unterminated_final_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"answer\":\"tail\"}").is_empty());
        let event = decoder.finish().expect("final line decoded");
        assert_eq!(event.answer.as_deref(), Some("tail"));
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: {\"answer\":\"a\"}\r\ndata: {\"answer\":\"b\"}\r\n");
        let texts: Vec<_> = events.iter().filter_map(|e| e.answer.as_deref()).collect();
        assert_eq!(texts, ["a", "b"]);
    }
}
