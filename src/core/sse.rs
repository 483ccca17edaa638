use std::fmt;
use std::str::Utf8Error;

use memchr::memmem;
use serde::Deserialize;
use serde_json::Value;

/// One parsed application payload from the SSE stream.
///
/// The backend emits frames of the form `data: <json>\n\n`. A payload may
/// carry incremental text in `chunk`; the terminal payload is flagged by
/// `done`, `completed`, or `type: "end"` and may carry the final message
/// metadata in `ai_message`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub ai_message: Option<StreamAiMessage>,
    /// The payload as received, for fields this struct does not model.
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamAiMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl StreamEvent {
    pub fn parse(payload: &str) -> Result<Self, FrameError> {
        let raw: Value = serde_json::from_str(payload).map_err(|source| FrameError::Json {
            frame: payload.to_string(),
            source,
        })?;
        let mut event: StreamEvent =
            serde_json::from_value(raw.clone()).map_err(|source| FrameError::Json {
                frame: payload.to_string(),
                source,
            })?;
        event.raw = raw;
        Ok(event)
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.completed || self.event_type.as_deref() == Some("end")
    }
}

/// A single malformed frame. Reported to the caller, which decides whether to
/// log and continue; the decoder itself keeps going.
#[derive(Debug)]
pub enum FrameError {
    Json {
        frame: String,
        source: serde_json::Error,
    },
    Utf8(Utf8Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Json { frame, source } => {
                write!(f, "malformed stream frame ({source}): {frame}")
            }
            FrameError::Utf8(e) => write!(f, "invalid UTF-8 in stream frame: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Json { source, .. } => Some(source),
            FrameError::Utf8(e) => Some(e),
        }
    }
}

/// Incremental SSE frame decoder.
///
/// Raw network chunks go in via [`feed`](Self::feed); complete frames come out
/// as [`StreamEvent`]s. The internal byte buffer persists across calls, so
/// chunk boundaries can fall anywhere, including inside a multi-byte UTF-8
/// sequence. Purely synchronous; suspension is the transport's concern.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
}

const FRAME_BOUNDARY: &[u8] = b"\n\n";

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network chunk and drain every complete frame it unlocked.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, FrameError>> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = memmem::find(&self.buffer, FRAME_BOUNDARY) {
            let frame: Vec<u8> = self.buffer.drain(..pos + FRAME_BOUNDARY.len()).collect();
            if let Some(item) = decode_frame(&frame[..pos]) {
                events.push(item);
            }
        }
        events
    }

    /// Drain a trailing unterminated frame at end of stream, if any.
    pub fn flush(&mut self) -> Option<Result<StreamEvent, FrameError>> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        decode_frame(&rest)
    }

    /// Bytes retained while waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one frame. Frames without a `data:` line (comments, keep-alives)
/// yield nothing.
fn decode_frame(frame: &[u8]) -> Option<Result<StreamEvent, FrameError>> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(e) => return Some(Err(FrameError::Utf8(e))),
    };

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(payload) = line.strip_prefix("data:") {
            return Some(StreamEvent::parse(payload.trim_start()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_of(events: Vec<Result<StreamEvent, FrameError>>) -> Vec<Option<String>> {
        events
            .into_iter()
            .map(|item| item.expect("well-formed frame").chunk)
            .collect()
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder.feed(b"data: {\"chunk\":\"A\"}\n\ndata: {\"chunk\":\"B\"}\n\n");
        assert_eq!(
            chunks_of(events),
            vec![Some("A".to_string()), Some("B".to_string())]
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn arbitrary_split_preserves_order() {
        let payload = b"data: {\"chunk\":\"A\"}\n\ndata: {\"chunk\":\"B\"}\n\n";
        // Split right inside the second frame's JSON.
        let mut decoder = SseFrameDecoder::new();
        let mut events = decoder.feed(&payload[..30]);
        events.extend(decoder.feed(&payload[30..]));
        assert_eq!(
            chunks_of(events),
            vec![Some("A".to_string()), Some("B".to_string())]
        );
    }

    #[test]
    fn every_byte_boundary_yields_the_same_events() {
        let payload: &[u8] =
            b"data: {\"chunk\":\"H\\u00e9llo\"}\n\ndata: {\"done\": true, \"type\": \"end\"}\n\n";

        let mut reference = SseFrameDecoder::new();
        let expected: Vec<String> = reference
            .feed(payload)
            .into_iter()
            .map(|item| format!("{:?}", item.expect("reference frame").raw))
            .collect();
        assert_eq!(expected.len(), 2);

        for split in 0..=payload.len() {
            let mut decoder = SseFrameDecoder::new();
            let mut events = decoder.feed(&payload[..split]);
            events.extend(decoder.feed(&payload[split..]));
            let got: Vec<String> = events
                .into_iter()
                .map(|item| format!("{:?}", item.expect("split frame").raw))
                .collect();
            assert_eq!(got, expected, "split at byte {split}");
        }
    }

    #[test]
    fn utf8_sequence_split_across_feeds() {
        // "é" is 0xC3 0xA9; cut between the two bytes.
        let payload = "data: {\"chunk\":\"é\"}\n\n".as_bytes();
        let cut = payload.iter().position(|&b| b == 0xC3).expect("utf8 lead") + 1;

        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.feed(&payload[..cut]).is_empty());
        let events = decoder.feed(&payload[cut..]);
        assert_eq!(chunks_of(events), vec![Some("é".to_string())]);
    }

    #[test]
    fn malformed_frame_reported_without_losing_the_next_one() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder.feed(b"data: {not json\n\ndata: {\"chunk\":\"ok\"}\n\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Err(FrameError::Json { .. })));
        assert_eq!(
            events[1].as_ref().expect("second frame").chunk.as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn flush_drains_a_trailing_frame() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.feed(b"data: {\"done\": true}").is_empty());
        let event = decoder
            .flush()
            .expect("trailing frame")
            .expect("well-formed");
        assert!(event.is_terminal());
        assert!(decoder.flush().is_none());
    }

    #[test]
    fn flush_ignores_whitespace_remainder() {
        let mut decoder = SseFrameDecoder::new();
        decoder.feed(b"data: {\"chunk\":\"x\"}\n\n\n");
        assert!(decoder.flush().is_none());
    }

    #[test]
    fn non_data_frames_are_skipped() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder.feed(b": keep-alive\n\ndata: {\"chunk\":\"y\"}\n\n");
        assert_eq!(chunks_of(events), vec![Some("y".to_string())]);
    }

    #[test]
    fn terminal_flags_all_recognized() {
        for payload in [
            r#"{"done": true}"#,
            r#"{"completed": true}"#,
            r#"{"type": "end"}"#,
        ] {
            let event = StreamEvent::parse(payload).expect("valid payload");
            assert!(event.is_terminal(), "payload {payload}");
        }
        let event = StreamEvent::parse(r#"{"chunk":"a"}"#).expect("valid payload");
        assert!(!event.is_terminal());
    }

    #[test]
    fn terminal_event_carries_model() {
        let event = StreamEvent::parse(r#"{"done": true, "ai_message": {"model": "gpt-4.1"}}"#)
            .expect("valid payload");
        assert_eq!(
            event.ai_message.and_then(|m| m.model).as_deref(),
            Some("gpt-4.1")
        );
    }
}
