use council_chat::chat::StreamEvent;

const DATA_FIELD: &str = "data:";

/// Turns arbitrary body chunks into turn events.
///
/// Bytes are buffered until a full line is available, so frames and multi-byte
/// characters may be split across chunks. Only `data:` lines produce events;
/// blank lines, comments and other fields are skipped, as are frames whose
/// JSON does not parse.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let Some(data) = line.strip_prefix(DATA_FIELD) else {
        tracing::trace!(line, "ignoring non-data sse field");
        return None;
    };
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim().is_empty() {
        return None;
    }

    match StreamEvent::from_json(data) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::warn!(%error, frame = data, "skipping malformed sse frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use council_chat::chat::{StageSlot, StreamEventKind};
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_several_frames_from_one_chunk() {
        let mut decoder = SseDecoder::new();

        let events = decoder.push(
            b"data: {\"type\":\"stage1_start\"}\n\ndata: {\"type\":\"stage1_complete\",\"data\":[1]}\n\n",
        );

        assert_eq!(
            events,
            vec![
                StreamEvent::stage_start(StageSlot::Stage1),
                StreamEvent::stage_complete(StageSlot::Stage1, json!([1])),
            ]
        );
        assert!(!decoder.has_pending());
    }

    #[test]
    fn reassembles_a_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(b"data: {\"type\":\"com").is_empty());
        assert!(decoder.has_pending());
        let events = decoder.push(b"plete\"}\r\n\r\n");

        assert_eq!(events, vec![StreamEvent::complete()]);
    }

    #[test]
    fn keeps_multi_byte_characters_split_between_chunks() {
        let frame = "data: {\"type\":\"error\",\"message\":\"échec\"}\n".as_bytes();
        let split = frame
            .iter()
            .position(|byte| *byte >= 0x80)
            .expect("multi-byte character")
            + 1;
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(&frame[..split]).is_empty());
        let events = decoder.push(&frame[split..]);

        assert_eq!(events, vec![StreamEvent::error("échec")]);
    }

    #[test]
    fn skips_comments_other_fields_and_malformed_frames() {
        let mut decoder = SseDecoder::new();

        let events = decoder.push(
            b": keep-alive\nevent: message\ndata: not json\ndata:\ndata: {\"type\":\"title_complete\",\"data\":{\"title\":\"T\"}}\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StreamEventKind::TitleComplete);
    }

    #[test]
    fn unknown_event_types_still_decode() {
        let mut decoder = SseDecoder::new();

        let events = decoder.push(b"data: {\"type\":\"stage4_start\"}\n");

        assert_eq!(
            events[0].kind,
            StreamEventKind::Unknown("stage4_start".to_string())
        );
    }

    #[test]
    fn finish_flushes_an_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"complete\"}").is_empty());

        assert_eq!(decoder.finish(), Some(StreamEvent::complete()));
        assert!(!decoder.has_pending());
        assert_eq!(decoder.finish(), None);
    }
}
