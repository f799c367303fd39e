//! Incremental Server-Sent Events decoder
//!
//! Bytes arrive in arbitrary chunks; frames are emitted once their terminating
//! blank line has been seen.

/// One decoded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name, `message` when the frame has no `event:` field
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&block[..end]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseFrame> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(block);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut id = None;

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(b"event: val").is_empty());
        assert!(decoder.push(b"ues\ndata: {\"a\":").is_empty());
        let frames = decoder.push(b" 1}\n\nevent: end\n\n");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "values");
        assert_eq!(frames[0].data, r#"{"a": 1}"#);
        assert_eq!(frames[1].event, "end");
        assert_eq!(frames[1].data, "");
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\r\n\r\nid: 7\r\nevent: updates\r\ndata: x\r\ndata: y\r\n\r\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "updates");
        assert_eq!(frames[0].data, "x\ny");
        assert_eq!(frames[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_default_event_name_and_finish() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());

        let frame = decoder.finish().unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.data, "tail");
        assert!(decoder.finish().is_none());
    }
}
