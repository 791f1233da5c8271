//! Incremental decoder for `text/event-stream` bodies.
//!
//! Feed raw byte chunks as they arrive; complete frames come back out.
//! Handles frames split across chunk boundaries and CRLF line endings.

#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain any frames it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end.frame_end).collect();
            self.buffer.drain(..end.separator_len);
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }
        frames
    }
}

struct FrameEnd {
    frame_end: usize,
    separator_len: usize,
}

fn find_frame_end(buffer: &[u8]) -> Option<FrameEnd> {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i..].starts_with(b"\n\n") {
            return Some(FrameEnd { frame_end: i, separator_len: 2 });
        }
        if buffer[i..].starts_with(b"\r\n\r\n") {
            return Some(FrameEnd { frame_end: i, separator_len: 4 });
        }
        i += 1;
    }
    None
}

fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = field(line, "event") {
            event = Some(value.to_string());
        } else if let Some(value) = field(line, "data") {
            data_lines.push(value.to_string());
        }
        // id: and retry: fields are not used.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame { event, data: data_lines.join("\n") })
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
