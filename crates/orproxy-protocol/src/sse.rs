//! Minimal incremental server-sent-events decoder for the upstream
//! chat-completions stream. The upstream emits data-only events, so event
//! names are parsed but dropped; callers get one `String` per `data` payload
//! (multi-line payloads joined with `\n`).

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.feed(text),
            // A chunk split inside a UTF-8 sequence is vanishingly rare for
            // JSON payloads; drop the chunk rather than corrupt the buffer.
            Err(_) => Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') || line.starts_with("event:") {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }

        payloads
    }

    /// Drain whatever a truncated stream left behind.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        let tail = tail.strip_suffix('\r').unwrap_or(&tail);
        if let Some(value) = tail.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_events_on_blank_lines() {
        let mut decoder = SseDecoder::new();
        let out = decoder.feed("data: one\n\ndata: two\n\n");
        assert_eq!(out, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn reassembles_payload_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed("data: {\"id\":").is_empty());
        let out = decoder.feed("\"x\"}\n\n");
        assert_eq!(out, vec!["{\"id\":\"x\"}".to_string()]);
    }

    #[test]
    fn ignores_comments_and_event_names() {
        let mut decoder = SseDecoder::new();
        let out = decoder.feed(": keep-alive\nevent: message\ndata: hi\n\n");
        assert_eq!(out, vec!["hi".to_string()]);
    }

    #[test]
    fn joins_multi_line_data() {
        let mut decoder = SseDecoder::new();
        let out = decoder.feed("data: a\ndata: b\n\n");
        assert_eq!(out, vec!["a\nb".to_string()]);
    }

    #[test]
    fn crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let out = decoder.feed("data: [DONE]\r\n\r\n");
        assert_eq!(out, vec!["[DONE]".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed("data: tail").is_empty());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }
}
