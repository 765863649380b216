//! Framing for `END`-terminated replies.
//!
//! The controller answers a framed command with any number of text lines
//! followed by a line holding only `END`. Payload is everything before that
//! line. A file stored without a trailing newline ends in `}END`; that also
//! completes the frame when the brace closes the payload's JSON object.
use std::ops::Range;

use serde_json::Value;

use super::unified::types::ResponseMatcher;
use super::{Result, SerialError};

pub const END_MARKER: &str = "END";

/// Splits raw reads into lines, carrying an unterminated fragment over to
/// the next read.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed, without the line
    /// terminator. Blank lines are kept; file payloads contain them.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    /// Keep the newest half of a fragment that grew past `limit` without a
    /// newline. Returns true if anything was dropped.
    pub fn trim_to(&mut self, limit: usize) -> bool {
        if self.partial.len() <= limit {
            return false;
        }
        let keep_from = self.partial.len() - limit / 2;
        let keep_from = (keep_from..self.partial.len())
            .find(|i| self.partial.is_char_boundary(*i))
            .unwrap_or(self.partial.len());
        self.partial.drain(..keep_from);
        true
    }

    pub fn pending(&self) -> &str {
        &self.partial
    }
}

/// Buffers the lines of one in-flight request until its matcher is satisfied.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    matcher: ResponseMatcher,
    lines: Vec<String>,
}

impl FrameAccumulator {
    pub fn new(matcher: ResponseMatcher) -> Self {
        Self { matcher, lines: Vec::new() }
    }

    /// Feed one complete line. Returns the payload once the frame is complete.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        match self.matcher {
            ResponseMatcher::EndMarker => {
                if line.trim() == END_MARKER {
                    return Some(self.lines.join("\n"));
                }
                // A file without a trailing newline arrives as `...}END`.
                if let Some(head) = line.trim_end().strip_suffix(END_MARKER) {
                    if !head.trim().is_empty() && self.closes_json(head) {
                        self.lines.push(head.to_string());
                        return Some(self.lines.join("\n"));
                    }
                }
                self.lines.push(line.to_string());
                None
            }
            _ => {
                self.lines.push(line.to_string());
                if self.matcher.is_complete(&self.lines) {
                    Some(self.lines.join("\n"))
                } else {
                    None
                }
            }
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// True if the buffered text plus `head` ends exactly where its first
    /// JSON object closes.
    fn closes_json(&self, head: &str) -> bool {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(head);
        let text = text.trim_end();
        json_span_range(text).is_some_and(|span| span.end == text.len())
    }
}

/// Locate the outermost `{...}` span in `text`, skipping leading noise.
///
/// Braces inside JSON strings are ignored. Candidates are tried left to right,
/// so a stray unbalanced `{` in the noise does not hide a later object.
pub fn extract_json_span(text: &str) -> Option<&str> {
    json_span_range(text).map(|span| &text[span])
}

fn json_span_range(text: &str) -> Option<Range<usize>> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            return Some(start..end + 1);
        }
        search_from = start + 1;
    }
    None
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract and parse the JSON object carried by a framed payload.
pub fn parse_json_payload(payload: &str) -> Result<Value> {
    let span = extract_json_span(payload)
        .ok_or_else(|| SerialError::ParseFailure("no JSON object in payload".into()))?;
    serde_json::from_str(span).map_err(|e| SerialError::ParseFailure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_marker_completes_frame() {
        let mut acc = FrameAccumulator::new(ResponseMatcher::EndMarker);
        assert_eq!(acc.push_line("{\"a\":"), None);
        assert_eq!(acc.push_line("1}"), None);
        assert_eq!(acc.push_line("END").as_deref(), Some("{\"a\":\n1}"));
    }

    #[test]
    fn chunks_split_mid_line_are_reassembled() {
        let mut buf = LineBuffer::new();
        assert!(buf.push_chunk("VERSION:2.").is_empty());
        assert_eq!(buf.push_chunk("2\r\nEN"), vec!["VERSION:2.2"]);
        assert_eq!(buf.pending(), "EN");
        assert_eq!(buf.push_chunk("D\r\n"), vec!["END"]);
        assert_eq!(buf.pending(), "");
    }

    #[test]
    fn blank_lines_survive_into_the_payload() {
        let mut buf = LineBuffer::new();
        let mut acc = FrameAccumulator::new(ResponseMatcher::EndMarker);
        let text = "import supervisor\r\n\r\nsupervisor.set_usb_identification(\n\nproduct=\"CH-Guitar\")\nEND\n";
        let payload = buf.push_chunk(text).into_iter().find_map(|line| acc.push_line(&line));
        assert_eq!(
            payload.as_deref(),
            Some("import supervisor\n\nsupervisor.set_usb_identification(\n\nproduct=\"CH-Guitar\")")
        );
    }

    #[test]
    fn runaway_fragment_is_trimmed() {
        let mut buf = LineBuffer::new();
        buf.push_chunk(&"x".repeat(100));
        assert!(!buf.trim_to(100));
        buf.push_chunk("y");
        assert!(buf.trim_to(100));
        assert_eq!(buf.pending().len(), 50);
        assert!(buf.pending().ends_with('y'));
    }

    #[test]
    fn end_glued_to_closing_brace_completes_frame() {
        let mut acc = FrameAccumulator::new(ResponseMatcher::EndMarker);
        assert_eq!(acc.push_line("{\"GREEN_FRET\": \"GP10\","), None);
        assert_eq!(acc.push_line("\"LED_BRIGHTNESS\": 0.5}END").as_deref(),
            Some("{\"GREEN_FRET\": \"GP10\",\n\"LED_BRIGHTNESS\": 0.5}"));

        // Text that merely ends in END is still payload.
        let mut acc = FrameAccumulator::new(ResponseMatcher::EndMarker);
        assert_eq!(acc.push_line("{\"mode\": \"LEGEND"), None);
        assert_eq!(acc.push_line("BACKEND"), None);
        assert_eq!(acc.push_line("END").as_deref(), Some("{\"mode\": \"LEGEND\nBACKEND"));
    }

    #[test]
    fn end_inside_a_line_is_not_a_marker() {
        let mut acc = FrameAccumulator::new(ResponseMatcher::EndMarker);
        assert_eq!(acc.push_line("\"BACKEND\": 1"), None);
        assert_eq!(acc.push_line("END").as_deref(), Some("\"BACKEND\": 1"));
    }

    #[test]
    fn prefix_and_custom_matchers() {
        let mut acc = FrameAccumulator::new(ResponseMatcher::AnyPrefix(&["PINDETECT:DETECTED:", "PINDETECT:NONE:"]));
        assert_eq!(acc.push_line("Waiting for press"), None);
        assert_eq!(acc.push_line("PINDETECT:DETECTED:GP10").as_deref(), Some("Waiting for press\nPINDETECT:DETECTED:GP10"));

        fn error_line(lines: &[String]) -> bool {
            lines.iter().any(|l| l.starts_with("ERROR:"))
        }
        let mut acc = FrameAccumulator::new(ResponseMatcher::Custom(error_line));
        assert_eq!(acc.push_line("ERROR: Unknown command").as_deref(), Some("ERROR: Unknown command"));
    }

    #[test]
    fn json_span_survives_surrounding_noise() {
        let payloads = [
            r#"{"GREEN_FRET":"GP10"}"#,
            r#"{"nested":{"a":[1,2,{"b":"}"}]},"s":"{"}"#,
            r#"{}"#,
        ];
        let noise = [("", ""), ("boot noise\n", "\ntrailer"), ("ERR{", " >>> ")];
        for payload in payloads {
            for (pre, post) in noise {
                let text = format!("{}{}{}", pre, payload, post);
                assert_eq!(extract_json_span(&text), Some(payload), "input: {text}");
            }
        }
    }

    #[test]
    fn missing_json_is_a_parse_failure() {
        let err = parse_json_payload("ERROR: [Errno 2] No such file/directory").unwrap_err();
        assert!(matches!(err, SerialError::ParseFailure(_)));
        let err = parse_json_payload("{\"a\": }").unwrap_err();
        assert!(matches!(err, SerialError::ParseFailure(_)));
    }
}
