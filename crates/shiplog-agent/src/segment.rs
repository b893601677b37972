// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Complete-line segmentation of raw read buffers.
//!
//! The segmenter walks a byte buffer left to right and yields only complete,
//! safely-bounded lines:
//!
//! - a UTF-8 byte-order-mark at the cursor is consumed without emitting
//! - lines end at the next `\n` within `max_line_length` bytes
//! - when no newline exists inside a full-length window and more data
//!   follows, the line is force-broken at the nearest position that does not
//!   split a multi-byte UTF-8 sequence
//! - trailing `\r`/`\n` bytes are trimmed and counted as separator skip
//! - lines that are empty after trimming are consumed without emitting
//! - a trailing partial line is left unconsumed so the next cycle re-reads
//!   it from the same file offset; partial lines are never shipped
//!
//! [`LineSegmenter::consumed`] reports how many bytes of the buffer were
//! captured, which is exactly how far the caller may advance its offset.

/// The UTF-8 byte order mark, written by some hosts at the start of the file.
pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// One complete line captured from the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedLine {
    /// Byte offset of the line's first content byte within the buffer.
    pub start: usize,
    /// Content length in bytes, after separator trimming.
    pub len: usize,
    /// Number of separator bytes (`\r`/`\n`) consumed after the content.
    pub separator_len: usize,
    /// True when the line was broken at the length bound rather than at a
    /// newline. Forced breaks consume no separator bytes.
    pub forced_break: bool,
}

/// Iterator over the complete lines of a read buffer.
#[derive(Debug)]
pub struct LineSegmenter<'a> {
    buf: &'a [u8],
    cursor: usize,
    max_line_length: usize,
}

impl<'a> LineSegmenter<'a> {
    pub fn new(buf: &'a [u8], max_line_length: usize) -> Self {
        debug_assert!(max_line_length > 0);
        LineSegmenter {
            buf,
            cursor: 0,
            max_line_length,
        }
    }

    /// Number of buffer bytes consumed so far: every captured line, its
    /// separators, skipped BOMs and blank lines. Bytes past this point form
    /// the unconsumed partial tail.
    pub fn consumed(&self) -> usize {
        self.cursor
    }
}

impl<'a> Iterator for LineSegmenter<'a> {
    type Item = CapturedLine;

    fn next(&mut self) -> Option<CapturedLine> {
        loop {
            let remaining = self.buf.len() - self.cursor;
            if remaining == 0 {
                return None;
            }

            // The byte order mark is consumed without emitting a line.
            if self.buf[self.cursor..].starts_with(&UTF8_BOM) {
                self.cursor += UTF8_BOM.len();
                continue;
            }

            let num_to_search = remaining.min(self.max_line_length);
            let window = &self.buf[self.cursor..self.cursor + num_to_search];
            let mut separator_len = 1; // the newline itself
            let mut forced_break = false;
            let mut found = window.iter().position(|&b| b == b'\n');

            if found.is_none() && num_to_search == self.max_line_length && remaining > num_to_search
            {
                // No newline inside a full-length window: break the line at
                // the bound. Walk backward so the break never lands inside a
                // multi-byte UTF-8 sequence; the last included byte must be
                // a single-byte character.
                separator_len = 0;
                let mut index = self.max_line_length - 1;
                while index > 0 {
                    if self.buf[self.cursor + index] >= 0x80 {
                        index -= 1;
                    } else {
                        index += 1;
                        break;
                    }
                }
                found = Some(index);
                forced_break = true;
            }

            // No newline and no forced break applies: the remaining bytes
            // are an incomplete tail for the next cycle.
            let mut end = found?;

            // Trim trailing newline bytes of any kind before the break
            // point, extending the separator skip accordingly.
            while end > 0 {
                let c = self.buf[self.cursor + end - 1];
                if c == b'\n' || c == b'\r' {
                    separator_len += 1;
                    end -= 1;
                } else {
                    break;
                }
            }

            // Blank after trimming: consume without emitting.
            if end == 0 {
                if separator_len == 0 {
                    separator_len = 1;
                }
                self.cursor += separator_len;
                continue;
            }

            let line = CapturedLine {
                start: self.cursor,
                len: end,
                separator_len,
                forced_break,
            };
            self.cursor += end + separator_len;
            return Some(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn capture_all(buf: &[u8], max_line_length: usize) -> (Vec<CapturedLine>, usize) {
        let mut segmenter = LineSegmenter::new(buf, max_line_length);
        let lines: Vec<_> = segmenter.by_ref().collect();
        (lines, segmenter.consumed())
    }

    fn line_text<'a>(buf: &'a [u8], line: &CapturedLine) -> &'a [u8] {
        &buf[line.start..line.start + line.len]
    }

    #[test]
    fn test_simple_lines() {
        let buf = b"A\nB\n";
        let (lines, consumed) = capture_all(buf, 1024);

        assert_eq!(lines.len(), 2);
        assert_eq!(line_text(buf, &lines[0]), b"A");
        assert_eq!(line_text(buf, &lines[1]), b"B");
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_bom_is_skipped() {
        let mut buf = UTF8_BOM.to_vec();
        buf.extend_from_slice(b"X\n");
        let (lines, consumed) = capture_all(&buf, 1024);

        assert_eq!(lines.len(), 1);
        assert_eq!(line_text(&buf, &lines[0]), b"X");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_crlf_trimmed_into_separator() {
        let buf = b"line one\r\nline two\r\n";
        let (lines, consumed) = capture_all(buf, 1024);

        assert_eq!(lines.len(), 2);
        assert_eq!(line_text(buf, &lines[0]), b"line one");
        assert_eq!(lines[0].separator_len, 2);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_blank_lines_consumed_without_output() {
        let buf = b"\n\nA\n\n";
        let (lines, consumed) = capture_all(buf, 1024);

        assert_eq!(lines.len(), 1);
        assert_eq!(line_text(buf, &lines[0]), b"A");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_partial_tail_left_unconsumed() {
        let buf = b"complete\npartial";
        let (lines, consumed) = capture_all(buf, 1024);

        assert_eq!(lines.len(), 1);
        assert_eq!(line_text(buf, &lines[0]), b"complete");
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_no_forced_break_at_buffer_end() {
        // A max-length window with nothing beyond it is an incomplete tail,
        // not a forced break: the rest of the line may still be in flight.
        let buf = vec![b'a'; 16];
        let (lines, consumed) = capture_all(&buf, 16);

        assert!(lines.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_forced_break_on_ascii() {
        let mut buf = vec![b'a'; 16];
        buf.extend_from_slice(b"rest of the line\n");
        let (lines, _) = capture_all(&buf, 16);

        assert!(lines[0].forced_break);
        assert_eq!(lines[0].len, 16);
        assert_eq!(lines[0].separator_len, 0);
        assert_eq!(line_text(&buf, &lines[1]), b"rest of the line");
    }

    #[test]
    fn test_forced_break_walks_back_over_multibyte() {
        // 15 ASCII bytes then a two-byte character straddling the bound.
        let mut buf = vec![b'a'; 15];
        buf.extend_from_slice("é".as_bytes());
        buf.extend(vec![b'b'; 500]);
        buf.push(b'\n');

        let (lines, _) = capture_all(&buf, 16);

        assert!(lines[0].forced_break);
        assert_eq!(lines[0].len, 15, "break must not split the two-byte char");
        // The straddling character leads the next captured line intact.
        assert_eq!(&line_text(&buf, &lines[1])[..2], "é".as_bytes());
    }

    #[test]
    fn test_forced_break_includes_trailing_ascii() {
        // When the byte at the bound is ASCII the full window is captured.
        let mut buf = vec![b'x'; 40];
        buf.push(b'\n');
        let (lines, _) = capture_all(&buf, 16);

        assert_eq!(lines[0].len, 16);
        assert_eq!(lines[1].len, 16);
        assert_eq!(lines[2].len, 8);
    }

    #[test]
    fn test_bom_between_lines() {
        let mut buf = b"A\n".to_vec();
        buf.extend_from_slice(&UTF8_BOM);
        buf.extend_from_slice(b"B\n");
        let (lines, consumed) = capture_all(&buf, 1024);

        assert_eq!(lines.len(), 2);
        assert_eq!(line_text(&buf, &lines[1]), b"B");
        assert_eq!(consumed, buf.len());
    }

    proptest! {
        /// Concatenating each line's captured bytes with its separator skip
        /// reconstructs exactly the byte range consumed for that line, and
        /// the ranges tile the consumed prefix in order.
        #[test]
        fn prop_segmentation_round_trip(
            lines in proptest::collection::vec("[a-z ]{1,40}", 0..8),
            terminator in prop_oneof![Just("\n"), Just("\r\n")],
        ) {
            let mut buf = Vec::new();
            for line in &lines {
                buf.extend_from_slice(line.as_bytes());
                buf.extend_from_slice(terminator.as_bytes());
            }

            let (captured, consumed) = capture_all(&buf, 1024);
            prop_assert_eq!(consumed, buf.len());
            prop_assert_eq!(captured.len(), lines.len());

            let mut cursor = 0;
            for (captured_line, source) in captured.iter().zip(&lines) {
                prop_assert_eq!(captured_line.start, cursor);
                prop_assert_eq!(line_text(&buf, captured_line), source.as_bytes());
                prop_assert_eq!(captured_line.separator_len, terminator.len());
                cursor = captured_line.start + captured_line.len + captured_line.separator_len;
            }
        }

        /// A forced break never lands inside a multi-byte UTF-8 sequence:
        /// the last captured byte of a force-broken line is single-byte.
        #[test]
        fn prop_forced_break_is_utf8_safe(text in "[a-zé例🙂]{1,200}") {
            let mut buf = text.as_bytes().to_vec();
            buf.extend_from_slice(b"tail beyond the window\n");

            let (captured, _) = capture_all(&buf, 16);
            for line in captured.iter().filter(|l| l.forced_break) {
                let last = buf[line.start + line.len - 1];
                prop_assert!(last < 0x80, "forced break after non-ASCII byte {last:#x}");
            }
        }
    }
}
