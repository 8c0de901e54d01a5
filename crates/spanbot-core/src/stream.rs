//! Per-turn stream buffering for channel-aware flushing.
//!
//! A streamed turn accumulates agent chunks in a [`StreamBuffer`]; how the
//! buffer flushes depends on the originating channel's [`StreamFamily`]:
//!
//! - **CardEdit** — every chunk forwards the cumulative text to the
//!   connector's card, which edits one platform-side message in place.
//! - **LineBuffered** — complete lines collect into a segment; once enough
//!   newlines accumulate outside code fences, the segment is emitted as an
//!   independent message. A fence is never split mid-block.
//! - **EditLast** — cumulative snapshots are published whenever enough new
//!   characters arrived; the threshold is redrawn after every flush so
//!   edits don't land in lockstep across users.

use rand::Rng;

/// Minimum characters between edit-last snapshot flushes.
pub const FLUSH_THRESHOLD_MIN: usize = 10;

/// Maximum characters between edit-last snapshot flushes.
pub const FLUSH_THRESHOLD_MAX: usize = 25;

/// How a channel renders streamed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFamily {
    /// One platform-side card edited in place (Feishu, Mochat).
    CardEdit,
    /// Independent messages split on line boundaries (QQ, DingTalk).
    LineBuffered,
    /// The most recent message edited to extend it (Telegram and most others).
    EditLast,
}

/// Accumulated state for one streamed turn.
#[derive(Debug)]
pub struct StreamBuffer {
    accumulated: String,
    unflushed: usize,
    threshold: usize,
    segment: String,
    partial_line: String,
    newline_count: usize,
    in_code_block: bool,
    split_threshold: usize,
}

impl StreamBuffer {
    /// Create a buffer; `split_threshold` is the newline count that
    /// triggers a line-buffered flush (0 disables splitting).
    pub fn new(split_threshold: usize) -> Self {
        Self {
            accumulated: String::new(),
            unflushed: 0,
            threshold: draw_threshold(),
            segment: String::new(),
            partial_line: String::new(),
            newline_count: 0,
            in_code_block: false,
            split_threshold,
        }
    }

    /// The full text received so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Append a chunk for the card-edit family. The caller forwards the
    /// cumulative text to the card after every append.
    pub fn push(&mut self, text: &str) {
        self.accumulated.push_str(text);
    }

    /// Append a chunk for the edit-last family.
    ///
    /// Returns the cumulative snapshot to publish when enough characters
    /// accumulated since the last flush; the threshold is redrawn on flush.
    pub fn push_edit_last(&mut self, text: &str) -> Option<String> {
        self.accumulated.push_str(text);
        self.unflushed += text.chars().count();

        if self.unflushed >= self.threshold {
            self.unflushed = 0;
            self.threshold = draw_threshold();
            return Some(self.accumulated.clone());
        }
        None
    }

    /// Append a chunk for the line-buffered family.
    ///
    /// Returns zero or more complete segments to emit as independent
    /// messages. Newlines inside code fences never count toward the split
    /// threshold, so fenced blocks stay whole.
    pub fn push_lines(&mut self, text: &str) -> Vec<String> {
        self.accumulated.push_str(text);
        self.partial_line.push_str(text);

        let mut flushed = Vec::new();

        while let Some(pos) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=pos).collect();

            if line.trim().starts_with("```") {
                self.in_code_block = !self.in_code_block;
            }
            self.segment.push_str(&line);
            if !self.in_code_block {
                self.newline_count += 1;
            }

            if self.split_threshold > 0 && self.newline_count >= self.split_threshold {
                let segment = self.segment.trim().to_owned();
                self.segment.clear();
                self.newline_count = 0;
                if !segment.is_empty() {
                    flushed.push(segment);
                }
            }
        }

        flushed
    }

    /// Flush the residual segment at stream end (line-buffered family).
    pub fn finish_lines(&mut self) -> Option<String> {
        let mut tail = std::mem::take(&mut self.segment);
        tail.push_str(&std::mem::take(&mut self.partial_line));
        let tail = tail.trim().to_owned();
        if tail.is_empty() { None } else { Some(tail) }
    }

    /// Consume the buffer, yielding the full accumulated text.
    pub fn into_accumulated(self) -> String {
        self.accumulated
    }
}

fn draw_threshold() -> usize {
    rand::thread_rng().gen_range(FLUSH_THRESHOLD_MIN..=FLUSH_THRESHOLD_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_last_flushes_cumulative_snapshots() {
        let mut buf = StreamBuffer::new(0);
        let mut snapshots = Vec::new();

        // 30 chars per chunk always exceeds the maximum threshold.
        for chunk in ["a".repeat(30), "b".repeat(30), "c".repeat(30)] {
            if let Some(snap) = buf.push_edit_last(&chunk) {
                snapshots.push(snap);
            }
        }

        assert_eq!(snapshots.len(), 3);
        // Every snapshot is a prefix of the next one.
        for pair in snapshots.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
        assert_eq!(buf.accumulated().len(), 90);
    }

    #[test]
    fn edit_last_small_chunks_buffer_until_threshold() {
        let mut buf = StreamBuffer::new(0);
        let mut flushes = 0;
        for _ in 0..FLUSH_THRESHOLD_MAX {
            if buf.push_edit_last("x").is_some() {
                flushes += 1;
            }
        }
        // 25 single chars cross any threshold in [10, 25] at least once.
        assert!(flushes >= 1);
    }

    #[test]
    fn threshold_redraw_stays_in_range() {
        for _ in 0..100 {
            let t = draw_threshold();
            assert!((FLUSH_THRESHOLD_MIN..=FLUSH_THRESHOLD_MAX).contains(&t));
        }
    }

    #[test]
    fn line_buffered_splits_on_newline_count() {
        let mut buf = StreamBuffer::new(2);
        let mut out = Vec::new();
        out.extend(buf.push_lines("one\ntwo\nthree\n"));
        out.extend(buf.finish_lines());

        assert_eq!(out, vec!["one\ntwo".to_owned(), "three".to_owned()]);
    }

    #[test]
    fn line_buffered_zero_threshold_single_flush() {
        let mut buf = StreamBuffer::new(0);
        assert!(buf.push_lines("line one\n").is_empty());
        assert!(buf.push_lines("line two\nand more").is_empty());

        let final_segment = buf.finish_lines().unwrap();
        assert_eq!(final_segment, "line one\nline two\nand more");
    }

    #[test]
    fn line_buffered_partial_lines_held_back() {
        let mut buf = StreamBuffer::new(1);
        assert!(buf.push_lines("no newline yet").is_empty());
        let out = buf.push_lines(" done\n");
        assert_eq!(out, vec!["no newline yet done".to_owned()]);
    }

    #[test]
    fn code_fence_split_across_chunks_never_splits_block() {
        let mut buf = StreamBuffer::new(1);
        let mut out = Vec::new();
        for chunk in ["``", "`\n", "code\n", "```\n", "End"] {
            out.extend(buf.push_lines(chunk));
        }
        out.extend(buf.finish_lines());

        // The whole fenced block flushes as one segment after the closing
        // fence; the trailing text flushes separately.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], "```\ncode\n```");
        assert_eq!(out[1], "End");
    }

    #[test]
    fn newlines_inside_code_block_do_not_count() {
        let mut buf = StreamBuffer::new(2);
        let out = buf.push_lines("```\na\nb\nc\nd\n```\ntext\nmore\n");
        // The fence closes (1 counted newline), then "text\nmore\n" brings
        // the count to 3, crossing the threshold of 2 at "text".
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("a\nb\nc\nd"));
        assert!(out[0].starts_with("```"));
    }

    #[test]
    fn accumulated_tracks_all_families() {
        let mut buf = StreamBuffer::new(2);
        buf.push_lines("hello\n");
        assert_eq!(buf.accumulated(), "hello\n");

        let mut buf = StreamBuffer::new(0);
        buf.push("abc");
        buf.push("def");
        assert_eq!(buf.into_accumulated(), "abcdef");
    }

    #[test]
    fn finish_lines_empty_when_nothing_pending() {
        let mut buf = StreamBuffer::new(1);
        let out = buf.push_lines("complete\n");
        assert_eq!(out.len(), 1);
        assert!(buf.finish_lines().is_none());
    }
}
