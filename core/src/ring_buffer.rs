//! Bounded FIFO of captured output lines.
//!
//! Incoming pty chunks are ANSI-stripped, split on `\n`, and stored as
//! `\r`-trimmed lines. The buffer evicts from the head once `capacity` is
//! reached but keeps counting: `total_appended` is the monotonic sequence
//! number of the newest line, which is what poll cursors compare against.
//! A trailing fragment with no newline yet is carried in `partial` until the
//! next chunk completes it, the settle detector flushes it, or the shell
//! exits.

use std::collections::VecDeque;

use crate::ansi::strip_ansi;

#[derive(Debug)]
pub struct RingLogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    max_line_bytes: usize,
    total_appended: u64,
    partial: String,
}

impl RingLogBuffer {
    pub fn new(capacity: usize, max_line_bytes: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            max_line_bytes: max_line_bytes.max(1),
            total_appended: 0,
            partial: String::new(),
        }
    }

    /// Append a raw pty chunk. Returns the newly completed `(seq, line)`
    /// pairs, in arrival order, for the classifier.
    pub fn append_bytes(&mut self, chunk: &[u8]) -> Vec<(u64, String)> {
        let text = strip_ansi(chunk);
        let mut completed = Vec::new();
        for part in text.split_inclusive('\n') {
            if let Some(body) = part.strip_suffix('\n') {
                let mut line = std::mem::take(&mut self.partial);
                line.push_str(body.strip_suffix('\r').unwrap_or(body));
                self.push_line(line, &mut completed);
            } else {
                self.partial.push_str(part);
                // Oversized unterminated output still obeys the line cap.
                while self.partial.len() > self.max_line_bytes {
                    let head = take_prefix(&mut self.partial, self.max_line_bytes);
                    self.push_line(head, &mut completed);
                }
            }
        }
        completed
    }

    /// Promote the pending unterminated fragment to a full line.
    pub fn flush_partial(&mut self) -> Option<(u64, String)> {
        if self.partial.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.partial);
        let mut completed = Vec::with_capacity(1);
        self.push_line(line, &mut completed);
        completed.pop()
    }

    /// Append a supervisor-synthesized line (spawn failures, reap notices).
    pub fn push_synthesized(&mut self, line: impl Into<String>) -> (u64, String) {
        let mut completed = Vec::with_capacity(1);
        self.push_line(line.into(), &mut completed);
        // push_line always records at least one line for non-split input.
        completed.pop().unwrap_or((self.total_appended, String::new()))
    }

    fn push_line(&mut self, line: String, completed: &mut Vec<(u64, String)>) {
        let mut rest = line;
        loop {
            let head = if rest.len() > self.max_line_bytes {
                take_prefix(&mut rest, self.max_line_bytes)
            } else {
                std::mem::take(&mut rest)
            };
            self.total_appended += 1;
            completed.push((self.total_appended, head.clone()));
            self.lines.push_back(head);
            while self.lines.len() > self.capacity {
                self.lines.pop_front();
            }
            if rest.is_empty() {
                break;
            }
        }
    }

    /// Sequence number of the newest line; monotonic across evictions.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Lines with sequence number > `cursor`, truncated to the most recent
    /// `limit`. Never mutates.
    pub fn lines_after(&self, cursor: u64, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        let first_seq = self.total_appended - self.lines.len() as u64 + 1;
        let skip = cursor.saturating_sub(first_seq - 1) as usize;
        let unseen = self.lines.len().saturating_sub(skip);
        let take_from = skip + unseen.saturating_sub(limit);
        self.lines.iter().skip(take_from).cloned().collect()
    }

    /// The most recent `n` lines joined with newlines, plus the pending
    /// fragment. Used for verification patterns that span line splits.
    pub fn recent_window(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        let mut window = self
            .lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if !self.partial.is_empty() {
            if !window.is_empty() {
                window.push('\n');
            }
            window.push_str(&self.partial);
        }
        window
    }
}

fn take_prefix(s: &mut String, max_bytes: usize) -> String {
    let mut split = max_bytes.min(s.len());
    while split > 0 && !s.is_char_boundary(split) {
        split -= 1;
    }
    let tail = s.split_off(split);
    std::mem::replace(s, tail)
}
