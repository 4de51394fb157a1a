//! Bounded per-run output buffers.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::runtime::OutputSink;

/// Bytes held back from program output for tracebacks and notices.
pub const DIAGNOSTIC_RESERVE: usize = 1024;

/// Final outcome of one submission. Never mutated after it is returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub failed: bool,
    /// Output exceeded its budget and was cut. Not a failure by itself.
    pub truncated: bool,
    /// Implies `failed`.
    pub timed_out: bool,
}

impl ExecutionResult {
    /// stdout, then a newline and stderr when there is any.
    pub fn transcript(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// stdout/stderr pair for one run.
///
/// Everything written is kept within `limit` once rendered as a transcript;
/// program writes stop `reserve` bytes short of it so a traceback still fits.
#[derive(Debug)]
pub struct Capture {
    stdout: String,
    stderr: String,
    limit: usize,
    reserve: usize,
    truncated: bool,
    sealed: bool,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            limit,
            reserve: DIAGNOSTIC_RESERVE.min(limit / 4),
            truncated: false,
            sealed: false,
        }
    }

    /// Bytes the transcript would occupy now.
    fn used(&self) -> usize {
        if self.stderr.is_empty() {
            self.stdout.len()
        } else {
            self.stdout.len() + 1 + self.stderr.len()
        }
    }

    /// Program output. Ignored once sealed. Returns the part of `text` that
    /// was kept.
    pub fn write_stdout<'t>(&mut self, text: &'t str) -> &'t str {
        if self.sealed || text.is_empty() {
            return "";
        }
        let program_room = (self.limit - self.reserve).saturating_sub(self.stdout.len());
        let room = program_room.min(self.limit.saturating_sub(self.used()));
        let kept = clamp(text, room);
        if kept.len() < text.len() {
            self.truncated = true;
        }
        self.stdout.push_str(kept);
        kept
    }

    /// Marks output as cut somewhere this capture did not see.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    /// Tracebacks and notices, drawn from the reserve. Still accepted after
    /// `seal`. What does not fit is cut from the front so the final
    /// `Kind: message` line survives.
    pub fn write_diagnostic(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let separator = usize::from(self.stderr.is_empty());
        let room = self.limit.saturating_sub(self.used() + separator);
        if text.len() <= room {
            self.stderr.push_str(text);
        } else {
            self.stderr.push_str(tail(text, room));
            self.truncated = true;
        }
    }

    /// Stops accepting program output, e.g. from a worker that outlived its
    /// deadline.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(self, failed: bool, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            stdout: self.stdout,
            stderr: self.stderr,
            failed: failed || timed_out,
            truncated: self.truncated,
            timed_out,
        }
    }
}

/// The longest prefix of `text` no longer than `max` bytes that ends on a
/// character boundary.
pub fn clamp(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// The longest suffix of `text` no longer than `max` bytes, starting on a
/// line boundary when one is available.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let rest = &text[start..];
    match rest.find('\n') {
        Some(newline) if newline + 1 < rest.len() => &rest[newline + 1..],
        _ => rest,
    }
}

/// A [`Capture`] shared between a worker thread and the task awaiting it.
#[derive(Debug, Clone)]
pub struct SharedCapture(Arc<Mutex<Capture>>);

impl SharedCapture {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(Mutex::new(Capture::new(limit))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Capture> {
        // A panicking writer leaves the buffers consistent.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seals the capture and takes its contents, leaving an empty one behind.
    pub fn take(&self) -> Capture {
        let mut guard = self.lock();
        let limit = guard.limit;
        let mut taken = std::mem::replace(&mut *guard, Capture::new(limit));
        guard.seal();
        taken.sealed = true;
        taken
    }
}

impl OutputSink for SharedCapture {
    fn stdout(&self, text: &str) {
        self.lock().write_stdout(text);
    }

    fn stderr(&self, text: &str) {
        self.lock().write_diagnostic(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn transcript_joins_streams_with_a_newline() {
        let mut capture = Capture::new(1000);
        capture.write_stdout("4\n");
        assert_eq!(capture.finish(false, false).transcript(), "4\n");

        let mut capture = Capture::new(1000);
        capture.write_stdout("a\n");
        capture.write_diagnostic("Boom\n");
        let result = capture.finish(true, false);
        assert_eq!(result.transcript(), "a\n\nBoom\n");
        assert!(result.failed);
    }

    #[test]
    fn empty_output_is_an_empty_transcript() {
        assert_eq!(Capture::new(10).finish(false, false).transcript(), "");
    }

    #[test]
    fn program_output_leaves_room_for_diagnostics() {
        let mut capture = Capture::new(100);
        capture.write_stdout(&"x".repeat(500));
        assert!(capture.truncated());
        capture.write_diagnostic("Error: late\n");
        let result = capture.finish(true, false);
        assert_eq!(result.stdout.len(), 75);
        assert_eq!(result.stderr, "Error: late\n");
        assert!(result.transcript().len() <= 100);
    }

    #[test]
    fn writes_after_overflow_are_discarded() {
        let mut capture = Capture::new(8);
        assert_eq!(capture.write_stdout("123456"), "123456");
        assert_eq!(capture.write_stdout("789"), "");
        assert_eq!(capture.write_stdout("0"), "");
        let result = capture.finish(false, false);
        assert_eq!(result.stdout, "123456");
        assert!(result.truncated);
        assert!(!result.failed);
    }

    #[test]
    fn clamping_respects_utf8_boundaries() {
        assert_eq!(clamp("héllo", 2), "h");
        assert_eq!(clamp("héllo", 3), "hé");
        let mut capture = Capture::new(4);
        capture.write_stdout("ééé");
        assert_eq!(capture.finish(false, false).stdout, "é");
    }

    #[test]
    fn oversized_diagnostics_keep_their_last_lines() {
        let mut capture = Capture::new(40);
        capture.write_stdout("out\n");
        let traceback = format!("Traceback\n{}ValueError: bad\n", "  frame line\n".repeat(10));
        capture.write_diagnostic(&traceback);
        let result = capture.finish(true, false);
        assert!(result.truncated);
        assert!(result.stderr.ends_with("ValueError: bad\n"));
        assert!(result.stderr.starts_with("  frame line\n"));
        assert!(result.transcript().len() <= 40);
    }

    #[test]
    fn sealed_capture_only_takes_diagnostics() {
        let shared = SharedCapture::new(100);
        shared.stdout("before\n");
        let mut capture = shared.take();
        shared.stdout("after\n");
        capture.write_stdout("ignored\n");
        capture.write_diagnostic("TimeoutError\n");
        let result = capture.finish(false, true);
        assert_eq!(result.transcript(), "before\n\nTimeoutError\n");
        assert!(result.failed);
        assert!(shared.take().finish(false, false).stdout.is_empty());
    }
}
