//! Best-effort peripheral telemetry polling.
//!
//! Reads newline-delimited sensor lines from an optional source (typically
//! a FIFO fed by a peripheral daemon) and hands them to the session for
//! monitor emission. Everything here is best-effort: a missing source, a
//! vanished writer, or a read error disables polling without affecting the
//! agent; would-block simply means "no data this pass".

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, warn};

/// Lines emitted per reactor pass at most, so telemetry can never starve
/// the loop.
const MAX_LINES_PER_PASS: usize = 4;

/// A line with no newline after this many bytes is discarded as garbage.
const MAX_LINE_BYTES: usize = 4096;

const READ_CHUNK: usize = 1024;

/// Non-blocking line reader over the telemetry source.
pub struct TelemetryPoller {
    source: Option<File>,
    acc: Vec<u8>,
}

impl TelemetryPoller {
    /// Open the configured source, if any. Failure to open is logged and
    /// polling stays disabled.
    pub fn open(path: Option<&Path>) -> Self {
        let source = path.and_then(|path| {
            match std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => {
                    debug!(path = %path.display(), "Telemetry source opened");
                    Some(file)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Telemetry source unavailable");
                    None
                }
            }
        });
        Self { source, acc: Vec::new() }
    }

    /// One bounded pass: up to `MAX_LINES_PER_PASS` complete lines.
    pub fn poll(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.source.is_none() {
            return lines;
        }

        self.extract_lines(&mut lines);
        while lines.len() < MAX_LINES_PER_PASS {
            let Some(source) = self.source.as_mut() else { break };
            let mut chunk = [0u8; READ_CHUNK];
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.acc.extend_from_slice(&chunk[..n]);
                    self.extract_lines(&mut lines);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Telemetry read failed, disabling polling");
                    self.source = None;
                    break;
                }
            }
        }

        // Discard only an oversized unterminated tail; complete lines still
        // buffered (the pass hit its line limit) stay for the next pass.
        let tail_start = self
            .acc
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        if self.acc.len() - tail_start > MAX_LINE_BYTES {
            self.acc.drain(tail_start..);
        }
        lines
    }

    fn extract_lines(&mut self, lines: &mut Vec<String>) {
        while lines.len() < MAX_LINES_PER_PASS {
            let Some(pos) = self.acc.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = String::from_utf8_lossy(&self.acc[..pos]).into_owned();
            self.acc.drain(..=pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_source_is_silently_disabled() {
        let mut poller = TelemetryPoller::open(Some(Path::new("/nonexistent/telemetry")));
        assert!(poller.poll().is_empty());

        let mut unconfigured = TelemetryPoller::open(None);
        assert!(unconfigured.poll().is_empty());
    }

    #[test]
    fn reads_complete_lines_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "t=21.0\nt=21.5\npartial").unwrap();

        let mut poller = TelemetryPoller::open(Some(file.path()));
        assert_eq!(poller.poll(), vec!["t=21.0", "t=21.5"]);
        // The partial tail stays buffered until its newline arrives.
        assert!(poller.poll().is_empty());
    }

    #[test]
    fn passes_are_bounded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..7 {
            writeln!(file, "line-{i}").unwrap();
        }

        let mut poller = TelemetryPoller::open(Some(file.path()));
        let first = poller.poll();
        assert_eq!(first.len(), MAX_LINES_PER_PASS);
        assert_eq!(first[0], "line-0");

        let second = poller.poll();
        assert_eq!(second.len(), 3);
        assert_eq!(second[2], "line-6");
    }

    #[test]
    fn oversized_tail_discarded_without_buffered_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut poller = TelemetryPoller::open(Some(file.path()));

        // Four lines fill the pass; a complete fifth line and a huge
        // unterminated blob are left in the buffer when the guard runs.
        poller.acc.extend_from_slice(b"a\nb\nc\nd\nkeep\n");
        poller.acc.extend_from_slice(&vec![b'#'; MAX_LINE_BYTES + 1000]);

        assert_eq!(poller.poll(), vec!["a", "b", "c", "d"]);
        assert_eq!(poller.acc, b"keep\n", "garbage dropped, complete line kept");
        assert_eq!(poller.poll(), vec!["keep"]);
    }

    #[test]
    fn blank_lines_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "a\n\nb\n").unwrap();

        let mut poller = TelemetryPoller::open(Some(file.path()));
        assert_eq!(poller.poll(), vec!["a", "b"]);
    }
}
