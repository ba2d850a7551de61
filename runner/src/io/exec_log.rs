//! Execution Log storage: append-only lines, state by replay.

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::log_event::{LogHeader, LogLine, LogState, parse_line};

/// The shared coordination channel between worker processes.
pub trait ExecutionLog {
    /// Append one line. Implementations must never rewrite earlier lines.
    fn append(&self, line: &LogLine) -> Result<()>;

    /// Every well-formed line in append order.
    fn lines(&self) -> Result<Vec<LogLine>>;

    fn replay(&self) -> Result<LogState> {
        Ok(LogState::replay(&self.lines()?))
    }
}

/// Log file appended through an `O_APPEND` handle, one `write_all` per line.
#[derive(Debug, Clone)]
pub struct FileLog {
    path: PathBuf,
}

impl FileLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the current log to `dest`. Returns false when there is no log yet.
    pub fn archive(&self, dest: &Path) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::rename(&self.path, dest).with_context(|| {
            format!(
                "archive log {} to {}",
                self.path.display(),
                dest.display()
            )
        })?;
        debug!(from = %self.path.display(), to = %dest.display(), "log archived");
        Ok(true)
    }

    /// Replace the log with a fresh one holding only `headers`.
    pub fn start(&self, headers: &[LogHeader]) -> Result<()> {
        let mut buf = String::new();
        for header in headers {
            buf.push_str(&header.to_string());
            buf.push('\n');
        }
        super::write_atomic(&self.path, &buf)
    }
}

impl ExecutionLog for FileLog {
    fn append(&self, line: &LogLine) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open log {}", self.path.display()))?;
        let text = format!("{line}\n");
        file.write_all(text.as_bytes())
            .with_context(|| format!("append log {}", self.path.display()))?;
        Ok(())
    }

    fn lines(&self) -> Result<Vec<LogLine>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read log {}", self.path.display()))?;
        let mut lines = Vec::new();
        for (number, raw) in contents.lines().enumerate() {
            match parse_line(raw) {
                Some(line) => lines.push(line),
                None if raw.trim().is_empty() => {}
                None => warn!(line = number + 1, "skipping malformed log line"),
            }
        }
        Ok(lines)
    }
}

/// In-memory log for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: RefCell<Vec<LogLine>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(headers: Vec<LogHeader>) -> Self {
        Self {
            lines: RefCell::new(headers.into_iter().map(LogLine::Header).collect()),
        }
    }

    /// Rendered text of every line, for assertions.
    pub fn rendered(&self) -> Vec<String> {
        self.lines.borrow().iter().map(ToString::to_string).collect()
    }
}

impl ExecutionLog for MemoryLog {
    fn append(&self, line: &LogLine) -> Result<()> {
        self.lines.borrow_mut().push(line.clone());
        Ok(())
    }

    fn lines(&self) -> Result<Vec<LogLine>> {
        Ok(self.lines.borrow().clone())
    }
}
