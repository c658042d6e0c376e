//! Line observers attached to the server's output streams.
//!
//! An observer receives every line of one stream, in order. `on_line` runs on the
//! stream's reader task, so a slow observer stalls that stream (and only that one).

use std::{
    collections::VecDeque,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tokio::{io::AsyncWriteExt, sync::mpsc};

const STD_PREFIX: &str = "[mongod std] ";
const ERR_PREFIX: &str = "[mongod err] ";

const DEFAULT_LINE_BUFFER_MAX_LINES: usize = 1000;
const DEFAULT_CONSOLE_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_CONSOLE_LOG_KEEP: usize = 3;
const CONSOLE_LOG_BATCH: usize = 64;

pub trait Observer: Send + Sync {
    fn on_line(&self, line: &str);

    fn name(&self) -> &str {
        "observer"
    }
}

/// Tracing observer for the server's standard output (INFO).
pub fn default_stdout_observer() -> TracingSink {
    TracingSink::new(Severity::Info, STD_PREFIX)
}

/// Tracing observer for the server's error output (ERROR).
pub fn default_stderr_observer() -> TracingSink {
    TracingSink::new(Severity::Error, ERR_PREFIX)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Observer for Discard {
    fn on_line(&self, _line: &str) {}

    fn name(&self) -> &str {
        "discard"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

/// Prints each line, prefixed, to this process's stdout or stderr.
#[derive(Debug, Clone)]
pub struct Print {
    channel: Channel,
    prefix: String,
}

impl Print {
    pub fn new(channel: Channel, prefix: impl Into<String>) -> Self {
        Self {
            channel,
            prefix: prefix.into(),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Channel::Stdout, STD_PREFIX)
    }

    pub fn stderr() -> Self {
        Self::new(Channel::Stderr, ERR_PREFIX)
    }
}

impl Observer for Print {
    fn on_line(&self, line: &str) {
        // Ignore closed pipes; output is best-effort.
        let _ = match self.channel {
            Channel::Stdout => writeln!(std::io::stdout().lock(), "{}{}", self.prefix, line),
            Channel::Stderr => writeln!(std::io::stderr().lock(), "{}{}", self.prefix, line),
        };
    }

    fn name(&self) -> &str {
        match self.channel {
            Channel::Stdout => "print-stdout",
            Channel::Stderr => "print-stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Forwards lines to `tracing` at a fixed severity.
#[derive(Debug, Clone)]
pub struct TracingSink {
    severity: Severity,
    prefix: String,
}

impl TracingSink {
    pub fn new(severity: Severity, prefix: impl Into<String>) -> Self {
        Self {
            severity,
            prefix: prefix.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

impl Observer for TracingSink {
    fn on_line(&self, line: &str) {
        let prefix = &self.prefix;
        match self.severity {
            Severity::Trace => tracing::trace!(target: "ember::mongod", "{prefix}{line}"),
            Severity::Debug => tracing::debug!(target: "ember::mongod", "{prefix}{line}"),
            Severity::Info => tracing::info!(target: "ember::mongod", "{prefix}{line}"),
            Severity::Warn => tracing::warn!(target: "ember::mongod", "{prefix}{line}"),
            Severity::Error => tracing::error!(target: "ember::mongod", "{prefix}{line}"),
        }
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// The most recent lines of a stream, oldest first. Holds at most `max_lines`.
#[derive(Debug)]
pub struct LineBuffer {
    max_lines: usize,
    lines: Mutex<VecDeque<String>>,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_lines(DEFAULT_LINE_BUFFER_MAX_LINES)
    }
}

impl LineBuffer {
    pub fn with_max_lines(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn retained(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lines(&self) -> Vec<String> {
        self.retained().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.retained().len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained().is_empty()
    }

    /// Retained lines, each terminated by a newline.
    pub fn contents(&self) -> String {
        self.retained().iter().fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.retained().iter().any(|l| l.contains(needle))
    }
}

impl Observer for LineBuffer {
    fn on_line(&self, line: &str) {
        let mut lines = self.retained();
        if lines.len() == self.max_lines {
            lines.pop_front();
        }
        lines.push_back(line.to_owned());
    }

    fn name(&self) -> &str {
        "line-buffer"
    }
}

/// Accumulates the whole stream into one string.
#[derive(Debug, Default)]
pub struct Capture {
    contents: Mutex<String>,
}

impl Capture {
    pub fn contents(&self) -> String {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Observer for Capture {
    fn on_line(&self, line: &str) {
        let mut contents = self.contents.lock().unwrap_or_else(PoisonError::into_inner);
        contents.push_str(line);
        contents.push('\n');
    }

    fn name(&self) -> &str {
        "capture"
    }
}

/// When a [`ConsoleLog`] starts a new file and how many old ones it keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Size the active file may reach; `0` disables rotation.
    pub max_bytes: u64,
    /// Rotated files kept next to the active one.
    pub keep: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_CONSOLE_LOG_MAX_BYTES,
            keep: DEFAULT_CONSOLE_LOG_KEEP,
        }
    }
}

fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

async fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Active file of a console log plus the bytes already in it.
struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    written: u64,
    file: tokio::fs::File,
}

impl RotatingFile {
    async fn create(path: PathBuf, policy: RotationPolicy) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            policy,
            written,
            file,
        })
    }

    fn is_full_for(&self, incoming: u64) -> bool {
        self.policy.max_bytes > 0
            && self.written > 0
            && self.written + incoming > self.policy.max_bytes
    }

    /// `log` becomes `log.1`, `log.1` becomes `log.2`, and so on; the oldest drops off.
    async fn roll(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        match tokio::fs::remove_file(numbered(&self.path, self.policy.keep)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        for n in (1..self.policy.keep).rev() {
            rename_if_present(&numbered(&self.path, n), &numbered(&self.path, n + 1)).await?;
        }
        rename_if_present(&self.path, &numbered(&self.path, 1)).await?;

        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn append(&mut self, line: &str) -> io::Result<()> {
        let incoming = line.len() as u64 + 1;
        if self.is_full_for(incoming)
            && let Err(e) = self.roll().await
        {
            tracing::warn!(path = %self.path.display(), error = %e, "console log rotation failed");
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written += incoming;
        Ok(())
    }
}

/// Appends lines to a size-rotated file (`console.log`, `console.log.1`, ...).
///
/// Writes happen on a background task; must be created inside a tokio runtime.
/// The writer drains what is queued and finishes once the `ConsoleLog` is dropped.
pub struct ConsoleLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<String>,
}

impl ConsoleLog {
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        Self::spawn_with_policy(path, RotationPolicy::default())
    }

    pub fn spawn_with_policy(path: impl Into<PathBuf>, mut policy: RotationPolicy) -> Self {
        let path = path.into();
        policy.keep = policy.keep.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(write_console_log(path.clone(), policy, rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_console_log(path: PathBuf, policy: RotationPolicy, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut out = match RotatingFile::create(path.clone(), policy).await {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "console log unavailable");
            return;
        }
    };

    let mut batch = Vec::with_capacity(CONSOLE_LOG_BATCH);
    while rx.recv_many(&mut batch, CONSOLE_LOG_BATCH).await > 0 {
        for line in batch.drain(..) {
            if let Err(e) = out.append(&line).await {
                tracing::warn!(path = %out.path.display(), error = %e, "console log write failed");
            }
        }
        if let Err(e) = out.file.flush().await {
            tracing::warn!(path = %out.path.display(), error = %e, "console log flush failed");
        }
    }
}

impl Observer for ConsoleLog {
    fn on_line(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }

    fn name(&self) -> &str {
        "console-log"
    }
}
