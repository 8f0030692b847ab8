//! Container log retrieval.
//!
//! The runtime appends container output to `logs/<name>.log`. Lines may
//! start with a bracketed ISO-8601 timestamp, e.g.
//! `[2024-05-01T10:00:00Z] listening on :80`.

use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use lxcompose_common::config::RuntimeConfig;
use lxcompose_common::error::{LxError, Result};

use crate::command::{CommandRunner, ProcessHandle};
use crate::layout::Layout;
use crate::state::StateStore;

/// Timestamp layouts accepted without an offset; interpreted as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// What to return from a container log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep streaming lines appended after the call.
    pub follow: bool,
    /// Keep only the last `tail` lines; `0` keeps everything.
    pub tail: usize,
    /// Drop timestamped lines earlier than this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep the leading timestamp of each line.
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: 0,
            since: None,
            timestamps: true,
        }
    }
}

/// Reads container logs.
pub struct LogRetrieval {
    layout: Layout,
    store: Arc<StateStore>,
    runner: Arc<dyn CommandRunner>,
    follow_program: String,
}

impl std::fmt::Debug for LogRetrieval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRetrieval")
            .field("logs_dir", &self.layout.logs_dir())
            .field("follow_program", &self.follow_program)
            .finish_non_exhaustive()
    }
}

impl LogRetrieval {
    /// Creates a log reader sharing `store` with the lifecycle controller.
    #[must_use]
    pub fn new(
        config: &RuntimeConfig,
        store: Arc<StateStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            layout: Layout::new(&config.data_dir),
            store,
            runner,
            follow_program: config.binaries.follow.clone(),
        }
    }

    /// Returns the log file path for a container.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.layout.log_path(name)
    }

    /// Opens the log of container `name`.
    ///
    /// The existing content is filtered by `since`, then cut to the last
    /// `tail` lines. With `follow`, lines appended later are streamed
    /// until the returned stream is closed.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown container, an I/O
    /// error if the log cannot be read, or the runner's error if the
    /// follow process cannot be spawned.
    pub fn get_logs(&self, name: &str, opts: &LogOptions) -> Result<LogStream> {
        if !self.store.contains(name) {
            return Err(LxError::NotFound {
                kind: "container",
                id: name.to_string(),
            });
        }
        let path = self.log_path(name);

        // Spawned before the file is read so no appended line is missed.
        let follow = if opts.follow {
            let args = [
                "-n".to_string(),
                "0".to_string(),
                "-F".to_string(),
                path.display().to_string(),
            ];
            let process = self.runner.spawn(&self.follow_program, &args)?;
            tracing::debug!(name, program = %self.follow_program, "log follow started");
            Some(Follow {
                stdout: BufReader::new(process.stdout),
                handle: process.handle,
            })
        } else {
            None
        };

        // Dropping the stream on a read error stops the follow process.
        let mut stream = LogStream {
            buffered: Cursor::new(Vec::new()),
            follow,
            timestamps: opts.timestamps,
        };
        let content = read_log(&path)?;
        let selected = select_lines(&content, opts);
        tracing::debug!(name, lines = selected.len(), follow = opts.follow, "logs read");

        let mut buffer = Vec::with_capacity(content.len());
        for line in selected {
            let line = if opts.timestamps { line } else { strip_timestamp(line) };
            buffer.extend_from_slice(line.as_bytes());
            buffer.push(b'\n');
        }
        stream.buffered = Cursor::new(buffer);
        Ok(stream)
    }
}

/// Reads a log file, returning an empty string if it does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_log(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(LxError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Appends a line prefixed with `[at]` to a log file.
///
/// Creates the log directory and file if they do not exist.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created or written.
pub fn append_log(path: &Path, at: DateTime<Utc>, line: &str) -> Result<()> {
    let io_err = |e| LxError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    writeln!(
        file,
        "[{}] {line}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
    .map_err(io_err)
}

/// Parses the bracketed timestamp at the start of `line`.
#[must_use]
pub fn parse_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let (raw, _) = split_timestamp(line)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Removes a parseable leading timestamp and the space after it.
#[must_use]
pub fn strip_timestamp(line: &str) -> &str {
    match split_timestamp(line) {
        Some((_, rest)) if parse_timestamp(line).is_some() => {
            rest.strip_prefix(' ').unwrap_or(rest)
        }
        _ => line,
    }
}

fn split_timestamp(line: &str) -> Option<(&str, &str)> {
    let inner = line.strip_prefix('[')?;
    let end = inner.find(']')?;
    Some((&inner[..end], &inner[end + 1..]))
}

fn select_lines<'a>(content: &'a str, opts: &LogOptions) -> Vec<&'a str> {
    let mut lines: Vec<&str> = content
        .lines()
        .filter(|line| match (opts.since, parse_timestamp(line)) {
            (Some(since), Some(ts)) => ts >= since,
            _ => true,
        })
        .collect();
    if opts.tail > 0 && lines.len() > opts.tail {
        let _ = lines.drain(..lines.len() - opts.tail);
    }
    lines
}

struct Follow {
    stdout: BufReader<Box<dyn Read + Send>>,
    handle: Box<dyn ProcessHandle>,
}

/// Stream of log bytes returned by [`LogRetrieval::get_logs`].
///
/// Yields the selected existing lines, then the output of the follow
/// process if one was started. Call [`LogStream::close`] to stop following;
/// dropping the stream stops it too, but swallows any error.
pub struct LogStream {
    buffered: Cursor<Vec<u8>>,
    follow: Option<Follow>,
    timestamps: bool,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("following", &self.follow.is_some())
            .finish_non_exhaustive()
    }
}

impl LogStream {
    /// Returns whether a follow process is attached.
    #[must_use]
    pub const fn is_following(&self) -> bool {
        self.follow.is_some()
    }

    /// Terminates the follow process, if any, and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be signalled or reaped.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        match self.follow.take() {
            Some(mut follow) => {
                drop(follow.stdout);
                follow.handle.terminate()?;
                tracing::debug!("log follow stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Read for LogStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffered.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        let Some(follow) = self.follow.as_mut() else {
            return Ok(0);
        };
        if self.timestamps {
            return follow.stdout.read(buf);
        }
        let mut line = Vec::new();
        if follow.stdout.read_until(b'\n', &mut line)? == 0 {
            return Ok(0);
        }
        if let Ok(text) = std::str::from_utf8(&line) {
            let stripped = strip_timestamp(text).as_bytes().to_vec();
            line = stripped;
        }
        self.buffered = Cursor::new(line);
        self.buffered.read(buf)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "failed to stop log follow process");
        }
    }
}
