//! Append-only per-session log with offset-addressable replay.
//!
//! Writers append at the end of the file; readers use a separate handle
//! positioned explicitly for every read. The live read cursor only moves in
//! [`LogChannel::flush_live`] and [`LogChannel::skip_to_end`], so ranged
//! replays never disturb live streaming.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;

use crate::{AppError, Result};

#[derive(Debug)]
struct LogState {
    writer: File,
    reader: File,
    cursor: u64,
}

/// Shared handle to the session log.
#[derive(Debug, Clone)]
pub struct LogChannel {
    path: Arc<PathBuf>,
    inner: Arc<Mutex<LogState>>,
}

impl LogChannel {
    /// Open (or create) the log file at `path`.
    ///
    /// Content already in the file is treated as delivered: the live cursor
    /// starts at the current end.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| AppError::Io(format!("cannot open log {}: {err}", path.display())))?;
        let reader = File::open(&path)
            .map_err(|err| AppError::Io(format!("cannot read log {}: {err}", path.display())))?;
        let cursor = writer.metadata()?.len();
        Ok(Self {
            path: Arc::new(path),
            inner: Arc::new(Mutex::new(LogState {
                writer,
                reader,
                cursor,
            })),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the write fails.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        state.writer.write_all(bytes)?;
        Ok(())
    }

    /// Append one line of diagnostic text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the write fails.
    pub fn append_line(&self, line: &str) -> Result<()> {
        let mut state = self.state()?;
        state.writer.write_all(line.trim_end_matches('\n').as_bytes())?;
        state.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Current end of the log; the offset the next append lands at.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file metadata cannot be read.
    pub fn mark_start(&self) -> Result<u64> {
        let mut state = self.state()?;
        state.writer.flush()?;
        Ok(state.writer.metadata()?.len())
    }

    /// Position of the live read cursor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the channel lock is poisoned.
    pub fn cursor(&self) -> Result<u64> {
        Ok(self.state()?.cursor)
    }

    /// Read `[from, to)` without touching the live cursor.
    ///
    /// `to` falls back to the current end when absent, not past `from`, or
    /// beyond the end of the log. A `from` past the end yields nothing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if reading fails.
    pub fn flush(&self, from: u64, to: Option<u64>) -> Result<String> {
        let mut state = self.state()?;
        let total = state.writer.metadata()?.len();
        let end = match to {
            Some(to) if to > from && to <= total => to,
            _ => total,
        };
        read_range(&mut state.reader, from, end)
    }

    /// Read everything appended since the previous live flush and advance
    /// the cursor past it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if reading fails.
    pub fn flush_live(&self) -> Result<String> {
        let mut state = self.state()?;
        let total = state.writer.metadata()?.len();
        let from = state.cursor;
        let text = read_range(&mut state.reader, from, total)?;
        state.cursor = total;
        Ok(text)
    }

    /// Drop pending output: move the live cursor to the current end.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file metadata cannot be read.
    pub fn skip_to_end(&self) -> Result<()> {
        let mut state = self.state()?;
        state.cursor = state.writer.metadata()?.len();
        Ok(())
    }

    /// Lines appended since `offset`, for attaching to a query record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if reading fails.
    pub fn lines_from(&self, offset: u64) -> Result<Vec<String>> {
        Ok(self
            .flush(offset, None)?
            .lines()
            .map(str::to_owned)
            .collect())
    }

    fn state(&self) -> Result<MutexGuard<'_, LogState>> {
        self.inner
            .lock()
            .map_err(|_| AppError::Io("log channel mutex poisoned".into()))
    }
}

fn read_range(reader: &mut File, from: u64, end: u64) -> Result<String> {
    if from >= end {
        return Ok(String::new());
    }
    reader.seek(SeekFrom::Start(from))?;
    let mut buf = Vec::new();
    Read::by_ref(reader).take(end - from).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Writer handed to `tracing_subscriber` so structured logs land in the
/// session log.
#[derive(Debug)]
pub struct LogWriter(LogChannel);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .append(buf)
            .map(|()| buf.len())
            .map_err(|err| io::Error::other(err.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogChannel {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.clone())
    }
}
