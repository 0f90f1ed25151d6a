//! Transcript parsing and tailing.
//!
//! A transcript is a JSON-lines file: a header object `{"width":..,"height":..}`
//! followed by `[time, type, data]` records, and optionally a terminating
//! `["exit", code, ...]` record.

use std::{io::SeekFrom, path::PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// One parsed transcript line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptRecord {
    /// Header line. Resizes the terminal when both dimensions are present.
    Header { width: Option<u16>, height: Option<u16> },
    /// `"o"`: output bytes for the emulator.
    Output(String),
    /// `"r"`: new terminal size.
    Resize { cols: u16, rows: u16 },
    /// `"m"`: clear marker.
    Marker,
    /// `"i"`: user input echo; carries nothing for the screen.
    Input,
    /// Session exited; nothing follows.
    Exit(i64),
}

impl TranscriptRecord {
    /// Whether applying this record can change the visible screen.
    #[must_use]
    pub const fn affects_screen(&self) -> bool {
        !matches!(self, Self::Input | Self::Exit(_))
    }
}

/// Why a transcript line was rejected.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not a transcript record")]
    NotARecord,
    #[error("Unknown record type: {0}")]
    UnknownType(String),
    #[error("Invalid resize payload: {0}")]
    InvalidResize(String),
    #[error("Record is missing its data field")]
    MissingData,
}

#[derive(Deserialize)]
struct Header {
    width: Option<u16>,
    height: Option<u16>,
}

/// Parse a single transcript line.
///
/// Blank lines yield `Ok(None)`.
///
/// # Errors
/// Returns a `StreamError` for anything that is not a valid header or record.
pub fn parse_line(line: &str) -> Result<Option<TranscriptRecord>, StreamError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)?;
    let items = match value {
        Value::Object(_) => {
            let header: Header = serde_json::from_value(value)?;
            return Ok(Some(TranscriptRecord::Header {
                width: header.width,
                height: header.height,
            }));
        }
        Value::Array(items) => items,
        _ => return Err(StreamError::NotARecord),
    };

    if items.first().and_then(Value::as_str) == Some("exit") {
        let code = items.get(1).and_then(Value::as_i64).unwrap_or(0);
        return Ok(Some(TranscriptRecord::Exit(code)));
    }

    if items.len() < 3 || !(items[0].is_number() || items[0].is_string()) {
        return Err(StreamError::NotARecord);
    }
    let kind = items[1].as_str().ok_or(StreamError::NotARecord)?;
    let data = items[2].as_str();

    let record = match kind {
        "o" => TranscriptRecord::Output(data.ok_or(StreamError::MissingData)?.to_string()),
        "r" => {
            let data = data.ok_or(StreamError::MissingData)?;
            let (cols, rows) =
                parse_size(data).ok_or_else(|| StreamError::InvalidResize(data.to_string()))?;
            TranscriptRecord::Resize { cols, rows }
        }
        "m" => TranscriptRecord::Marker,
        "i" => TranscriptRecord::Input,
        other => return Err(StreamError::UnknownType(other.to_string())),
    };
    Ok(Some(record))
}

/// Parse `"COLSxROWS"`.
fn parse_size(data: &str) -> Option<(u16, u16)> {
    let (cols, rows) = data.split_once('x')?;
    let cols: u16 = cols.trim().parse().ok()?;
    let rows: u16 = rows.trim().parse().ok()?;
    (cols > 0 && rows > 0).then_some((cols, rows))
}

/// Incremental reader over a growing transcript file.
///
/// Only complete, newline-terminated lines are returned, and the read offset
/// advances past exactly the lines handed out. Anything left behind stays in
/// the file until the next call.
#[derive(Debug)]
pub struct TranscriptTail {
    path: PathBuf,
    offset: u64,
    chunk: usize,
}

const INITIAL_CHUNK: usize = 256 * 1024;

impl TranscriptTail {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_offset(path, 0)
    }

    /// Resume tailing at a previously recorded offset.
    #[must_use]
    pub fn from_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            chunk: INITIAL_CHUNK,
        }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to `max_lines` complete lines.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or read.
    pub async fn read_lines(&mut self, max_lines: usize) -> std::io::Result<Vec<String>> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::warn!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "Transcript shrank, restarting from the beginning"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity(self.chunk.min(usize::try_from(len - self.offset).unwrap_or(usize::MAX)));
        file.take(self.chunk as u64).read_to_end(&mut buf).await?;

        let mut lines = Vec::new();
        let mut consumed = 0;
        for (idx, byte) in buf.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            lines.push(String::from_utf8_lossy(&buf[consumed..idx]).into_owned());
            consumed = idx + 1;
            if lines.len() == max_lines {
                break;
            }
        }

        if lines.is_empty() && buf.len() == self.chunk {
            // a single line longer than the chunk; widen and pick it up next time
            self.chunk *= 2;
            tracing::debug!(path = %self.path.display(), chunk = self.chunk, "Growing transcript read chunk");
        }

        self.offset += consumed as u64;
        Ok(lines)
    }
}
