//! Query log sink.
//!
//! The relay appends one line per extracted query. The sink adds no framing,
//! timestamps, or client identifiers.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::{RelayError, Result};

/// Destination for extracted query text.
pub trait QuerySink {
    /// Append `line` followed by a newline.
    fn append_line(&mut self, line: &[u8]) -> io::Result<()>;
}

/// Append-only, line-oriented query log.
#[derive(Debug)]
pub struct QueryLog<W: Write = File> {
    writer: W,
}

impl QueryLog<File> {
    /// Open (or create) a log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| RelayError::QueryLog {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self { writer: file })
    }
}

impl<W: Write> QueryLog<W> {
    /// Wrap an arbitrary writer.
    pub fn from_writer(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> QuerySink for QueryLog<W> {
    fn append_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.writer.write_all(line)?;
        self.writer.write_all(b"\n")?;
        // Flushed per line so the file is readable while the relay runs
        self.writer.flush()
    }
}
