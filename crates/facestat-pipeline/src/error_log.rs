//! Append-only JSON-lines log of per-record failures.
//!
//! The log is advisory. Records replayed after a crash can appear twice;
//! the aggregate statistics are the source of truth.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use facestat_core::ProcessedRecord;

pub struct ErrorLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl ErrorLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: None,
            written: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Lines written by this handle.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append every failed outcome in `outcomes`.
    ///
    /// A write failure disables the log for the rest of the run instead of
    /// failing it.
    pub fn append(&mut self, outcomes: &[ProcessedRecord]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let mut written = 0;
        let result = outcomes
            .iter()
            .filter(|p| !p.outcome.is_success())
            .try_for_each(|p| {
                serde_json::to_writer(&mut *writer, p)?;
                writer.write_all(b"\n")?;
                written += 1;
                Ok::<_, io::Error>(())
            })
            .and_then(|()| writer.flush());

        self.written += written;
        if let Err(e) = result {
            tracing::warn!(
                path = ?self.path,
                error = %e,
                "error log write failed, disabling error log"
            );
            self.writer = None;
        }
    }
}
