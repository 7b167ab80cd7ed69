//! Durable checkpoint storage.
//!
//! A checkpoint pairs the resume offset with the aggregate snapshot that
//! covers every record before it. Commits go through a temp file and a rename
//! over the primary, so a crash mid-write never leaves a torn or missing
//! `processing_checkpoint.json`. The previous good checkpoint is kept as
//! `.bak` and used when the primary is unreadable.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use facestat_core::AggregateStats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reader::InputFormat;

pub const CHECKPOINT_FILE_NAME: &str = "processing_checkpoint.json";
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
const BACKUP_SUFFIX: &str = "bak";
const TEMP_SUFFIX: &str = "tmp";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to write checkpoint {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read checkpoint {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint schema version {found} is not supported (expected {})", CHECKPOINT_SCHEMA_VERSION)]
    UnsupportedVersion { found: u32 },
    #[error("checkpoint was written for {expected}, current input is {found}")]
    SourceMismatch {
        expected: SourceIdentity,
        found: SourceIdentity,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identity of an input file: path, size and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time as RFC 3339 with nanoseconds, or empty when the
    /// platform does not report one.
    pub modified: String,
}

impl SourceIdentity {
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_default();
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(Self {
            path,
            size: meta.len(),
            modified,
        })
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, modified {})",
            self.path.display(),
            self.size,
            self.modified
        )
    }
}

/// Persisted pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub schema_version: u32,
    pub source_identity: SourceIdentity,
    /// Offset to resume reading from.
    pub last_committed_offset: u64,
    pub records_processed: u64,
    pub aggregate_stats: AggregateStats,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub input_format: Option<InputFormat>,
    /// Set on the final commit once the input was exhausted.
    #[serde(default)]
    pub completed: bool,
    /// Batch size in effect when the checkpoint was taken.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl CheckpointState {
    /// Build a state whose `records_processed` is taken from the snapshot
    /// itself, so the two can never disagree.
    pub fn new(
        source_identity: SourceIdentity,
        last_committed_offset: u64,
        aggregate_stats: AggregateStats,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            source_identity,
            last_committed_offset,
            records_processed: aggregate_stats.records_processed,
            aggregate_stats,
            timestamp: Utc::now(),
            input_format: None,
            completed: false,
            batch_size: None,
        }
    }

    pub fn with_format(mut self, format: InputFormat) -> Self {
        self.input_format = Some(format);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn mark_completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// When a commit is due: after `every_records` newly folded records or after
/// `every` has elapsed since the last commit, whichever comes first.
/// A zero value disables that trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    pub every_records: u64,
    pub every: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            every_records: 10_000,
            every: Duration::from_secs(60),
        }
    }
}

impl CommitPolicy {
    pub fn is_due(&self, records_since_commit: u64, since_commit: Duration) -> bool {
        if records_since_commit == 0 {
            return false;
        }
        (self.every_records > 0 && records_since_commit >= self.every_records)
            || (!self.every.is_zero() && since_commit >= self.every)
    }
}

#[derive(Serialize, Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

/// Owns the checkpoint files in one output directory.
///
/// Only the orchestrator commits, so commits are never concurrent.
pub struct CheckpointManager {
    path: PathBuf,
    backup_path: PathBuf,
    temp_path: PathBuf,
    policy: CommitPolicy,
    last_commit_at: Instant,
    last_commit_records: u64,
}

impl CheckpointManager {
    pub fn new(dir: &Path, policy: CommitPolicy) -> Self {
        let path = dir.join(CHECKPOINT_FILE_NAME);
        Self {
            backup_path: sibling(&path, BACKUP_SUFFIX),
            temp_path: sibling(&path, TEMP_SUFFIX),
            path,
            policy,
            last_commit_at: Instant::now(),
            last_commit_records: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Reset the commit interval baseline (after resuming from a checkpoint).
    pub fn set_baseline(&mut self, records_processed: u64) {
        self.last_commit_records = records_processed;
        self.last_commit_at = Instant::now();
    }

    pub fn is_due(&self, records_processed: u64) -> bool {
        self.policy.is_due(
            records_processed.saturating_sub(self.last_commit_records),
            self.last_commit_at.elapsed(),
        )
    }

    /// Atomically replace the checkpoint with `state`.
    pub fn commit(&mut self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_error(parent))?;
        }

        let mut file = File::create(&self.temp_path).map_err(write_error(&self.temp_path))?;
        file.write_all(&bytes).map_err(write_error(&self.temp_path))?;
        file.sync_all().map_err(write_error(&self.temp_path))?;
        drop(file);

        if self.path.exists() {
            if let Err(e) = self.rotate_backup() {
                tracing::warn!(
                    path = %self.backup_path.display(),
                    error = %e,
                    "failed to keep checkpoint backup"
                );
            }
        }
        // The primary is replaced in one rename and never goes missing.
        fs::rename(&self.temp_path, &self.path).map_err(write_error(&self.path))?;
        sync_parent_dir(&self.path);

        self.last_commit_at = Instant::now();
        self.last_commit_records = state.records_processed;

        tracing::debug!(
            offset = state.last_committed_offset,
            records = state.records_processed,
            completed = state.completed,
            "checkpoint written"
        );
        Ok(())
    }

    /// Point `.bak` at the current primary. A hard link shares the old inode,
    /// which the following rename leaves untouched.
    fn rotate_backup(&self) -> io::Result<()> {
        match fs::remove_file(&self.backup_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match fs::hard_link(&self.path, &self.backup_path) {
            Ok(()) => Ok(()),
            Err(_) => fs::copy(&self.path, &self.backup_path).map(|_| ()),
        }
    }

    /// Load the checkpoint for `identity`.
    ///
    /// Returns `Ok(None)` when no checkpoint exists. A checkpoint written for
    /// a different input is reported as [`CheckpointError::SourceMismatch`].
    pub fn load(&self, identity: &SourceIdentity) -> Result<Option<CheckpointState>, CheckpointError> {
        let Some(state) = self.peek()? else {
            return Ok(None);
        };
        if &state.source_identity != identity {
            return Err(CheckpointError::SourceMismatch {
                expected: state.source_identity,
                found: identity.clone(),
            });
        }
        Ok(Some(state))
    }

    /// Read whatever checkpoint is on disk, without an identity check.
    pub fn peek(&self) -> Result<Option<CheckpointState>, CheckpointError> {
        match read_state(&self.path) {
            Ok(Some(state)) => Ok(Some(state)),
            Ok(None) => read_state(&self.backup_path),
            Err(err @ CheckpointError::UnsupportedVersion { .. }) => Err(err),
            Err(primary_err) => {
                tracing::warn!(error = %primary_err, "primary checkpoint unreadable, trying backup");
                match read_state(&self.backup_path) {
                    Ok(Some(state)) => Ok(Some(state)),
                    _ => Err(primary_err),
                }
            }
        }
    }

    /// Remove checkpoint, backup and any leftover temp file.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        for path in [&self.path, &self.backup_path, &self.temp_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CheckpointError::Write {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        tracing::info!(path = %self.path.display(), "checkpoint cleared");
        Ok(())
    }
}

fn read_state(path: &Path) -> Result<Option<CheckpointState>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let probe: VersionProbe =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    if probe.schema_version != CHECKPOINT_SCHEMA_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            found: probe.schema_version,
        });
    }

    let state: CheckpointState =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    if state.records_processed != state.aggregate_stats.records_processed {
        return Err(corrupt(format!(
            "records_processed {} does not match aggregate count {}",
            state.records_processed, state.aggregate_stats.records_processed
        )));
    }
    Ok(Some(state))
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Write { path, source }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Best-effort fsync of the directory so the rename itself is durable.
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
