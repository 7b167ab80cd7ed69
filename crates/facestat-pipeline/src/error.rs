use std::io;
use std::path::PathBuf;

use facestat_io::{CheckpointError, ReaderError};
use thiserror::Error;

/// Fatal pipeline errors. Per-record failures never surface here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(#[from] ReaderError),
    #[error("checkpoint commit failed: {0}")]
    CheckpointWrite(#[source] CheckpointError),
    #[error("checkpoint could not be loaded: {0}")]
    CheckpointLoad(#[source] CheckpointError),
    #[error("resume rejected: {0}")]
    ResumeMismatch(#[source] CheckpointError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| PipelineError::Io { path, source }
    }
}
