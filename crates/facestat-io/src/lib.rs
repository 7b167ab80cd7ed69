//! facestat-io — Streaming record readers and crash-safe checkpoint storage.
//!
//! [`RecordReader`] yields records lazily from JSON-array, JSONL and
//! line-delimited text inputs with a resumable offset. [`CheckpointManager`]
//! persists that offset together with the aggregate snapshot using
//! write-then-rename, keeping a backup of the previous checkpoint.

pub mod checkpoint;
pub mod reader;

pub use checkpoint::{
    CheckpointError, CheckpointManager, CheckpointState, CommitPolicy, SourceIdentity,
    CHECKPOINT_FILE_NAME, CHECKPOINT_SCHEMA_VERSION,
};
pub use reader::{InputFormat, RawEntry, ReaderError, RecordReader};
