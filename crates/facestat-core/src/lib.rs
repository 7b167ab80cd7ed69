//! facestat-core — Face-recognition event records and aggregate statistics.
//!
//! Decodes loosely-typed detection events into a fixed [`Record`] schema,
//! validates them, and folds per-record outcomes into [`AggregateStats`].

pub mod record;
pub mod stats;
pub mod types;

pub use record::{Record, RecordParseError, ValidationIssue};
pub use stats::{AggregateAccumulator, AggregateStats};
pub use types::{ErrorKind, ImageRef, ProcessedRecord, RecordOutcome, Sex};
