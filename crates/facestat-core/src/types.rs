use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::record::{Record, ValidationIssue};

/// Normalized sex of the detected person.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Female,
    Male,
    #[default]
    Unknown,
}

impl Sex {
    /// Normalize a raw sex value as emitted by recognition terminals.
    ///
    /// Accepts English and Russian spellings plus the numeric `0`/`1`
    /// encoding (`0` = female, `1` = male).
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "female" | "f" | "0" | "жен" | "женский" => Sex::Female,
            "male" | "m" | "1" | "муж" | "мужской" => Sex::Male,
            _ => Sex::Unknown,
        }
    }
}

/// Classification of a per-record failure, used as the key for error counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The record could not be decoded.
    Parse,
    /// The record decoded but failed structural validation.
    Validation,
    /// Connection-level failure talking to the image source.
    Network,
    /// The image request exceeded its timeout.
    Timeout,
    /// The image source answered with a non-success status.
    HttpStatus,
    /// The image exceeded the configured maximum size.
    SizeLimit,
    /// The payload was not a recognizable image.
    InvalidImage,
    /// The image could not be written to the local cache.
    Storage,
    /// The worker processing the record terminated abnormally.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::SizeLimit => "size_limit",
            ErrorKind::InvalidImage => "invalid_image",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A locally available image resolved for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Cache key (hex digest of the normalized source URL).
    pub key: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Tagged result of processing one record. Every record yields exactly one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Success {
        image: Option<ImageRef>,
    },
    ParseError {
        message: String,
    },
    ValidationError {
        issues: Vec<ValidationIssue>,
    },
    FetchError {
        kind: ErrorKind,
        message: String,
        attempts: u32,
    },
    /// Processing of the record terminated abnormally.
    WorkerError {
        message: String,
    },
}

impl RecordOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Success { .. })
    }

    /// The error classification, or `None` for a successful outcome.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            RecordOutcome::Success { .. } => None,
            RecordOutcome::ParseError { .. } => Some(ErrorKind::Parse),
            RecordOutcome::ValidationError { .. } => Some(ErrorKind::Validation),
            RecordOutcome::FetchError { kind, .. } => Some(*kind),
            RecordOutcome::WorkerError { .. } => Some(ErrorKind::Internal),
        }
    }
}

/// A record together with the outcome derived for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedRecord {
    /// Stable input position of the record (byte offset or element index).
    pub offset: u64,
    /// The decoded record; absent when decoding failed.
    pub record: Option<Record>,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}
