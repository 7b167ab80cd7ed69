//! Concurrent per-record processing over one batch.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use facestat_core::{AggregateStats, ProcessedRecord, RecordOutcome};
use facestat_io::RawEntry;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::ImageCache;
use crate::fetch::ImageFetcher;

/// Records read for one iteration, in input order.
#[derive(Debug, Default)]
pub struct BatchTask {
    pub entries: Vec<RawEntry>,
    /// Offset of the first record.
    pub start_offset: u64,
    /// Offset to resume from once the whole batch is accounted for.
    pub end_offset: u64,
}

impl BatchTask {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a fully processed batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Aggregate over exactly the records of this batch.
    pub partial: AggregateStats,
    /// One outcome per record, sorted by offset.
    pub outcomes: Vec<ProcessedRecord>,
    pub end_offset: u64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("batch cancelled")]
pub struct Cancelled;

pub struct WorkerPool<F> {
    cache: Arc<ImageCache<F>>,
}

impl<F: ImageFetcher> WorkerPool<F> {
    pub fn new(cache: Arc<ImageCache<F>>) -> Self {
        Self { cache }
    }

    /// Process every record of `batch` with at most `concurrency` in flight.
    ///
    /// A failing record never affects its siblings. On cancellation the
    /// in-flight tasks are aborted and nothing from the batch is returned.
    pub async fn process(
        &self,
        batch: BatchTask,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, Cancelled> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let expected = batch.entries.len();

        for entry in batch.entries {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                permit = semaphore.clone().acquire_owned() => permit.map_err(|_| Cancelled)?,
            };
            let cache = self.cache.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let offset = entry.offset;
                AssertUnwindSafe(process_record(&cache, entry))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| ProcessedRecord {
                        offset,
                        record: None,
                        outcome: RecordOutcome::WorkerError {
                            message: panic_message(panic.as_ref()),
                        },
                    })
            });
        }

        let mut outcomes = Vec::with_capacity(expected);
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                joined = tasks.join_next() => joined,
            };
            match joined {
                Some(Ok(processed)) => outcomes.push(processed),
                Some(Err(e)) => {
                    // Only reachable if the task was aborted externally.
                    tracing::error!(error = %e, "record task failed to join");
                    return Err(Cancelled);
                }
                None => break,
            }
        }

        outcomes.sort_by_key(|p| p.offset);
        let mut partial = AggregateStats::default();
        for processed in &outcomes {
            partial.fold(processed);
        }

        Ok(BatchOutcome {
            partial,
            outcomes,
            end_offset: batch.end_offset,
        })
    }
}

/// Validate one record and resolve its image.
async fn process_record<F: ImageFetcher>(cache: &ImageCache<F>, entry: RawEntry) -> ProcessedRecord {
    let offset = entry.offset;
    let record = match entry.result {
        Ok(record) => record,
        Err(e) => {
            return ProcessedRecord {
                offset,
                record: None,
                outcome: RecordOutcome::ParseError {
                    message: e.to_string(),
                },
            }
        }
    };

    let issues = record.validate();
    if !issues.is_empty() {
        return ProcessedRecord {
            offset,
            record: Some(record),
            outcome: RecordOutcome::ValidationError { issues },
        };
    }

    let outcome = match record.image_url.as_deref() {
        None => RecordOutcome::Success { image: None },
        Some(url) => match cache.get_or_fetch(url).await {
            Ok(image) => RecordOutcome::Success { image: Some(image) },
            Err(failure) => RecordOutcome::FetchError {
                kind: failure.error.kind(),
                message: failure.error.to_string(),
                attempts: failure.attempts,
            },
        },
    };

    ProcessedRecord {
        offset,
        record: Some(record),
        outcome,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
