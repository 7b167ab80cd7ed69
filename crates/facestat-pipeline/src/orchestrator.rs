//! The batch loop: read → size → dispatch → accumulate → checkpoint.
//!
//! One task drives every iteration in input order. The tracked offset only
//! moves after a batch's partial aggregate has been merged, so each committed
//! checkpoint pairs an offset with exactly the records folded before it.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use facestat_core::{AggregateAccumulator, AggregateStats};
use facestat_io::{
    CheckpointError, CheckpointManager, CheckpointState, InputFormat, ReaderError, RecordReader,
    SourceIdentity,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheConfig, CacheStats, ImageCache};
use crate::config::{MismatchPolicy, PipelineConfig};
use crate::error::PipelineError;
use crate::error_log::ErrorLog;
use crate::eviction::run_eviction_daemon;
use crate::fetch::{HttpFetcher, ImageFetcher};
use crate::memory::{MemoryMonitor, MemorySampler};
use crate::worker::{BatchTask, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Reading,
    Dispatching,
    Accumulating,
    Checkpointing,
    Completed,
    Failed,
    Paused,
}

/// What a finished (completed or paused) run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: PipelineState,
    pub stats: AggregateStats,
    /// Offset of the next unprocessed record.
    pub offset: u64,
    pub input_format: InputFormat,
    /// Batches processed by this run.
    pub batches: u64,
    /// Offset this run resumed from, if it resumed.
    pub resumed_from: Option<u64>,
    pub cache: CacheStats,
    pub errors_logged: u64,
    pub elapsed_ms: u64,
    pub output_formats: Vec<String>,
}

pub struct Orchestrator<F> {
    config: PipelineConfig,
    /// Moved into the image cache when the run starts.
    fetcher: Option<F>,
    sampler: Option<Box<dyn MemorySampler>>,
    cancel: CancellationToken,
    state: PipelineState,
}

impl Orchestrator<HttpFetcher> {
    /// Orchestrator backed by the real HTTP fetcher.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let fetcher = HttpFetcher::new(config.request_timeout())
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self::new(config, fetcher))
    }
}

impl<F: ImageFetcher> Orchestrator<F> {
    pub fn new(config: PipelineConfig, fetcher: F) -> Self {
        Self {
            config,
            fetcher: Some(fetcher),
            sampler: None,
            cancel: CancellationToken::new(),
            state: PipelineState::Idle,
        }
    }

    /// Use `sampler` instead of the system sampler for adaptive sizing.
    /// Ignored with `skip_optimization`.
    pub fn with_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Token that pauses the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "pipeline state");
            self.state = next;
        }
    }

    /// Run until the input is exhausted, the run is cancelled or the record
    /// limit is reached. An `Err` means the run ended in
    /// [`PipelineState::Failed`]; the last committed checkpoint is left intact.
    pub async fn run(mut self) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        self.config.validate()?;

        let result = self.drive(started).await;
        if let Err(e) = &result {
            self.transition(PipelineState::Failed);
            tracing::error!(error = %e, "pipeline failed");
        }
        result
    }

    async fn drive(&mut self, started: Instant) -> Result<RunSummary, PipelineError> {
        let config = self.config.clone();
        for dir in [
            config.output_dir.clone(),
            config.photos_dir(),
            config.reports_dir(),
            config.image_cache_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(PipelineError::io(&dir))?;
        }

        let identity = SourceIdentity::of(&config.input_path).map_err(|source| {
            PipelineError::Input(ReaderError::Open {
                path: config.input_path.clone(),
                source,
            })
        })?;

        let mut checkpoints = CheckpointManager::new(&config.output_dir, config.commit_policy());
        let resumed = self.restore(&mut checkpoints, &identity)?;

        let mut format = match config.input_format {
            Some(format) => format,
            None => InputFormat::detect(&config.input_path)?,
        };
        let (accumulator, mut offset, resumed_from) = match resumed {
            Some(state) => {
                if let Some(recorded) = state.input_format {
                    if recorded != format {
                        tracing::warn!(
                            recorded = %recorded,
                            requested = %format,
                            "checkpoint was written for another input format, keeping recorded format"
                        );
                        format = recorded;
                    }
                }
                checkpoints.set_baseline(state.records_processed);
                tracing::info!(
                    offset = state.last_committed_offset,
                    records = state.records_processed,
                    "resuming from checkpoint"
                );
                (
                    AggregateAccumulator::from_snapshot(state.aggregate_stats),
                    state.last_committed_offset,
                    Some(state.last_committed_offset),
                )
            }
            None => (AggregateAccumulator::new(), 0, None),
        };

        let fetcher = self
            .fetcher
            .take()
            .ok_or_else(|| PipelineError::Internal("fetcher already consumed".into()))?;
        let cache = ImageCache::open(fetcher, CacheConfig::from_pipeline(&config))
            .map_err(PipelineError::io(config.image_cache_dir()))?;
        let cache = Arc::new(cache);
        let eviction = self.cancel.child_token();
        let daemon = tokio::spawn(run_eviction_daemon(cache.clone(), eviction.clone()));

        let result = self
            .batch_loop(BatchLoop {
                config: &config,
                identity: &identity,
                format,
                checkpoints,
                accumulator: &accumulator,
                offset: &mut offset,
                cache: &cache,
            })
            .await;

        eviction.cancel();
        if let Err(e) = daemon.await {
            tracing::warn!(error = %e, "eviction daemon did not shut down cleanly");
        }

        let (batches, errors_logged) = result?;
        let stats = accumulator.snapshot();
        let summary = RunSummary {
            state: self.state,
            offset,
            input_format: format,
            batches,
            resumed_from,
            cache: cache.stats(),
            errors_logged,
            elapsed_ms: started.elapsed().as_millis() as u64,
            output_formats: config.output_formats.clone(),
            stats,
        };

        tracing::info!(
            state = ?summary.state,
            records = summary.stats.records_processed,
            succeeded = summary.stats.succeeded,
            failed = summary.stats.failed,
            batches = summary.batches,
            offset = summary.offset,
            elapsed_ms = summary.elapsed_ms,
            "pipeline finished"
        );
        Ok(summary)
    }

    /// Load the checkpoint to resume from, applying the mismatch policy.
    /// A fresh run removes any earlier checkpoint and error log.
    fn restore(
        &self,
        checkpoints: &mut CheckpointManager,
        identity: &SourceIdentity,
    ) -> Result<Option<CheckpointState>, PipelineError> {
        if !self.config.resume {
            checkpoints.clear().map_err(PipelineError::CheckpointWrite)?;
            let log = self.config.error_log_path();
            match fs::remove_file(&log) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(PipelineError::io(&log)(e)),
            }
            return Ok(None);
        }

        match checkpoints.load(identity) {
            Ok(Some(state)) => Ok(Some(state)),
            Ok(None) => {
                tracing::info!("no checkpoint found, starting from the beginning");
                Ok(None)
            }
            Err(mismatch @ CheckpointError::SourceMismatch { .. }) => {
                match self.config.on_source_mismatch {
                    MismatchPolicy::Abort => Err(PipelineError::ResumeMismatch(mismatch)),
                    MismatchPolicy::Restart => {
                        tracing::warn!(
                            error = %mismatch,
                            "checkpoint belongs to a different input, restarting from the beginning"
                        );
                        checkpoints.clear().map_err(PipelineError::CheckpointWrite)?;
                        Ok(None)
                    }
                }
            }
            Err(e) => Err(PipelineError::CheckpointLoad(e)),
        }
    }

    async fn batch_loop(&mut self, ctx: BatchLoop<'_, F>) -> Result<(u64, u64), PipelineError> {
        let BatchLoop {
            config,
            identity,
            format,
            checkpoints,
            accumulator,
            offset,
            cache,
        } = ctx;

        let mut monitor = match self.sampler.take() {
            Some(sampler) if !config.skip_optimization => MemoryMonitor::adaptive(sampler, config),
            _ => MemoryMonitor::from_config(config),
        };
        let mut error_log = if config.error_log {
            let path = config.error_log_path();
            ErrorLog::open(&path).map_err(PipelineError::io(&path))?
        } else {
            ErrorLog::disabled()
        };
        let pool = WorkerPool::new(cache.clone());

        self.transition(PipelineState::Reading);
        let mut reader = Some(RecordReader::open_at(&config.input_path, format, *offset)?);
        let mut checkpoints = Some(checkpoints);
        let mut batches = 0u64;

        tracing::info!(
            input = %config.input_path.display(),
            format = %format,
            offset = *offset,
            adaptive = monitor.is_adaptive(),
            "pipeline started"
        );

        let end_state = loop {
            if self.cancel.is_cancelled() {
                break PipelineState::Paused;
            }

            let processed = accumulator.records_processed();
            let remaining = config
                .record_limit
                .map(|limit| limit.saturating_sub(processed));
            if remaining == Some(0) {
                tracing::info!(records = processed, "record limit reached");
                break PipelineState::Paused;
            }

            monitor.refresh();
            let mut batch_size = monitor.next_batch_size();
            if let Some(remaining) = remaining {
                batch_size = batch_size.min(remaining.try_into().unwrap_or(usize::MAX));
            }

            self.transition(PipelineState::Reading);
            let taken = reader
                .take()
                .ok_or_else(|| PipelineError::Internal("record reader lost".into()))?;
            let (returned, batch) = read_batch(taken, batch_size).await?;
            reader = Some(returned);
            if batch.is_empty() {
                break PipelineState::Completed;
            }

            self.transition(PipelineState::Dispatching);
            let workers = monitor.max_concurrent_workers();
            let records = batch.len();
            let outcome = match pool.process(batch, workers, &self.cancel).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::info!(records, "run cancelled, discarding in-flight batch");
                    break PipelineState::Paused;
                }
            };

            self.transition(PipelineState::Accumulating);
            accumulator.merge(&outcome.partial);
            *offset = outcome.end_offset;
            error_log.append(&outcome.outcomes);
            batches += 1;

            tracing::debug!(
                batch = batches,
                records,
                workers,
                offset = *offset,
                total = accumulator.records_processed(),
                "batch merged"
            );

            let due = checkpoints
                .as_ref()
                .is_some_and(|c| c.is_due(accumulator.records_processed()));
            if due {
                self.transition(PipelineState::Checkpointing);
                let state =
                    checkpoint_state(identity, format, *offset, accumulator, &monitor, false);
                commit(&mut checkpoints, state).await?;
                tracing::info!(
                    offset = *offset,
                    records = accumulator.records_processed(),
                    "checkpoint committed"
                );
            }
        };

        self.transition(PipelineState::Checkpointing);
        let state = checkpoint_state(
            identity,
            format,
            *offset,
            accumulator,
            &monitor,
            end_state == PipelineState::Completed,
        );
        commit(&mut checkpoints, state).await?;
        self.transition(end_state);

        Ok((batches, error_log.written()))
    }
}

struct BatchLoop<'a, F> {
    config: &'a PipelineConfig,
    identity: &'a SourceIdentity,
    format: InputFormat,
    checkpoints: CheckpointManager,
    accumulator: &'a AggregateAccumulator,
    offset: &'a mut u64,
    cache: &'a Arc<ImageCache<F>>,
}

fn checkpoint_state(
    identity: &SourceIdentity,
    format: InputFormat,
    offset: u64,
    accumulator: &AggregateAccumulator,
    monitor: &MemoryMonitor,
    completed: bool,
) -> CheckpointState {
    let state = CheckpointState::new(identity.clone(), offset, accumulator.snapshot())
        .with_format(format)
        .with_batch_size(monitor.next_batch_size());
    if completed {
        state.mark_completed()
    } else {
        state
    }
}

/// Write `state` on the blocking pool, handing the manager back to `slot`.
async fn commit(
    slot: &mut Option<CheckpointManager>,
    state: CheckpointState,
) -> Result<(), PipelineError> {
    let mut manager = slot
        .take()
        .ok_or_else(|| PipelineError::Internal("checkpoint manager lost".into()))?;
    let (manager, result) = tokio::task::spawn_blocking(move || {
        let result = manager.commit(&state);
        (manager, result)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("checkpoint task failed: {e}")))?;
    *slot = Some(manager);
    result.map_err(PipelineError::CheckpointWrite)
}

/// Pull up to `limit` entries on the blocking pool, handing the reader back.
async fn read_batch(
    mut reader: RecordReader,
    limit: usize,
) -> Result<(RecordReader, BatchTask), PipelineError> {
    tokio::task::spawn_blocking(move || -> Result<_, PipelineError> {
        let start_offset = reader.offset();
        let mut entries = Vec::with_capacity(limit.min(4_096));
        while entries.len() < limit {
            match reader.advance()? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        let end_offset = reader.offset();
        Ok((
            reader,
            BatchTask {
                entries,
                start_offset,
                end_offset,
            },
        ))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("reader task failed: {e}")))?
}
