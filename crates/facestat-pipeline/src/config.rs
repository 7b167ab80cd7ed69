use std::path::PathBuf;
use std::time::Duration;

use facestat_io::{CommitPolicy, InputFormat};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::fetch::RetryPolicy;

/// What to do when a checkpoint exists for a different input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Stop with [`PipelineError::ResumeMismatch`].
    #[default]
    Abort,
    /// Discard the stale checkpoint and start from the beginning.
    Restart,
}

/// Bounded retry schedule for image fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 300,
            max_delay_ms: 5_000,
        }
    }
}

/// Bounds and tuning for adaptive batch sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub initial_batch: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Headroom above which batch size and workers grow.
    pub high_water: f64,
    /// Headroom below which batch size and workers shrink.
    pub low_water: f64,
    pub grow_factor: f64,
    pub shrink_factor: f64,
    /// Minimum time between memory samples.
    pub sample_interval_ms: u64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            initial_batch: 1_000,
            min_batch: 100,
            max_batch: 50_000,
            initial_workers: 15,
            min_workers: 1,
            max_workers: 50,
            high_water: 0.5,
            low_water: 0.2,
            grow_factor: 1.5,
            shrink_factor: 0.5,
            sample_interval_ms: 1_000,
        }
    }
}

/// The single configuration value handed to the pipeline.
///
/// The pipeline never reads the environment; the caller builds this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_path: PathBuf,
    /// Input layout; detected from the file when unset.
    pub input_format: Option<InputFormat>,
    pub output_dir: PathBuf,
    /// Report formats requested by the caller, passed through untouched.
    pub output_formats: Vec<String>,
    pub resume: bool,
    pub on_source_mismatch: MismatchPolicy,
    /// Initial batch size, or the fixed size with `skip_optimization`.
    pub batch_size: Option<usize>,
    /// Upper bound on workers, or the fixed count with `skip_optimization`.
    pub max_workers: Option<usize>,
    /// Memory limit as a percentage of total system memory.
    pub memory_limit_percent: f64,
    /// Disable memory sampling and use fixed batch/worker values.
    pub skip_optimization: bool,
    pub request_timeout_secs: u64,
    pub retry: RetryConfig,
    pub checkpoint_every_records: u64,
    pub checkpoint_every_secs: u64,
    pub max_image_bytes: u64,
    pub max_cache_bytes: u64,
    pub sizing: SizingConfig,
    /// Append per-record failures to `errors.jsonl`.
    pub error_log: bool,
    /// Stop (paused) after this many records in total.
    pub record_limit: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::new(),
            input_format: None,
            output_dir: PathBuf::from("."),
            output_formats: Vec::new(),
            resume: false,
            on_source_mismatch: MismatchPolicy::default(),
            batch_size: None,
            max_workers: None,
            memory_limit_percent: 85.0,
            skip_optimization: false,
            request_timeout_secs: 30,
            retry: RetryConfig::default(),
            checkpoint_every_records: 10_000,
            checkpoint_every_secs: 60,
            max_image_bytes: 10 * 1024 * 1024,
            max_cache_bytes: 800 * 1024 * 1024,
            sizing: SizingConfig::default(),
            error_log: true,
            record_limit: None,
        }
    }
}

impl PipelineConfig {
    pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Reject values that cannot produce a working pipeline.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let s = &self.sizing;
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if self.input_path.as_os_str().is_empty() {
            return fail("input path is empty".into());
        }
        if s.min_batch == 0 || s.min_batch > s.max_batch {
            return fail(format!(
                "batch bounds [{}, {}] are invalid",
                s.min_batch, s.max_batch
            ));
        }
        if s.min_workers == 0 || s.min_workers > s.max_workers {
            return fail(format!(
                "worker bounds [{}, {}] are invalid",
                s.min_workers, s.max_workers
            ));
        }
        if !(0.0..=1.0).contains(&s.low_water)
            || !(0.0..=1.0).contains(&s.high_water)
            || s.low_water >= s.high_water
        {
            return fail(format!(
                "water marks low={} high={} must satisfy 0 <= low < high <= 1",
                s.low_water, s.high_water
            ));
        }
        if s.grow_factor < 1.0 || !(0.0..1.0).contains(&s.shrink_factor) || s.shrink_factor == 0.0 {
            return fail("grow factor must be >= 1 and shrink factor in (0, 1)".into());
        }
        if !(self.memory_limit_percent > 0.0 && self.memory_limit_percent <= 100.0) {
            return fail(format!(
                "memory limit {}% must be in (0, 100]",
                self.memory_limit_percent
            ));
        }
        if self.batch_size == Some(0) || self.max_workers == Some(0) {
            return fail("batch size and worker overrides must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if self.request_timeout_secs == 0 {
            return fail("request timeout must be positive".into());
        }
        if self.max_image_bytes == 0 {
            return fail("max image size must be positive".into());
        }
        if self.record_limit == Some(0) {
            return fail("record limit must be positive".into());
        }
        Ok(())
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.output_dir.join("photos")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output_dir.join("reports")
    }

    pub fn image_cache_dir(&self) -> PathBuf {
        self.output_dir.join("image_cache")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.output_dir.join("errors.jsonl")
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            every_records: self.checkpoint_every_records,
            every: Duration::from_secs(self.checkpoint_every_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Initial batch size with any override applied, clamped to the bounds.
    pub fn initial_batch_size(&self) -> usize {
        self.batch_size
            .unwrap_or(self.sizing.initial_batch)
            .clamp(self.sizing.min_batch, self.sizing.max_batch)
    }

    /// Worker ceiling with any override applied.
    pub fn worker_ceiling(&self) -> usize {
        self.max_workers
            .unwrap_or(self.sizing.max_workers)
            .max(self.sizing.min_workers)
    }

    pub fn initial_workers(&self) -> usize {
        self.sizing
            .initial_workers
            .clamp(self.sizing.min_workers, self.worker_ceiling())
    }
}
