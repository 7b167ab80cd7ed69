//! Memory-driven sizing of batches and worker concurrency.
//!
//! Headroom is `(limit - resident) / limit`, where the limit is a percentage
//! of total system memory. Above the high-water mark batch size and workers
//! grow multiplicatively, below the low-water mark they shrink, and in
//! between they hold. Every proposal is clamped to its configured bounds.

use std::time::{Duration, Instant};

use sysinfo::{Pid, System};

use crate::config::{PipelineConfig, SizingConfig};

/// One memory reading, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub process_resident: u64,
    pub system_total: u64,
}

/// Source of memory readings.
pub trait MemorySampler: Send {
    /// Take a reading, or `None` when the platform cannot provide one.
    fn sample(&mut self) -> Option<MemorySample>;
}

/// Reads process RSS and total memory through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("cannot determine current pid, memory sampling disabled");
        }
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self) -> Option<MemorySample> {
        let pid = self.pid?;
        self.system.refresh_memory();
        self.system.refresh_process(pid);
        let resident = self.system.process(pid)?.memory();
        Some(MemorySample {
            process_resident: resident,
            system_total: self.system.total_memory(),
        })
    }
}

/// Sizing decision taken for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Grow,
    Hold,
    Shrink,
}

pub struct MemoryMonitor {
    sampler: Option<Box<dyn MemorySampler>>,
    sizing: SizingConfig,
    limit_fraction: f64,
    worker_ceiling: usize,
    batch_size: usize,
    workers: usize,
    headroom: Option<f64>,
    sample_interval: Duration,
    last_sample: Option<Instant>,
}

impl MemoryMonitor {
    /// Build the monitor the configuration asks for: fixed when
    /// `skip_optimization` is set, sampling through `sysinfo` otherwise.
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.skip_optimization {
            Self::fixed(config)
        } else {
            Self::adaptive(Box::new(SysinfoSampler::new()), config)
        }
    }

    pub fn adaptive(sampler: Box<dyn MemorySampler>, config: &PipelineConfig) -> Self {
        Self {
            sampler: Some(sampler),
            sizing: config.sizing.clone(),
            limit_fraction: config.memory_limit_percent / 100.0,
            worker_ceiling: config.worker_ceiling(),
            batch_size: config.initial_batch_size(),
            workers: config.initial_workers(),
            headroom: None,
            sample_interval: Duration::from_millis(config.sizing.sample_interval_ms),
            last_sample: None,
        }
    }

    /// Fixed batch size and workers; sampling disabled.
    pub fn fixed(config: &PipelineConfig) -> Self {
        let workers = config
            .max_workers
            .unwrap_or(config.sizing.initial_workers)
            .max(1);
        let batch_size = config.batch_size.unwrap_or(config.sizing.initial_batch).max(1);
        Self {
            sampler: None,
            sizing: config.sizing.clone(),
            limit_fraction: config.memory_limit_percent / 100.0,
            worker_ceiling: workers,
            batch_size,
            workers,
            headroom: None,
            sample_interval: Duration::ZERO,
            last_sample: None,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        self.sampler.is_some()
    }

    /// Sample memory if the sample interval has elapsed and adjust sizing.
    pub fn refresh(&mut self) -> Option<Pressure> {
        if let Some(last) = self.last_sample {
            if last.elapsed() < self.sample_interval {
                return None;
            }
        }
        let sample = self.sampler.as_mut()?.sample()?;
        self.last_sample = Some(Instant::now());
        Some(self.observe(sample))
    }

    /// Apply one reading to the sizing state.
    pub fn observe(&mut self, sample: MemorySample) -> Pressure {
        let limit = sample.system_total as f64 * self.limit_fraction;
        if limit <= 0.0 {
            return Pressure::Hold;
        }
        let headroom = ((limit - sample.process_resident as f64) / limit).min(1.0);
        self.headroom = Some(headroom);

        let pressure = if headroom > self.sizing.high_water {
            Pressure::Grow
        } else if headroom < self.sizing.low_water {
            Pressure::Shrink
        } else {
            Pressure::Hold
        };

        let (batch, workers) = (self.batch_size, self.workers);
        match pressure {
            Pressure::Grow => {
                self.batch_size = scale_up(batch, self.sizing.grow_factor)
                    .clamp(self.sizing.min_batch, self.sizing.max_batch);
                self.workers = scale_up(workers, self.sizing.grow_factor)
                    .clamp(self.sizing.min_workers, self.worker_ceiling);
            }
            Pressure::Shrink => {
                self.batch_size = scale_down(batch, self.sizing.shrink_factor)
                    .clamp(self.sizing.min_batch, self.sizing.max_batch);
                self.workers = scale_down(workers, self.sizing.shrink_factor)
                    .clamp(self.sizing.min_workers, self.worker_ceiling);
            }
            Pressure::Hold => {}
        }

        if (batch, workers) != (self.batch_size, self.workers) {
            tracing::debug!(
                headroom,
                batch_size = self.batch_size,
                workers = self.workers,
                "sizing changed"
            );
        }
        pressure
    }

    pub fn next_batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_concurrent_workers(&self) -> usize {
        self.workers
    }

    /// Headroom from the latest sample, if any.
    pub fn headroom(&self) -> Option<f64> {
        self.headroom
    }
}

fn scale_up(value: usize, factor: f64) -> usize {
    ((value as f64) * factor).ceil() as usize
}

fn scale_down(value: usize, factor: f64) -> usize {
    ((value as f64) * factor).floor() as usize
}
