//! facestat-pipeline — Resumable, memory-adaptive processing of recognition events.
//!
//! The [`Orchestrator`] drives read → size batch → dispatch → accumulate →
//! checkpoint until the input is exhausted, the run is cancelled, or a fatal
//! error occurs. Images are resolved through a shared [`ImageCache`] that
//! coalesces concurrent fetches of the same URL.

pub mod cache;
pub mod config;
pub mod error;
pub mod error_log;
pub mod eviction;
pub mod fetch;
pub mod memory;
pub mod orchestrator;
pub mod worker;

pub use cache::{cache_key, CacheConfig, CacheStats, FetchFailure, ImageCache};
pub use config::{MismatchPolicy, PipelineConfig, RetryConfig, SizingConfig};
pub use error::PipelineError;
pub use fetch::{FetchError, HttpFetcher, ImageFetcher, RetryPolicy};
pub use memory::{MemoryMonitor, MemorySample, MemorySampler, SysinfoSampler};
pub use orchestrator::{Orchestrator, PipelineState, RunSummary};
pub use worker::{BatchOutcome, BatchTask, Cancelled, WorkerPool};
