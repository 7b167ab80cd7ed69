//! Background image cache eviction.
//!
//! The daemon sleeps until a store pushes the cache past its cap, then trims
//! it to 90% of the cap. Fetches never wait for it.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::cache::{EvictionResult, ImageCache};
use crate::fetch::ImageFetcher;

/// Run until `cancellation` fires.
pub async fn run_eviction_daemon<F: ImageFetcher>(
    cache: Arc<ImageCache<F>>,
    cancellation: CancellationToken,
) {
    tracing::debug!(
        cache_dir = %cache.config().cache_dir.display(),
        max_cache_bytes = cache.config().max_cache_bytes,
        "starting image cache eviction daemon"
    );

    loop {
        if cache.is_over_limit() {
            let start = Instant::now();
            let result = cache.evict_to_target().await;
            log_eviction_result(&result, start);
        }

        tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::debug!("image cache eviction daemon shutting down");
                break;
            }
            _ = cache.over_limit_notified() => {}
        }
    }
}

fn log_eviction_result(result: &EvictionResult, start: Instant) {
    if result.files_deleted == 0 {
        return;
    }
    tracing::info!(
        files_deleted = result.files_deleted,
        bytes_freed = result.bytes_freed,
        size_before = result.size_before,
        size_after = result.size_after,
        duration_ms = start.elapsed().as_millis() as u64,
        "image cache eviction complete"
    );
}
