//! Content-addressed on-disk image cache.
//!
//! Keys are SHA-256 digests of the normalized URL. Each key owns one slot
//! whose value is initialized once: the first caller fetches, concurrent
//! callers wait on the same initialization and share its result. Stored
//! images stay mapped until evicted; failed keys are unmapped once their
//! waiters have the result, so the map holds only stored and in-flight keys.
//! Size is bounded by `max_cache_bytes`; eviction runs out of band (see
//! [`crate::eviction`]) and removes least-recently-accessed entries.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use facestat_core::ImageRef;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, OnceCell};

use crate::config::PipelineConfig;
use crate::fetch::{FetchError, ImageFetcher, RetryPolicy};

/// Smallest payload accepted as an image.
const MIN_IMAGE_BYTES: usize = 100;
/// Fraction of the cap the cache is trimmed to once it overflows.
const EVICTION_TARGET_FRACTION: f64 = 0.9;
const PARTIAL_SUFFIX: &str = "part";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub photos_dir: PathBuf,
    pub max_image_bytes: u64,
    pub max_cache_bytes: u64,
    pub retry: RetryPolicy,
}

impl CacheConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            cache_dir: config.image_cache_dir(),
            photos_dir: config.photos_dir(),
            max_image_bytes: config.max_image_bytes,
            max_cache_bytes: config.max_cache_bytes,
            retry: config.retry_policy(),
        }
    }
}

/// Terminal failure for one image, shared by every caller of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub error: FetchError,
    pub attempts: u32,
}

/// Counters exposed for logging. Not part of the aggregate statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub fetches: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub evictions: u64,
    pub indexed: u64,
    /// Keys currently tracked in memory.
    pub entries: u64,
    pub bytes_on_disk: u64,
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub size_before: u64,
    pub size_after: u64,
}

/// An entry chosen for eviction. Its slot stays mapped until the file is gone.
struct Victim {
    key: String,
    slot: Arc<Slot>,
    bytes: u64,
    path: PathBuf,
}

#[derive(Debug, Clone)]
struct Stored {
    image: ImageRef,
    cache_path: PathBuf,
}

type SlotValue = Result<Stored, FetchFailure>;

struct Slot {
    value: OnceCell<SlotValue>,
    last_access: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            value: OnceCell::new(),
            last_access: AtomicU64::new(0),
        }
    }

    fn ready(stored: Stored) -> Self {
        Self {
            value: OnceCell::new_with(Some(Ok(stored))),
            last_access: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    indexed: AtomicU64,
}

pub struct ImageCache<F> {
    fetcher: F,
    config: CacheConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    /// Logical clock for access ordering.
    clock: AtomicU64,
    total_bytes: AtomicU64,
    over_limit: Notify,
    counters: Counters,
}

impl<F: ImageFetcher> ImageCache<F> {
    /// Open the cache, indexing files left by earlier runs and removing
    /// partial downloads.
    pub fn open(fetcher: F, config: CacheConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;
        fs::create_dir_all(&config.photos_dir)?;

        let mut slots = HashMap::new();
        let mut total = 0u64;
        let mut removed_partials = 0usize;

        for entry in fs::read_dir(&config.cache_dir)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            if path.extension().is_some_and(|ext| ext == PARTIAL_SUFFIX) {
                if fs::remove_file(&path).is_ok() {
                    removed_partials += 1;
                }
                continue;
            }
            let Some((key, _ext)) = name.split_once('.') else {
                continue;
            };
            if !is_cache_key(key) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }

            let photo_path = config.photos_dir.join(&name);
            if !photo_path.exists() {
                if let Err(e) = link_or_copy(&path, &photo_path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to restore photo");
                    continue;
                }
            }

            total += meta.len();
            slots.insert(
                key.to_string(),
                Arc::new(Slot::ready(Stored {
                    image: ImageRef {
                        key: key.to_string(),
                        path: photo_path,
                        bytes: meta.len(),
                    },
                    cache_path: path,
                })),
            );
        }

        tracing::info!(
            cache_dir = %config.cache_dir.display(),
            entries = slots.len(),
            bytes = total,
            removed_partials,
            "image cache opened"
        );

        let counters = Counters::default();
        counters.indexed.store(slots.len() as u64, Ordering::Relaxed);

        let cache = Self {
            fetcher,
            config,
            slots: Mutex::new(slots),
            clock: AtomicU64::new(1),
            total_bytes: AtomicU64::new(total),
            over_limit: Notify::new(),
            counters,
        };
        if cache.is_over_limit() {
            cache.over_limit.notify_one();
        }
        Ok(cache)
    }

    /// Resolve `url` to a local image, fetching it at most once per run.
    pub async fn get_or_fetch(&self, url: &str) -> Result<ImageRef, FetchFailure> {
        let key = cache_key(url);
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::empty()))
                .clone()
        };
        slot.last_access
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

        if slot.value.initialized() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        }

        let value = slot
            .value
            .get_or_init(|| self.fetch_and_store(&key, url))
            .await;
        match value {
            Ok(stored) => Ok(stored.image.clone()),
            Err(failure) => {
                // Waiters already hold the slot; later requests fetch afresh.
                self.forget(&key, &slot);
                Err(failure.clone())
            }
        }
    }

    /// Drop `key` from the map if it still points at `slot`.
    fn forget(&self, key: &str, slot: &Arc<Slot>) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(key) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn fetch_and_store(&self, key: &str, url: &str) -> SlotValue {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);

        let fetcher = &self.fetcher;
        let max_bytes = self.config.max_image_bytes;
        let (result, attempts) = self
            .config
            .retry
            .run(|| async move {
                let bytes = fetcher.fetch(url, max_bytes).await?;
                let ext = validate_image(&bytes)?;
                Ok::<_, FetchError>((bytes, ext))
            })
            .await;

        let stored = match result {
            Ok((bytes, ext)) => self.store(key, ext, &bytes).await,
            Err(error) => Err(error),
        };

        stored.map_err(|error| {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(url, attempts, error = %error, "image unavailable");
            FetchFailure { error, attempts }
        })
    }

    async fn store(&self, key: &str, ext: &str, bytes: &[u8]) -> Result<Stored, FetchError> {
        let storage = |e: io::Error| FetchError::Storage(e.to_string());

        let file_name = format!("{key}.{ext}");
        let cache_path = self.config.cache_dir.join(&file_name);
        let partial = self
            .config
            .cache_dir
            .join(format!("{file_name}.{PARTIAL_SUFFIX}"));
        tokio::fs::write(&partial, bytes).await.map_err(storage)?;
        tokio::fs::rename(&partial, &cache_path)
            .await
            .map_err(storage)?;

        let photo_path = self.config.photos_dir.join(&file_name);
        let (src, dst) = (cache_path.clone(), photo_path.clone());
        tokio::task::spawn_blocking(move || link_or_copy(&src, &dst))
            .await
            .map_err(|e| FetchError::Storage(e.to_string()))?
            .map_err(storage)?;

        let len = bytes.len() as u64;
        let total = self.total_bytes.fetch_add(len, Ordering::Relaxed) + len;
        if total > self.config.max_cache_bytes {
            self.over_limit.notify_one();
        }

        Ok(Stored {
            image: ImageRef {
                key: key.to_string(),
                path: photo_path,
                bytes: len,
            },
            cache_path,
        })
    }

    pub fn is_over_limit(&self) -> bool {
        self.total_bytes.load(Ordering::Relaxed) > self.config.max_cache_bytes
    }

    /// Resolves once a store has pushed the cache past its cap.
    pub async fn over_limit_notified(&self) {
        self.over_limit.notified().await
    }

    /// Evict least-recently-accessed entries until the cache is at 90% of
    /// its cap. Evicted keys are fetched again on their next request;
    /// materialized photos are left in place.
    pub async fn evict_to_target(&self) -> EvictionResult {
        let size_before = self.total_bytes.load(Ordering::Relaxed);
        if size_before <= self.config.max_cache_bytes {
            return EvictionResult {
                size_before,
                size_after: size_before,
                ..Default::default()
            };
        }
        let target = (self.config.max_cache_bytes as f64 * EVICTION_TARGET_FRACTION) as u64;

        let victims = self.select_victims(size_before, target);
        let (files_deleted, bytes_freed) = self.retire(victims).await;

        EvictionResult {
            files_deleted,
            bytes_freed,
            size_before,
            size_after: self.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Least-recently-accessed stored entries whose removal brings the cache
    /// from `size` down to `target`. The map is left unchanged.
    fn select_victims(&self, size: u64, target: u64) -> Vec<Victim> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<(u64, Victim)> = slots
            .iter()
            .filter_map(|(key, slot)| match slot.value.get() {
                Some(Ok(stored)) => Some((
                    slot.last_access.load(Ordering::Relaxed),
                    Victim {
                        key: key.clone(),
                        slot: slot.clone(),
                        bytes: stored.image.bytes,
                        path: stored.cache_path.clone(),
                    },
                )),
                _ => None,
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key)));

        let mut remaining = size;
        let mut victims = Vec::new();
        for (_, victim) in candidates {
            if remaining <= target {
                break;
            }
            remaining = remaining.saturating_sub(victim.bytes);
            victims.push(victim);
        }
        victims
    }

    /// Delete the victims' files, then unmap them.
    ///
    /// While a file is being deleted its key still resolves to the stored
    /// entry, so no new fetch can write the same path underneath the removal.
    /// Returns the number of entries removed and the bytes they held.
    async fn retire(&self, victims: Vec<Victim>) -> (usize, u64) {
        if victims.is_empty() {
            return (0, 0);
        }
        let paths: Vec<PathBuf> = victims.iter().map(|v| v.path.clone()).collect();
        let removal = tokio::task::spawn_blocking(move || {
            for path in paths {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::debug!(path = %path.display(), error = %e, "failed to evict cache file");
                    }
                }
            }
        })
        .await;
        if let Err(e) = removal {
            tracing::warn!(error = %e, "eviction task failed");
        }

        let mut files_deleted = 0usize;
        let mut bytes_freed = 0u64;
        for victim in &victims {
            if self.forget(&victim.key, &victim.slot) {
                files_deleted += 1;
                bytes_freed += victim.bytes;
            }
        }
        self.total_bytes.fetch_sub(bytes_freed, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(files_deleted as u64, Ordering::Relaxed);
        (files_deleted, bytes_freed)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let requests = c.requests.load(Ordering::Relaxed);
        let hits = c.hits.load(Ordering::Relaxed);
        let fetches = c.fetches.load(Ordering::Relaxed);
        CacheStats {
            requests,
            hits,
            fetches,
            coalesced: requests.saturating_sub(hits + fetches),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            indexed: c.indexed.load(Ordering::Relaxed),
            entries: self.slots.lock().unwrap_or_else(|e| e.into_inner()).len() as u64,
            bytes_on_disk: self.total_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

/// Cache key for an image URL: hex SHA-256 of the normalized URL.
pub fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(normalize_url(url).as_bytes());
    format!("{digest:x}")
}

/// Trim, lowercase scheme and host, and drop any fragment.
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split_once('#').map_or(url, |(head, _)| head);
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let host_end = rest.find(['/', '?']).unwrap_or(rest.len());
            let (host, tail) = rest.split_at(host_end);
            format!(
                "{}://{}{}",
                scheme.to_ascii_lowercase(),
                host.to_ascii_lowercase(),
                tail
            )
        }
        None => url.to_string(),
    }
}

fn is_cache_key(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Check the payload is a supported image and return its file extension.
pub fn validate_image(bytes: &[u8]) -> Result<&'static str, FetchError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(FetchError::InvalidImage);
    }
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => Ok("jpg"),
        Ok(image::ImageFormat::Png) => Ok("png"),
        Ok(image::ImageFormat::Gif) => Ok("gif"),
        Ok(image::ImageFormat::Bmp) => Ok("bmp"),
        Ok(image::ImageFormat::WebP) => Ok("webp"),
        _ => Err(FetchError::InvalidImage),
    }
}

/// Hard-link `src` to `dst`, copying when linking is not possible.
fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(_) => fs::copy(src, dst).map(|_| ()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// A valid-looking PNG of `len` bytes.
    pub(crate) fn png(len: usize) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.resize(len.max(8), 0);
        bytes
    }

    /// Fetcher that replays scripted responses per URL and counts calls.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        pub responses: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, FetchError>>>>,
        pub calls: AtomicU32,
        pub delay: Duration,
    }

    impl ScriptedFetcher {
        pub(crate) fn respond(&self, url: &str, response: Result<Vec<u8>, FetchError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(response);
        }
    }

    impl ImageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self
                .responses
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|q| q.pop_front());
            let bytes = next.unwrap_or(Err(FetchError::Http { status: 404 }))?;
            if bytes.len() as u64 > max_bytes {
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
            Ok(bytes)
        }
    }

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.join("image_cache"),
            photos_dir: dir.join("photos"),
            max_image_bytes: 10_000,
            max_cache_bytes: 1_000_000,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[test]
    fn test_cache_key_normalization() {
        let a = cache_key("https://CDN.Example.com/faces/1.jpg#frag");
        let b = cache_key("  https://cdn.example.com/faces/1.jpg ");
        let c = cache_key("https://cdn.example.com/faces/1.JPG");
        assert_eq!(a, b);
        assert_ne!(a, c, "path case is significant");
        assert!(is_cache_key(&a));
    }

    #[test]
    fn test_validate_image() {
        assert_eq!(validate_image(&png(200)), Ok("png"));
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
        jpeg.resize(150, 0);
        assert_eq!(validate_image(&jpeg), Ok("jpg"));
        assert_eq!(validate_image(&png(50)), Err(FetchError::InvalidImage));
        assert_eq!(
            validate_image(b"<html>not an image</html>".repeat(10).as_slice()),
            Err(FetchError::InvalidImage)
        );
    }

    #[tokio::test]
    async fn test_fetch_stores_and_materializes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::default();
        let url = "https://cdn.example.com/a.png";
        fetcher.respond(url, Ok(png(500)));
        let cache = ImageCache::open(fetcher, config(dir.path())).unwrap();

        let image = cache.get_or_fetch(url).await.unwrap();
        assert_eq!(image.bytes, 500);
        assert_eq!(image.path, dir.path().join("photos").join(format!("{}.png", image.key)));
        assert!(image.path.exists());
        assert!(dir
            .path()
            .join("image_cache")
            .join(format!("{}.png", image.key))
            .exists());

        // Second request is a hit and does not touch the network.
        let again = cache.get_or_fetch(url).await.unwrap();
        assert_eq!(again, image);
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.fetches, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let url = "https://cdn.example.com/shared.png";
        fetcher.respond(url, Ok(png(300)));
        let cache = Arc::new(ImageCache::open(fetcher, config(dir.path())).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_fetch(url).await })
            })
            .collect();
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_size_limit_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::default();
        let url = "https://cdn.example.com/huge.png";
        fetcher.respond(url, Ok(png(20_000)));
        let cache = ImageCache::open(fetcher, config(dir.path())).unwrap();

        let failure = cache.get_or_fetch(url).await.unwrap_err();
        assert_eq!(failure.error, FetchError::TooLarge { limit: 10_000 });
        assert_eq!(failure.attempts, 1);
        assert_eq!(fs::read_dir(dir.path().join("photos")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("image_cache")).unwrap().count(), 0);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::default();
        let url = "https://cdn.example.com/page.png";
        fetcher.respond(url, Ok(vec![b'x'; 500]));
        let cache = ImageCache::open(fetcher, config(dir.path())).unwrap();

        let failure = cache.get_or_fetch(url).await.unwrap_err();
        assert_eq!(failure.error, FetchError::InvalidImage);
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reopen_indexes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://cdn.example.com/keep.png";
        {
            let fetcher = ScriptedFetcher::default();
            fetcher.respond(url, Ok(png(400)));
            let cache = ImageCache::open(fetcher, config(dir.path())).unwrap();
            cache.get_or_fetch(url).await.unwrap();
        }
        let stray = dir.path().join("image_cache").join("abc.png.part");
        fs::write(&stray, b"partial").unwrap();

        let cache = ImageCache::open(ScriptedFetcher::default(), config(dir.path())).unwrap();
        assert!(!stray.exists());
        assert_eq!(cache.stats().indexed, 1);
        assert_eq!(cache.stats().bytes_on_disk, 400);

        let image = cache.get_or_fetch(url).await.unwrap();
        assert_eq!(image.bytes, 400);
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_eviction_removes_least_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_cache_bytes = 1_000;
        let fetcher = ScriptedFetcher::default();
        let urls: Vec<String> = (0..4).map(|i| format!("https://cdn.example.com/{i}.png")).collect();
        for url in &urls {
            fetcher.respond(url, Ok(png(300)));
        }
        let cache = ImageCache::open(fetcher, cfg).unwrap();

        for url in &urls[..3] {
            cache.get_or_fetch(url).await.unwrap();
        }
        // Touch the oldest so the second becomes least recent.
        cache.get_or_fetch(&urls[0]).await.unwrap();
        let evicted_key = cache_key(&urls[1]);
        cache.get_or_fetch(&urls[3]).await.unwrap();
        assert!(cache.is_over_limit());

        let result = cache.evict_to_target().await;
        assert_eq!(result.size_before, 1_200);
        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.size_after, 900);
        assert!(!cache.is_over_limit());
        assert!(!dir
            .path()
            .join("image_cache")
            .join(format!("{evicted_key}.png"))
            .exists());
        // Materialized photo survives eviction.
        assert!(dir.path().join("photos").join(format!("{evicted_key}.png")).exists());
        assert_eq!(cache.stats().evictions, 1);

        // The evicted key is fetched again on its next request.
        cache.fetcher.respond(&urls[1], Ok(png(300)));
        cache.get_or_fetch(&urls[1]).await.unwrap();
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failed_keys_are_not_retained() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(ScriptedFetcher::default(), config(dir.path())).unwrap();

        for i in 0..200 {
            let url = format!("https://cdn.example.com/gone/{i}.png");
            assert!(cache.get_or_fetch(&url).await.is_err());
        }
        let stats = cache.stats();
        assert_eq!(stats.failures, 200);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_failure_is_shared_then_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let url = "https://cdn.example.com/denied.png";
        fetcher.respond(url, Err(FetchError::Http { status: 403 }));
        let cache = Arc::new(ImageCache::open(fetcher, config(dir.path())).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_fetch(url).await })
            })
            .collect();
        for h in handles {
            let failure = h.await.unwrap().unwrap_err();
            assert_eq!(failure.error, FetchError::Http { status: 403 });
        }
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 0);

        // A later request is a fresh fetch.
        cache.fetcher.respond(url, Ok(png(300)));
        cache.get_or_fetch(url).await.unwrap();
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_request_during_eviction_keeps_disk_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_cache_bytes = 1_000;
        let fetcher = ScriptedFetcher::default();
        let urls: Vec<String> = (0..4).map(|i| format!("https://cdn.example.com/r{i}.png")).collect();
        for url in &urls {
            fetcher.respond(url, Ok(png(300)));
        }
        let cache = ImageCache::open(fetcher, cfg).unwrap();
        for url in &urls {
            cache.get_or_fetch(url).await.unwrap();
        }

        let victims = cache.select_victims(1_200, 900);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, cache_key(&urls[0]));
        // Still mapped while its file is being removed: a hit, not a new fetch.
        cache.get_or_fetch(&urls[0]).await.unwrap();
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 4);

        assert_eq!(cache.retire(victims).await, (1, 300));
        assert_eq!(cache.stats().entries, 3);
        assert_eq!(cache.stats().bytes_on_disk, 900);

        cache.fetcher.respond(&urls[0], Ok(png(300)));
        let image = cache.get_or_fetch(&urls[0]).await.unwrap();
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 5);
        assert!(dir
            .path()
            .join("image_cache")
            .join(format!("{}.png", image.key))
            .exists());

        let on_disk: u64 = fs::read_dir(dir.path().join("image_cache"))
            .unwrap()
            .map(|e| e.unwrap().metadata().unwrap().len())
            .sum();
        assert_eq!(on_disk, 1_200);
        assert_eq!(cache.stats().bytes_on_disk, on_disk);
    }
}
