//! Builds the [`PipelineConfig`] handed to the pipeline.
//!
//! Layers, lowest precedence first: built-in defaults, `FACESTAT_*`
//! environment variables, the optional `--config` TOML file, then explicit
//! command-line flags.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use facestat_io::InputFormat;
use facestat_pipeline::{MismatchPolicy, PipelineConfig};

/// Overrides taken from `facestat run` flags. `None` leaves the lower layers alone.
#[derive(Debug, Default)]
pub struct FlagOverrides {
    pub input: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub input_format: Option<InputFormat>,
    pub formats: Vec<String>,
    pub resume: bool,
    pub restart_on_mismatch: bool,
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub memory_limit: Option<f64>,
    pub skip_optimization: bool,
    pub timeout_secs: Option<u64>,
    pub checkpoint_records: Option<u64>,
    pub checkpoint_secs: Option<u64>,
    pub max_image_bytes: Option<u64>,
    pub max_cache_bytes: Option<u64>,
    pub limit: Option<u64>,
    pub no_error_log: bool,
}

/// Resolve the full configuration from the process environment.
pub fn load(flags: FlagOverrides, file: Option<&Path>) -> Result<PipelineConfig> {
    build(flags, file, |key| std::env::var(key).ok())
}

fn build(
    flags: FlagOverrides,
    file: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PipelineConfig> {
    let mut config = from_env(&env);
    if let Some(path) = file {
        config = overlay_file(config, path)?;
    }
    apply_flags(&mut config, flags);
    Ok(config)
}

/// Defaults overridden by `FACESTAT_*` variables. Unparseable values are ignored.
fn from_env(env: &impl Fn(&str) -> Option<String>) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    let defaults = PipelineConfig::default();

    if let Some(dir) = env("FACESTAT_OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(formats) = env("FACESTAT_FORMATS") {
        config.output_formats = split_formats(&formats);
    }
    config.input_format = env_parse(env, "FACESTAT_INPUT_FORMAT");
    config.resume = env_bool(env, "FACESTAT_RESUME", defaults.resume);
    config.batch_size = env_parse(env, "FACESTAT_BATCH_SIZE");
    config.max_workers = env_parse(env, "FACESTAT_MAX_WORKERS");
    config.memory_limit_percent =
        env_f64(env, "FACESTAT_MEMORY_LIMIT", defaults.memory_limit_percent);
    config.skip_optimization =
        env_bool(env, "FACESTAT_SKIP_OPTIMIZATION", defaults.skip_optimization);
    config.request_timeout_secs =
        env_u64(env, "FACESTAT_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs);
    config.retry.max_attempts = env_parse(env, "FACESTAT_RETRY_ATTEMPTS")
        .unwrap_or(defaults.retry.max_attempts);
    config.checkpoint_every_records = env_u64(
        env,
        "FACESTAT_CHECKPOINT_RECORDS",
        defaults.checkpoint_every_records,
    );
    config.checkpoint_every_secs =
        env_u64(env, "FACESTAT_CHECKPOINT_SECS", defaults.checkpoint_every_secs);
    config.max_image_bytes = env_u64(env, "FACESTAT_MAX_IMAGE_BYTES", defaults.max_image_bytes);
    config.max_cache_bytes = env_u64(env, "FACESTAT_MAX_CACHE_BYTES", defaults.max_cache_bytes);
    config.error_log = env_bool(env, "FACESTAT_ERROR_LOG", defaults.error_log);
    config
}

/// Merge the keys present in a TOML file over `base`.
fn overlay_file(base: PipelineConfig, path: &Path) -> Result<PipelineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let overlay: toml::Table = toml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    let mut merged = match toml::Value::try_from(&base)
        .context("failed to encode base configuration")?
    {
        toml::Value::Table(table) => table,
        other => anyhow::bail!("base configuration encoded as {}", other.type_str()),
    };
    merge_tables(&mut merged, overlay);
    toml::Value::Table(merged)
        .try_into()
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_flags(config: &mut PipelineConfig, flags: FlagOverrides) {
    config.input_path = flags.input;
    if let Some(dir) = flags.output_dir {
        config.output_dir = dir;
    }
    if flags.input_format.is_some() {
        config.input_format = flags.input_format;
    }
    if !flags.formats.is_empty() {
        config.output_formats = flags.formats;
    }
    config.resume |= flags.resume;
    if flags.restart_on_mismatch {
        config.on_source_mismatch = MismatchPolicy::Restart;
    }
    config.batch_size = flags.batch_size.or(config.batch_size);
    config.max_workers = flags.max_workers.or(config.max_workers);
    if let Some(limit) = flags.memory_limit {
        config.memory_limit_percent = limit;
    }
    config.skip_optimization |= flags.skip_optimization;
    if let Some(secs) = flags.timeout_secs {
        config.request_timeout_secs = secs;
    }
    if let Some(records) = flags.checkpoint_records {
        config.checkpoint_every_records = records;
    }
    if let Some(secs) = flags.checkpoint_secs {
        config.checkpoint_every_secs = secs;
    }
    if let Some(bytes) = flags.max_image_bytes {
        config.max_image_bytes = bytes;
    }
    if let Some(bytes) = flags.max_cache_bytes {
        config.max_cache_bytes = bytes;
    }
    config.record_limit = flags.limit.or(config.record_limit);
    if flags.no_error_log {
        config.error_log = false;
    }
}

fn split_formats(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

fn env_u64(env: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    env_parse(env, key).unwrap_or(default)
}

fn env_f64(env: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    env_parse(env, key).unwrap_or(default)
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    env(key)
        .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off" | ""))
        .unwrap_or(default)
}
