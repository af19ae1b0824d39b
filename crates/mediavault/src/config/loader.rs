use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{BackoffStrategy, Config};
use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::roots::SINGLE_ROOT_KEYS;

pub(crate) fn load<F>(lookup: &F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = Config::default();
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    config.database_path = get("MEDIAVAULT_DB_PATH").map(PathBuf::from);

    config.roots.roots_mapping = get("MEDIA_ROOTS");
    config.roots.single_roots = SINGLE_ROOT_KEYS
        .iter()
        .filter_map(|(env_key, root_key)| {
            get(env_key).map(|path| (root_key.to_string(), PathBuf::from(path)))
        })
        .collect();
    config.roots.fallback_root = get("MEDIA_FALLBACK_ROOT").map(PathBuf::from);

    let watcher = &mut config.watcher;
    watcher.root_keys = get("WATCH_ROOT_KEYS")
        .map(|v| parse_list(&v))
        .filter(|keys| !keys.is_empty());
    watcher.enabled = bool_or(&get, "WATCHER_ENABLED", watcher.enabled);
    watcher.poll_interval = millis_or(&get, "WATCH_POLL_INTERVAL_MS", watcher.poll_interval, 1);
    watcher.stability_window =
        millis_or(&get, "WATCH_STABILITY_MS", watcher.stability_window, 0);
    watcher.exclude = get("WATCH_EXCLUDE").map(|v| parse_list(&v)).unwrap_or_default();
    watcher.auto_organize = bool_or(&get, "AUTO_ORGANIZE", watcher.auto_organize);
    watcher.backfill_missing_outputs = bool_or(
        &get,
        "BACKFILL_MISSING_OUTPUTS",
        watcher.backfill_missing_outputs,
    );
    watcher.cleanup_every_scans =
        number_or(&get, "CLEANUP_EVERY_SCANS", watcher.cleanup_every_scans, 0);

    let jobs = &mut config.jobs;
    jobs.concurrency = number_or(&get, "JOB_CONCURRENCY", jobs.concurrency, 1);
    jobs.poll_interval = millis_or(&get, "JOB_POLL_INTERVAL_MS", jobs.poll_interval, 1);
    jobs.retry_backoff = millis_or(&get, "JOB_RETRY_BACKOFF_MS", jobs.retry_backoff, 0);
    jobs.retry_backoff_max =
        millis_or(&get, "JOB_RETRY_BACKOFF_MAX_MS", jobs.retry_backoff_max, 0);
    jobs.retry_strategy = match get("JOB_RETRY_STRATEGY").as_deref() {
        None => jobs.retry_strategy,
        Some(v) if v.eq_ignore_ascii_case("fixed") => BackoffStrategy::Fixed,
        Some(v) if v.eq_ignore_ascii_case("exponential") => BackoffStrategy::Exponential,
        Some(v) => {
            warn_invalid("JOB_RETRY_STRATEGY", v, "expected 'fixed' or 'exponential'");
            jobs.retry_strategy
        }
    };
    jobs.cleanup_days = number_or(&get, "JOB_CLEANUP_DAYS", jobs.cleanup_days, 0);

    config.dedup.batch_limit = number_or(&get, "HASH_BATCH_LIMIT", config.dedup.batch_limit, 1);
    config.dedup.sample_bytes =
        number_or(&get, "HASH_SAMPLE_BYTES", config.dedup.sample_bytes, 1);
    config.dedup.interval = millis_or(&get, "HASH_INTERVAL_MS", config.dedup.interval, 0);

    if let Some(level) = get("LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = get("LOG_FORMAT") {
        match format.parse::<LogFormat>() {
            Ok(f) => config.logging.format = f,
            Err(reason) => warn_invalid("LOG_FORMAT", &format, &reason),
        }
    }

    config
}

/// Parses a boolean flag; accepts true/false, 1/0, yes/no, on/off.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Splits a comma-separated list, dropping blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn warn_invalid(key: &str, value: &str, reason: &str) {
    let err = ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    tracing::warn!("{}; using default", err);
}

fn bool_or<G>(get: &G, key: &str, default: bool) -> bool
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => default,
        Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
            warn_invalid(key, &raw, "expected a boolean");
            default
        }),
    }
}

fn number_or<G, T>(get: &G, key: &str, default: T, min: T) -> T
where
    G: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
{
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(v) if v >= min => v,
        Ok(_) => {
            warn_invalid(key, &raw, &format!("must be at least {}", min));
            default
        }
        Err(_) => {
            warn_invalid(key, &raw, "expected a non-negative integer");
            default
        }
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration, min_ms: u64) -> Duration
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(number_or(get, key, default_ms, min_ms))
}
