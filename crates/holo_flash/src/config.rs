//! Worker pool configuration.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_FLUSHES: usize = 8;
pub const DEFAULT_MAX_BG_FLUSHES: usize = 8;
pub const DEFAULT_BG_FLUSH_SLEEP_FLOOR: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_KEY_LEN: usize = 256;
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 1024 * 1024;
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// How submissions are assigned to worker inboxes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dispatch {
    /// Rotate across workers.
    #[default]
    RoundRobin,
    /// Hash the target and key so one object always lands on the same worker,
    /// giving per-object FIFO ordering.
    KeyAffinity,
}

impl FromStr for Dispatch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(Dispatch::RoundRobin),
            "key-affinity" | "keyaffinity" | "key" => Ok(Dispatch::KeyAffinity),
            other => Err(Error::ConfigInvalid(format!(
                "unknown dispatch mode {other:?} (expected round-robin or key-affinity)"
            ))),
        }
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::RoundRobin => f.write_str("round-robin"),
            Dispatch::KeyAffinity => f.write_str("key-affinity"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    /// Number of workers.
    pub threads: usize,
    pub max_flushes_in_progress: usize,
    pub max_background_flushes_in_progress: usize,
    /// Minimum pause between background flush passes.
    #[serde(with = "duration_ms")]
    pub background_flush_sleep_floor: Duration,
    pub max_key_len: usize,
    /// Upper bound on object size; sizes the per-worker data arena.
    pub max_object_size: usize,
    /// Capacity of each worker's inbox.
    pub queue_depth: usize,
    pub dispatch: Dispatch,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_flushes_in_progress: DEFAULT_MAX_FLUSHES,
            max_background_flushes_in_progress: DEFAULT_MAX_BG_FLUSHES,
            background_flush_sleep_floor: DEFAULT_BG_FLUSH_SLEEP_FLOOR,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            dispatch: Dispatch::RoundRobin,
        }
    }
}

impl PoolConfig {
    /// Build a config from `HOLO_FLASH_*` environment variables, falling back
    /// to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let dispatch = env::var("HOLO_FLASH_DISPATCH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.dispatch);
        Self {
            threads: read_env_usize("HOLO_FLASH_THREADS", defaults.threads),
            max_flushes_in_progress: read_env_usize(
                "HOLO_FLASH_MAX_FLUSHES",
                defaults.max_flushes_in_progress,
            ),
            max_background_flushes_in_progress: read_env_usize(
                "HOLO_FLASH_MAX_BG_FLUSHES",
                defaults.max_background_flushes_in_progress,
            ),
            background_flush_sleep_floor: Duration::from_millis(read_env_u64(
                "HOLO_FLASH_BG_FLUSH_SLEEP_FLOOR_MS",
                defaults.background_flush_sleep_floor.as_millis() as u64,
            )),
            max_key_len: read_env_usize("HOLO_FLASH_MAX_KEY_LEN", defaults.max_key_len),
            max_object_size: read_env_usize(
                "HOLO_FLASH_MAX_OBJECT_SIZE",
                defaults.max_object_size,
            ),
            queue_depth: read_env_usize("HOLO_FLASH_QUEUE_DEPTH", defaults.queue_depth),
            dispatch,
        }
    }

    /// Reject unusable settings and clamp the flush limits to the worker count.
    pub fn validate(mut self) -> Result<Self> {
        if self.threads == 0 {
            return Err(Error::ConfigInvalid("threads must be >= 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::ConfigInvalid("queue_depth must be >= 1".into()));
        }
        if self.max_key_len == 0 {
            return Err(Error::ConfigInvalid("max_key_len must be >= 1".into()));
        }
        if self.max_object_size == 0 {
            return Err(Error::ConfigInvalid("max_object_size must be >= 1".into()));
        }
        self.max_flushes_in_progress =
            clamp_flush_limit("max_flushes_in_progress", self.max_flushes_in_progress, self.threads);
        self.max_background_flushes_in_progress = clamp_flush_limit(
            "max_background_flushes_in_progress",
            self.max_background_flushes_in_progress,
            self.threads,
        );
        Ok(self)
    }
}

/// Clamp a flush-token limit into `1..=threads`. Clamping is not an error.
pub fn clamp_flush_limit(name: &str, requested: usize, threads: usize) -> usize {
    let clamped = requested.clamp(1, threads.max(1));
    if clamped != requested {
        tracing::info!(
            limit = name,
            requested,
            clamped,
            threads,
            "flush limit clamped to worker count"
        );
    }
    clamped
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threads: usize) -> PoolConfig {
        PoolConfig {
            threads,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = config(0).validate().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn flush_limits_are_clamped_to_thread_count() {
        let cfg = config(4).validate().unwrap();
        assert_eq!(cfg.max_flushes_in_progress, 4);
        assert_eq!(cfg.max_background_flushes_in_progress, 4);

        let cfg = config(16).validate().unwrap();
        assert_eq!(cfg.max_flushes_in_progress, DEFAULT_MAX_FLUSHES);
        assert_eq!(cfg.max_background_flushes_in_progress, DEFAULT_MAX_BG_FLUSHES);
    }

    #[test]
    fn zero_flush_limit_is_raised_to_one() {
        let cfg = PoolConfig {
            max_flushes_in_progress: 0,
            ..config(2)
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.max_flushes_in_progress, 1);
    }

    #[test]
    fn dispatch_parses_both_modes() {
        assert_eq!("round-robin".parse::<Dispatch>().unwrap(), Dispatch::RoundRobin);
        assert_eq!("Key-Affinity".parse::<Dispatch>().unwrap(), Dispatch::KeyAffinity);
        assert!("shared".parse::<Dispatch>().is_err());
        assert_eq!(Dispatch::KeyAffinity.to_string(), "key-affinity");
    }
}
