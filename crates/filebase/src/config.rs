//! Handle and lock configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of additional lock attempts after the first.
pub const DEFAULT_MAX_RETRY: u32 = 4;
/// Default sleep between lock attempts, in microseconds.
pub const DEFAULT_RETRY_INTERVAL_MICROS: u64 = 200_000;
/// Default permission bits for files created on open.
pub const DEFAULT_CREATE_MODE: u32 = 0o644;

/// Controls how [`crate::FileHandle::lock_with`] acquires a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Poll with a bounded retry budget instead of blocking in the kernel.
    pub nonblocking: bool,
    /// Additional attempts after the first one when nonblocking.
    pub max_retry: u32,
    /// Sleep between attempts, in microseconds.
    pub retry_interval_micros: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            nonblocking: true,
            max_retry: DEFAULT_MAX_RETRY,
            retry_interval_micros: DEFAULT_RETRY_INTERVAL_MICROS,
        }
    }
}

impl LockOptions {
    /// Options that block in the kernel until the lock is granted.
    pub fn blocking() -> Self {
        Self {
            nonblocking: false,
            ..Self::default()
        }
    }

    /// Nonblocking options with the given retry budget.
    pub fn nonblocking(max_retry: u32, retry_interval_micros: u64) -> Self {
        Self {
            nonblocking: true,
            max_retry,
            retry_interval_micros,
        }
    }

    /// Sleep between attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_micros(self.retry_interval_micros)
    }

    /// Upper bound on the time spent sleeping by a nonblocking acquisition.
    pub fn worst_case_wait(&self) -> Duration {
        self.retry_interval().saturating_mul(self.max_retry)
    }
}

/// Per-handle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Permission bits for files created by writable opens.
    pub create_mode: u32,
    /// Lock options used by [`crate::FileHandle::lock`].
    pub lock: LockOptions,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            create_mode: DEFAULT_CREATE_MODE,
            lock: LockOptions::default(),
        }
    }
}

impl HandleConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
