//! Global configuration model for the lxcompose runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LxError, Result};

/// Root configuration for the lxcompose runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for container trees, state, logs and templates.
    pub data_dir: PathBuf,
    /// External programs driven by the lifecycle controller.
    pub binaries: Binaries,
    /// Retry policy applied to state persistence.
    pub retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            binaries: Binaries::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            binaries: Binaries::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Loads a configuration from a JSON file.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(LxError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        Ok(serde_json::from_str(&content)?)
    }
}

/// Program names of the external runtime commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Binaries {
    /// Starts a container.
    pub start: String,
    /// Stops a container.
    pub stop: String,
    /// Freezes a container.
    pub freeze: String,
    /// Thaws a frozen container.
    pub unfreeze: String,
    /// Prints container status.
    pub info: String,
    /// Streams appended log lines.
    pub follow: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            start: "lxc-start".into(),
            stop: "lxc-stop".into(),
            freeze: "lxc-freeze".into(),
            unfreeze: "lxc-unfreeze".into(),
            info: "lxc-info".into(),
            follow: "tail".into(),
        }
    }
}

/// Exponential backoff policy for transient failures.
///
/// Durations are serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_interval: Duration,
    /// Factor applied to the delay after every retry.
    pub multiplier: f64,
    /// Upper bound of a single delay.
    #[serde(with = "millis")]
    pub max_interval: Duration,
    /// Total time after which no further attempt is started.
    #[serde(with = "millis")]
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to wait after `retry` failed attempts (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(i32::try_from(retry).unwrap_or(i32::MAX));
        let millis = self.initial_interval.as_secs_f64() * 1000.0 * factor;
        let cap = self.max_interval.as_secs_f64() * 1000.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(millis.min(cap) as u64)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
