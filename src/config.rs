//! Configuration types for cycle-runner

use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-cycle execution settings (worker bound and pool timeouts)
///
/// Read once at the start of every cycle. Updates made while a cycle is
/// running only apply to the next cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Maximum items processed concurrently within one cycle (default: 8)
    ///
    /// Values of zero or below mean "no concurrency" and are clamped to a
    /// single worker. They are never interpreted as unbounded.
    #[serde(default = "default_max_worker_threads")]
    pub max_worker_threads: i32,

    /// Maximum time to wait for dispatched items before the pool is torn down
    /// (default: 1000 ms)
    ///
    /// Items still running when this elapses are reported as abandoned and
    /// receive a cancellation signal. They are not retried.
    #[serde(default = "default_drain_timeout", with = "duration_ms_serde")]
    pub drain_timeout: Duration,

    /// How long an idle pool worker waits for new work before exiting
    /// (default: 3000 ms)
    #[serde(default = "default_idle_timeout", with = "duration_ms_serde")]
    pub idle_timeout: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_worker_threads: default_max_worker_threads(),
            drain_timeout: default_drain_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl CycleConfig {
    /// Effective worker bound, with values of zero or below clamped to 1
    pub fn worker_limit(&self) -> usize {
        usize::try_from(self.max_worker_threads)
            .unwrap_or(1)
            .max(1)
    }

    /// Worker pool settings derived from this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.worker_limit(),
            idle_timeout: self.idle_timeout,
        }
    }

    /// Check the configuration for values that cannot work
    ///
    /// A non-positive `max_worker_threads` is not an error: it is clamped.
    pub fn validate(&self) -> Result<()> {
        if self.drain_timeout.is_zero() {
            return Err(Error::Config {
                message: "drain_timeout must be greater than zero".into(),
                key: Some("drain_timeout".into()),
            });
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Config {
                message: "idle_timeout must be greater than zero".into(),
                key: Some("idle_timeout".into()),
            });
        }
        Ok(())
    }
}

/// Interval trigger settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Time between cycle fires (default: 60 s)
    #[serde(default = "default_trigger_interval", with = "duration_ms_serde")]
    pub interval: Duration,

    /// Fire a cycle immediately when the trigger starts (default: true)
    #[serde(default = "default_true")]
    pub fire_on_start: bool,

    /// Name recorded in the [`CycleContext`](crate::types::CycleContext) of
    /// every cycle fired by this trigger (default: "interval")
    #[serde(default = "default_trigger_name")]
    pub name: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            interval: default_trigger_interval(),
            fire_on_start: true,
            name: default_trigger_name(),
        }
    }
}

/// Main configuration
///
/// Groups the cycle settings with the optional interval trigger settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Cycle execution settings
    #[serde(default)]
    pub cycle: CycleConfig,

    /// Interval trigger settings
    #[serde(default)]
    pub trigger: TriggerConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.cycle.validate()?;
        if self.trigger.interval.is_zero() {
            return Err(Error::Config {
                message: "trigger interval must be greater than zero".into(),
                key: Some("trigger.interval".into()),
            });
        }
        Ok(())
    }
}

fn default_max_worker_threads() -> i32 {
    8
}

fn default_drain_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_idle_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_trigger_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_trigger_name() -> String {
    "interval".to_string()
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
