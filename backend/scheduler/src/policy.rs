//! Reclamation policy: when an idle sandbox gets paused or stopped.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// What to do with a running sandbox the activity tracker has never seen,
/// typically because the manager restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnobservedPolicy {
    /// Leave it alone until some activity arrives.
    Skip,
    /// Start its idle clock now.
    #[default]
    FirstSeen,
    /// Treat it as idle since the runtime created it.
    CreatedAt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclamationPolicy {
    #[serde(with = "secs")]
    pub idle_pause_threshold: Duration,
    #[serde(with = "secs")]
    pub idle_stop_threshold: Duration,
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(with = "secs")]
    pub startup_delay: Duration,
    pub unobserved: UnobservedPolicy,
}

impl Default for ReclamationPolicy {
    fn default() -> Self {
        Self {
            idle_pause_threshold: Duration::from_secs(10 * 60),
            idle_stop_threshold: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(60),
            startup_delay: Duration::from_secs(120),
            unobserved: UnobservedPolicy::FirstSeen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Pause,
    Stop,
}

impl ReclamationPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.idle_pause_threshold.is_zero() {
            bail!("idle pause threshold must be positive");
        }
        if self.idle_stop_threshold <= self.idle_pause_threshold {
            bail!("idle stop threshold must exceed the pause threshold");
        }
        if self.interval.is_zero() {
            bail!("optimizer interval must be positive");
        }
        Ok(())
    }

    /// Stop supersedes pause.
    pub fn verdict(&self, idle: chrono::Duration) -> Verdict {
        let idle = idle.to_std().unwrap_or_default();
        if idle >= self.idle_stop_threshold {
            Verdict::Stop
        } else if idle >= self.idle_pause_threshold {
            Verdict::Pause
        } else {
            Verdict::Keep
        }
    }

    pub fn pause_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.idle_pause_threshold).unwrap_or(chrono::Duration::MAX)
    }

    pub fn stop_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.idle_stop_threshold).unwrap_or(chrono::Duration::MAX)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
