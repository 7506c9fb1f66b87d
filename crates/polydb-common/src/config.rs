//! Configuration types for PolyDB

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Deadlock detection strategy, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadlockDetectorKind {
    /// Exact cycle detection over an explicit wait-for graph
    #[default]
    Graph,
    /// Per-resource sequence number heuristic (best-effort)
    RequestSequence,
}

impl fmt::Display for DeadlockDetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlockDetectorKind::Graph => write!(f, "graph"),
            DeadlockDetectorKind::RequestSequence => write!(f, "request-sequence"),
        }
    }
}

/// Policy for picking the victim among conflicting transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VictimSelection {
    /// First transaction reported by the detector
    #[default]
    First,
    /// Highest sequence number (most recently started)
    Youngest,
    /// Lowest sequence number
    Oldest,
}

/// Deadlock handling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Detector strategy
    pub detector: DeadlockDetectorKind,

    /// Victim selection policy
    pub victim_selection: VictimSelection,

    /// Upper bound for a blocked lock request
    #[serde(with = "humantime_serde")]
    pub lock_wait_timeout: Duration,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            detector: DeadlockDetectorKind::default(),
            victim_selection: VictimSelection::default(),
            lock_wait_timeout: Duration::from_secs(30),
        }
    }
}

impl DeadlockConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: DeadlockConfig =
            toml::from_str(s).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_wait_timeout.is_zero() {
            return Err(Error::config("lock_wait_timeout must be > 0"));
        }

        if self.detector == DeadlockDetectorKind::RequestSequence {
            tracing::warn!(
                "request-sequence deadlock detector is best-effort and may miss deadlocks; \
                 lock_wait_timeout ({}) is the fallback",
                humantime::format_duration(self.lock_wait_timeout)
            );
        }

        Ok(())
    }
}

/// Duration serialization helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
