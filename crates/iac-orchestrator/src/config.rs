//! Runtime configuration (ambient stack — modeled on the teacher's
//! `StageConfig`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the Planner's fixed-point loop and the Runtime's lock
/// acquisition. None of this affects planning *semantics* — it bounds how
/// long the orchestrator is willing to wait or iterate before giving up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard cap on Planner fixed-point iterations (spec §9 "capped at a
    /// fixed iteration limit"). Exceeding it is a bug in the inclusion
    /// rules, not a valid project shape, so it surfaces as an error rather
    /// than a silent truncation.
    pub planner_iteration_cap: usize,
    /// How long `operate()` waits for progressive lock acquisition to make
    /// forward progress before giving up and aborting the operation.
    #[serde(with = "duration_secs")]
    pub lock_retry_timeout: Duration,
    /// Forwarded to the runner on every call; does not affect inclusion.
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            planner_iteration_cap: 100,
            lock_retry_timeout: Duration::from_secs(60),
            debug: false,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_budget() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.planner_iteration_cap, 100);
        assert_eq!(cfg.lock_retry_timeout, Duration::from_secs(60));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.planner_iteration_cap, cfg.planner_iteration_cap);
    }
}
