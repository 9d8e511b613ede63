//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Settings of one scheduler node.
///
/// Durations serialize as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick cadence of the main loop and of heartbeats.
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    /// Silence after which peers consider this node stalled.
    #[serde(rename = "heartbeat_timeout_ms", with = "millis")]
    pub heartbeat_timeout: Duration,
    /// Maximum concurrent job executions on this node.
    pub worker_capacity: usize,
    /// Remove the node's registration on a clean stop.
    pub deregister_on_stop: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            worker_capacity: 4,
            deregister_on_stop: true,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.heartbeat_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "heartbeat interval should be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(SchedulerError::InvalidConfig(format!(
                "heartbeat timeout ({:?}) should be greater than heartbeat interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        if self.worker_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "worker capacity should be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
