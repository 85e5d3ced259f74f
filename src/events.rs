//! Upstream event stream
//!
//! The binary is fed newline-delimited JSON events standing in for a pool
//! connection: session parameters, difficulty changes, job notifications and
//! pauses between them.

use crate::coordinator::JobCoordinator;
use crate::job::JobNotification;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One line of the upstream event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamEvent {
    /// Per-connection extranonce settings
    Session {
        extranonce1: String,
        extranonce2_size: usize,
    },
    /// New pool difficulty
    Difficulty { value: f64 },
    /// New job
    Notify(JobNotification),
    /// Pause the replay
    Wait { millis: u64 },
}

impl UpstreamEvent {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line)?))
    }
}

/// Apply an event to the coordinator.
///
/// Returns how long the replay should pause before the next event.
pub fn apply_event(coordinator: &JobCoordinator, event: &UpstreamEvent) -> Result<Option<Duration>> {
    match event {
        UpstreamEvent::Session {
            extranonce1,
            extranonce2_size,
        } => {
            coordinator.set_session(extranonce1.clone(), *extranonce2_size)?;
        }
        UpstreamEvent::Difficulty { value } => {
            coordinator.set_pool_difficulty(*value);
        }
        UpstreamEvent::Notify(notification) => {
            coordinator.deliver_job(notification)?;
        }
        UpstreamEvent::Wait { millis } => {
            debug!(millis, "Replay pause");
            return Ok(Some(Duration::from_millis(*millis)));
        }
    }
    Ok(None)
}
