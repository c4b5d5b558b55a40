//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use
//! cases are to expose metrics to a metrics collection platform, or to trigger
//! events within the parent application. The [`Wait`] helper awaits a metrics
//! condition with a timeout, which is how tests (and the server's startup
//! path) observe the cluster converging.

use std::fmt::Debug;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::State;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to have been appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to have been applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
        }
    }
}

/// Error variants surfaced while waiting for a metrics condition.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A helper for awaiting a metrics condition, with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for a metrics condition to become true, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }

            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| WaitError::ShuttingDown)?;
                }
            }
        }
    }

    /// Wait for `last_log_index` to reach at least `want`.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want,
            format!("{} .last_log_index >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for `last_applied` to reach at least `want`.
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= want,
            format!("{} .last_applied >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node to reach the given state.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, format!("{} .state == {:?}", msg.to_string(), want)).await
    }

    /// Wait for `current_leader` to become the given node.
    pub async fn current_leader(&self, leader: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader.as_ref() == Some(&leader),
            format!("{} .current_leader == {}", msg.to_string(), leader),
        )
        .await
    }
}
