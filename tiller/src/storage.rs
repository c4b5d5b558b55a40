//! The Raft storage interface and data types.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This state must be durable on disk before any RPC reply which depends on
/// it is sent; implementations are expected to write it atomically.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The greatest entry recorded in the log.
    pub last_log_id: LogId,
    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
        }
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// The log side of this trait is expected to be write-ahead and durable:
/// `append_to_log` may buffer, but nothing is considered durable until a
/// following `sync_log` has completed, and `delete_logs_from` must be durable
/// before it returns. The consensus core drives `sync_log` so that all
/// appends accumulated in one scheduling tick ride a single fsync (group
/// commit).
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the
    /// storage system to fetch the last known state from stable storage. If no
    /// such entry exists due to being the first time the node has come online,
    /// then `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state, durably, with atomic replacement semantics.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get the log entry at `log_index`, returning `None` if it is not present.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Returns the last known log id, `(0, 0)` for an empty log.
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete the log suffix starting at `from` (inclusive).
    ///
    /// Used by followers to resolve log conflicts. The truncation must be
    /// durable before this method returns.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from(&self, from: u64) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Entries are presented in order and with dense indexes. Implementations
    /// may buffer; entries are not durable until `sync_log` completes.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Flush all buffered log appends and fsync the log.
    ///
    /// The consensus core calls this at most once per batch of appends; a
    /// follower will not acknowledge an AppendEntries RPC, and a leader will
    /// not count itself towards a commit majority, before the covering
    /// `sync_log` has completed.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn sync_log(&self) -> Result<()>;

    /// Apply the given payload of entries to the state machine, returning one
    /// response per entry.
    ///
    /// The Raft protocol guarantees that only committed entries are applied,
    /// strictly in index order, exactly once. Command-level failures (e.g. an
    /// increment against a non-integer value) must be reported as response
    /// values, not as errors: the entry still counts as applied.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;
}

/// APIs for debugging a store, used by tests.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> SM;

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> HardState;
}
