//! tiller: the Raft consensus core of a replicated key-value store.
//!
//! This crate implements the Raft protocol proper: leader election, log
//! replication, commit advancement and client linearization. It is generic
//! over the application's command and response types, and over the storage
//! and network layers, which are supplied through the [`RaftStorage`] and
//! [`RaftNetwork`] traits. See the `walstore` crate for the durable storage
//! implementation and `tillerd` for the server binary.

pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
mod quorum;
pub mod raft;
mod replication;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::core::State;
pub use crate::error::ClientReadError;
pub use crate::error::ClientWriteError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::storage::RaftStorage;
pub use crate::storage::RaftStorageDebug;

/// A Raft node's ID.
///
/// Nodes are identified by the `host:port` address their peers dial them at,
/// which makes client redirection trivial: the leader ID *is* the address to
/// redirect to.
pub type NodeId = String;

/// The identity of a log entry: the term it was proposed in and its position
/// in the log. Indexes are 1-based and dense; `(0, 0)` denotes the empty log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate
/// will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// goes through Raft. Instead, applications can present their data models
/// as-is, and the data will be serialized only when it hits the wire or the
/// log.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// This is the type returned from applying an entry to the state machine, and
/// is ultimately handed back to the waiting client.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait for producing a one-line summary of a message for tracing.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
