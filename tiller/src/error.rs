//! Error types exposed by this crate.

use thiserror::Error;

use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// The Raft node is shutting down.
    #[error("this Raft instance is shutting down")]
    ShuttingDown,
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    ///
    /// The request payload is handed back so that the caller can retry it
    /// against the leader without cloning up front. The leader is `None` when
    /// this node does not currently know of one.
    #[error("this node is not the Raft leader")]
    ForwardToLeader(D, Option<NodeId>),
}

/// An error related to a client read request.
#[derive(Debug, Error)]
pub enum ClientReadError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client read request must be forwarded to the cluster leader.
    #[error("this node is not the Raft leader")]
    ForwardToLeader(Option<NodeId>),
    /// The leader has not yet committed an entry of its own term, so it can
    /// not yet guarantee linearizable reads. Clients should retry after a
    /// short backoff.
    #[error("the leader has not yet committed an entry of its current term")]
    NotReady,
}
