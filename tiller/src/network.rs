//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be hidden behind a
/// `Box<T>` or `Arc<T>` and this interface implemented on the container type.
/// Implementations are expected to surface transport failures as errors; the
/// replication layer retries them indefinitely with its own pacing, and the
/// caller imposes a deadline of one election timeout per RPC.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;
}
