//! The peer RPC wire format.
//!
//! Peers speak the same transport and framing as clients: one JSON object per
//! newline-terminated line. Peer messages are distinguished by their `type`
//! field, and their field names follow the RPC definitions of the Raft paper
//! (`prev_log_index` / `prev_log_term` are carried flat).

use serde::Deserialize;
use serde::Serialize;
use tiller::raft::AppendEntriesRequest;
use tiller::raft::AppendEntriesResponse;
use tiller::raft::ConflictOpt;
use tiller::raft::Entry;
use tiller::raft::VoteRequest;
use tiller::raft::VoteResponse;
use tiller::LogId;
use tiller::NodeId;
use walstore::KvRequest;

/// A peer-to-peer RPC message, tagged by `type` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry<KvRequest>>,
        leader_commit: u64,
    },
    AppendEntriesReply {
        term: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_term: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_first_index: Option<u64>,
    },
}

impl From<AppendEntriesRequest<KvRequest>> for PeerMessage {
    fn from(rpc: AppendEntriesRequest<KvRequest>) -> Self {
        PeerMessage::AppendEntries {
            term: rpc.term,
            leader_id: rpc.leader_id,
            prev_log_index: rpc.prev_log_id.index,
            prev_log_term: rpc.prev_log_id.term,
            entries: rpc.entries,
            leader_commit: rpc.leader_commit,
        }
    }
}

impl From<VoteRequest> for PeerMessage {
    fn from(rpc: VoteRequest) -> Self {
        PeerMessage::RequestVote {
            term: rpc.term,
            candidate_id: rpc.candidate_id,
            last_log_index: rpc.last_log_index,
            last_log_term: rpc.last_log_term,
        }
    }
}

impl From<AppendEntriesResponse> for PeerMessage {
    fn from(res: AppendEntriesResponse) -> Self {
        PeerMessage::AppendEntriesReply {
            term: res.term,
            success: res.success,
            conflict_term: res.conflict_opt.as_ref().map(|c| c.term),
            conflict_first_index: res.conflict_opt.as_ref().map(|c| c.first_index),
        }
    }
}

impl From<VoteResponse> for PeerMessage {
    fn from(res: VoteResponse) -> Self {
        PeerMessage::RequestVoteReply {
            term: res.term,
            vote_granted: res.vote_granted,
        }
    }
}

impl PeerMessage {
    /// Reassemble an inbound `append_entries` message into the core's request type.
    pub fn into_append_entries(self) -> Option<AppendEntriesRequest<KvRequest>> {
        match self {
            PeerMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => Some(AppendEntriesRequest {
                term,
                leader_id,
                prev_log_id: LogId {
                    term: prev_log_term,
                    index: prev_log_index,
                },
                entries,
                leader_commit,
            }),
            _ => None,
        }
    }

    /// Reassemble an inbound `request_vote` message into the core's request type.
    pub fn into_vote_request(self) -> Option<VoteRequest> {
        match self {
            PeerMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => Some(VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            }),
            _ => None,
        }
    }

    /// Reassemble an inbound `append_entries_reply`.
    pub fn into_append_entries_reply(self) -> Option<AppendEntriesResponse> {
        match self {
            PeerMessage::AppendEntriesReply {
                term,
                success,
                conflict_term,
                conflict_first_index,
            } => Some(AppendEntriesResponse {
                term,
                success,
                conflict_opt: match (conflict_term, conflict_first_index) {
                    (Some(term), Some(first_index)) => Some(ConflictOpt { term, first_index }),
                    _ => None,
                },
            }),
            _ => None,
        }
    }

    /// Reassemble an inbound `request_vote_reply`.
    pub fn into_vote_reply(self) -> Option<VoteResponse> {
        match self {
            PeerMessage::RequestVoteReply { term, vote_granted } => Some(VoteResponse { term, vote_granted }),
            _ => None,
        }
    }
}
