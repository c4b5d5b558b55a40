//! RequestVote handling: the receiving side and the candidate's fan-out.

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// The grant conditions: the candidate's term is current, this node has
    /// not yet voted for a different candidate in this term, and the
    /// candidate's log is at least as up-to-date as ours (§5.4.1). The vote is
    /// persisted before the reply is sent.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(candidate = %msg.candidate_id, term = msg.term))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        if msg.term < self.current_term {
            tracing::debug!(
                { candidate = %msg.candidate_id, self.current_term, rpc_term = msg.term },
                "RequestVote RPC term is less than current term"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Observing a higher term: adopt it, clear our vote, and revert to
        // follower no matter the current role.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Check if candidate's log is at least as up-to-date as this node's (§5.4.1).
        let candidate_is_up_to_date = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);
        if !candidate_is_up_to_date {
            tracing::debug!(
                { candidate = %msg.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        match &self.voted_for {
            // This node has already voted for the candidate; re-grant is idempotent.
            Some(candidate_id) if candidate_id == &msg.candidate_id => {
                self.update_next_election_timeout(false);
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(msg.candidate_id.clone());
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                tracing::debug!({ candidate = %msg.candidate_id }, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Spawn parallel vote requests to all cluster peers.
    ///
    /// Each request is given a deadline of one election timeout; responses
    /// stream back over the returned channel as they arrive.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let peers: Vec<_> = self.core.members.iter().filter(|id| *id != &self.core.id).cloned().collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));

        let rpc = VoteRequest::new(
            self.core.current_term,
            self.core.id.clone(),
            self.core.last_log_id.index,
            self.core.last_log_id.term,
        );
        let ttl = Duration::from_millis(self.core.config.election_timeout_max);

        for peer in peers {
            let (network, tx_inner, rpc) = (self.core.network.clone(), tx.clone(), rpc.clone());
            tokio::spawn(async move {
                match timeout(ttl, network.send_vote(peer.clone(), rpc)).await {
                    Ok(Ok(res)) => {
                        let _ = tx_inner.send((res, peer)).await;
                    }
                    Ok(Err(err)) => tracing::warn!(target = %peer, error = %err, "error while requesting vote"),
                    Err(_) => tracing::warn!(target = %peer, "timeout while requesting vote"),
                }
            });
        }
        rx
    }

    /// Handle a response to a vote request.
    #[tracing::instrument(level = "trace", skip(self, res), fields(peer = %target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If a peer is ahead of us, revert to follower: our campaign is over.
        if res.term > self.core.current_term {
            tracing::debug!({ peer_term = res.term, peer = %target }, "newer term observed in vote response");
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(id = %self.core.id, term = self.core.current_term, "transitioning to leader state");
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }
}
