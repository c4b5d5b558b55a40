//! The follower side of AppendEntries: log consistency, truncation & apply.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg = %msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term = msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // The RPC is from the legitimate leader of `msg.term`: reset the
        // election timer and adopt term & leader.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        if self.current_leader.as_ref() != Some(&msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id.clone()));
            report_metrics = true;
        }

        // A candidate (or a deposed leader) observing an AppendEntries with
        // term >= its own steps down to follower.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // Log consistency check (§5.3): our log must contain an entry at
        // `prev_log_id.index` with a matching term. Index 0 means the leader
        // is replicating from the very start of the log.
        if msg.prev_log_id.index > 0 {
            let prev_entry = self
                .storage
                .try_get_log_entry(msg.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match prev_entry {
                None => {
                    // Our log is too short. Hint the leader to resume from
                    // just past our last entry.
                    let conflict_opt = Some(ConflictOpt {
                        term: self.last_log_id.term,
                        first_index: self.last_log_id.index + 1,
                    });
                    if report_metrics {
                        self.report_metrics();
                    }
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_opt,
                    });
                }
                Some(prev) if prev.log_id.term != msg.prev_log_id.term => {
                    // Conflicting entry: report its term together with the
                    // first index we hold for that term, so the leader backs
                    // off a whole term at a time instead of one entry.
                    let conflict_term = prev.log_id.term;
                    let start = msg.prev_log_id.index.saturating_sub(50).max(1);
                    let old_entries = self
                        .storage
                        .get_log_entries(start..=msg.prev_log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    let first_index = old_entries
                        .iter()
                        .find(|entry| entry.log_id.term == conflict_term)
                        .map(|entry| entry.log_id.index)
                        .unwrap_or(msg.prev_log_id.index);
                    if report_metrics {
                        self.report_metrics();
                    }
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_opt: Some(ConflictOpt {
                            term: conflict_term,
                            first_index,
                        }),
                    });
                }
                Some(_) => {}
            }
        }

        // Find the first of the new entries which diverges from our log.
        // Identical prefixes are skipped (idempotent re-delivery); the first
        // index holding a different term truncates our suffix (§5.3).
        let mut offset = 0;
        for entry in msg.entries.iter() {
            let existing = self
                .storage
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(existing) if existing.log_id.term == entry.log_id.term => offset += 1,
                Some(_) => {
                    self.storage
                        .delete_logs_from(entry.log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.last_log_id =
                        self.storage.get_last_log_id().await.map_err(|err| self.map_fatal_storage_error(err))?;
                    break;
                }
                None => break,
            }
        }

        let new_entries = &msg.entries[offset..];
        if !new_entries.is_empty() {
            let entry_refs: Vec<_> = new_entries.iter().collect();
            self.storage.append_to_log(&entry_refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
            // The new entries must be durable before the leader is told they
            // are stored: its commit math depends on it.
            self.storage.sync_log().await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = new_entries.last().map(|entry| entry.log_id).unwrap_or(self.last_log_id);
        }

        // Update the commit index: never past the last entry this request
        // covers, else we could "commit" entries we do not have.
        let new_commit_index = std::cmp::min(msg.leader_commit, self.last_log_id.index);
        if new_commit_index > self.commit_index {
            self.commit_index = new_commit_index;
            self.replicate_to_state_machine_if_needed().await?;
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Apply any outstanding committed entries to the state machine, in
    /// index order, synchronously in the core task.
    ///
    /// This is the follower's half of the apply loop; the leader's runs
    /// through its completion slots. Keeping the apply inline means observers
    /// see mutations in commit order and apply order equals log order across
    /// the whole cluster.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn replicate_to_state_machine_if_needed(&mut self) -> RaftResult<()> {
        if self.commit_index <= self.last_applied.index {
            return Ok(());
        }
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index);
        if self.last_applied.index + 1 > stop {
            return Ok(());
        }
        let entries = self
            .storage
            .get_log_entries(self.last_applied.index + 1..=stop)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let last_log_id = match entries.last() {
            Some(entry) => entry.log_id,
            None => return Ok(()),
        };

        let data_entries: Vec<_> = entries.iter().collect();
        self.storage
            .apply_to_state_machine(&data_entries)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_applied = last_log_id;
        Ok(())
    }
}
