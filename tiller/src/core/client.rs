//! The leader's client request handling: linearized writes & the read barrier.

use std::sync::Arc;

use crate::core::LeaderState;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A wrapper around a ClientRequest which has been transformed into an Entry,
/// along with its response channel: the per-entry completion slot.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across task boundaries for
    /// replication without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

/// An enum type wrapping either a client response channel or an internal marker.
///
/// Blank entries proposed by a new leader have no waiting client; everything
/// else resolves a `client_write` call.
#[derive(derive_more::From)]
pub(super) enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    #[from]
    Client(ClientWriteResponseTx<D, R>),
    Internal,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when
    /// first coming to power, per §8.
    ///
    /// This blank entry establishes commit ordering for the new term and is
    /// the read barrier: once it has committed and applied, the leader knows
    /// its state machine reflects every entry committed by prior terms and
    /// may serve reads directly from it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let req: ClientWriteRequest<D> = ClientWriteRequest::new_blank_payload();
        let entry = self.append_payload_to_log(req.entry).await?;
        // This only ever needs to be updated once per term.
        self.core.last_log_id.term = self.core.current_term;
        self.barrier_index = entry.log_id.index;

        self.core.storage.sync_log().await.map_err(|err| self.core.map_fatal_storage_error(err))?;

        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry),
            tx: ClientOrInternalResponseTx::Internal,
        };
        self.replicate_client_request(cr_entry).await?;
        Ok(())
    }

    /// Handle client read requests.
    ///
    /// Serving a linearizable read requires that this leader has committed at
    /// least one entry of its own term (its blank entry suffices): until then
    /// the applied state may lag entries committed by prior leaders. Once the
    /// barrier has committed *and* applied, reads are served by the caller
    /// directly from the state machine without going through the log. Before
    /// that, the request is rejected with `NotReady` and the client retries
    /// after a short backoff.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        let barrier_satisfied =
            self.core.commit_index >= self.barrier_index && self.core.last_applied.index >= self.barrier_index;
        if barrier_satisfied {
            let _ = tx.send(Ok(()));
        } else {
            let _ = tx.send(Err(ClientReadError::NotReady));
        }
    }

    /// Handle client write requests.
    ///
    /// Group commit: any further write requests already queued on the API
    /// channel are folded into this batch, so the whole batch is appended to
    /// the WAL and made durable with a single fsync before replication fans
    /// out. Non-write messages encountered while draining are deferred and
    /// processed right after, preserving arrival order.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) -> RaftResult<()> {
        let mut batch = vec![(rpc, tx)];
        let mut deferred = None;
        while batch.len() < self.core.config.max_payload_entries as usize {
            match self.core.rx_api.try_recv() {
                Ok(RaftMsg::ClientWriteRequest { rpc, tx }) => batch.push((rpc, tx)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        let mut appended = Vec::with_capacity(batch.len());
        for (rpc, tx) in batch {
            let entry = match self.append_payload_to_log(rpc.entry).await {
                Ok(entry) => entry,
                Err(err) => {
                    let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                    continue;
                }
            };
            appended.push(ClientRequestEntry {
                entry: Arc::new(entry),
                tx: tx.into(),
            });
        }

        if !appended.is_empty() {
            // One fsync covers every append in this batch. Nothing in the
            // batch is replicated, let alone acknowledged, before it returns.
            self.core.storage.sync_log().await.map_err(|err| self.core.map_fatal_storage_error(err))?;
            for cr_entry in appended {
                self.replicate_client_request(cr_entry).await?;
            }
        }

        if let Some(msg) = deferred {
            match msg {
                RaftMsg::AppendEntries { rpc, tx } => {
                    let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                }
                RaftMsg::RequestVote { rpc, tx } => {
                    let _ = tx.send(self.core.handle_vote_request(rpc).await);
                }
                RaftMsg::ClientReadRequest { tx } => self.handle_client_read_request(tx),
                RaftMsg::ClientWriteRequest { .. } => unreachable!("writes are drained into the batch"),
            }
        }
        Ok(())
    }

    /// Transform the given payload into an entry, assign an index and term,
    /// and append the entry to the log (buffered; the caller drives the
    /// covering `sync_log`).
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;
        self.core.report_metrics();
        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually
    /// finish replication, it merely begins the process. Once the entry has
    /// been committed to the cluster, its response will be generated
    /// asynchronously from the completion slot.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) -> RaftResult<()> {
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() {
            // There are no other cluster members, so the payload is committed
            // as soon as it is durable locally.
            self.core.commit_index = entry_arc.log_id.index;
            self.core.report_metrics();
            self.client_request_post_commit(req).await?;
            return Ok(());
        }

        self.awaiting_committed.push(req);
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(RaftEvent::Replicate {
                entry: entry_arc.clone(),
                commit_index: self.core.commit_index,
            });
        }
        Ok(())
    }

    /// Handle the post-commit logic for a client request: apply it and
    /// resolve its completion slot.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) -> RaftResult<()> {
        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => match &req.entry.payload {
                EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(&req.entry).await {
                    Ok(data) => {
                        let _ = tx.send(Ok(ClientWriteResponse {
                            index: req.entry.log_id.index,
                            data,
                        }));
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                    }
                },
                EntryPayload::Blank => {
                    // Client response channels are only ever attached to
                    // normal entries; this would be a programming bug.
                    tracing::error!("critical: blank entry carried a client response channel");
                    let _ = tx.send(Err(ClientWriteError::RaftError(RaftError::ShuttingDown)));
                }
            },
            ClientOrInternalResponseTx::Internal => {
                self.apply_entry_to_state_machine(&req.entry).await?;
            }
        }
        Ok(())
    }

    /// Apply the given log entry to the state machine, first applying any
    /// earlier committed entries which are still outstanding.
    ///
    /// A gap would only ever exist if this node carried committed-but-not-yet
    /// applied entries from before it became leader.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry<D>) -> RaftResult<R> {
        let index = entry.log_id.index;
        let expected_next_index = self.core.last_applied.index + 1;
        if index != expected_next_index {
            self.apply_outstanding_up_to(index - 1).await?;
        }

        let res = self
            .core
            .storage
            .apply_to_state_machine(&[entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = entry.log_id;
        self.core.report_metrics();

        res.into_iter()
            .next()
            .ok_or_else(|| RaftError::RaftStorage(anyhow::anyhow!("storage returned no response for applied entry")))
    }

    /// Apply all committed-but-unapplied entries up to and including `index`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn apply_outstanding_up_to(&mut self, index: u64) -> RaftResult<()> {
        let start = self.core.last_applied.index + 1;
        if start > index {
            return Ok(());
        }
        let entries = self
            .core
            .storage
            .get_log_entries(start..=index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let last_log_id = match entries.last() {
            Some(entry) => entry.log_id,
            None => return Ok(()),
        };

        let data_entries: Vec<_> = entries.iter().collect();
        self.core
            .storage
            .apply_to_state_machine(&data_entries)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = last_log_id;
        self.core.report_metrics();
        Ok(())
    }
}
