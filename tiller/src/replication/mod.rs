//! Replication stream.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;

use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent<D>>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        ReplicationCore::spawn(id, target, term, config, last_log, commit_index, network, storage, raft_core_tx)
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could
/// result in out-of-order delivery. We always buffer until we receive a
/// success response, then send the next payload from the buffer. A peer
/// connection is thereby a single ordered stream: heartbeats from a given
/// leader arrive at a follower in send order.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<RaftEvent<D>>,

    /// The `RaftNetwork` interface.
    network: Arc<N>,
    /// The `RaftStorage` interface.
    storage: Arc<S>,
    /// The Raft's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,

    /// The index of the next log to send.
    ///
    /// Initialized to leader's last log index + 1. Per the Raft protocol spec,
    /// this value may be decremented as the log consistency check fails for
    /// peers which are behind or hold conflicting entries; the conflict hint
    /// returned on rejections lets it jump back a whole term at a time.
    next_index: u64,
    /// The last log known to be successfully replicated on the target.
    matched: LogId,

    /// A buffer of data to replicate to the target follower.
    ///
    /// The buffered payload here will be expanded as more replication commands
    /// come in from the Raft node. Data from this buffer will flow into the
    /// `outbound_buffer` in chunks.
    replication_buffer: Vec<Arc<Entry<D>>>,
    /// A buffer of data which is being sent to the follower.
    ///
    /// Data in this buffer comes directly from the `replication_buffer` in
    /// chunks, and will remain here until it is confirmed that the payload has
    /// been successfully received by the target node. This allows for
    /// retransmission of payloads in the face of transient errors.
    outbound_buffer: Vec<OutboundEntry<D>>,
    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,
    /// The timeout for an outbound RPC: one election timeout.
    rpc_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let rpc_timeout = Duration::from_millis(config.election_timeout_max);
        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            max_payload_entries,
            marker_r: std::marker::PhantomData,
            target_state: TargetReplState::Lagging,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: last_log,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            rpc_timeout,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
        };

        tokio::spawn(this.main());

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, target = %self.target))]
    async fn main(mut self) {
        // Perform an initial heartbeat.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// This request will timeout if no response is received within one
    /// election timeout.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = std::cmp::min(repl_len, self.max_payload_entries);
                self.outbound_buffer
                    .extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        // Build the heartbeat frame to be sent to the follower.
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id.clone(),
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };

        // Send the payload.
        let res = match timeout(self.rpc_timeout, self.network.send_append_entries(self.target.clone(), payload)).await
        {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(target = %self.target, error = %err, "error sending AppendEntries RPC to target");
                return;
            }
            Err(_) => {
                tracing::warn!(target = %self.target, "timeout while sending AppendEntries RPC to target");
                return;
            }
        };
        let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id);

        // Once we've successfully sent a payload of entries, don't send them again.
        self.outbound_buffer.clear();

        // Handle success conditions.
        if res.success {
            if let Some(log_id) = last_log_id {
                self.next_index = log_id.index + 1; // This should always be the next expected index.
                self.matched = log_id;
            }
            // Report on every success, heartbeats included: the leader uses
            // these events both for commit math and for tracking that it is
            // still in contact with a quorum.
            let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatchIndex {
                target: self.target.clone(),
                matched: self.matched,
            });

            // If our outbound requests have accumulated too much, transition
            // to a lagging state and catch up from storage instead.
            let is_lagging = self
                .last_log_index
                .checked_sub(self.matched.index)
                .map(|diff| diff > self.config.replication_lag_threshold)
                .unwrap_or(false);
            if is_lagging {
                self.target_state = TargetReplState::Lagging;
            }
            return;
        }

        // Replication was not successful, if a newer term has been returned, revert to follower.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target.clone(),
                term: res.term,
            });
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        // Replication was not successful: handle the conflict hint, else
        // fall back to decrementing `next_index` by one.
        match res.conflict_opt {
            Some(conflict) => {
                let next = conflict.first_index.max(1);
                if next > self.last_log_index + 1 {
                    // A hint beyond our own log is nonsensical; ignore it and
                    // let the next round trip sort it out.
                    tracing::warn!(target = %self.target, hint = next, "conflict hint beyond leader log, ignoring");
                    return;
                }
                self.next_index = next;
            }
            None => {
                self.next_index = self.next_index.saturating_sub(1).max(1);
            }
        }
        // Resume sending from the entry preceding next_index; its log id is
        // the prev_log_id of the next request. This is a *presumed* match
        // point only, so it is not reported to the leader's commit math.
        let prev = self.next_index - 1;
        if prev == 0 {
            self.matched = LogId::default();
        } else {
            match self.storage.try_get_log_entry(prev).await {
                Ok(Some(entry)) => self.matched = entry.log_id,
                Ok(None) => {
                    // Without log compaction every index down to 1 is present;
                    // an absent entry means the storage layer is failing.
                    tracing::error!(target = %self.target, index = prev, "log entry missing while resolving conflict");
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
                Err(err) => {
                    tracing::error!(error = ?err, "error fetching log entry while resolving conflict");
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }
        }
        self.outbound_buffer.clear();
        self.replication_buffer.clear();
        self.target_state = TargetReplState::Lagging;
    }

    /// Fully drain the channel coming in from the Raft node.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent<D>) {
        let mut event_opt = Some(first);
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            // Unpack the event opt, else return if we don't have one to process.
            let event = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == TargetReplState::LineRate {
                        self.replication_buffer.push(entry);
                    }
                }
                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event_next) = self.repl_rx.recv().now_or_never() {
                event_opt = event_next;
            }
            iters += 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // When converting from `Lagging`, `outbound_buffer` and
            // `replication_buffer` were cleared and may be missing entries
            // which came in while catching up: resend everything outstanding
            // from storage in that case.
            let index = match next_buf_index {
                Some(index) => index,
                None => self.last_log_index + 1,
            };

            // Ensure that our buffered data matches up with `next_index`. When
            // transitioning to line rate, it is always possible that new data
            // has been sent for replication but has skipped this replication
            // stream during transition. In such cases, a single update from
            // storage will put this stream back on track.
            if self.next_index != index {
                self.frontload_outbound_buffer(self.next_index, index).await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,
                event = self.repl_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.drain_raft_rx(event);
                            // New entries go out immediately; they do not wait
                            // for the next heartbeat.
                            if !self.replication_buffer.is_empty() || !self.outbound_buffer.is_empty() {
                                self.send_append_entries().await;
                            }
                        }
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer due to transition from lagging.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        let entries = match self.storage.get_log_entries(start..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "error while frontloading outbound buffer");
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    pub async fn lagging_loop(&mut self) {
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != TargetReplState::Lagging {
                return;
            }

            // Prep entries from storage and send them off for replication.
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }
            let next_index_before = self.next_index;
            self.prep_outbound_buffer_from_storage().await;
            self.send_append_entries().await;
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }

            if self.next_index == next_index_before {
                // No progress was made: the target is unreachable or still
                // rejecting. Pace the retries at the heartbeat interval.
                tokio::select! {
                    _ = self.heartbeat.tick() => (),
                    event = self.repl_rx.recv() => {
                        match event {
                            Some(event) => self.drain_raft_rx(event),
                            None => self.target_state = TargetReplState::Shutdown,
                        }
                    }
                }
            } else if let Some(Some(event)) = self.repl_rx.recv().now_or_never() {
                // Check raft channel to ensure we are staying up-to-date, then loop.
                self.drain_raft_rx(event);
            }
        }
    }

    /// Check if this replication stream is now up-to-speed.
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.commit_index
    }

    /// Prep the outbound buffer with the next payload of entries to append.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        // If the send buffer is empty, we need to fill it.
        if self.outbound_buffer.is_empty() {
            // Underflow is guarded against in the `is_up_to_speed` check in the outer loop.
            let distance_behind = self.commit_index - self.next_index;

            let is_within_payload_distance = distance_behind <= self.max_payload_entries as u64;
            let stop_idx = if is_within_payload_distance {
                // If we have caught up to the line index, then that means we
                // will be running at line rate after this payload is
                // successfully replicated.
                self.target_state = TargetReplState::LineRate; // Will continue in lagging state until the outer loop cycles.
                self.commit_index + 1 // +1 to ensure stop value is included.
            } else {
                self.next_index + self.max_payload_entries as u64 + 1
            };

            let entries = match self.storage.get_log_entries(self.next_index..stop_idx).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error = %err, "error fetching logs from storage");
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            };
            self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
        }
    }
}

/// A type which wraps two possible forms of an outbound entry for replication.
enum OutboundEntry<D: AppData> {
    /// An entry owned by an Arc, hot off the replication stream from the Raft leader.
    Arc(Arc<Entry<D>>),
    /// An entry which was fetched directly from storage.
    Raw(Entry<D>),
}

impl<D: AppData> AsRef<Entry<D>> for OutboundEntry<D> {
    fn as_ref(&self) -> &Entry<D> {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is lagging behind, catching up from storage.
    Lagging,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the Raft node.
pub(crate) enum RaftEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been
        /// appended to the log, so its index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent {
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The most recent log known to have been successfully replicated on the target.
        matched: LogId,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}
