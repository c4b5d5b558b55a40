//! The core logic of a Raft node.

mod append_entries;
mod client;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::core::client::ClientOrInternalResponseTx;
use crate::core::client::ClientRequestEntry;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::quorum;
use crate::raft::ClientReadResponseTx;
use crate::raft::EntryPayload;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// The core type implementing the Raft protocol.
///
/// This is the single owner of the node's role/term/log/commit state: it runs
/// as one task, and every mutation of that state happens between suspension
/// points of its loop, so each logical action is an atomic critical section
/// from the scheduler's perspective.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The fixed set of cluster members, this node included.
    members: BTreeSet<NodeId>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Committed means: replicated to a majority of the cluster and belonging
    /// to the current leader's term (or covered by such an entry). This value
    /// is volatile: it is initialized to 0 on startup and re-learned, either
    /// from the leader via AppendEntries or, on a leader, from the majority's
    /// match indexes.
    commit_index: u64,

    /// The log id of the highest log entry which has been applied to the local state machine.
    last_applied: LogId,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is
    /// normally based on the leader's term which is communicated to other
    /// members via the AppendEntries protocol, but this may also be
    /// incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The last entry to be appended to the log.
    last_log_id: LogId,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        members: BTreeSet<NodeId>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let this = Self {
            id,
            config,
            members,
            network,
            storage,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.last_applied = state.last_applied_log;
        // NOTE: it is unsafe to initialize the node's commit index to any
        // other value. The commit index must be re-learned from a leader after
        // it has committed an entry of its own term.
        self.commit_index = 0;

        self.report_metrics();

        // This is the central loop of the system. The Raft core assumes a few
        // different roles based on cluster state. The Raft core will delegate
        // control to the different state controllers and simply awaits the
        // delegated loop to return, which will only take place if some error
        // has been encountered, or if a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!(id = %self.id, "node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id.clone(),
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader.clone(),
        });
        if let Err(err) = res {
            tracing::error!(error = %err, id = %self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state.
    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id.clone());
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as the `voted_for` state must also be updated.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is
    /// non-recoverable: an fsync failure or mid-log corruption leaves no safe
    /// way to continue, so the node stops. On restart, WAL replay
    /// re-establishes the state up to the last fsync.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error = ?err, id = %self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Forward the given client write request to the leader.
    fn forward_client_write_request(
        &self,
        rpc: crate::raft::ClientWriteRequest<D>,
        tx: crate::raft::ClientWriteResponseTx<D, R>,
    ) {
        match rpc.entry {
            EntryPayload::Normal(entry) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data, self.current_leader.clone())));
            }
            EntryPayload::Blank => {
                // Blank entries are created internally by leaders and should
                // never arrive through the client write API.
                tracing::error!("unreachable: attempted to forward a blank log entry");
            }
        }
    }

    /// Forward the given client read request to the leader.
    fn forward_client_read_request(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.current_leader.clone())));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState<D>>,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,

    /// A buffer of client requests which have been appended locally and are
    /// awaiting to be committed to the cluster, in increasing index order.
    /// These are the per-entry completion slots: the apply loop resolves each
    /// one once its index commits and its entry has been applied.
    pub(super) awaiting_committed: Vec<ClientRequestEntry<D, R>>,

    /// The index of the blank entry this leader proposed when coming to
    /// power. Linearizable reads are refused until it has committed and
    /// applied (the leader-lease read barrier).
    pub(super) barrier_index: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
            barrier_index: 0,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.core.id, raft_state = "leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams.
        let targets = self
            .core
            .members
            .iter()
            .filter(|elem| *elem != &self.core.id)
            .cloned()
            .collect::<Vec<_>>();
        for target in targets {
            let state = self.spawn_replication_stream(target.clone());
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        // A partitioned leader must not keep serving reads forever: check at
        // each heartbeat interval that a majority has acked recently.
        let mut quorum_check = interval(Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!(id = %self.core.id, state = ?self.core.target_state, "leader is stepping down");
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                }
                // Pending client waiters will never be resolved by this node;
                // hand them back for retry against the new leader.
                for req in self.awaiting_committed.drain(..) {
                    match req.tx {
                        ClientOrInternalResponseTx::Client(tx) => {
                            if let EntryPayload::Normal(entry) = &req.entry.payload {
                                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(
                                    entry.data.clone(),
                                    self.core.current_leader.clone(),
                                )));
                            }
                        }
                        ClientOrInternalResponseTx::Internal => {}
                    }
                }
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => self.handle_msg(msg).await?,
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event).await?,
                _ = quorum_check.tick() => self.check_quorum_contact(),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Dispatch a single API message in leader state.
    async fn handle_msg(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            RaftMsg::ClientWriteRequest { rpc, tx } => {
                self.handle_client_write_request(rpc, tx).await?;
            }
            RaftMsg::ClientReadRequest { tx } => {
                self.handle_client_read_request(tx);
            }
        }
        Ok(())
    }

    /// Handle an event coming from a replication stream.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.matched = matched;
                    node.last_ack = Instant::now();
                }
                self.advance_commit_index().await?;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(%target, term, "higher term observed from replication, reverting to follower");
                    self.core.update_current_term(term, None);
                    self.core.save_hard_state().await?;
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                }
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return Err(RaftError::ShuttingDown);
            }
        }
        Ok(())
    }

    /// Advance the commit index if a majority of the cluster has replicated
    /// a log entry of the current term (§5.3, §5.4).
    async fn advance_commit_index(&mut self) -> RaftResult<()> {
        let mut indexes: Vec<u64> = self.nodes.values().map(|node| node.matched.index).collect();
        // The leader's own log is durable through `sync_log` before any entry
        // is handed to replication, so it counts towards the majority.
        indexes.push(self.core.last_log_id.index);
        indexes.sort_unstable();

        let majority = quorum::majority_of(self.core.members.len());
        let new_commit_index = indexes[indexes.len() - majority];
        if new_commit_index <= self.core.commit_index {
            return Ok(());
        }

        // A leader may only commit entries from its own term by counting
        // replicas; entries from prior terms are committed implicitly (§5.4.2).
        let entry = self
            .core
            .storage
            .try_get_log_entry(new_commit_index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let term_matches = entry.map(|e| e.log_id.term == self.core.current_term).unwrap_or(false);
        if !term_matches {
            return Ok(());
        }

        self.core.commit_index = new_commit_index;
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(RaftEvent::UpdateCommitIndex {
                commit_index: self.core.commit_index,
            });
        }
        self.process_committed_entries().await?;
        self.core.report_metrics();
        Ok(())
    }

    /// Apply newly committed entries and resolve their completion slots.
    async fn process_committed_entries(&mut self) -> RaftResult<()> {
        let commit_index = self.core.commit_index;
        while self
            .awaiting_committed
            .first()
            .map(|req| req.entry.log_id.index <= commit_index)
            .unwrap_or(false)
        {
            let req = self.awaiting_committed.remove(0);
            self.client_request_post_commit(req).await?;
        }
        // Entries without waiters (inherited from prior terms, or whose
        // clients have gone away) still must be applied in order.
        if self.core.last_applied.index < commit_index {
            self.apply_outstanding_up_to(commit_index).await?;
        }
        Ok(())
    }

    /// Check that a majority of the cluster has acked replication traffic
    /// within the last election timeout; step down otherwise, so that a
    /// partitioned leader stops accepting reads & writes (§6.2 of the Raft
    /// dissertation).
    fn check_quorum_contact(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut acked: Vec<Instant> = self.nodes.values().map(|node| node.last_ack).collect();
        acked.push(now);
        acked.sort_unstable();

        let majority = quorum::majority_of(self.core.members.len());
        let quorum_acked_at = acked[acked.len() - majority];
        let timeout = Duration::from_millis(self.core.config.election_timeout_max);
        if now.duration_since(quorum_acked_at) > timeout {
            tracing::warn!(id = %self.core.id, "leader lost contact with a majority, stepping down");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
    }

    /// Spawn a replication stream for the target node.
    fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id.clone(),
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            last_ack: Instant::now(),
            replstream,
        }
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
struct ReplicationState<D: AppData> {
    pub matched: LogId,
    pub last_ack: Instant,
    pub replstream: ReplicationStream<D>,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// The number of votes which have been granted by peer nodes.
    votes_granted: usize,
    /// The number of votes needed in order to become the Raft leader.
    votes_needed: usize,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.core.id, raft_state = "candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup new term.
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id.clone());
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();

            // We must vote for ourselves per the Raft spec.
            self.votes_granted = 1;
            self.votes_needed = quorum::majority_of(self.core.members.len());

            // A single-node cluster has nobody else to ask.
            if self.votes_granted >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // This election has timed-out. Break to outer loop, which starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest { rpc, tx } => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::ClientReadRequest { tx } => {
                            self.core.forward_client_read_request(tx);
                        }
                    },
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.core.id, raft_state = "follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // Value is updated as heartbeats are received.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries { rpc, tx } => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote { rpc, tx } => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::ClientWriteRequest { rpc, tx } => {
                        self.core.forward_client_write_request(rpc, tx);
                    }
                    RaftMsg::ClientReadRequest { tx } => {
                        self.core.forward_client_read_request(tx);
                    }
                },
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
