//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tiller::error::ClientWriteError;
use tiller::raft::AppendEntriesRequest;
use tiller::raft::AppendEntriesResponse;
use tiller::raft::ClientWriteRequest;
use tiller::raft::ClientWriteResponse;
use tiller::raft::VoteRequest;
use tiller::raft::VoteResponse;
use tiller::Config;
use tiller::NodeId;
use tiller::Raft;
use tiller::RaftNetwork;
use tiller::RaftStorage;
use tiller::State;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Instant;
use walstore::Command;
use walstore::KvRequest;
use walstore::KvResponse;
use walstore::Value;
use walstore::WalStore;

/// A concrete Raft type used during testing.
pub type KvRaft = Raft<KvRequest, KvResponse, RaftRouter, WalStore>;

/// Initialize the tracing system for a test.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false).with_test_writer();
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A type which emulates a network transport and implements the `RaftNetwork`
/// trait, routing RPCs between in-process nodes.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The fixed membership of the cluster under test.
    members: BTreeSet<NodeId>,
    /// The table of all nodes currently alive in this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (KvRaft, Arc<WalStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// Data directories, retained across node restarts.
    dirs: StdMutex<HashMap<NodeId, TempDir>>,
}

impl RaftRouter {
    /// Create a new instance for a cluster of the given node names.
    pub fn new(config: Arc<Config>, members: impl IntoIterator<Item = &'static str>) -> Arc<Self> {
        Arc::new(Self {
            config,
            members: members.into_iter().map(|id| id.to_string()).collect(),
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            dirs: Default::default(),
        })
    }

    /// The configured member set.
    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Create and spawn a new Raft node, opening (or reopening) its storage.
    pub async fn new_raft_node(self: &Arc<Self>, id: &str) -> KvRaft {
        let id = id.to_string();
        assert!(self.members.contains(&id), "node {} is not a configured member", id);
        let dir_path = {
            let mut dirs = self.dirs.lock().expect("dirs lock poisoned");
            dirs.entry(id.clone())
                .or_insert_with(|| TempDir::with_prefix("tiller-test").expect("tempdir failed"))
                .path()
                .to_path_buf()
        };
        let store = Arc::new(WalStore::open(id.clone(), dir_path).expect("store failed to open"));
        let raft = Raft::new(id.clone(), self.config.clone(), self.members.clone(), self.clone(), store.clone());
        self.routing_table.write().await.insert(id, (raft.clone(), store));
        raft
    }

    /// Shut a node down and drop it from the routing table, keeping its data
    /// directory for a later restart.
    pub async fn remove_node(&self, id: &str) -> Option<(KvRaft, Arc<WalStore>)> {
        let removed = self.routing_table.write().await.remove(id);
        if let Some((raft, _)) = &removed {
            let _ = raft.shutdown().await;
        }
        removed
    }

    /// Restart a previously removed node from its retained data directory.
    pub async fn restart_node(self: &Arc<Self>, id: &str) -> KvRaft {
        assert!(
            !self.routing_table.read().await.contains_key(id),
            "node {} is still running",
            id
        );
        self.new_raft_node(id).await
    }

    /// Isolate a node: it can neither send nor receive frames.
    pub async fn isolate_node(&self, id: &str) {
        self.isolated_nodes.write().await.insert(id.to_string());
    }

    /// Restore an isolated node to the network.
    pub async fn restore_node(&self, id: &str) {
        self.isolated_nodes.write().await.remove(id);
    }

    /// Get a handle to a node's raft instance.
    pub async fn get_raft_handle(&self, id: &str) -> Result<KvRaft> {
        self.routing_table
            .read()
            .await
            .get(id)
            .map(|(raft, _)| raft.clone())
            .ok_or_else(|| anyhow!("node {} not found", id))
    }

    /// Get a handle to a node's storage.
    pub async fn get_storage_handle(&self, id: &str) -> Result<Arc<WalStore>> {
        self.routing_table
            .read()
            .await
            .get(id)
            .map(|(_, store)| store.clone())
            .ok_or_else(|| anyhow!("node {} not found", id))
    }

    /// Wait for any live node to report itself leader, returning its id.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            for (id, (raft, _)) in self.routing_table.read().await.iter() {
                let metrics = raft.metrics().borrow().clone();
                if metrics.state == State::Leader {
                    return Ok(id.clone());
                }
            }
            if Instant::now() >= deadline {
                bail!("timeout after {:?} waiting for a leader: {}", timeout, msg);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// The set of live nodes currently reporting themselves leader.
    pub async fn current_leaders(&self) -> Vec<NodeId> {
        let mut leaders = Vec::new();
        for (id, (raft, _)) in self.routing_table.read().await.iter() {
            if raft.metrics().borrow().state == State::Leader {
                leaders.push(id.clone());
            }
        }
        leaders
    }

    /// Submit a SET through the given node.
    pub async fn client_write(
        &self,
        target: &str,
        key: &str,
        value: Value,
    ) -> Result<ClientWriteResponse<KvResponse>, ClientWriteError<KvRequest>> {
        let raft = self
            .get_raft_handle(target)
            .await
            .map_err(|_| ClientWriteError::RaftError(tiller::RaftError::ShuttingDown))?;
        raft.client_write(ClientWriteRequest::new(KvRequest::new(Command::Set {
            key: key.to_string(),
            value,
        })))
        .await
    }

    /// Wait until every live node has applied at least `index`.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration, msg: &str) -> Result<()> {
        let nodes: Vec<_> = self.routing_table.read().await.values().map(|(raft, _)| raft.clone()).collect();
        for raft in nodes {
            raft.wait(Some(timeout)).applied(index, msg).await?;
        }
        Ok(())
    }

    /// Assert that all live nodes hold byte-identical logs and applied state.
    pub async fn assert_consistent_state(&self, msg: &str) {
        let table = self.routing_table.read().await;
        let mut prev: Option<(NodeId, Vec<u8>, BTreeMap<String, Value>)> = None;
        for (id, (_, store)) in table.iter() {
            let entries = store.get_log_entries(1..).await.expect("log read failed");
            let encoded = serde_json::to_vec(&entries).expect("log encoding failed");
            let snapshot = store.snapshot().await;
            if let Some((prev_id, prev_log, prev_snap)) = &prev {
                assert_eq!(&encoded, prev_log, "{}: log mismatch between {} and {}", msg, prev_id, id);
                assert_eq!(&snapshot, prev_snap, "{}: state mismatch between {} and {}", msg, prev_id, id);
            }
            prev = Some((id.clone(), encoded, snapshot));
        }
    }

    /// Check whether `id` is currently isolated.
    async fn is_isolated(&self, id: &str) -> bool {
        self.isolated_nodes.read().await.contains(id)
    }

    /// Route an RPC to the target node, honoring isolation of both ends.
    async fn check_reachable(&self, source: &str, target: &str) -> Result<()> {
        if self.is_isolated(source).await {
            bail!("source node {} is isolated", source);
        }
        if self.is_isolated(target).await {
            bail!("target node {} is isolated", target);
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork<KvRequest> for RaftRouter {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<KvRequest>,
    ) -> Result<AppendEntriesResponse> {
        self.check_reachable(&rpc.leader_id, &target).await?;
        let raft = self.get_raft_handle(&target).await?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.check_reachable(&rpc.candidate_id, &target).await?;
        let raft = self.get_raft_handle(&target).await?;
        Ok(raft.vote(rpc).await?)
    }
}
