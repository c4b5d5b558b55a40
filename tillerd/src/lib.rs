//! The tiller server daemon: TCP front-end, request dispatcher, peer
//! transport and node bootstrap. The binary lives in `main.rs`; everything
//! here is also consumed by the end-to-end tests.

pub mod client;
pub mod network;
pub mod server;
pub mod wire;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tiller::Config;
use tiller::NodeId;
use tiller::Raft;
use tokio::net::TcpListener;
use walstore::SearchIndex;
use walstore::WalStore;

pub use crate::server::App;
pub use crate::server::KvRaft;

/// Everything needed to start a node.
#[derive(Clone, Debug)]
pub struct NodeOpts {
    /// A human-friendly name for this node, used for logging and the default
    /// data directory.
    pub id: String,
    /// The address this node advertises to its peers; doubles as its Raft ID.
    pub addr: NodeId,
    /// The addresses of the other cluster members.
    pub peers: Vec<NodeId>,
    /// Where the WAL and hard-state files live.
    pub data_dir: PathBuf,
}

/// Open storage, rebuild the indexes, spawn the Raft core and assemble the
/// connection-handler state. The caller supplies the already-bound listener
/// (which lets tests bind port 0 first and learn the address).
pub fn bootstrap(opts: &NodeOpts, config: Arc<Config>) -> Result<Arc<App>> {
    let store = Arc::new(WalStore::open(opts.addr.clone(), &opts.data_dir)?);

    // The index reloads its registered fields from the data directory; the
    // views themselves refill from the apply stream.
    let index = Arc::new(SearchIndex::open(opts.data_dir.join("indexes.state"))?);
    store.register_observer(index.clone());

    let mut members: BTreeSet<NodeId> = opts.peers.iter().cloned().collect();
    members.insert(opts.addr.clone());

    let network = Arc::new(network::TcpTransport::new());
    let raft = Raft::new(opts.addr.clone(), config, members, network, store.clone());

    Ok(Arc::new(App {
        id: opts.addr.clone(),
        raft,
        store,
        index,
    }))
}

/// Rebuild the search index from the recovered state machine and serve the
/// listener until it fails or the process is told to stop.
pub async fn run(app: Arc<App>, listener: TcpListener) -> Result<()> {
    // WAL replay happened in bootstrap; the applied map fills back in as the
    // cluster re-commits, and the index follows it through the observer. A
    // node restarted with pre-applied state rebuilds the views up front.
    app.index.rebuild(&app.store.snapshot().await);
    server::serve(app, listener).await
}
