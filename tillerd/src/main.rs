//! The tiller server daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tiller::Config;
use tiller::State;
use tillerd::App;
use tillerd::NodeOpts;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// A replicated, durable key-value store node.
#[derive(Debug, Parser)]
#[command(name = "tillerd", version, about)]
struct Opts {
    /// The name of this node; also names the default data directory.
    #[arg(long)]
    id: String,

    /// The host this node binds and advertises.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// The port this node binds and advertises.
    #[arg(long)]
    port: u16,

    /// Comma-separated peer addresses (host:port). Listing this node's own
    /// address is harmless.
    #[arg(long, value_delimiter = ',', default_value = "")]
    peers: Vec<String>,

    /// The data directory. Defaults to ./data/<id>.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// The node runs a current-thread runtime: one cooperative scheduler owns
/// all node state, and only fsync is shipped to a blocking helper thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let opts = Opts::parse();
    let addr = format!("{}:{}", opts.host, opts.port);
    let node = NodeOpts {
        id: opts.id.clone(),
        addr: addr.clone(),
        peers: opts.peers.into_iter().filter(|p| !p.is_empty() && p != &addr).collect(),
        data_dir: opts.data_dir.unwrap_or_else(|| PathBuf::from("./data").join(&opts.id)),
    };

    let config = Arc::new(
        Config::build("tiller".into())
            .validate()
            .context("invalid raft configuration")?,
    );

    // A storage failure here (mid-log corruption, unreadable data dir) is
    // fatal and exits non-zero; a trailing torn write has already been
    // recovered by replay.
    let app = tillerd::bootstrap(&node, config)?;
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {}", addr))?;

    tracing::info!(id = %node.id, %addr, peers = ?node.peers, "tillerd starting");

    tokio::select! {
        res = tillerd::run(app.clone(), listener) => res?,
        res = watch_for_shutdown(&app) => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            app.raft.shutdown().await?;
        }
    }
    Ok(())
}

/// Resolve if the consensus core stops on its own. That only happens for
/// non-recoverable storage failures (a failed fsync, corruption), which must
/// take the whole node down with a non-zero exit.
async fn watch_for_shutdown(app: &App) -> Result<()> {
    let mut metrics = app.raft.metrics();
    loop {
        if metrics.borrow().state == State::Shutdown {
            bail!("raft core stopped on a fatal storage error");
        }
        if metrics.changed().await.is_err() {
            bail!("raft core task ended unexpectedly");
        }
    }
}
