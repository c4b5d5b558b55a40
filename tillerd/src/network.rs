//! The TCP peer transport: `tiller::RaftNetwork` over JSON lines.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tiller::raft::AppendEntriesRequest;
use tiller::raft::AppendEntriesResponse;
use tiller::raft::VoteRequest;
use tiller::raft::VoteResponse;
use tiller::NodeId;
use tiller::RaftNetwork;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use walstore::KvRequest;

use crate::wire::PeerMessage;

struct PeerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A lazily connecting peer transport.
///
/// One connection is kept per peer, serialized behind a mutex so that
/// requests and replies pair up and arrive in send order. A transport error
/// drops the connection; the next call redials. Retry pacing is left to the
/// replication layer, which retries transport failures indefinitely.
pub struct TcpTransport {
    peers: Mutex<HashMap<NodeId, Arc<Mutex<Option<PeerConn>>>>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    async fn call(&self, target: &NodeId, msg: PeerMessage) -> Result<PeerMessage> {
        let slot = {
            let mut peers = self.peers.lock().await;
            peers.entry(target.clone()).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
        };
        let mut conn = slot.lock().await;
        if conn.is_none() {
            let stream = TcpStream::connect(target.as_str())
                .await
                .with_context(|| format!("connecting to peer {}", target))?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            *conn = Some(PeerConn {
                reader: BufReader::new(reader),
                writer,
            });
        }

        let res = Self::exchange(conn.as_mut().expect("connection was just established"), msg).await;
        if res.is_err() {
            // Drop the broken connection; the next call redials.
            *conn = None;
        }
        res
    }

    async fn exchange(conn: &mut PeerConn, msg: PeerMessage) -> Result<PeerMessage> {
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        conn.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        let n = conn.reader.read_line(&mut reply).await?;
        if n == 0 {
            bail!("peer closed the connection");
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}

#[async_trait]
impl RaftNetwork<KvRequest> for TcpTransport {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<KvRequest>,
    ) -> Result<AppendEntriesResponse> {
        let reply = self.call(&target, rpc.into()).await?;
        match reply.into_append_entries_reply() {
            Some(res) => Ok(res),
            None => bail!("unexpected reply type to append_entries from {}", target),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let reply = self.call(&target, rpc.into()).await?;
        match reply.into_vote_reply() {
            Some(res) => Ok(res),
            None => bail!("unexpected reply type to request_vote from {}", target),
        }
    }
}
