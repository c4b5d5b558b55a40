//! The TCP front-end: accept loop and request dispatcher.
//!
//! One JSON object per newline-terminated line in each direction. Objects
//! carrying a `type` field are peer RPCs; objects carrying a `command` field
//! are client commands. Responses to a connection are emitted in the order
//! its requests were received: the dispatcher handles one line at a time per
//! connection.

use std::sync::Arc;

use serde_json::json;
use tiller::error::ClientReadError;
use tiller::error::ClientWriteError;
use tiller::raft::ClientWriteRequest;
use tiller::NodeId;
use tiller::Raft;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use walstore::Command;
use walstore::KvPair;
use walstore::KvRequest;
use walstore::KvResponse;
use walstore::SearchIndex;
use walstore::Value;
use walstore::WalStore;

use crate::network::TcpTransport;
use crate::wire::PeerMessage;

/// The concrete Raft type of a tiller node.
pub type KvRaft = Raft<KvRequest, KvResponse, TcpTransport, WalStore>;

/// Everything a connection handler needs.
pub struct App {
    pub id: NodeId,
    pub raft: KvRaft,
    pub store: Arc<WalStore>,
    pub index: Arc<SearchIndex>,
}

/// Run the accept loop until the listener fails.
pub async fn serve(app: Arc<App>, listener: TcpListener) -> anyhow::Result<()> {
    tracing::info!(id = %app.id, "listening for connections");
    loop {
        let (socket, addr) = listener.accept().await?;
        tracing::debug!(%addr, "accepted connection");
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(app, socket).await {
                tracing::debug!(%addr, error = %err, "connection closed");
            }
        });
    }
}

/// Serve a single connection: one request line in, one response line out.
async fn handle_conn(app: Arc<App>, socket: TcpStream) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = dispatch_line(&app, &line).await;
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

/// Dispatch one request line, producing one response line.
async fn dispatch_line(app: &App, line: &str) -> String {
    let parsed: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => return error_response(format!("malformed request: {}", err)),
    };

    if parsed.get("type").is_some() {
        return handle_peer_message(app, line).await;
    }
    handle_client_command(app, &parsed).await
}

/// Handle an inbound peer RPC and encode its reply.
async fn handle_peer_message(app: &App, line: &str) -> String {
    let msg: PeerMessage = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(err) => return error_response(format!("malformed peer message: {}", err)),
    };
    match msg {
        PeerMessage::AppendEntries { .. } => {
            let rpc = msg.into_append_entries().expect("variant was just matched");
            match app.raft.append_entries(rpc).await {
                Ok(res) => encode_peer(PeerMessage::from(res)),
                Err(err) => error_response(err.to_string()),
            }
        }
        PeerMessage::RequestVote { .. } => {
            let rpc = msg.into_vote_request().expect("variant was just matched");
            match app.raft.vote(rpc).await {
                Ok(res) => encode_peer(PeerMessage::from(res)),
                Err(err) => error_response(err.to_string()),
            }
        }
        PeerMessage::AppendEntriesReply { .. } | PeerMessage::RequestVoteReply { .. } => {
            error_response("unexpected reply message on the request path")
        }
    }
}

fn encode_peer(msg: PeerMessage) -> String {
    serde_json::to_string(&msg).unwrap_or_else(|err| error_response(format!("encoding reply failed: {}", err)))
}

/// Handle a client command object.
async fn handle_client_command(app: &App, req: &serde_json::Value) -> String {
    let command = match req.get("command").and_then(|c| c.as_str()) {
        Some(command) => command,
        None => return error_response("missing required field: command"),
    };

    let res = match command {
        "SET" => match (required_str(req, "key"), required_value(req, "value")) {
            (Ok(key), Ok(value)) => write_command(app, req, Command::Set { key, value }).await,
            (Err(err), _) | (_, Err(err)) => Err(err),
        },
        "GET" => match required_str(req, "key") {
            Ok(key) => read_key(app, &key).await,
            Err(err) => Err(err),
        },
        "DELETE" => match required_str(req, "key") {
            Ok(key) => write_command(app, req, Command::Delete { key }).await,
            Err(err) => Err(err),
        },
        "INCR" => match (required_str(req, "key"), required_i64(req, "amount")) {
            (Ok(key), Ok(amount)) => write_command(app, req, Command::Incr { key, amount }).await,
            (Err(err), _) | (_, Err(err)) => Err(err),
        },
        "BULK_SET" => match required_items(req) {
            Ok(items) => write_command(app, req, Command::BulkSet { items }).await,
            Err(err) => Err(err),
        },
        "SEARCH" => match required_str(req, "query") {
            Ok(query) => {
                let hits = app.index.search(&query, top_k(req));
                Ok(success_response(json!(hits)))
            }
            Err(err) => Err(err),
        },
        "SEMANTIC_SEARCH" => match required_str(req, "query") {
            Ok(query) => {
                let hits = app.index.semantic_search(&query, top_k(req));
                Ok(success_response(json!(hits)))
            }
            Err(err) => Err(err),
        },
        "CREATE_INDEX" => match required_str(req, "field") {
            Ok(field) => match app.index.create_index(&field) {
                Ok(()) => Ok(success_response(json!("ok"))),
                Err(err) => Ok(error_response(format!("creating index failed: {}", err))),
            },
            Err(err) => Err(err),
        },
        "QUERY_INDEX" => match (required_str(req, "field"), required_value(req, "value")) {
            (Ok(field), Ok(value)) => match app.index.query_index(&field, &value) {
                Some(keys) => Ok(success_response(json!(keys))),
                None => Err(format!("no index on field {:?}", field)),
            },
            (Err(err), _) | (_, Err(err)) => Err(err),
        },
        other => Err(format!("unknown command {:?}", other)),
    };

    res.unwrap_or_else(error_response)
}

/// Run a mutation through the Raft write path.
async fn write_command(app: &App, req: &serde_json::Value, command: Command) -> Result<String, String> {
    let client_id = req.get("client_id").and_then(|v| v.as_str()).map(str::to_string);
    let seq = req.get("seq").and_then(|v| v.as_u64());
    let request = KvRequest {
        command,
        client_id,
        seq,
    };

    match app.raft.client_write(ClientWriteRequest::new(request)).await {
        Ok(res) => Ok(match res.data {
            KvResponse::Ok => success_response(json!("ok")),
            KvResponse::Value(value) => {
                success_response(serde_json::to_value(value).expect("value encoding cannot fail"))
            }
            KvResponse::Err(err) => error_response(err.to_string()),
        }),
        Err(ClientWriteError::ForwardToLeader(_, leader)) => Ok(redirect_response(leader)),
        Err(ClientWriteError::RaftError(err)) => Ok(error_response(err.to_string())),
    }
}

/// Serve a linearizable read: confirm leadership + read barrier, then read
/// straight from the state machine.
async fn read_key(app: &App, key: &str) -> Result<String, String> {
    match app.raft.client_read().await {
        Ok(()) => match app.store.get(key).await {
            Some(value) => Ok(success_response(
                serde_json::to_value(value).expect("value encoding cannot fail"),
            )),
            None => Ok(error_response("not found")),
        },
        Err(ClientReadError::ForwardToLeader(leader)) => Ok(redirect_response(leader)),
        Err(ClientReadError::NotReady) => Ok(error_response("not ready")),
        Err(ClientReadError::RaftError(err)) => Ok(error_response(err.to_string())),
    }
}

fn success_response(result: serde_json::Value) -> String {
    json!({"status": "success", "result": result}).to_string()
}

fn error_response(message: impl ToString) -> String {
    json!({"status": "error", "error": message.to_string()}).to_string()
}

fn redirect_response(leader: Option<NodeId>) -> String {
    match leader {
        Some(leader) => json!({"status": "redirect", "leader": leader}).to_string(),
        // No leader known (mid-election): the client backs off and retries.
        None => error_response("leader unknown"),
    }
}

fn required_str(req: &serde_json::Value, field: &str) -> Result<String, String> {
    req.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| format!("missing required field: {}", field))
}

fn required_i64(req: &serde_json::Value, field: &str) -> Result<i64, String> {
    req.get(field)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| format!("missing required field: {}", field))
}

fn required_value(req: &serde_json::Value, field: &str) -> Result<Value, String> {
    let raw = req.get(field).ok_or_else(|| format!("missing required field: {}", field))?;
    serde_json::from_value(raw.clone()).map_err(|_| format!("field {:?} is not a valid value", field))
}

fn required_items(req: &serde_json::Value) -> Result<Vec<KvPair>, String> {
    let raw = req.get("items").ok_or_else(|| "missing required field: items".to_string())?;
    serde_json::from_value(raw.clone()).map_err(|_| "field \"items\" is not a list of {key, value} pairs".to_string())
}

fn top_k(req: &serde_json::Value) -> usize {
    req.get("top_k").and_then(|v| v.as_u64()).unwrap_or(10) as usize
}
