//! A small client for the line-delimited JSON protocol.
//!
//! Follows redirects to the leader and retries `not ready` / `leader
//! unknown` responses with exponential backoff, up to a bounded number of
//! attempts. Used by the end-to-end tests and suitable as a building block
//! for tooling.

use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use walstore::Value;

/// The decoded response to a client request.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Success(serde_json::Value),
    Error(String),
}

impl Response {
    /// Unwrap a success result, turning protocol-level errors into `Err`.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            Response::Success(value) => Ok(value),
            Response::Error(message) => bail!("server error: {}", message),
        }
    }
}

/// A client connection to a tiller cluster.
pub struct Client {
    /// The address to dial first; updated when the cluster redirects us.
    addr: String,
    conn: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
    max_attempts: usize,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: None,
            max_attempts: 8,
        }
    }

    /// Send one request object, following redirects and retrying transient
    /// `not ready` conditions with exponential backoff.
    pub async fn request(&mut self, body: serde_json::Value) -> Result<Response> {
        let mut backoff = Duration::from_millis(20);
        for _ in 0..self.max_attempts {
            let reply = match self.exchange(&body).await {
                Ok(reply) => reply,
                Err(err) => {
                    // Transport trouble: drop the connection, back off, redial.
                    tracing::debug!(error = %err, addr = %self.addr, "request failed, retrying");
                    self.conn = None;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
            };

            let status = reply.get("status").and_then(|s| s.as_str()).unwrap_or("");
            match status {
                "success" => {
                    return Ok(Response::Success(reply.get("result").cloned().unwrap_or(serde_json::Value::Null)))
                }
                "redirect" => {
                    let leader = reply
                        .get("leader")
                        .and_then(|l| l.as_str())
                        .context("redirect response without a leader")?;
                    self.addr = leader.to_string();
                    self.conn = None;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                "error" => {
                    let message = reply.get("error").and_then(|e| e.as_str()).unwrap_or("unknown error");
                    // Election in progress or read barrier pending: retryable.
                    if message == "not ready" || message == "leader unknown" {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    return Ok(Response::Error(message.to_string()));
                }
                other => bail!("malformed response status {:?}", other),
            }
        }
        bail!("request did not succeed after {} attempts", self.max_attempts)
    }

    pub async fn set(&mut self, key: &str, value: Value) -> Result<Response> {
        self.request(json!({"command": "SET", "key": key, "value": value})).await
    }

    pub async fn get(&mut self, key: &str) -> Result<Response> {
        self.request(json!({"command": "GET", "key": key})).await
    }

    pub async fn delete(&mut self, key: &str) -> Result<Response> {
        self.request(json!({"command": "DELETE", "key": key})).await
    }

    pub async fn incr(&mut self, key: &str, amount: i64) -> Result<Response> {
        self.request(json!({"command": "INCR", "key": key, "amount": amount})).await
    }

    pub async fn bulk_set(&mut self, items: &[(&str, Value)]) -> Result<Response> {
        let items: Vec<_> = items.iter().map(|(k, v)| json!({"key": k, "value": v})).collect();
        self.request(json!({"command": "BULK_SET", "items": items})).await
    }

    pub async fn search(&mut self, query: &str, top_k: usize) -> Result<Response> {
        self.request(json!({"command": "SEARCH", "query": query, "top_k": top_k})).await
    }

    pub async fn semantic_search(&mut self, query: &str, top_k: usize) -> Result<Response> {
        self.request(json!({"command": "SEMANTIC_SEARCH", "query": query, "top_k": top_k})).await
    }

    pub async fn create_index(&mut self, field: &str) -> Result<Response> {
        self.request(json!({"command": "CREATE_INDEX", "field": field})).await
    }

    pub async fn query_index(&mut self, field: &str, value: Value) -> Result<Response> {
        self.request(json!({"command": "QUERY_INDEX", "field": field, "value": value})).await
    }

    async fn exchange(&mut self, body: &serde_json::Value) -> Result<serde_json::Value> {
        if self.conn.is_none() {
            let stream = TcpStream::connect(&self.addr).await.with_context(|| format!("dialing {}", self.addr))?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            self.conn = Some((BufReader::new(reader), writer));
        }
        let (reader, writer) = self.conn.as_mut().expect("connection was just established");

        let mut line = serde_json::to_string(body)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        let n = reader.read_line(&mut reply).await?;
        if n == 0 {
            bail!("server closed the connection");
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}
