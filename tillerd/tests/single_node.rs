//! End-to-end tests against a single node over loopback TCP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;
use tiller::Config;
use tillerd::client::Client;
use tillerd::client::Response;
use tillerd::App;
use tillerd::NodeOpts;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use walstore::Value;

/// Bind a listener on an ephemeral port and launch a one-node cluster on it.
async fn start_node() -> Result<(Arc<App>, String, TempDir)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let dir = TempDir::new()?;
    let opts = NodeOpts {
        id: "t1".to_string(),
        addr: addr.clone(),
        peers: vec![],
        data_dir: dir.path().to_path_buf(),
    };
    let config = Arc::new(Config::build("e2e".into()).validate()?);
    let app = tillerd::bootstrap(&opts, config)?;
    tokio::spawn(tillerd::run(app.clone(), listener));

    // Wait for the node to elect itself and open the read barrier.
    app.raft.wait(Some(Duration::from_secs(3))).applied(1, "self-election").await?;
    Ok((app, addr, dir))
}

/// Set, get, delete, get-after-delete.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn set_get_delete_round_trip() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    let res = client.set("foo", Value::String("bar".into())).await?;
    assert_eq!(res, Response::Success(json!("ok")));

    let res = client.get("foo").await?;
    assert_eq!(res, Response::Success(json!("bar")));

    let res = client.delete("foo").await?;
    assert_eq!(res, Response::Success(json!("ok")));

    let res = client.get("foo").await?;
    assert_eq!(res, Response::Error("not found".to_string()));
    Ok(())
}

/// INCR against a string reports a type mismatch and changes nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn incr_type_mismatch() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    client.set("k", Value::String("hello".into())).await?;
    let res = client.incr("k", 1).await?;
    match res {
        Response::Error(message) => assert!(message.contains("type mismatch"), "got {:?}", message),
        other => panic!("expected a type mismatch error, got {:?}", other),
    }
    assert_eq!(client.get("k").await?, Response::Success(json!("hello")));
    Ok(())
}

/// INCR creates absent keys at zero and returns the new value.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn incr_counts_from_zero() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    assert_eq!(client.incr("n", 3).await?, Response::Success(json!(3)));
    assert_eq!(client.incr("n", -1).await?, Response::Success(json!(2)));
    Ok(())
}

/// BULK_SET lands all pairs.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn bulk_set_round_trip() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    client.bulk_set(&[("a", Value::Integer(1)), ("b", Value::Integer(2))]).await?;
    assert_eq!(client.get("a").await?, Response::Success(json!(1)));
    assert_eq!(client.get("b").await?, Response::Success(json!(2)));
    Ok(())
}

/// A map value with a single `city` field.
fn city(name: &str) -> Value {
    Value::Map(BTreeMap::from([("city".to_string(), Value::String(name.to_string()))]))
}

/// Search commands are served from the index fed by applied mutations.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn search_finds_written_documents() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    client.set("doc1", Value::String("the raft consensus algorithm".into())).await?;
    client.set("doc2", Value::String("cooking with cast iron".into())).await?;

    let res = client.search("consensus", 5).await?.into_result()?;
    let hits = res.as_array().expect("search result is an array");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["key"], "doc1");
    Ok(())
}

/// Semantic search ranks documents by similarity to the query, not by exact
/// term overlap alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn semantic_search_prefers_similar_documents() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    client.set("doc1", Value::String("distributed consensus protocol".into())).await?;
    client.set("doc2", Value::String("cooking pasta recipes".into())).await?;

    let res = client.semantic_search("consensus protocol design", 5).await?.into_result()?;
    let hits = res.as_array().expect("search result is an array");
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["key"], "doc1");
    assert!(hits.iter().all(|hit| hit["key"] != "doc2"));
    Ok(())
}

/// The full field-index lifecycle over the wire: querying an unregistered
/// field is an error, creation backfills from existing state, and later
/// mutations keep the index current.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn field_indexes_are_created_and_queried() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;
    let mut client = Client::new(&addr);

    client.set("u1", city("oslo")).await?;
    client.set("u2", city("bergen")).await?;

    // No index yet.
    match client.query_index("city", Value::String("oslo".into())).await? {
        Response::Error(message) => assert!(message.contains("no index"), "got {:?}", message),
        other => panic!("expected an error for an unregistered field, got {:?}", other),
    }

    // Creation backfills from the existing state.
    assert_eq!(client.create_index("city").await?, Response::Success(json!("ok")));
    assert_eq!(
        client.query_index("city", Value::String("oslo".into())).await?,
        Response::Success(json!(["u1"]))
    );

    // Later writes and deletes maintain the index.
    client.set("u3", city("oslo")).await?;
    assert_eq!(
        client.query_index("city", Value::String("oslo".into())).await?,
        Response::Success(json!(["u1", "u3"]))
    );
    client.delete("u1").await?;
    assert_eq!(
        client.query_index("city", Value::String("oslo".into())).await?,
        Response::Success(json!(["u3"]))
    );

    // A registered field with no matching value yields an empty set.
    assert_eq!(
        client.query_index("city", Value::String("tromso".into())).await?,
        Response::Success(json!([]))
    );
    Ok(())
}

/// A created field index survives a restart: the registration is persisted
/// alongside the hard state, and the views refill as the recovered log
/// re-applies.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn restart_preserves_created_indexes() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let dir = TempDir::new()?;
    let opts = NodeOpts {
        id: "t1".to_string(),
        addr: addr.clone(),
        peers: vec![],
        data_dir: dir.path().to_path_buf(),
    };
    let config = Arc::new(Config::build("e2e".into()).validate()?);

    {
        let app = tillerd::bootstrap(&opts, config.clone())?;
        let serve = tokio::spawn(tillerd::run(app.clone(), listener));
        app.raft.wait(Some(Duration::from_secs(3))).applied(1, "self-election").await?;

        let mut client = Client::new(&addr);
        client.set("u1", city("oslo")).await?.into_result()?;
        client.set("doc1", Value::String("searchable text".into())).await?.into_result()?;
        client.create_index("city").await?.into_result()?;
        assert_eq!(
            client.query_index("city", Value::String("oslo".into())).await?,
            Response::Success(json!(["u1"]))
        );

        app.raft.shutdown().await?;
        serve.abort();
    }

    // Reopen on the same data directory and port.
    let listener = TcpListener::bind(&addr).await?;
    let app = tillerd::bootstrap(&opts, config)?;
    tokio::spawn(tillerd::run(app.clone(), listener));

    let mut client = Client::new(&addr);
    // A read first: once it succeeds, the recovered log has re-applied and
    // the views are current.
    assert_eq!(client.get("u1").await?, Response::Success(json!({"city": "oslo"})));
    assert_eq!(
        client.query_index("city", Value::String("oslo".into())).await?,
        Response::Success(json!(["u1"]))
    );
    let res = client.search("searchable", 5).await?.into_result()?;
    assert_eq!(res.as_array().expect("search result is an array")[0]["key"], "doc1");
    Ok(())
}

/// Malformed requests get an error response and the connection stays open.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn malformed_requests_keep_the_connection_open() -> Result<()> {
    let (_app, addr, _dir) = start_node().await?;

    let stream = TcpStream::connect(&addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"this is not json\n").await?;
    let reply: serde_json::Value = serde_json::from_str(&lines.next_line().await?.unwrap())?;
    assert_eq!(reply["status"], "error");

    writer.write_all(b"{\"no_command\": true}\n").await?;
    let reply: serde_json::Value = serde_json::from_str(&lines.next_line().await?.unwrap())?;
    assert_eq!(reply["status"], "error");

    // The same connection still serves well-formed requests, in order.
    writer
        .write_all(b"{\"command\":\"SET\",\"key\":\"x\",\"value\":1}\n{\"command\":\"GET\",\"key\":\"x\"}\n")
        .await?;
    let reply: serde_json::Value = serde_json::from_str(&lines.next_line().await?.unwrap())?;
    assert_eq!(reply["status"], "success");
    let reply: serde_json::Value = serde_json::from_str(&lines.next_line().await?.unwrap())?;
    assert_eq!(reply["result"], 1);
    Ok(())
}

/// Restarting the node recovers acknowledged writes from the WAL.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn restart_recovers_acknowledged_writes() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let dir = TempDir::new()?;
    let opts = NodeOpts {
        id: "t1".to_string(),
        addr: addr.clone(),
        peers: vec![],
        data_dir: dir.path().to_path_buf(),
    };
    let config = Arc::new(Config::build("e2e".into()).validate()?);

    {
        let app = tillerd::bootstrap(&opts, config.clone())?;
        let serve = tokio::spawn(tillerd::run(app.clone(), listener));
        app.raft.wait(Some(Duration::from_secs(3))).applied(1, "self-election").await?;

        let mut client = Client::new(&addr);
        client.set("durable", Value::Integer(7)).await?.into_result()?;

        app.raft.shutdown().await?;
        serve.abort();
    }

    // Reopen on the same data directory and port.
    let listener = TcpListener::bind(&addr).await?;
    let app = tillerd::bootstrap(&opts, config)?;
    tokio::spawn(tillerd::run(app.clone(), listener));

    let mut client = Client::new(&addr);
    assert_eq!(client.get("durable").await?, Response::Success(json!(7)));
    Ok(())
}
