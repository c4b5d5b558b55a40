mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use tiller::error::ClientWriteError;
use tiller::raft::ClientWriteRequest;
use tiller::raft::EntryPayload;
use tiller::Config;
use tiller::RaftStorage;
use walstore::ApplyError;
use walstore::Command;
use walstore::KvRequest;
use walstore::KvResponse;
use walstore::Value;

/// Writes through the leader land, durably and identically, in every
/// follower's log and state machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_replicate_to_all_followers() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    let mut last_index = 0;
    for i in 0..10 {
        let res = router
            .client_write(&leader, &format!("key{}", i), Value::Integer(i))
            .await
            .expect("write through leader failed");
        assert!(res.index > last_index, "indexes must be handed out in order");
        last_index = res.index;
    }

    router.wait_for_applied(last_index, Duration::from_secs(3), "all nodes applied").await?;
    router.assert_consistent_state("after replicated writes").await;

    // Spot-check a follower's log: the entry at the acknowledged index holds
    // the same command the leader proposed.
    let follower = router.members().iter().find(|id| **id != leader).unwrap();
    let store = router.get_storage_handle(follower).await?;
    let entry = store.try_get_log_entry(last_index).await?.expect("entry missing on follower");
    match &entry.payload {
        EntryPayload::Normal(normal) => {
            assert_eq!(
                normal.data.command,
                Command::Set {
                    key: "key9".to_string(),
                    value: Value::Integer(9)
                }
            );
        }
        other => panic!("unexpected payload at index {}: {:?}", last_index, other),
    }
    Ok(())
}

/// A write sent to a follower is bounced back with the leader's identity.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_to_follower_is_redirected() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    let follower = router.members().iter().find(|id| **id != leader).unwrap().clone();
    let raft = router.get_raft_handle(&follower).await?;
    raft.wait(Some(Duration::from_secs(2)))
        .current_leader(leader.clone(), "follower learns the leader")
        .await?;

    let res = router.client_write(&follower, "nope", Value::Integer(0)).await;
    match res {
        Err(ClientWriteError::ForwardToLeader(data, Some(hint))) => {
            assert_eq!(hint, leader);
            assert_eq!(
                data.command,
                Command::Set {
                    key: "nope".to_string(),
                    value: Value::Integer(0)
                }
            );
        }
        other => panic!("expected a redirect, got {:?}", other.map(|r| r.index)),
    }
    Ok(())
}

/// INCR against a non-integer reports a type mismatch to the caller and
/// leaves the state untouched; the entry itself still commits.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn incr_type_mismatch_is_reported_not_applied() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1"]);
    let raft = router.new_raft_node("n1").await;
    router.wait_for_leader(Duration::from_secs(2), "single node elects itself").await?;

    router.client_write("n1", "k", Value::String("hello".into())).await.expect("set failed");

    let res = raft
        .client_write(ClientWriteRequest::new(KvRequest::new(Command::Incr {
            key: "k".to_string(),
            amount: 1,
        })))
        .await
        .expect("incr must commit even when it fails at apply time");
    assert_eq!(res.data, KvResponse::Err(ApplyError::TypeMismatch { key: "k".to_string() }));

    let store = router.get_storage_handle("n1").await?;
    assert_eq!(store.get("k").await, Some(Value::String("hello".into())));
    Ok(())
}

/// A batch of concurrent writes all succeed and apply in index order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_apply_in_index_order() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;
    let raft = router.get_raft_handle(&leader).await?;

    let mut handles = Vec::new();
    for i in 0..20 {
        let raft = raft.clone();
        handles.push(tokio::spawn(async move {
            raft.client_write(ClientWriteRequest::new(KvRequest::new(Command::Incr {
                key: "counter".to_string(),
                amount: 1,
            })))
            .await
            .map(|res| (res.index, i))
        }));
    }
    let mut indexes = Vec::new();
    for handle in handles {
        let (index, _) = handle.await?.expect("concurrent write failed");
        indexes.push(index);
    }
    indexes.sort_unstable();
    indexes.dedup();
    assert_eq!(indexes.len(), 20, "every write got a distinct log index");

    let store = router.get_storage_handle(&leader).await?;
    assert_eq!(store.get("counter").await, Some(Value::Integer(20)));
    Ok(())
}
