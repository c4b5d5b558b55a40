mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use tiller::error::ClientReadError;
use tiller::Config;

/// The leader serves linearizable reads once its own blank entry has
/// committed and applied; followers bounce reads to the leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_are_served_by_the_leader_only() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    // The read barrier opens once the blank entry applies on the leader.
    let leader_raft = router.get_raft_handle(&leader).await?;
    leader_raft.wait(Some(Duration::from_secs(2))).applied(1, "read barrier").await?;
    leader_raft.client_read().await?;

    // Followers redirect, naming the leader once they have learned it.
    let follower = router.members().iter().find(|id| **id != leader).unwrap().clone();
    let follower_raft = router.get_raft_handle(&follower).await?;
    follower_raft
        .wait(Some(Duration::from_secs(2)))
        .current_leader(leader.clone(), "follower learns the leader")
        .await?;
    match follower_raft.client_read().await {
        Err(ClientReadError::ForwardToLeader(Some(hint))) => assert_eq!(hint, leader),
        other => panic!("expected a redirect, got {:?}", other),
    }
    Ok(())
}

/// A read acknowledged by the leader reflects every previously acknowledged
/// write (the write-then-read round trip of a single client).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acknowledged_writes_are_visible_to_reads() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);
    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;
    let raft = router.get_raft_handle(&leader).await?;
    let store = router.get_storage_handle(&leader).await?;

    for i in 0..5 {
        router.client_write(&leader, "k", walstore::Value::Integer(i)).await.expect("write failed");
        raft.client_read().await?;
        assert_eq!(store.get("k").await, Some(walstore::Value::Integer(i)));
    }
    Ok(())
}
