mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use tiller::Config;
use tiller::State;

/// A single-node cluster elects itself and serves linearizable reads once
/// its first blank entry has committed.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn single_node_becomes_leader() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1"]);

    let raft = router.new_raft_node("n1").await;

    let leader = router.wait_for_leader(Duration::from_secs(2), "single node elects itself").await?;
    assert_eq!(leader, "n1");

    // The blank entry of the new term commits and applies, opening the read barrier.
    raft.wait(Some(Duration::from_secs(2))).applied(1, "blank entry applied").await?;
    raft.client_read().await?;
    Ok(())
}

/// Three nodes with no traffic converge on exactly one leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_elect_exactly_one_leader() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);

    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }

    router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    // Let the cluster settle, then check leadership is unique.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let leaders = router.current_leaders().await;
    assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
    Ok(())
}

/// Killing the leader makes the remaining majority elect a new one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surviving_nodes_elect_new_leader_after_leader_dies() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);

    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let old_leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    router.remove_node(&old_leader).await;

    let new_leader = router.wait_for_leader(Duration::from_secs(3), "election after leader death").await?;
    assert_ne!(new_leader, old_leader);

    // The new leader serves writes with just two of three nodes alive.
    let res = router.client_write(&new_leader, "after-failover", walstore::Value::Integer(1)).await;
    assert!(res.is_ok(), "write after failover failed: {:?}", res.err());
    Ok(())
}

/// A deposed candidate returns to follower when it sees a legitimate leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_settles_into_one_leader_and_followers() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config, ["n1", "n2", "n3"]);

    for id in ["n1", "n2", "n3"] {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    for id in ["n1", "n2", "n3"] {
        if id != leader {
            let raft = router.get_raft_handle(id).await?;
            raft.wait(Some(Duration::from_secs(2))).state(State::Follower, "settles as follower").await?;
            raft.wait(Some(Duration::from_secs(2)))
                .current_leader(leader.clone(), "knows the leader")
                .await?;
        }
    }
    Ok(())
}
