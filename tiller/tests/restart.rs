mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use tiller::Config;
use walstore::Value;

/// Durability across a full-cluster crash: every acknowledged write is still
/// present after all nodes restart from their WALs and re-elect.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_restart_preserves_acknowledged_writes() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let members = ["n1", "n2", "n3"];
    let router = RaftRouter::new(config, members);
    for id in members {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    let mut last_index = 0;
    for i in 0..5 {
        let res = router
            .client_write(&leader, &format!("key{}", i), Value::Integer(i))
            .await
            .expect("write failed");
        last_index = res.index;
    }
    router.wait_for_applied(last_index, Duration::from_secs(3), "all nodes applied").await?;

    // Simultaneous crash: every node goes down, then comes back from disk.
    for id in members {
        router.remove_node(id).await;
    }
    for id in members {
        router.restart_node(id).await;
    }

    // The new term's blank entry commits, which re-commits (and re-applies)
    // the recovered log on every node.
    router.wait_for_leader(Duration::from_secs(3), "election after restart").await?;
    router.wait_for_applied(last_index + 1, Duration::from_secs(5), "recovered entries re-applied").await?;
    router.assert_consistent_state("after full-cluster restart").await;

    for id in members {
        let store = router.get_storage_handle(id).await?;
        for i in 0..5 {
            assert_eq!(
                store.get(&format!("key{}", i)).await,
                Some(Value::Integer(i)),
                "{} lost key{} across restart",
                id,
                i
            );
        }
    }
    Ok(())
}

/// A restarted follower that missed writes catches up from the leader's log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_follower_catches_up() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test".into()).validate()?);
    let members = ["n1", "n2", "n3"];
    let router = RaftRouter::new(config, members);
    for id in members {
        router.new_raft_node(id).await;
    }
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    let follower = members.iter().find(|id| **id != leader).unwrap().to_string();
    router.remove_node(&follower).await;

    // The cluster keeps committing with the follower down.
    let mut last_index = 0;
    for i in 0..5 {
        let res = router
            .client_write(&leader, &format!("key{}", i), Value::Integer(i))
            .await
            .expect("write with node down failed");
        last_index = res.index;
    }

    // On return, replication backfills the missed entries.
    let raft = router.restart_node(&follower).await;
    raft.wait(Some(Duration::from_secs(5))).applied(last_index, "follower caught up").await?;

    let store = router.get_storage_handle(&follower).await?;
    assert_eq!(store.get("key4").await, Some(Value::Integer(4)));
    Ok(())
}
