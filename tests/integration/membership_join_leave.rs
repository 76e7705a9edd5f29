//! Membership: join handshake and dead-peer eviction.

use mesh_test_utils::{spawn_cluster, wait_until};
use std::time::Duration;

#[tokio::test]
async fn join_builds_symmetric_rosters() {
    let (leader, followers) = spawn_cluster(2).await;

    // Quiescent cluster: every node's peer set is everyone else.
    let mut all_urls = vec![leader.url()];
    all_urls.extend(followers.iter().map(|f| f.url()));
    all_urls.sort();

    for node in followers.iter().map(|f| &f.node).chain([&leader.node]) {
        let mut seen = node.peer_urls();
        seen.push(node.url().to_owned());
        seen.sort();
        assert_eq!(seen, all_urls, "roster of {} out of sync", node.url());
    }

    // Followers adopted the node that answered their join as leader.
    for follower in &followers {
        assert_eq!(follower.node.leader_url().as_deref(), Some(leader.node.url()));
        assert!(!follower.node.is_leader());
    }
    assert!(leader.node.is_leader());

    for node in followers {
        node.shutdown();
    }
    leader.shutdown();
}

#[tokio::test]
async fn dead_peers_are_evicted_cluster_wide() {
    let (leader, mut followers) = spawn_cluster(2).await;

    let victim = followers.remove(0);
    let victim_url = victim.url();
    victim.shutdown();

    // The 1 s failure detector notices the dead listener on both survivors.
    wait_until(Duration::from_secs(4), "victim eviction", || {
        !leader.node.peer_urls().contains(&victim_url)
            && !followers[0].node.peer_urls().contains(&victim_url)
    })
    .await;

    // The survivor roster is otherwise intact.
    assert!(leader.node.peer_urls().contains(&followers[0].url()));
    assert!(followers[0].node.peer_urls().contains(&leader.url()));

    for node in followers {
        node.shutdown();
    }
    leader.shutdown();
}
