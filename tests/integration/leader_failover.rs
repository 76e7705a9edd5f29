//! Leader death and bully re-election.
//!
//! When the leader's listener goes away, every follower's detector notices
//! within a tick and starts an election. The follower with the highest
//! FNV-1a id wins, multicasts VICTORY, binds its own public endpoint, and
//! the rest adopt it.

use mesh_test_utils::{spawn_cluster, wait_until};
use std::time::Duration;

#[tokio::test]
async fn highest_id_follower_takes_over_when_the_leader_dies() {
    let (leader, mut followers) = spawn_cluster(2).await;
    let old_leader_url = leader.url();
    leader.shutdown();

    // The winner is determined by id, not by start order.
    followers.sort_by_key(|f| f.node.id());
    let loser = followers.remove(0);
    let winner = followers.remove(0);
    assert!(winner.node.id() > loser.node.id());

    wait_until(Duration::from_secs(8), "election to settle", || {
        winner.node.is_leader()
            && winner.node.public_addr().is_some()
            && loser.node.leader_url().as_deref() == Some(winner.node.url())
    })
    .await;

    // The loser did not promote itself; ANSWER is an ack, not a promotion.
    assert!(!loser.node.is_leader());

    // The dead leader is gone from both rosters.
    assert!(!winner.node.peer_urls().contains(&old_leader_url));
    assert!(!loser.node.peer_urls().contains(&old_leader_url));

    winner.shutdown();
    loser.shutdown();
}

#[tokio::test]
async fn single_survivor_elects_itself() {
    let (leader, mut followers) = spawn_cluster(1).await;
    let survivor = followers.remove(0);
    leader.shutdown();

    wait_until(Duration::from_secs(8), "self-election", || {
        survivor.node.is_leader() && survivor.node.public_addr().is_some()
    })
    .await;
    assert_eq!(
        survivor.node.leader_url().as_deref(),
        Some(survivor.node.url())
    );
    assert!(survivor.node.peer_urls().is_empty());

    survivor.shutdown();
}
