//! Failure detection driving bully re-election.
//!
//! A 1-second ticker probes every peer point-to-point (a bare TCP connect)
//! and evicts unreachable ones, which bounds how long a dead peer lingers in
//! any roster. Non-leaders additionally probe the leader; a failed leader
//! probe clears the adoption and starts an election.
//!
//! The election itself lives on [`ProxyNode`]: challenge every peer with a
//! higher FNV-1a id, and claim leadership by multicasting VICTORY when no
//! such peer exists. VICTORY recipients adopt the sender and answer; the
//! ANSWER is an acknowledgment with no side effect.

use std::sync::Arc;
use std::time::Duration;

use crate::node::ProxyNode;

/// How often the detector ticks. Also bounds how quickly a dead leader is
/// noticed, so the re-election scenarios settle within a couple of seconds.
pub const TICK: Duration = Duration::from_secs(1);

pub async fn run_failure_detector(node: Arc<ProxyNode>) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a freshly-started node
    // isn't probing before its join request has even gone out.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        node.probe_peers().await;
        node.check_leader().await;
    }
}
