//! Blocklist behavior on the public surface.
//!
//! A blocked host is answered 200 with the block page, before the cluster
//! is consulted at all, so a single leader with no peers can serve it.

use mesh_test_utils::{spawn_node, test_config};
use std::net::SocketAddr;

/// A client configured to use the leader as its HTTP forward proxy, so
/// requests arrive in absolute form exactly like real proxy traffic.
fn proxy_client(addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{addr}")).expect("proxy url"))
        .build()
        .expect("client")
}

#[tokio::test]
async fn blocked_hosts_get_the_block_page() {
    let mut config = test_config();
    config.blocked_hosts.insert("evil.example".to_owned());
    let leader = spawn_node(true, config).await;
    let addr = leader.node.public_addr().expect("public endpoint");

    let response = proxy_client(addr)
        .get("http://evil.example/x")
        .send()
        .await
        .expect("request");

    // 200 with the block page, not a 403: the block is a page, not an
    // HTTP-level refusal.
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "Site is blocked!\n");

    // No upstream fetch can have happened anywhere.
    assert_eq!(leader.fetcher.fetch_count(), 0);
    leader.shutdown();
}

#[tokio::test]
async fn unblocked_hosts_are_not_caught_by_the_blocklist() {
    let mut config = test_config();
    config.blocked_hosts.insert("evil.example".to_owned());
    config.request_timeout_secs = 1;
    let leader = spawn_node(true, config).await;
    let addr = leader.node.public_addr().expect("public endpoint");

    // No peers, so a non-blocked host falls through to the rendezvous
    // timeout, but it must NOT get the block page.
    let response = proxy_client(addr)
        .get("http://ok.example/x")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 504);
    leader.shutdown();
}
