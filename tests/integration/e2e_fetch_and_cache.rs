//! End-to-end fetch pipeline: client → leader → peer → stub upstream →
//! leader cache → client.
//!
//! Covers body and header fidelity, upstream status propagation, the cache
//! hit path (no second upstream fetch), and the synthetic 502 when the
//! peer's upstream fetch fails.

use mesh_protocol::ProxiedResponse;
use mesh_test_utils::{spawn_cluster, wait_until};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

fn proxy_client(addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{addr}")).expect("proxy url"))
        .build()
        .expect("client")
}

#[tokio::test]
async fn two_node_fetch_preserves_body_and_headers() {
    let (leader, followers) = spawn_cluster(1).await;
    let follower = &followers[0];
    follower
        .fetcher
        .respond_ok("ok.example/", &[("X-Test", "y")], "hi");

    let client = proxy_client(leader.node.public_addr().expect("public endpoint"));
    let response = client
        .get("http://ok.example/")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-test")
            .and_then(|v| v.to_str().ok()),
        Some("y")
    );
    assert_eq!(response.text().await.expect("body"), "hi");
    assert_eq!(follower.fetcher.fetch_count(), 1);

    for node in followers {
        node.shutdown();
    }
    leader.shutdown();
}

#[tokio::test]
async fn repeated_requests_are_served_from_the_leader_cache() {
    let (leader, followers) = spawn_cluster(1).await;
    let follower = &followers[0];
    follower.fetcher.respond_ok("ok.example/", &[], "cached");

    let client = proxy_client(leader.node.public_addr().expect("public endpoint"));
    for _ in 0..3 {
        let response = client
            .get("http://ok.example/")
            .send()
            .await
            .expect("request");
        assert_eq!(response.text().await.expect("body"), "cached");
    }

    // Only the first request crossed the cluster; the rest hit the cache.
    assert_eq!(follower.fetcher.fetch_count(), 1);

    for node in followers {
        node.shutdown();
    }
    leader.shutdown();
}

#[tokio::test]
async fn upstream_status_codes_reach_the_client() {
    let (leader, followers) = spawn_cluster(1).await;
    followers[0].fetcher.insert(ProxiedResponse {
        status: "404 Not Found".to_owned(),
        request_url: "missing.example/gone".to_owned(),
        header: HashMap::new(),
        body: b"nope".to_vec(),
        content_length: 4,
    });

    let client = proxy_client(leader.node.public_addr().expect("public endpoint"));
    let response = client
        .get("http://missing.example/gone")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.expect("body"), "nope");

    for node in followers {
        node.shutdown();
    }
    leader.shutdown();
}

#[tokio::test]
async fn failed_upstream_fetch_becomes_a_502() {
    let (leader, followers) = spawn_cluster(1).await;
    // Nothing scripted for this url: the peer's fetch fails and it answers
    // with a synthetic 502 instead of crashing or going silent.
    let client = proxy_client(leader.node.public_addr().expect("public endpoint"));
    let response = client
        .get("http://down.example/")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 502);

    // The peer really was asked.
    wait_until(Duration::from_secs(1), "peer fetch attempt", || {
        followers[0].fetcher.fetch_count() == 1
    })
    .await;

    for node in followers {
        node.shutdown();
    }
    leader.shutdown();
}
