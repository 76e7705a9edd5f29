//! Rendezvous deadline: a leader with no reachable peers answers 504
//! instead of parking the client forever.

use mesh_test_utils::{spawn_node, test_config};
use std::net::SocketAddr;

fn proxy_client(addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{addr}")).expect("proxy url"))
        .build()
        .expect("client")
}

#[tokio::test]
async fn peerless_leader_times_out_with_504() {
    let mut config = test_config();
    config.request_timeout_secs = 1;
    let leader = spawn_node(true, config).await;
    let addr = leader.node.public_addr().expect("public endpoint");

    let started = std::time::Instant::now();
    let response = proxy_client(addr)
        .get("http://ok.example/")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 504);
    assert!(response.text().await.expect("body").is_empty());
    // The deadline actually bounded the wait.
    assert!(started.elapsed() < std::time::Duration::from_secs(3));

    leader.shutdown();
}
