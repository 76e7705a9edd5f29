// mesh-test-utils: shared fixtures for the cluster integration suites.
//
// Provides a deterministic upstream fetcher and an in-process node harness
// so the end-to-end scenarios can spin whole clusters on 127.0.0.1 without
// touching the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mesh_protocol::{ProxiedRequest, ProxiedResponse};
use proxyd::{FetchError, Messenger, NodeInfo, ProxyConfig, ProxyNode, UpstreamFetcher};

// ---------------------------------------------------------------------------
// StubFetcher
// ---------------------------------------------------------------------------

/// Scripted upstream: `request_url → response`, with a fetch counter so
/// tests can assert that cache hits never reach upstream. An unscripted url
/// fails the fetch, which is how the 502 path is exercised.
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, ProxiedResponse>>,
    fetches: AtomicUsize,
}

impl StubFetcher {
    pub fn new() -> Self {
        StubFetcher::default()
    }

    /// Script a 200 response with one header and a body for `request_url`.
    pub fn respond_ok(&self, request_url: &str, header: &[(&str, &str)], body: &str) {
        let mut header_map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in header {
            header_map
                .entry((*name).to_owned())
                .or_default()
                .push((*value).to_owned());
        }
        self.insert(ProxiedResponse {
            status: "200 OK".to_owned(),
            request_url: request_url.to_owned(),
            header: header_map,
            body: body.as_bytes().to_vec(),
            content_length: body.len() as i64,
        });
    }

    /// Script an arbitrary response, keyed by its `request_url`.
    pub fn insert(&self, response: ProxiedResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(response.request_url.clone(), response);
    }

    /// How many fetches reached this upstream.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamFetcher for StubFetcher {
    async fn fetch(&self, request: &ProxiedRequest) -> Result<ProxiedResponse, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().unwrap().get(&request.request_url) {
            Some(response) => Ok(response.clone()),
            None => Err(FetchError::Transport(format!(
                "no scripted response for {}",
                request.request_url
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Node harness
// ---------------------------------------------------------------------------

/// An in-process node plus its scripted upstream.
pub struct TestNode {
    pub node: Arc<ProxyNode>,
    pub fetcher: Arc<StubFetcher>,
}

impl TestNode {
    pub fn url(&self) -> String {
        self.node.url().to_owned()
    }

    /// Kill the node: abort its tasks and drop the last `Arc`, closing the
    /// peer listener so the rest of the cluster sees it as dead.
    pub fn shutdown(self) {
        self.node.shutdown();
    }
}

/// Config suited to in-process clusters: ephemeral public port, short
/// request deadline so failure scenarios settle quickly.
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        public_url: "127.0.0.1:0".to_owned(),
        cache_timeout_secs: 60,
        request_timeout_secs: 5,
        fetch_timeout_secs: None,
        blocked_hosts: Default::default(),
    }
}

/// Bind a node on an ephemeral port and start its background tasks. A
/// leader also binds its public endpoint; its address is available via
/// `node.public_addr()`.
pub async fn spawn_node(is_leader: bool, config: ProxyConfig) -> TestNode {
    let fetcher = Arc::new(StubFetcher::new());
    let messenger = Messenger::bind("127.0.0.1:0")
        .await
        .expect("bind peer listener");
    let port = messenger.local_addr().port();
    let info = NodeInfo::new("127.0.0.1", port);
    let node = ProxyNode::new(
        info,
        config,
        messenger,
        Arc::clone(&fetcher) as Arc<dyn UpstreamFetcher>,
        is_leader,
    );
    if is_leader {
        proxyd::http::ensure_public_endpoint(&node)
            .await
            .expect("bind public endpoint");
    }
    node.start();
    TestNode { node, fetcher }
}

/// Spawn a leader plus `followers` joined nodes and wait until every roster
/// has settled (each node sees all the others).
pub async fn spawn_cluster(followers: usize) -> (TestNode, Vec<TestNode>) {
    let leader = spawn_node(true, test_config()).await;
    let mut nodes = Vec::with_capacity(followers);
    for _ in 0..followers {
        let follower = spawn_node(false, test_config()).await;
        follower
            .node
            .join_cluster(&leader.url())
            .await
            .expect("join cluster");
        nodes.push(follower);
    }

    wait_until(Duration::from_secs(5), "cluster rosters to settle", || {
        let all_see_everyone = nodes.iter().all(|follower| {
            follower.node.peer_urls().len() == followers
                && follower.node.leader_url().as_deref() == Some(leader.node.url())
        });
        leader.node.peer_urls().len() == followers && all_see_everyone
    })
    .await;

    (leader, nodes)
}

/// Poll `predicate` until it holds or `deadline` passes; panics with `what`
/// on timeout.
pub async fn wait_until<F: Fn() -> bool>(deadline: Duration, what: &str, predicate: F) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
