//! Cluster node: membership roster, frame dispatch, fan-out, and the
//! leader-side client request path.
//!
//! One node owns one messenger, one cache, one peer roster, and one waiter
//! table. Inbound frames are dispatched over the typed payload after the
//! dedup check; every handler runs in its own task so the acceptor is never
//! blocked.
//!
//! # Locks
//! Peers, cache, leader state, and the dedup table each sit behind their own
//! lock, and no lock is held across network I/O. The one ordering rule that
//! matters: a client handler subscribes to the waiter table *while still
//! holding the cache lock*, so a response can never slip between the cache
//! miss and the subscription.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use mesh_protocol::{fnv1a_32, Envelope, Payload, ProxiedRequest, ProxiedResponse};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedPage, LocalCache};
use crate::config::ProxyConfig;
use crate::election;
use crate::fetcher::{bad_gateway, UpstreamFetcher};
use crate::http;
use crate::messenger::Messenger;
use crate::rendezvous::ResponseWaiters;

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

/// Immutable identity of a cluster member. The id is FNV-1a of the url, so
/// two peers with the same url are the same node and every member computes
/// the same ordering for elections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub url: String,
    pub id: u32,
}

impl NodeInfo {
    pub fn new(host: &str, port: u16) -> Self {
        let url = format!("{host}:{port}");
        let id = fnv1a_32(url.as_bytes());
        NodeInfo {
            host: host.to_owned(),
            port,
            url,
            id,
        }
    }

    /// Parse a `host:port` url as received on the wire. `None` for anything
    /// that cannot name a peer.
    pub fn parse(url: &str) -> Option<NodeInfo> {
        let (host, port) = url.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port: u16 = port.parse().ok()?;
        Some(NodeInfo::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// PeerList
// ---------------------------------------------------------------------------

/// Roster of known peers (self excluded) plus the round-robin cursor used
/// for fan-out. Removal swap-removes; order is not meaningful.
#[derive(Debug, Default)]
pub struct PeerList {
    peers: Vec<NodeInfo>,
    cursor: usize,
}

impl PeerList {
    pub fn contains_url(&self, url: &str) -> bool {
        self.peers.iter().any(|p| p.url == url)
    }

    /// Add a peer; `false` if the url is already present.
    pub fn add(&mut self, info: NodeInfo) -> bool {
        if self.contains_url(&info.url) {
            return false;
        }
        self.peers.push(info);
        true
    }

    /// Remove by url; `false` if absent.
    pub fn remove_url(&mut self, url: &str) -> bool {
        match self.peers.iter().position(|p| p.url == url) {
            Some(idx) => {
                self.peers.swap_remove(idx);
                if !self.peers.is_empty() {
                    self.cursor %= self.peers.len();
                }
                true
            }
            None => false,
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.url.clone()).collect()
    }

    /// Advance the cursor and return every peer url starting from it, so a
    /// fan-out tries successive peers in round-robin order.
    pub fn rotation(&mut self) -> Vec<String> {
        let len = self.peers.len();
        if len == 0 {
            return Vec::new();
        }
        self.cursor = (self.cursor + 1) % len;
        (0..len)
            .map(|i| self.peers[(self.cursor + i) % len].url.clone())
            .collect()
    }

    /// Urls of peers whose id outranks `id` (the bully election targets).
    pub fn higher_than(&self, id: u32) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.id > id)
            .map(|p| p.url.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Leader state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LeaderState {
    /// Unknown until a JOIN_NOTIFY or VICTORY names one (or we are it).
    leader_url: Option<String>,
    is_leader: bool,
}

// ---------------------------------------------------------------------------
// Client request outcome
// ---------------------------------------------------------------------------

/// What the public HTTP surface should answer.
#[derive(Debug)]
pub enum ClientOutcome {
    /// Host is on the blocklist.
    Blocked,
    /// A cached or freshly-arrived upstream response.
    Page(Arc<CachedPage>),
    /// No response arrived within `request_timeout_secs`.
    TimedOut,
}

// ---------------------------------------------------------------------------
// ProxyNode
// ---------------------------------------------------------------------------

/// Errors surfaced to the startup path.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Codec(#[from] mesh_protocol::CodecError),
    #[error("bootstrap node {0} is unreachable")]
    Unreachable(String),
}

pub struct ProxyNode {
    pub(crate) config: ProxyConfig,
    info: NodeInfo,
    messenger: Messenger,
    fetcher: Arc<dyn UpstreamFetcher>,
    peers: Mutex<PeerList>,
    cache: Mutex<LocalCache>,
    waiters: ResponseWaiters,
    leader: RwLock<LeaderState>,
    pub(crate) public_endpoint: OnceLock<SocketAddr>,
    pub(crate) endpoint_starting: AtomicBool,
    /// Long-lived tasks (acceptor, detector, public endpoint), recorded so
    /// `shutdown` can abort them and release the listener sockets.
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyNode {
    pub fn new(
        info: NodeInfo,
        config: ProxyConfig,
        messenger: Messenger,
        fetcher: Arc<dyn UpstreamFetcher>,
        is_leader: bool,
    ) -> Arc<ProxyNode> {
        let leader_url = is_leader.then(|| info.url.clone());
        Arc::new(ProxyNode {
            config,
            info,
            messenger,
            fetcher,
            peers: Mutex::new(PeerList::default()),
            cache: Mutex::new(LocalCache::new()),
            waiters: ResponseWaiters::new(),
            leader: RwLock::new(LeaderState {
                leader_url,
                is_leader,
            }),
            public_endpoint: OnceLock::new(),
            endpoint_starting: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the acceptor and the failure detector.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(accept_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(election::run_failure_detector(Arc::clone(self))));
    }

    /// Abort every long-lived task. Once the last `Arc` drops, the peer
    /// listener closes and the rest of the cluster sees this node as dead,
    /// which is exactly how the integration suites kill a node.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn is_leader(&self) -> bool {
        self.leader.read().unwrap().is_leader
    }

    pub fn leader_url(&self) -> Option<String> {
        self.leader.read().unwrap().leader_url.clone()
    }

    pub fn peer_urls(&self) -> Vec<String> {
        self.peers.lock().unwrap().urls()
    }

    /// Where the public HTTP endpoint is bound, once it is.
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public_endpoint.get().copied()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Announce this node to an existing cluster member. The recipient adds
    /// us and floods a JOIN_NOTIFY with the full roster, which is how we
    /// learn the other peers and the leader.
    pub async fn join_cluster(&self, bootstrap_url: &str) -> Result<(), NodeError> {
        let frame = Envelope::new(
            self.info.url.clone(),
            Payload::JoinRequest {
                url: self.info.url.clone(),
            },
        )
        .encode()?;
        if !self.messenger.dial(bootstrap_url, &frame).await {
            return Err(NodeError::Unreachable(bootstrap_url.to_owned()));
        }
        info!(bootstrap = %bootstrap_url, "join request sent");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frame intake
    // -----------------------------------------------------------------------

    /// Decode, dedup, dispatch. Malformed frames are dropped; so are our own
    /// flooded frames and anything already seen inside the dedup window.
    pub async fn handle_frame(self: &Arc<Self>, frame: Vec<u8>) {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, len = frame.len(), "discarding malformed frame");
                return;
            }
        };
        if envelope.sender_url == self.info.url {
            return;
        }
        if !self.messenger.observe(fnv1a_32(&frame), envelope.timestamp) {
            return;
        }
        self.dispatch(envelope, frame).await;
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope, raw: Vec<u8>) {
        let sender = envelope.sender_url;
        match envelope.payload {
            Payload::Unicast(data) => {
                info!(from = %sender, data = %String::from_utf8_lossy(&data), "unicast received");
            }
            Payload::Multicast(_) => {
                // Flood-fill: every copy re-floods verbatim, dedup bounds it.
                self.multicast(raw).await;
            }
            Payload::JoinRequest { url } => self.handle_join_request(&url).await,
            Payload::JoinNotify { urls } => {
                self.multicast(raw).await;
                self.handle_join_notify(&sender, &urls);
            }
            Payload::LeaveNotify { url } => {
                if self.remove_peer(&url) {
                    info!(%url, "peer left the cluster");
                }
                self.multicast(raw).await;
            }
            Payload::HttpRequest(request) => self.handle_fanned_request(request).await,
            Payload::HttpResponse(response) => self.handle_peer_response(response),
            Payload::Election => {
                info!(from = %sender, "election requested");
                self.start_election().await;
            }
            Payload::Victory => self.handle_victory(&sender).await,
            Payload::Answer => {
                info!(from = %sender, "leadership acknowledged");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    fn add_peer(&self, info: NodeInfo) -> bool {
        self.peers.lock().unwrap().add(info)
    }

    fn remove_peer(&self, url: &str) -> bool {
        self.peers.lock().unwrap().remove_url(url)
    }

    async fn handle_join_request(&self, url: &str) {
        let Some(info) = NodeInfo::parse(url) else {
            warn!(%url, "ignoring malformed join request");
            return;
        };
        if self.add_peer(info) {
            info!(%url, "peer joined");
        }
        // Announce the full roster, self first.
        let mut urls = vec![self.info.url.clone()];
        urls.extend(self.peers.lock().unwrap().urls());
        self.multicast_payload(Payload::JoinNotify { urls }).await;
    }

    fn handle_join_notify(&self, sender: &str, urls: &[String]) {
        for url in urls {
            if url == &self.info.url {
                continue;
            }
            match NodeInfo::parse(url) {
                Some(info) => {
                    if self.add_peer(info) {
                        info!(%url, "peer joined");
                    }
                }
                None => warn!(%url, "ignoring malformed peer url in join notify"),
            }
        }
        let mut leader = self.leader.write().unwrap();
        if leader.leader_url.is_none() {
            leader.leader_url = Some(sender.to_owned());
            info!(leader = %sender, "adopted join sender as leader");
        }
    }

    /// Drop `url` from the roster and tell the cluster, if it was a peer.
    pub(crate) async fn evict_and_notify(&self, url: &str) {
        if !self.remove_peer(url) {
            return;
        }
        warn!(%url, "peer unreachable, evicted");
        self.multicast_payload(Payload::LeaveNotify {
            url: url.to_owned(),
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Deliver to one peer; a failed dial evicts it from the roster and
    /// notifies the cluster.
    pub(crate) async fn unicast(&self, url: &str, frame: &[u8]) -> bool {
        if self.messenger.dial(url, frame).await {
            return true;
        }
        self.evict_and_notify(url).await;
        false
    }

    pub(crate) async fn unicast_payload(&self, url: &str, payload: Payload) -> bool {
        match Envelope::new(self.info.url.clone(), payload).encode() {
            Ok(frame) => self.unicast(url, &frame).await,
            Err(e) => {
                error!(error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    /// Deliver to every current peer, each attempted once. Unreachable
    /// peers are evicted and their LEAVE_NOTIFY frames queued onto the same
    /// pass, so the notification cascade stays iterative and terminates:
    /// every queued frame corresponds to a peer that just left the roster.
    pub(crate) async fn multicast(&self, frame: Vec<u8>) {
        let mut pending = vec![frame];
        while let Some(frame) = pending.pop() {
            let targets = self.peers.lock().unwrap().urls();
            let mut failed = Vec::new();
            for url in targets {
                if !self.messenger.dial(&url, &frame).await {
                    failed.push(url);
                }
            }
            for url in failed {
                if self.remove_peer(&url) {
                    warn!(%url, "peer unreachable, evicted");
                    let leave = Envelope::new(
                        self.info.url.clone(),
                        Payload::LeaveNotify { url },
                    );
                    match leave.encode() {
                        Ok(bytes) => pending.push(bytes),
                        Err(e) => error!(error = %e, "failed to encode leave notification"),
                    }
                }
            }
        }
    }

    pub(crate) async fn multicast_payload(&self, payload: Payload) {
        match Envelope::new(self.info.url.clone(), payload).encode() {
            Ok(frame) => self.multicast(frame).await,
            Err(e) => error!(error = %e, "failed to encode outbound message"),
        }
    }

    // -----------------------------------------------------------------------
    // Peer side: perform the upstream fetch
    // -----------------------------------------------------------------------

    async fn handle_fanned_request(&self, request: ProxiedRequest) {
        info!(method = %request.method, url = %request.request_url, "fetching upstream");
        let response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.request_url, error = %e, "upstream fetch failed, answering 502");
                bad_gateway(&request.request_url, &e.to_string())
            }
        };
        let leader = self.leader.read().unwrap().leader_url.clone();
        match leader {
            Some(url) => {
                self.unicast_payload(&url, Payload::HttpResponse(response))
                    .await;
            }
            None => warn!(url = %request.request_url, "no known leader to return the response to"),
        }
    }

    // -----------------------------------------------------------------------
    // Leader side: response arrival and the client path
    // -----------------------------------------------------------------------

    fn handle_peer_response(&self, response: ProxiedResponse) {
        let url = response.request_url.clone();
        let page = Arc::new(CachedPage::from(response));
        self.cache.lock().unwrap().set(
            url.clone(),
            Arc::clone(&page),
            self.config.cache_timeout_secs,
        );
        let woken = self.waiters.complete(&url, page);
        debug!(%url, woken, "peer response cached");
    }

    /// The full leader path for one client request: blocklist, cache,
    /// fan-out, rendezvous.
    pub async fn handle_client_request(&self, request: ProxiedRequest) -> ClientOutcome {
        let host = request.request_url.split('/').next().unwrap_or("");
        if self.config.is_blocked(host) {
            info!(%host, "blocked site");
            return ClientOutcome::Blocked;
        }

        let mut rx = {
            let mut cache = self.cache.lock().unwrap();
            if let Some(page) = cache.get(&request.request_url) {
                debug!(url = %request.request_url, "cache hit");
                return ClientOutcome::Page(page);
            }
            // Subscribe while still holding the cache lock: a response
            // landing after this point must find the subscription.
            self.waiters.subscribe(&request.request_url)
        };

        self.fan_out(&request).await;

        let deadline = Duration::from_secs(self.config.request_timeout_secs);
        let arrival = tokio::time::timeout(deadline, rx.recv()).await;
        drop(rx);
        match arrival {
            Ok(Ok(page)) => ClientOutcome::Page(page),
            Ok(Err(_)) => {
                // Channel torn down without a value reaching this waiter;
                // the response may still have made it into the cache.
                match self.cache.lock().unwrap().get(&request.request_url) {
                    Some(page) => ClientOutcome::Page(page),
                    None => ClientOutcome::TimedOut,
                }
            }
            Err(_) => {
                warn!(url = %request.request_url, "no peer response within deadline");
                self.waiters.forget_if_idle(&request.request_url);
                ClientOutcome::TimedOut
            }
        }
    }

    /// Hand the request to one peer, trying successive peers round-robin
    /// until a dial lands. All-failed is not fatal: the caller keeps
    /// waiting, since a late response could still satisfy the url.
    async fn fan_out(&self, request: &ProxiedRequest) {
        let envelope = Envelope::new(
            self.info.url.clone(),
            Payload::HttpRequest(request.clone()),
        );
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to encode fan-out request");
                return;
            }
        };
        let targets = self.peers.lock().unwrap().rotation();
        if targets.is_empty() {
            warn!(url = %request.request_url, "no peers to forward to");
            return;
        }
        for url in targets {
            if self.messenger.dial(&url, &frame).await {
                debug!(peer = %url, url = %request.request_url, "request forwarded");
                return;
            }
            self.evict_and_notify(&url).await;
        }
        warn!(url = %request.request_url, "every peer failed; waiting for a late response");
    }

    // -----------------------------------------------------------------------
    // Leadership
    // -----------------------------------------------------------------------

    /// Bully election: challenge every higher-id peer; with none left to
    /// defer to, claim leadership outright.
    pub(crate) async fn start_election(self: &Arc<Self>) {
        let higher = self.peers.lock().unwrap().higher_than(self.info.id);
        if higher.is_empty() {
            info!("no peer outranks this node, claiming leadership");
            self.become_leader().await;
            return;
        }
        for url in higher {
            self.unicast_payload(&url, Payload::Election).await;
        }
    }

    pub(crate) async fn become_leader(self: &Arc<Self>) {
        {
            let mut leader = self.leader.write().unwrap();
            leader.is_leader = true;
            leader.leader_url = Some(self.info.url.clone());
        }
        self.multicast_payload(Payload::Victory).await;
        if let Err(e) = http::ensure_public_endpoint(self).await {
            error!(error = %e, "failed to bind the public endpoint");
        }
        info!("this node is now the leader");
    }

    async fn handle_victory(self: &Arc<Self>, sender: &str) {
        {
            let mut leader = self.leader.write().unwrap();
            leader.leader_url = Some(sender.to_owned());
        }
        // Acknowledgment only; promotion is the victor's own act.
        self.unicast_payload(sender, Payload::Answer).await;
        info!(leader = %sender, "new leader elected");
    }

    // -----------------------------------------------------------------------
    // Failure detection hooks (driven by the 1 s ticker)
    // -----------------------------------------------------------------------

    /// Probe every peer point-to-point; unreachable peers are evicted and
    /// announced.
    pub(crate) async fn probe_peers(&self) {
        let urls = self.peers.lock().unwrap().urls();
        for url in urls {
            if !Messenger::probe(&url).await {
                self.evict_and_notify(&url).await;
            }
        }
    }

    /// Probe the leader and start an election if it is gone. The stale
    /// adoption is kept until a VICTORY replaces it, so every following
    /// tick re-triggers the election until one resolves. That retry is
    /// what rides out challenged peers dying mid-election.
    pub(crate) async fn check_leader(self: &Arc<Self>) {
        let target = {
            let leader = self.leader.read().unwrap();
            if leader.is_leader {
                None
            } else {
                leader.leader_url.clone()
            }
        };
        let Some(url) = target else { return };
        if Messenger::probe(&url).await {
            return;
        }
        warn!(leader = %url, "leader unreachable, starting election");
        self.start_election().await;
    }
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

async fn accept_loop(node: Arc<ProxyNode>) {
    loop {
        match node.messenger.accept().await {
            Ok(stream) => {
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    match Messenger::read_frame(stream).await {
                        Ok(frame) => node.handle_frame(frame).await,
                        Err(e) => debug!(error = %e, "failed to read inbound frame"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
