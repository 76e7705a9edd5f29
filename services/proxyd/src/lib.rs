// proxyd: one node of the distributed caching forward-proxy cluster.
//
// The leader accepts client HTTP traffic, fans each miss out to a peer,
// and caches the responses that come back over the peer wire. Every node
// runs the same membership, dedup, and election machinery; leadership is
// just state plus the bound public endpoint.

pub mod cache;
pub mod config;
pub mod election;
pub mod fetcher;
pub mod http;
pub mod messenger;
pub mod node;
pub mod rendezvous;

pub use cache::{CachedPage, LocalCache};
pub use config::ProxyConfig;
pub use fetcher::{FetchError, HttpFetcher, UpstreamFetcher};
pub use messenger::Messenger;
pub use node::{ClientOutcome, NodeInfo, ProxyNode};
