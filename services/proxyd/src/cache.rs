//! Response cache: `request_url → page` with absolute expiry.
//!
//! Unbounded, lazily evicted on lookup, no background sweep. A TTL of zero
//! makes every lookup miss, which disables caching without a separate flag.
//! Concurrent access is serialized by the node's cache lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mesh_protocol::ProxiedResponse;

/// A cached upstream response, shared between the cache and any client
/// handlers waiting on the same url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    /// Upstream status line, e.g. `"200 OK"`; propagated to clients.
    pub status: String,
    pub header: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl CachedPage {
    /// Numeric status code parsed from the status line.
    pub fn status_code(&self) -> u16 {
        self.status
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .unwrap_or(200)
    }
}

impl From<ProxiedResponse> for CachedPage {
    fn from(res: ProxiedResponse) -> Self {
        CachedPage {
            status: res.status,
            header: res.header,
            body: res.body,
        }
    }
}

#[derive(Debug, Default)]
pub struct LocalCache {
    entries: HashMap<String, (Arc<CachedPage>, DateTime<Utc>)>,
}

impl LocalCache {
    pub fn new() -> Self {
        LocalCache::default()
    }

    /// Look up `url`. An entry at or past its expiry is removed and treated
    /// as absent.
    pub fn get(&mut self, url: &str) -> Option<Arc<CachedPage>> {
        let expired = match self.entries.get(url) {
            None => return None,
            Some((_, expires_at)) => Utc::now() >= *expires_at,
        };
        if expired {
            self.entries.remove(url);
            return None;
        }
        self.entries.get(url).map(|(page, _)| Arc::clone(page))
    }

    /// Store `page` under `url`, expiring `ttl_secs` from now.
    pub fn set(&mut self, url: String, page: Arc<CachedPage>, ttl_secs: u64) {
        let ttl = Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        self.entries.insert(url, (page, Utc::now() + ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
