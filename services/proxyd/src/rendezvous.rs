//! Rendezvous between client handlers and arriving peer responses.
//!
//! Each in-flight `request_url` gets its own broadcast channel: handlers
//! subscribe before fanning the request out, and the first response for that
//! url wakes exactly the handlers waiting on it. Handlers for other urls are
//! never woken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::CachedPage;

// One response per url is ever sent before the channel is torn down, so the
// buffer only needs to absorb that single value.
const CHANNEL_CAP: usize = 4;

#[derive(Default)]
pub struct ResponseWaiters {
    inner: Mutex<HashMap<String, broadcast::Sender<Arc<CachedPage>>>>,
}

impl ResponseWaiters {
    pub fn new() -> Self {
        ResponseWaiters::default()
    }

    /// Register interest in the response for `url`. Concurrent handlers for
    /// the same url share one channel.
    pub fn subscribe(&self, url: &str) -> broadcast::Receiver<Arc<CachedPage>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(url) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(CHANNEL_CAP);
                inner.insert(url.to_owned(), tx);
                rx
            }
        }
    }

    /// Wake every handler waiting on `url` with the arrived page and drop
    /// the channel. Returns how many handlers were woken.
    pub fn complete(&self, url: &str, page: Arc<CachedPage>) -> usize {
        let sender = self.inner.lock().unwrap().remove(url);
        match sender {
            Some(tx) => tx.send(page).unwrap_or(0),
            None => {
                debug!(%url, "response arrived with no waiting handlers");
                0
            }
        }
    }

    /// Drop the channel for `url` if no handler is subscribed anymore.
    /// Handlers call this after timing out so abandoned urls do not pile up.
    pub fn forget_if_idle(&self, url: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.get(url) {
            if tx.receiver_count() == 0 {
                inner.remove(url);
            }
        }
    }

    /// Number of urls with at least one waiting handler.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
