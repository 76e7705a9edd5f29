//! TCP transport between peers.
//!
//! One message per connection: the sender writes the whole frame, shuts the
//! write half down, and the receiver reads to EOF. A connect failure is the
//! cluster's dead-peer signal: `dial` reports it as `false` and the caller
//! evicts the peer.
//!
//! The messenger also owns the frame-dedup table. Re-multicast flooding
//! delivers the same frame several times within a short window; a frame's
//! FNV-1a hash suppresses every copy after the first for [`DEDUP_WINDOW_SECS`]
//! seconds, after which the hash is pruned and the frame would dispatch again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// How long a frame hash suppresses duplicate deliveries.
pub const DEDUP_WINDOW_SECS: i64 = 1;

pub struct Messenger {
    listener: TcpListener,
    local_addr: SocketAddr,
    recent_hashes: Mutex<HashMap<u32, DateTime<Utc>>>,
}

impl Messenger {
    /// Bind the peer listener. Failure here is fatal at startup; the caller
    /// exits nonzero.
    pub async fn bind(url: &str) -> std::io::Result<Messenger> {
        let listener = TcpListener::bind(url).await?;
        let local_addr = listener.local_addr()?;
        Ok(Messenger {
            listener,
            local_addr,
            recent_hashes: Mutex::new(HashMap::new()),
        })
    }

    /// The bound peer address (useful when port 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound connection. The caller spawns a task per
    /// connection so a slow sender never blocks the acceptor.
    pub async fn accept(&self) -> std::io::Result<TcpStream> {
        let (stream, _peer) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Read one frame: everything the sender wrote before closing.
    pub async fn read_frame(mut stream: TcpStream) -> std::io::Result<Vec<u8>> {
        let mut frame = Vec::new();
        stream.read_to_end(&mut frame).await?;
        Ok(frame)
    }

    /// Deliver `frame` to `url`. Returns `false` when the peer cannot be
    /// reached (connect failure) or the write is cut short; either way the
    /// frame was not delivered and the peer should be treated as gone.
    pub async fn dial(&self, url: &str, frame: &[u8]) -> bool {
        let mut stream = match TcpStream::connect(url).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%url, error = %e, "dial failed");
                return false;
            }
        };
        if let Err(e) = stream.write_all(frame).await {
            warn!(%url, error = %e, "write failed after dial");
            return false;
        }
        if let Err(e) = stream.shutdown().await {
            warn!(%url, error = %e, "shutdown failed after write");
            return false;
        }
        true
    }

    /// Liveness probe: can a TCP connection be opened to `url` right now?
    pub async fn probe(url: &str) -> bool {
        TcpStream::connect(url).await.is_ok()
    }

    /// Record a frame sighting. Prunes hashes older than the dedup window,
    /// then returns `true` (and remembers `hash` with the frame's own
    /// timestamp) only if the frame has not been seen inside the window.
    pub fn observe(&self, hash: u32, timestamp: DateTime<Utc>) -> bool {
        let cutoff = Utc::now() - Duration::seconds(DEDUP_WINDOW_SECS);
        let mut recent = self.recent_hashes.lock().unwrap();
        recent.retain(|_, seen_at| *seen_at > cutoff);
        if recent.contains_key(&hash) {
            return false;
        }
        recent.insert(hash, timestamp);
        true
    }
}
