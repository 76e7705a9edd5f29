//! Node configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//!
//! # Recognized options
//! - `public_url`: bind address for the leader's client-facing endpoint
//! - `cache_timeout_secs`: TTL for cached upstream responses
//! - `request_timeout_secs`: how long a client handler waits for a peer
//!   response before answering 504
//! - `fetch_timeout_secs`: optional deadline for the upstream fetch
//! - `blocklist_file`: one host per line; `#` comments and blanks ignored
//!
//! A relative `blocklist_file` resolves against the config file's directory.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config type
// ---------------------------------------------------------------------------

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub public_url: String,
    pub cache_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub fetch_timeout_secs: Option<u64>,
    /// Hosts answered with the block message instead of being proxied.
    pub blocked_hosts: HashSet<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            public_url: "0.0.0.0:8080".to_owned(),
            cache_timeout_secs: 60,
            request_timeout_secs: 30,
            fetch_timeout_secs: None,
            blocked_hosts: HashSet::new(),
        }
    }
}

impl ProxyConfig {
    /// True if requests for `host` must be refused. Blocklist entries are
    /// bare hostnames, so any `:port` suffix on the request host is ignored.
    pub fn is_blocked(&self, host: &str) -> bool {
        let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);
        self.blocked_hosts.contains(bare) || self.blocked_hosts.contains(host)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    public_url: Option<String>,
    cache_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    blocklist_file: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str, path)
}

/// Load config from a TOML string. `config_file_path` anchors relative
/// blocklist paths.
pub fn load_config_from_str(
    toml_str: &str,
    config_file_path: &Path,
) -> Result<ProxyConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = ProxyConfig::default();

    let blocked_hosts = match raw.blocklist_file {
        None => HashSet::new(),
        Some(file) => {
            let mut path = std::path::PathBuf::from(&file);
            if path.is_relative() {
                if let Some(parent) = config_file_path.parent() {
                    path = parent.join(path);
                }
            }
            read_blocklist(&path)?
        }
    };

    Ok(ProxyConfig {
        public_url: raw.public_url.unwrap_or(defaults.public_url),
        cache_timeout_secs: raw.cache_timeout_secs.unwrap_or(defaults.cache_timeout_secs),
        request_timeout_secs: raw
            .request_timeout_secs
            .unwrap_or(defaults.request_timeout_secs),
        fetch_timeout_secs: raw.fetch_timeout_secs,
        blocked_hosts,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Blocklist reader
// ---------------------------------------------------------------------------

fn read_blocklist(path: &Path) -> Result<HashSet<String>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading blocklist '{}': {}", path.display(), e)))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
