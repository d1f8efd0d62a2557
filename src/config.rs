//! Node configuration and validation.
//!
//! Mirrors the original Python `NodeConfig` dataclass: node identity, bind
//! address, a peer map that excludes self, the 2PC vote policy for this
//! node, and the randomized-timeout parameters that drive Raft elections
//! and heartbeats.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors, one variant per rejected shape of `NodeConfig`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("peer map must not contain this node's own id ({0})")]
    SelfInPeers(String),

    #[error("election_timeout_range ({lo:?}, {hi:?}) must satisfy 0 < lo < hi")]
    InvalidElectionRange { lo: Duration, hi: Duration },

    #[error("heartbeat_interval must be greater than zero")]
    ZeroHeartbeatInterval,

    #[error("invalid peers JSON: {0}")]
    InvalidPeersJson(String),
}

/// Static cluster membership and per-node tuning, resolved once at
/// startup. `peers` never contains `node_id` as a key.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub peers: HashMap<String, String>,
    /// Vote cast by this node during the 2PC voting phase.
    pub vote_commit: bool,
    pub election_timeout_range: (Duration, Duration),
    pub heartbeat_interval: Duration,
}

impl NodeConfig {
    /// Build a config with the spec's default timeout ranges.
    pub fn new(
        node_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        peers: HashMap<String, String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            peers,
            vote_commit: true,
            election_timeout_range: (Duration::from_millis(1500), Duration::from_millis(3000)),
            heartbeat_interval: Duration::from_millis(1000),
        }
    }

    /// This node's own `host:port` address, as embedded in other nodes'
    /// peer maps.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configs that violate the invariants documented in SPEC_FULL
    /// §4 (peers excludes self, timeout range is well-formed, heartbeat is
    /// positive).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.contains_key(&self.node_id) {
            return Err(ConfigError::SelfInPeers(self.node_id.clone()));
        }
        let (lo, hi) = self.election_timeout_range;
        if lo.is_zero() || lo >= hi {
            return Err(ConfigError::InvalidElectionRange { lo, hi });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        Ok(())
    }
}

/// Parse a `peer_id -> "host:port"` JSON object as passed to the launcher
/// via `--peers`.
pub fn parse_peers_json(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::InvalidPeersJson(e.to_string()))
}

/// Split a `"host:port"` address into its parts.
pub fn parse_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn valid_config_passes() {
        let cfg = NodeConfig::new("n1", "127.0.0.1", 6000, peers(&[("n2", "127.0.0.1:6001")]));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_self_in_peers() {
        let mut cfg = NodeConfig::new("n1", "127.0.0.1", 6000, HashMap::new());
        cfg.peers.insert("n1".to_string(), "127.0.0.1:6000".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::SelfInPeers(_))));
    }

    #[test]
    fn rejects_inverted_election_range() {
        let mut cfg = NodeConfig::new("n1", "127.0.0.1", 6000, HashMap::new());
        cfg.election_timeout_range = (Duration::from_millis(3000), Duration::from_millis(1500));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidElectionRange { .. })
        ));
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let mut cfg = NodeConfig::new("n1", "127.0.0.1", 6000, HashMap::new());
        cfg.heartbeat_interval = Duration::ZERO;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroHeartbeatInterval)
        ));
    }

    #[test]
    fn address_formats_host_port() {
        let cfg = NodeConfig::new("n1", "127.0.0.1", 6000, HashMap::new());
        assert_eq!(cfg.address(), "127.0.0.1:6000");
    }

    #[test]
    fn parses_peers_json() {
        let parsed = parse_peers_json(r#"{"n2": "127.0.0.1:6001"}"#).unwrap();
        assert_eq!(parsed.get("n2").unwrap(), "127.0.0.1:6001");
    }

    #[test]
    fn rejects_malformed_peers_json() {
        assert!(parse_peers_json("not json").is_err());
    }

    #[test]
    fn parses_target_address() {
        assert_eq!(
            parse_target("127.0.0.1:6001"),
            Some(("127.0.0.1".to_string(), 6001))
        );
        assert_eq!(parse_target("no-port"), None);
    }
}
