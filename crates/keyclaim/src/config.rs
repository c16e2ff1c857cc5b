//! network and claim configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// one node of the threshold network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// node url
    pub url: String,
    /// stable node identifier
    pub id: String,
}

impl NodeEndpoint {
    pub fn new(url: impl Into<String>, id: impl Into<String>) -> Self {
        Self { url: url.into(), id: id.into() }
    }
}

/// target network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// network name, embedded in handshakes and signed messages
    pub name: String,
    /// node set to fan out to
    pub nodes: Vec<NodeEndpoint>,
    /// minimum agreeing/responsive nodes for any distributed result
    pub quorum: usize,
    /// connect barrier timeout
    pub connect_timeout: Duration,
    /// per-call deadline for remote execution
    pub execute_deadline: Duration,
}

impl NetworkConfig {
    /// three local dev nodes, 2-of-3
    pub fn localhost() -> Self {
        Self {
            name: "localdev".into(),
            nodes: vec![
                NodeEndpoint::new("http://localhost:7101", "node-1"),
                NodeEndpoint::new("http://localhost:7102", "node-2"),
                NodeEndpoint::new("http://localhost:7103", "node-3"),
            ],
            quorum: 2,
            connect_timeout: Duration::from_secs(10),
            execute_deadline: Duration::from_secs(30),
        }
    }

    /// rotko test network, 2-of-3
    pub fn rotko_testnet() -> Self {
        Self {
            name: "rotko-testnet".into(),
            nodes: vec![
                NodeEndpoint::new("https://keynode1.rotko.net", "keynode-1"),
                NodeEndpoint::new("https://keynode2.rotko.net", "keynode-2"),
                NodeEndpoint::new("https://keynode3.rotko.net", "keynode-3"),
            ],
            quorum: 2,
            connect_timeout: Duration::from_secs(10),
            execute_deadline: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::InvalidConfig("empty node set".into()));
        }
        if self.quorum == 0 || self.quorum > self.nodes.len() {
            return Err(Error::InvalidConfig(format!(
                "quorum {} out of range for {} nodes",
                self.quorum,
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

/// settings for one claim flow
#[derive(Clone, Debug)]
pub struct ClaimConfig {
    /// session credential lifetime
    pub session_lifetime: chrono::Duration,
    /// overall deadline for reaching quorum on the claim
    pub claim_deadline: Duration,
    /// bounded retries for retryable failures; each retry re-issues
    /// fresh session credentials
    pub max_attempts: u32,
    /// sign-in uri embedded in session messages
    pub session_uri: String,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            session_lifetime: chrono::Duration::hours(24),
            claim_deadline: Duration::from_secs(60),
            max_attempts: 3,
            session_uri: "keyclaim:session".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        NetworkConfig::localhost().validate().unwrap();
        NetworkConfig::rotko_testnet().validate().unwrap();
    }

    #[test]
    fn test_quorum_bounds() {
        let mut config = NetworkConfig::localhost();
        config.quorum = 4;
        assert!(config.validate().is_err());

        config.quorum = 0;
        assert!(config.validate().is_err());

        config.nodes.clear();
        config.quorum = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_claim_defaults() {
        let config = ClaimConfig::default();
        assert_eq!(config.session_lifetime, chrono::Duration::hours(24));
        assert!(config.max_attempts >= 1);
    }
}
