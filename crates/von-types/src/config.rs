//! Node configuration types.
//!
//! Every section defaults, so an empty TOML document is a valid config.

use crate::address::{Address, DEFAULT_PORT};
use crate::error::{VonError, VonResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration of a VON node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Socket address the listener binds to.
    pub listen: SocketAddr,
    /// Address advertised to peers (`host:port`). Derived from `listen` when unset.
    pub advertise: Option<String>,
    /// Protocol timeouts and limits.
    pub protocol: ProtocolConfig,
    /// Logging output.
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise: None,
            protocol: ProtocolConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Config for a node listening on an ephemeral loopback port.
    pub fn loopback() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// Parse the configured advertised address, if any.
    pub fn advertised_address(&self) -> VonResult<Option<Address>> {
        self.advertise.as_deref().map(str::parse).transpose()
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> VonResult<()> {
        self.advertised_address()?;
        let p = &self.protocol;
        if p.request_attempts == 0 {
            return Err(VonError::Config("protocol.request_attempts must be >= 1".into()));
        }
        if p.request_timeout_ms == 0 || p.connect_timeout_ms == 0 || p.join_timeout_ms == 0 {
            return Err(VonError::Config("protocol timeouts must be non-zero".into()));
        }
        if p.max_message_size < 64 {
            return Err(VonError::Config(format!(
                "protocol.max_message_size too small: {}",
                p.max_message_size
            )));
        }
        Ok(())
    }
}

/// How point forwarding picks the next hop when this node does not own the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardRule {
    /// The neighbor whose site is closest to this node.
    #[default]
    NearestToSelf,
    /// The neighbor whose site is closest to the target point.
    NearestToTarget,
}

/// Timeouts, retry policy and limits for the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long to wait for each correlated reply.
    pub request_timeout_ms: u64,
    /// Total send attempts per request before it is abandoned.
    pub request_attempts: u32,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Upper bound on a whole join, from JOIN until neighbor discovery completes.
    pub join_timeout_ms: u64,
    /// Largest accepted frame body in bytes.
    pub max_message_size: u32,
    /// Next-hop selection for point forwarding.
    pub forward_rule: ForwardRule,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            request_attempts: 2,
            connect_timeout_ms: 3_000,
            join_timeout_ms: 30_000,
            max_message_size: 16 * 1024 * 1024,
            forward_rule: ForwardRule::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Log output settings, consumed by the node binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (`RUST_LOG` overrides it).
    pub level: String,
    /// Write logs to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.protocol.request_attempts, 2);
        assert_eq!(config.protocol.forward_rule, ForwardRule::NearestToSelf);
        assert_eq!(config.log.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen, NodeConfig::default().listen);
        assert!(config.advertise.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: NodeConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:9100"
            advertise = "node-a.example:9100"

            [protocol]
            request_timeout_ms = 250
            forward_rule = "nearest-to-target"

            [log]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(
            config.advertised_address().unwrap(),
            Some(Address::new("node-a.example", 9100))
        );
        assert_eq!(config.protocol.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.protocol.request_attempts, 2);
        assert_eq!(config.protocol.forward_rule, ForwardRule::NearestToTarget);
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = NodeConfig::loopback();
        config.protocol.request_attempts = 0;
        assert!(matches!(config.validate(), Err(VonError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_advertise() {
        let config = NodeConfig {
            advertise: Some("no-port".to_string()),
            ..NodeConfig::loopback()
        };
        assert!(matches!(config.validate(), Err(VonError::InvalidAddress(_))));
    }
}
