//! Peer identity value types.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network identity of a cluster node: an immutable `(hostname, port)` pair.
///
/// The derived connection name `hostname:port` is the total ordering key used
/// wherever the cluster needs a deterministic tie-break, most importantly in
/// primary voting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub host: String,
    pub port: u16,
}

impl NodeDefinition {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `hostname:port`, the cluster-wide ordering key.
    pub fn connection_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl PartialOrd for NodeDefinition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeDefinition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.connection_name().cmp(&other.connection_name())
    }
}

impl FromStr for NodeDefinition {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = raw.rsplit_once(':') else {
            anyhow::bail!("`{raw}` is not a host:port address");
        };
        if host.is_empty() {
            anyhow::bail!("`{raw}` has an empty hostname");
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("`{raw}` has an invalid port"))?;
        Ok(Self::new(host, port))
    }
}

/// Role a peer is classified under once its join handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Controller,
    Query,
    Storage,
    Api,
    Console,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Controller => "controller",
            NodeType::Query => "query",
            NodeType::Storage => "storage",
            NodeType::Api => "api",
            NodeType::Console => "console",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        let node: NodeDefinition = "10.0.0.7:5100".parse().expect("parse");
        assert_eq!(node.host, "10.0.0.7");
        assert_eq!(node.port, 5100);
        assert_eq!(node.connection_name(), "10.0.0.7:5100");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("no-port".parse::<NodeDefinition>().is_err());
        assert!(":5100".parse::<NodeDefinition>().is_err());
        assert!("host:notaport".parse::<NodeDefinition>().is_err());
    }

    #[test]
    fn ordering_follows_connection_name() {
        let a = NodeDefinition::new("alpha", 5100);
        let b = NodeDefinition::new("beta", 5100);
        assert!(a < b);

        // The ordering key is the rendered string, not the numeric port.
        let nine = NodeDefinition::new("host", 9);
        let ten = NodeDefinition::new("host", 10);
        assert!(ten < nine);
    }
}
