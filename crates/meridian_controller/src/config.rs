//! Controller settings and connection-string handling.
//!
//! The comma-separated connection string names every controller replica and
//! doubles as the cluster identity: replicas with different connection
//! strings refuse to join each other.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::node::NodeDefinition;

/// Runtime settings for one controller replica.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Comma-separated `host:port` list of all controller replicas.
    pub connection_string: String,
    /// Hostname this replica advertises to peers.
    pub node_name: String,
    /// Listen port; `node_name:port` must appear in the connection string.
    pub port: u16,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Chunk split threshold advertised to storage nodes by the primary.
    pub max_chunk_item_count: u32,
    pub redundant_nodes_per_location: u32,
    /// Reserved for the web console; carried but unused by this node.
    pub web_interface_port: u16,
    /// Bounds for the randomized reconciler interval.
    pub reconcile_min: Duration,
    pub reconcile_max: Duration,
}

/// The settings subset exchanged during admission. Controllers must agree on
/// all three fields; query and storage peers only on the connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilitySettings {
    pub connection_string: String,
    pub max_chunk_item_count: u32,
    pub redundant_nodes_per_location: u32,
}

impl ControllerSettings {
    pub fn self_node(&self) -> NodeDefinition {
        NodeDefinition::new(self.node_name.clone(), self.port)
    }

    pub fn controllers(&self) -> anyhow::Result<Vec<NodeDefinition>> {
        parse_connection_string(&self.connection_string)
    }

    /// Parse the controller set and check this replica belongs to it.
    /// Startup must treat any error as fatal.
    pub fn validate(&self) -> anyhow::Result<Vec<NodeDefinition>> {
        let controllers = self.controllers()?;
        let me = self.self_node();
        if !controllers.contains(&me) {
            bail!(
                "node {me} is not part of the configured connection string `{}`",
                self.connection_string
            );
        }
        if self.reconcile_min > self.reconcile_max {
            bail!("reconcile interval lower bound exceeds upper bound");
        }
        Ok(controllers)
    }

    pub fn compatibility(&self) -> CompatibilitySettings {
        CompatibilitySettings {
            connection_string: self.connection_string.clone(),
            max_chunk_item_count: self.max_chunk_item_count,
            redundant_nodes_per_location: self.redundant_nodes_per_location,
        }
    }
}

/// Split a comma-separated `host:port` list, preserving declaration order.
pub fn parse_connection_string(raw: &str) -> anyhow::Result<Vec<NodeDefinition>> {
    let mut nodes = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let node = part
            .parse()
            .with_context(|| format!("invalid controller address `{part}`"))?;
        nodes.push(node);
    }
    if nodes.is_empty() {
        bail!("connection string contains no controller addresses");
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(connection_string: &str, node_name: &str, port: u16) -> ControllerSettings {
        ControllerSettings {
            connection_string: connection_string.to_string(),
            node_name: node_name.to_string(),
            port,
            log_level: "info".to_string(),
            max_chunk_item_count: 1000,
            redundant_nodes_per_location: 1,
            web_interface_port: 0,
            reconcile_min: Duration::from_secs(30),
            reconcile_max: Duration::from_secs(120),
        }
    }

    #[test]
    fn parses_in_declaration_order() {
        let nodes = parse_connection_string("b:5101, a:5100 ,c:5102").expect("parse");
        let names: Vec<String> = nodes.iter().map(|n| n.connection_name()).collect();
        assert_eq!(names, ["b:5101", "a:5100", "c:5102"]);
    }

    #[test]
    fn rejects_empty_list() {
        assert!(parse_connection_string(" , ,").is_err());
    }

    #[test]
    fn validate_requires_self_membership() {
        let ok = settings("a:5100,b:5101", "a", 5100);
        assert_eq!(ok.validate().expect("valid").len(), 2);

        let missing = settings("a:5100,b:5101", "c", 5102);
        assert!(missing.validate().is_err());
    }

    #[test]
    fn compatibility_compares_structurally() {
        let a = settings("a:5100,b:5101", "a", 5100);
        let b = settings("a:5100,b:5101", "b", 5101);
        assert_eq!(a.compatibility(), b.compatibility());

        let mut other = settings("a:5100,b:5101", "b", 5101);
        other.max_chunk_item_count = 42;
        assert_ne!(a.compatibility(), other.compatibility());
    }
}
