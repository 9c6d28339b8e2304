//! Node identity for cluster members.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors related to NodeId parsing.
#[derive(Debug, Error)]
pub enum NodeIdError {
    /// Invalid NodeId format.
    #[error("Invalid NodeId format (expected 'host:port')")]
    InvalidFormat,

    /// Port is not a valid u16.
    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Identifies a node in the cluster by its network address.
///
/// Two nodes are equal iff host and port match. The identity is assigned
/// once the bus listener is bound (so a wildcard port resolves to the
/// actual bound port), possibly overridden by an operator-supplied public
/// host/port.
///
/// # Format
///
/// `host:port` where host can be IPv4, IPv6, or hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    host: String,
    port: u16,
}

impl NodeId {
    /// Create a NodeId from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a NodeId from `host:port` form.
    ///
    /// The port is taken from the last colon so IPv6 hosts with bracket
    /// notation parse correctly.
    ///
    /// # Errors
    ///
    /// Returns `NodeIdError::InvalidFormat` if there is no colon separator,
    /// `NodeIdError::InvalidPort` if the port is not a valid u16.
    pub fn parse(s: &str) -> Result<Self, NodeIdError> {
        let idx = s.rfind(':').ok_or(NodeIdError::InvalidFormat)?;
        let (host, port) = s.split_at(idx);
        if host.is_empty() {
            return Err(NodeIdError::InvalidFormat);
        }
        let port = port[1..]
            .parse::<u16>()
            .map_err(|_| NodeIdError::InvalidPort(port[1..].to_string()))?;
        Ok(Self {
            host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
            port,
        })
    }

    /// Build a NodeId from a bound socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Host portion.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port portion.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_creation() {
        let node = NodeId::new("127.0.0.1", 5000);
        assert_eq!(node.host(), "127.0.0.1");
        assert_eq!(node.port(), 5000);
        assert_eq!(node.to_string(), "127.0.0.1:5000");
    }

    #[test]
    fn test_node_id_parse() {
        let node = NodeId::parse("192.168.1.100:8080").unwrap();
        assert_eq!(node.host(), "192.168.1.100");
        assert_eq!(node.port(), 8080);
    }

    #[test]
    fn test_node_id_parse_hostname() {
        let node = NodeId::parse("node1.cluster.local:5000").unwrap();
        assert_eq!(node.host(), "node1.cluster.local");
        assert_eq!(node.port(), 5000);
    }

    #[test]
    fn test_node_id_parse_invalid() {
        assert!(NodeId::parse("invalid").is_err());
        assert!(NodeId::parse(":5000").is_err());
        assert!(NodeId::parse("host:99999").is_err());
        assert!(NodeId::parse("host:abc").is_err());
    }

    #[test]
    fn test_node_id_equality() {
        let a = NodeId::new("localhost", 1);
        let b = NodeId::new("localhost", 1);
        let c = NodeId::new("localhost", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_node_id_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let node = NodeId::from_socket_addr(addr);
        assert_eq!(node.to_string(), "127.0.0.1:5000");
    }
}
