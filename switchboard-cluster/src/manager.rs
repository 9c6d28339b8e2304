//! Cluster manager SPI.
//!
//! The event bus talks to the cluster exclusively through these traits:
//! [`ClusterManager`] supplies membership and named multi-maps, and
//! [`AsyncMultiMap`] is the distributed `address -> nodes` mapping the bus
//! stores its subscriptions in. Backends implement both; the bus never
//! assumes a particular technology behind them.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::choosable::ChoosableSet;
use crate::node::NodeId;

/// Errors surfaced by cluster backends.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The manager has not joined the cluster yet (or has left).
    #[error("cluster manager is not joined")]
    NotJoined,

    /// A multi-map operation failed in the backend.
    #[error("cluster map operation failed: {0}")]
    MapOperation(String),

    /// Generic backend failure.
    #[error("cluster operation failed: {0}")]
    OperationFailed(String),
}

/// Callbacks for node-membership changes.
///
/// Member ids are opaque strings assigned by the backend; they are not
/// network addresses.
pub trait NodeListener: Send + Sync {
    /// A member joined the cluster.
    fn node_added(&self, node_id: &str);

    /// A member left the cluster (gracefully or by failure detection).
    fn node_left(&self, node_id: &str);
}

/// Distributed multi-map from string keys to sets of nodes.
///
/// Eventual consistency is acceptable: readers may briefly observe entries
/// for nodes that already removed themselves. Callers maintain the
/// invariant that a node appears under a key iff it has at least one
/// non-local handler registered there.
#[async_trait]
pub trait AsyncMultiMap: Send + Sync {
    /// Add one `(key, value)` occurrence.
    ///
    /// Safe to call repeatedly with the same pair; the map need not
    /// deduplicate.
    async fn add(&self, key: &str, value: NodeId) -> Result<(), ClusterError>;

    /// Remove one `(key, value)` occurrence. Returns whether one was found.
    async fn remove(&self, key: &str, value: &NodeId) -> Result<bool, ClusterError>;

    /// Remove every occurrence of `value` under any key.
    ///
    /// Used for crash recovery when a peer is declared dead; best-effort,
    /// the peer re-registers its entries on reconnect.
    async fn remove_all_for_value(&self, value: &NodeId) -> Result<(), ClusterError>;

    /// Snapshot the set of nodes under `key`.
    async fn get(&self, key: &str) -> Result<ChoosableSet<NodeId>, ClusterError>;
}

/// A pluggable cluster backend.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Join the cluster. Idempotent.
    async fn join(&self) -> Result<(), ClusterError>;

    /// Leave the cluster. Idempotent.
    async fn leave(&self) -> Result<(), ClusterError>;

    /// Obtain the named multi-map.
    fn multi_map(&self, name: &str) -> Result<Arc<dyn AsyncMultiMap>, ClusterError>;

    /// This member's opaque id.
    fn member_id(&self) -> String;

    /// Current member ids, including this one.
    fn members(&self) -> Vec<String>;

    /// Install the membership listener. At most one per manager; a second
    /// call replaces the first.
    fn set_node_listener(&self, listener: Arc<dyn NodeListener>);
}
