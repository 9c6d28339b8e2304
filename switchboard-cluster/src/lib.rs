//! Cluster SPI for the switchboard event bus.
//!
//! A clustered bus needs three things from its environment: an identity for
//! each member, a distributed multi-map to publish handler subscriptions
//! into, and membership notifications. This crate defines those seams
//! ([`ClusterManager`], [`AsyncMultiMap`], [`NodeListener`]) together with
//! the value types that cross them ([`NodeId`], [`ChoosableSet`]), plus an
//! in-process backend ([`LocalCluster`]) for tests and single-process
//! deployments.
//!
//! Production backends (a gossip- or KV-store-based manager) implement the
//! same traits and plug into the bus unchanged.

pub mod choosable;
pub mod local;
pub mod manager;
pub mod node;

pub use choosable::ChoosableSet;
pub use local::{LocalCluster, LocalClusterManager, LocalMultiMap};
pub use manager::{AsyncMultiMap, ClusterError, ClusterManager, NodeListener};
pub use node::{NodeId, NodeIdError};
