//! Switchboard: a clustered, address-indexed event bus.
//!
//! Handlers register under string addresses; producers `send` (one handler
//! receives, round-robin across the cluster) or `publish` (every handler
//! receives). A delivery may carry a reply address, so request/response is
//! the same mechanism pointed back at the sender.
//!
//! # Core Concepts
//!
//! - **Addresses**: UTF-8 strings; the only routing key there is.
//! - **Subscription map**: a distributed multi-map from address to the
//!   nodes hosting handlers, supplied by a pluggable cluster manager
//!   (`switchboard-cluster`).
//! - **Contexts**: every handler is bound to a serial execution lane at
//!   registration; its deliveries never interleave.
//! - **Lazy peer connections**: one outbound TCP connection per remote
//!   node, created on first use, kept alive with ping/pong and rebuilt on
//!   the next send after a failure.
//!
//! # Architecture
//!
//! ```text
//! send/publish ──► dispatch engine ──► handler registry (local delivery)
//!                      │                      ▲
//!                      │ subs.get()           │ receive_message
//!                      ▼                      │
//!              subscription map        inbound server ◄── TCP ◄──┐
//!                      │                                         │
//!                      └──► connection pool ──► TCP ─────────────┘
//!                            (per-peer, lazy, ping/pong)
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use switchboard::{BusConfig, EventBus, Message};
//! use switchboard_cluster::LocalCluster;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = LocalCluster::new();
//!     let bus = EventBus::start_clustered(BusConfig::default(), cluster.manager()).await?;
//!
//!     let registration = bus.register_handler("greetings", |msg: Message| {
//!         msg.reply(format!("hello, {:?}", msg.body()));
//!     })?;
//!     registration.completion().await?;
//!
//!     bus.send_with_timeout("greetings", "world", Duration::from_secs(1), |reply| {
//!         println!("{reply:?}");
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;

mod context;
mod pool;
mod registry;
mod server;
mod wire;

pub use body::Body;
pub use bus::{EventBus, Registration};
pub use codec::{JsonCodec, MessageCodec};
pub use config::BusConfig;
pub use error::{BusError, ReplyError, WireError};
pub use message::{Message, MessageHandler, ReplyResult};
