//! Error types for the event bus.

use switchboard_cluster::ClusterError;
use thiserror::Error;

/// Errors returned synchronously by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been closed.
    #[error("event bus is closed")]
    Closed,

    /// A non-primitive body was sent on a clustered bus with no codec
    /// registered for its type.
    #[error("no codec registered for body type {0}")]
    NoCodec(String),

    /// Binding the inbound listener failed.
    #[error("failed to bind event bus listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Cluster backend failure.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Wire-format failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Failures delivered to a reply handler instead of a reply message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplyError {
    /// The target address has no registered handler anywhere in the
    /// cluster (or on the chosen node, if the subscription view was stale).
    #[error("no handlers registered for address")]
    NoHandlers,

    /// The reply timer fired before a reply arrived.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The receiving handler explicitly signalled failure.
    #[error("recipient failure {code}: {message}")]
    Recipient { code: i32, message: String },
}

/// Errors related to frame encoding and decoding.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame exceeds the maximum permitted size.
    #[error("frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    /// Unknown body type tag in a received frame.
    #[error("invalid body type tag: {0}")]
    InvalidTypeTag(u8),

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A received object body has no codec registered on this node.
    #[error("no codec registered for received body type {0}")]
    UnknownBodyType(String),

    /// A user codec failed to encode or decode.
    #[error("codec failed: {0}")]
    Codec(String),

    /// JSON body encoding or decoding failed.
    #[error("JSON body error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
