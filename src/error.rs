//! Error taxonomy for the whole crate.
//!
//! Background tasks never surface errors to callers; they log and continue.
//! Everything here is returned from user-invoked operations only.

use std::net::SocketAddr;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("encode failed: {0}")]
    Encode(postcard::Error),

    #[error("decode failed: {0}")]
    Decode(postcard::Error),

    #[error("unknown message type: {0}")]
    UnknownMessage(u8),

    #[error("encryption is not configured")]
    NoKeyring,

    #[error("invalid key: expected 16, 24 or 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("encrypt failed")]
    Encrypt,

    #[error("no installed key could decrypt the message")]
    Decrypt,

    #[error("remote label {remote:?} does not match local label {local:?}")]
    LabelMismatch { remote: String, local: String },

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("{kind} size {size} exceeds limit {limit}")]
    SizeLimit {
        kind: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("failed to join any of {attempted} addresses: {last}")]
    JoinFailed {
        attempted: usize,
        #[source]
        last: Box<Error>,
    },

    #[error("connect to {addr} timed out")]
    DialTimeout { addr: SocketAddr },

    #[error("leave broadcast not drained within the timeout")]
    LeaveTimeout,

    #[error("node is shut down")]
    Shutdown,

    #[error("node is leaving or has left the cluster")]
    NotAlive,

    #[error("snapshot replay names the local node {0:?}; refusing to start")]
    SnapshotIdentity(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("query {0:?} has already finished")]
    QueryFinished(String),
}
