//! Decentralized cluster membership, user events, and queries over
//! SWIM-style gossip.
//!
//! A `Cluster` binds a UDP/TCP endpoint, discovers peers through push/pull
//! anti-entropy, detects failures with probe/suspect/confirm rounds, and
//! layers Lamport-ordered join/leave intents, best-effort user events, and
//! deadline-bound queries on top. An optional append-only snapshot lets a
//! restarted node rejoin its previous cluster automatically.

pub mod broadcast;
pub mod cidr;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordinate;
pub mod crypto;
pub mod error;
pub mod keyring;
pub mod membership;
pub mod transport;
pub mod types;
pub mod wire;

mod snapshot;

pub use cluster::{
    Cluster, Event, KeyManager, KeyResponse, MemberEvent, MemberEventKind, NodeResponse,
    QueryEvent, QueryParams, QueryResponse, UserEventData,
};
pub use config::{Config, ReconnectTimeoutOverride};
pub use coordinate::Coordinate;
pub use error::{Error, Result};
pub use keyring::Keyring;
pub use types::{Member, MemberStatus, Tags};
