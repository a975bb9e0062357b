//! Hooks the membership engine calls up into its consumer.
//!
//! The engine and the cluster orchestrator reference each other: the engine
//! reports node events and carries opaque upper-layer state, the orchestrator
//! drives probing and broadcasts through the engine. The cycle is broken by
//! having the engine consume this trait; the orchestrator is constructed
//! first, the engine is handed an `Arc<dyn Delegate>`, and the orchestrator
//! then attaches its engine handle.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// A node as the membership engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    /// Opaque upper-layer metadata (encoded tags).
    pub meta: Vec<u8>,
    /// [proto_min, proto_max, proto_cur, delegate_min, delegate_max,
    /// delegate_cur]
    pub vsn: [u8; 6],
}

impl Node {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

pub trait Delegate: Send + Sync + 'static {
    /// Metadata to gossip in our alive message, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A non-membership message arrived (intent, user event, query, relay).
    /// `buf` is the full tagged message.
    fn notify_message(&self, buf: &[u8], from: SocketAddr);

    /// Upper-layer broadcasts to piggyback on outgoing gossip packets.
    /// Same contract as `TransmitQueue::get_broadcasts`.
    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Opaque state for the push/pull exchange (clocks, tombstones, buffered
    /// intents).
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Counterpart of `local_state` on the receiving side.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    fn notify_join(&self, node: &Node);
    fn notify_leave(&self, node: &Node);
    fn notify_update(&self, node: &Node);

    /// An alive message claimed a name we already map to a different
    /// address. The existing record is kept; resolution is up to the
    /// consumer.
    fn notify_conflict(&self, existing: &Node, other: &Node);

    /// Payload to attach to outgoing acks (our network coordinate).
    fn ack_payload(&self) -> Vec<u8>;

    /// A direct probe completed; `payload` is the remote ack payload.
    fn notify_ping_rtt(&self, node: &str, payload: &[u8], rtt: Duration);
}
