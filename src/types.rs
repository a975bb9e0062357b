//! Core constants and shared types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Oldest wire protocol version we still speak.
pub const PROTOCOL_MIN: u8 = 1;

/// Newest wire protocol version. Increment on breaking wire format changes.
pub const PROTOCOL_MAX: u8 = 2;

/// Oldest cluster-layer (intent/event/query) version we still speak.
pub const CLUSTER_PROTOCOL_MIN: u8 = 1;

/// Newest cluster-layer version.
pub const CLUSTER_PROTOCOL_MAX: u8 = 2;

/// Default UDP/TCP gossip port.
pub const DEFAULT_BIND_PORT: u16 = 7946;

// =============================================================================
// SIZE LIMITS
// =============================================================================

/// MTU budget for an outbound UDP packet before label and encryption overhead.
pub const UDP_PACKET_BUDGET: usize = 1400;

/// Receive buffer for a single UDP datagram.
pub const UDP_RECV_BUF: usize = 65_536;

/// Hard cap on a single framed TCP message (push/pull state, fallback pings).
/// Push/pull for a large cluster dominates this: ~1KB per node state.
pub const MAX_STREAM_FRAME: usize = 10 * 1024 * 1024;

/// Encoded tags may not exceed this once packed into the alive message.
pub const MAX_TAG_BYTES: usize = 512;

/// Longest node name accepted off the wire.
pub const MAX_NODE_NAME_LEN: usize = 128;

/// Lamport time, a 64-bit logical clock value.
pub type LamportTime = u64;

/// Node tags, gossiped as the metadata field of the alive message.
pub type Tags = HashMap<String, String>;

// =============================================================================
// MEMBERS
// =============================================================================

/// Cluster-layer status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Placeholder for a member we have heard an intent about but never seen.
    None,
    Alive,
    Leaving,
    Left,
    Failed,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberStatus::None => "none",
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single member of the cluster as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: Tags,
    pub status: MemberStatus,

    // Wire protocol version range and current, then cluster-layer range and
    // current, as gossiped in the alive message.
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
}

impl Member {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.addr, self.port)
    }
}

/// Encode tags for the alive message metadata field.
pub fn encode_tags(tags: &Tags) -> crate::error::Result<Vec<u8>> {
    // BTreeMap gives a stable byte encoding so metadata hashes compare equal
    // for equal tag sets.
    let ordered: std::collections::BTreeMap<&str, &str> =
        tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let buf = postcard::to_stdvec(&ordered).map_err(crate::error::Error::Encode)?;
    if buf.len() > MAX_TAG_BYTES {
        return Err(crate::error::Error::SizeLimit {
            kind: "encoded tags",
            size: buf.len(),
            limit: MAX_TAG_BYTES,
        });
    }
    Ok(buf)
}

/// Decode the alive message metadata field back into tags.
/// Malformed metadata decodes to an empty tag set rather than erroring:
/// membership must keep working even if a peer ships garbage meta.
pub fn decode_tags(buf: &[u8]) -> Tags {
    if buf.is_empty() {
        return Tags::new();
    }
    match postcard::from_bytes::<std::collections::BTreeMap<String, String>>(buf) {
        Ok(m) => m.into_iter().collect(),
        Err(_) => {
            tracing::warn!("failed to decode member tags, treating as empty");
            Tags::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        let mut tags = Tags::new();
        tags.insert("role".to_string(), "web".to_string());
        tags.insert("dc".to_string(), "east".to_string());

        let buf = encode_tags(&tags).unwrap();
        assert_eq!(decode_tags(&buf), tags);
    }

    #[test]
    fn test_tags_encoding_is_stable() {
        let mut a = Tags::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());

        let mut b = Tags::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());

        assert_eq!(encode_tags(&a).unwrap(), encode_tags(&b).unwrap());
    }

    #[test]
    fn test_tags_size_limit() {
        let mut tags = Tags::new();
        tags.insert("k".to_string(), "v".repeat(MAX_TAG_BYTES));
        assert!(encode_tags(&tags).is_err());
    }

    #[test]
    fn test_bad_tags_decode_empty() {
        assert!(decode_tags(&[0xff, 0xff, 0xff]).is_empty());
    }
}
