//! Wire message types and codec.
//!
//! Every UDP/TCP message starts with a single `MessageType` byte followed by
//! a postcard-encoded body. UDP packets may carry a `Compound` envelope that
//! packs several small messages into one datagram:
//! `[tag][count:u8][len:u16 BE]*count [body]*count`.

use crate::error::{Error, Result};
use crate::types::LamportTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// One byte on the wire in front of every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Nack = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    PushPull = 7,
    Compound = 8,
    UserEvent = 9,
    LeaveIntent = 10,
    JoinIntent = 11,
    Query = 12,
    QueryResponse = 13,
    ConflictResponse = 14,
    KeyRequest = 15,
    KeyResponse = 16,
    Relay = 17,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Result<Self> {
        use MessageType::*;
        Ok(match b {
            0 => Ping,
            1 => IndirectPing,
            2 => Ack,
            3 => Nack,
            4 => Suspect,
            5 => Alive,
            6 => Dead,
            7 => PushPull,
            8 => Compound,
            9 => UserEvent,
            10 => LeaveIntent,
            11 => JoinIntent,
            12 => Query,
            13 => QueryResponse,
            14 => ConflictResponse,
            15 => KeyRequest,
            16 => KeyResponse,
            17 => Relay,
            other => return Err(Error::UnknownMessage(other)),
        })
    }
}

/// Membership-layer state of a node as carried in push/pull exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
    /// Graceful departure, distinguished from `Dead` so the upper layer can
    /// tell a leave from a failure.
    Left,
}

// =============================================================================
// SWIM MESSAGES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMsg {
    pub seq_no: u32,
    /// Target node name; a ping that reaches the wrong node is dropped.
    pub node: String,
    /// Name of the sender, so the ack can be attributed.
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectPingMsg {
    pub seq_no: u32,
    pub target_addr: IpAddr,
    pub target_port: u16,
    pub target: String,
    pub from: String,
    /// Ask the relay to send us a nack if the target does not answer, so a
    /// silent relay can be told apart from a dead target.
    pub nack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMsg {
    pub seq_no: u32,
    /// Opaque payload; carries the responder's network coordinate.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackMsg {
    pub seq_no: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectMsg {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveMsg {
    pub incarnation: u64,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    /// Cluster-layer metadata (encoded tags).
    pub meta: Vec<u8>,
    /// [proto_min, proto_max, proto_cur, delegate_min, delegate_max,
    /// delegate_cur]
    pub vsn: [u8; 6],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadMsg {
    pub incarnation: u64,
    pub node: String,
    /// `from == node` marks a graceful leave rather than an accusation.
    pub from: String,
}

/// Full anti-entropy exchange. `user_state` is the cluster layer's opaque
/// state (clocks, left members, recent intents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullMsg {
    pub join: bool,
    pub states: Vec<PushNodeState>,
    pub user_state: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: NodeStatus,
    pub vsn: [u8; 6],
}

// =============================================================================
// CLUSTER MESSAGES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinIntentMsg {
    pub ltime: LamportTime,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveIntentMsg {
    pub ltime: LamportTime,
    pub node: String,
    /// Erase the member immediately on every node instead of leaving a
    /// tombstone.
    pub prune: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventMsg {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    /// Coalesce-on-name hint carried to receivers.
    pub cc: bool,
}

/// Filters restricting which nodes should handle a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryFilter {
    /// Only the named nodes respond.
    Nodes(Vec<String>),
    /// Only nodes whose tag value matches the anchored regular expression.
    Tag { tag: String, expr: String },
}

/// Flag bits in `QueryMsg::flags` / `QueryResponseMsg::flags`.
pub const QUERY_FLAG_ACK: u32 = 1 << 0;
/// Response originates from an internal handler rather than the user.
pub const QUERY_FLAG_INTERNAL: u32 = 1 << 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMsg {
    pub ltime: LamportTime,
    pub id: u32,
    /// Originator endpoint responses are sent to.
    pub addr: IpAddr,
    pub port: u16,
    pub source: String,
    pub filters: Vec<QueryFilter>,
    pub flags: u32,
    pub relay_factor: u8,
    pub timeout_ms: u64,
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponseMsg {
    pub ltime: LamportTime,
    pub id: u32,
    pub from: String,
    pub flags: u32,
    pub payload: Vec<u8>,
}

/// Envelope used to bounce a query response through a third node, mitigating
/// asymmetric partitions between responder and originator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMsg {
    pub dest_addr: IpAddr,
    pub dest_port: u16,
    /// A complete tagged packet to forward verbatim.
    pub payload: Vec<u8>,
}

// =============================================================================
// INTERNAL QUERY PAYLOADS
// =============================================================================

/// Payload of the conflict-resolution internal query response: the
/// responder's record for the contested name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponseMsg {
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
}

/// Payload of key-management internal queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestMsg {
    /// Base64 key for install/use/remove; empty for list.
    pub key: String,
}

/// Per-node reply to a key-management query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyResponseMsg {
    pub result: bool,
    pub message: String,
    /// Installed keys (base64), only populated for list operations.
    pub keys: Vec<String>,
    /// Primary key (base64), only populated for list operations.
    pub primary: String,
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a message: tag byte + postcard body.
pub fn encode<T: Serialize>(ty: MessageType, msg: &T) -> Result<Vec<u8>> {
    let body = postcard::to_stdvec(msg).map_err(Error::Encode)?;
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(ty as u8);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a message body (the slice after the tag byte).
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    postcard::from_bytes(body).map_err(Error::Decode)
}

/// Maximum messages per compound packet (count field is one byte).
pub const MAX_COMPOUND_MESSAGES: usize = 255;

/// Pack multiple tagged messages into one compound packet.
pub fn make_compound(msgs: &[Vec<u8>]) -> Vec<u8> {
    debug_assert!(msgs.len() <= MAX_COMPOUND_MESSAGES);
    let total: usize = msgs.iter().map(|m| m.len()).sum();
    let mut buf = Vec::with_capacity(2 + msgs.len() * 2 + total);
    buf.push(MessageType::Compound as u8);
    buf.push(msgs.len() as u8);
    for m in msgs {
        buf.extend_from_slice(&(m.len() as u16).to_be_bytes());
    }
    for m in msgs {
        buf.extend_from_slice(m);
    }
    buf
}

/// Split a compound body (after the tag byte) into its tagged parts.
/// Truncated packets yield the parts that fit plus an error count.
pub fn split_compound(body: &[u8]) -> Result<(Vec<&[u8]>, usize)> {
    if body.is_empty() {
        return Err(Error::Decode(postcard::Error::DeserializeUnexpectedEnd));
    }
    let count = body[0] as usize;
    let header = 1 + count * 2;
    if body.len() < header {
        return Err(Error::Decode(postcard::Error::DeserializeUnexpectedEnd));
    }

    let mut parts = Vec::with_capacity(count);
    let mut truncated = 0;
    let mut offset = header;
    for i in 0..count {
        let len = u16::from_be_bytes([body[1 + i * 2], body[2 + i * 2]]) as usize;
        if offset + len > body.len() {
            truncated = count - i;
            break;
        }
        parts.push(&body[offset..offset + len]);
        offset += len;
    }
    Ok((parts, truncated))
}

/// Overhead of adding one more message to a compound packet.
pub const COMPOUND_OVERHEAD: usize = 2;
/// Fixed overhead of the compound envelope itself.
pub const COMPOUND_HEADER_OVERHEAD: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for b in 0..=17u8 {
            let ty = MessageType::from_u8(b).unwrap();
            assert_eq!(ty as u8, b);
        }
        assert!(MessageType::from_u8(200).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let ping = PingMsg {
            seq_no: 42,
            node: "n1".to_string(),
            from: "n2".to_string(),
        };
        let buf = encode(MessageType::Ping, &ping).unwrap();
        assert_eq!(buf[0], MessageType::Ping as u8);
        let back: PingMsg = decode(&buf[1..]).unwrap();
        assert_eq!(back.seq_no, 42);
        assert_eq!(back.node, "n1");
    }

    #[test]
    fn test_compound_round_trip() {
        let a = encode(MessageType::Nack, &NackMsg { seq_no: 1 }).unwrap();
        let b = encode(MessageType::Nack, &NackMsg { seq_no: 2 }).unwrap();
        let packet = make_compound(&[a.clone(), b.clone()]);

        assert_eq!(packet[0], MessageType::Compound as u8);
        let (parts, truncated) = split_compound(&packet[1..]).unwrap();
        assert_eq!(truncated, 0);
        assert_eq!(parts, vec![a.as_slice(), b.as_slice()]);
    }

    #[test]
    fn test_compound_truncated() {
        let a = encode(MessageType::Nack, &NackMsg { seq_no: 1 }).unwrap();
        let b = encode(MessageType::Nack, &NackMsg { seq_no: 2 }).unwrap();
        let packet = make_compound(&[a.clone(), b]);

        // Chop the tail off the second message.
        let (parts, truncated) = split_compound(&packet[1..packet.len() - 2]).unwrap();
        assert_eq!(truncated, 1);
        assert_eq!(parts, vec![a.as_slice()]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode::<QueryMsg>(&[0xff, 0x01]).is_err());
        assert!(split_compound(&[]).is_err());
        assert!(split_compound(&[10, 0]).is_err());
    }
}
