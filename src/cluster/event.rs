//! The event sum type delivered to the host process.
//!
//! Every consumer (the host's event loop, the snapshotter tee) receives the
//! same tagged variants and matches exhaustively.

use crate::types::{LamportTime, Member};

pub use super::query::QueryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
    Update,
    /// A failed or left member was erased by the reaper.
    Reap,
}

impl std::fmt::Display for MemberEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberEventKind::Join => "member-join",
            MemberEventKind::Leave => "member-leave",
            MemberEventKind::Failed => "member-failed",
            MemberEventKind::Update => "member-update",
            MemberEventKind::Reap => "member-reap",
        };
        f.write_str(s)
    }
}

/// One or more members changed state. Bursts may be coalesced: `members`
/// holds every affected member.
#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub members: Vec<Member>,
}

/// A user event received (or sent) on this node.
#[derive(Debug, Clone)]
pub struct UserEventData {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    /// Sender asked receivers to coalesce same-named events.
    pub coalesce: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    Member(MemberEvent),
    User(UserEventData),
    Query(QueryEvent),
}
