//! Cluster orchestrator.
//!
//! Sits above the membership engine: owns the canonical member map with
//! Lamport-timed join/leave intents, coalesces member events, reaps failed
//! and left members, runs user events and queries, and feeds the snapshotter.

pub mod event;
pub mod internal;
pub mod query;

mod coalesce;

pub use event::{Event, MemberEvent, MemberEventKind, UserEventData};
pub use internal::{KeyManager, KeyResponse};
pub use query::{NodeResponse, QueryEvent, QueryParams, QueryResponse};

use crate::broadcast::TransmitQueue;
use crate::clock::LamportClock;
use crate::config::Config;
use crate::coordinate::{Coordinate, CoordinateClient};
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::membership::{Delegate, Membership, Node};
use crate::snapshot;
use crate::types::{
    decode_tags, encode_tags, LamportTime, Member, MemberStatus, Tags, DEFAULT_BIND_PORT,
};
use crate::wire::{
    self, JoinIntentMsg, LeaveIntentMsg, MessageType, QueryMsg, QueryResponseMsg, RelayMsg,
    UserEventMsg,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

/// Buffered intents for not-yet-seen members are capped at this many.
const MAX_RECENT_INTENTS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClusterStatus {
    Alive,
    Leaving,
    Left,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentKind {
    Join,
    Leave,
}

struct NodeIntent {
    kind: IntentKind,
    ltime: LamportTime,
    at: Instant,
}

/// Cluster-layer record for one member.
pub(crate) struct MemberState {
    pub(crate) member: Member,
    /// Lamport time of the last status-changing intent.
    pub(crate) status_ltime: LamportTime,
    /// When the member left or failed; drives the reaper.
    leave_time: Option<Instant>,
}

/// One Lamport tick's worth of user events, kept for de-duplication and
/// push/pull replay.
pub(crate) struct EventSlot {
    pub(crate) ltime: LamportTime,
    pub(crate) events: Vec<(String, Vec<u8>)>,
}

/// One Lamport tick's worth of seen query ids.
pub(crate) struct QuerySlot {
    pub(crate) ltime: LamportTime,
    pub(crate) ids: Vec<u32>,
}

pub(crate) struct ClusterState {
    pub(crate) members: HashMap<String, MemberState>,
    failed_members: Vec<String>,
    left_members: Vec<String>,
    recent_intents: HashMap<String, NodeIntent>,
    pub(crate) event_buffer: Vec<Option<EventSlot>>,
    pub(crate) query_buffer: Vec<Option<QuerySlot>>,
    /// User events below this Lamport time are ignored (join with
    /// `ignore_old`).
    event_min_time: LamportTime,
    status: ClusterStatus,
}

impl ClusterState {
    fn new(event_buffer_size: usize, query_buffer_size: usize) -> Self {
        Self {
            members: HashMap::new(),
            failed_members: Vec::new(),
            left_members: Vec::new(),
            recent_intents: HashMap::new(),
            event_buffer: (0..event_buffer_size).map(|_| None).collect(),
            query_buffer: (0..query_buffer_size).map(|_| None).collect(),
            event_min_time: 0,
            status: ClusterStatus::Alive,
        }
    }

    /// Remember an intent for a member we have not seen yet. Returns whether
    /// the intent was fresh (worth rebroadcasting).
    fn upsert_intent(&mut self, kind: IntentKind, node: &str, ltime: LamportTime) -> bool {
        if let Some(existing) = self.recent_intents.get(node) {
            if ltime <= existing.ltime {
                return false;
            }
        }
        if self.recent_intents.len() >= MAX_RECENT_INTENTS
            && !self.recent_intents.contains_key(node)
        {
            // Evict the stalest buffered intent.
            if let Some(oldest) = self
                .recent_intents
                .iter()
                .min_by_key(|(_, i)| i.at)
                .map(|(n, _)| n.clone())
            {
                self.recent_intents.remove(&oldest);
            }
        }
        self.recent_intents.insert(
            node.to_string(),
            NodeIntent {
                kind,
                ltime,
                at: Instant::now(),
            },
        );
        true
    }
}

/// Fan-in point for events produced by synchronous handlers; a single drainer
/// task forwards them, in order, into the bounded pipeline.
#[derive(Default)]
struct Outbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
}

/// State recovered and carried over the push/pull user-state blob.
#[derive(Serialize, Deserialize)]
struct UserState {
    member_ltime: LamportTime,
    event_ltime: LamportTime,
    query_ltime: LamportTime,
    status_ltimes: Vec<(String, LamportTime)>,
    left_members: Vec<String>,
    events: Vec<UserEventMsg>,
}

pub(crate) struct ClusterCore {
    pub(crate) config: Arc<Config>,
    pub(crate) keyring: Option<Arc<Keyring>>,
    pub(crate) tags: Mutex<Tags>,

    pub(crate) member_clock: LamportClock,
    pub(crate) event_clock: LamportClock,
    pub(crate) query_clock: LamportClock,

    pub(crate) state: Mutex<ClusterState>,
    membership: OnceLock<Arc<Membership>>,

    /// Broadcast queue for intents, user events, and queries; drained through
    /// the engine's gossip packets.
    pub(crate) event_broadcasts: TransmitQueue,
    pub(crate) pending_queries: query::PendingQueries,
    query_id: AtomicU32,

    outbox: Outbox,
    event_join_ignore: AtomicBool,

    pub(crate) coord_client: Option<Arc<CoordinateClient>>,
    coord_cache: Mutex<HashMap<String, Coordinate>>,

    snapshot: OnceLock<snapshot::SnapshotHandle>,
    start_time: Instant,
}

impl ClusterCore {
    pub(crate) fn membership(&self) -> Option<Arc<Membership>> {
        self.membership.get().cloned()
    }

    pub(crate) fn next_query_id(&self) -> u32 {
        self.query_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        match self.state.lock().unwrap().status {
            ClusterStatus::Alive => Ok(()),
            ClusterStatus::Shutdown => Err(Error::Shutdown),
            _ => Err(Error::NotAlive),
        }
    }

    /// Queue an event for the pipeline (coalescer -> snapshotter -> host).
    pub(crate) fn emit(&self, ev: Event) {
        self.outbox.queue.lock().unwrap().push_back(ev);
        self.outbox.notify.notify_one();
    }

    // =========================================================================
    // INBOUND CLUSTER MESSAGES
    // =========================================================================

    /// Dispatch a cluster-layer message handed up by the membership engine.
    pub(crate) fn handle_message(self: &Arc<Self>, buf: &[u8], from: SocketAddr) {
        let Some(&tag) = buf.first() else {
            return;
        };
        let body = &buf[1..];
        let ty = match MessageType::from_u8(tag) {
            Ok(ty) => ty,
            Err(_) => {
                warn!("unknown cluster message type {} from {}", tag, from);
                return;
            }
        };

        match ty {
            MessageType::JoinIntent => match wire::decode::<JoinIntentMsg>(body) {
                Ok(msg) => {
                    if self.handle_join_intent(&msg) {
                        self.requeue(MessageType::JoinIntent, &msg, intent_key(&msg.node));
                    }
                }
                Err(e) => warn!("bad join intent from {}: {}", from, e),
            },
            MessageType::LeaveIntent => match wire::decode::<LeaveIntentMsg>(body) {
                Ok(msg) => {
                    if self.handle_leave_intent(&msg) {
                        self.requeue(MessageType::LeaveIntent, &msg, intent_key(&msg.node));
                    }
                }
                Err(e) => warn!("bad leave intent from {}: {}", from, e),
            },
            MessageType::UserEvent => match wire::decode::<UserEventMsg>(body) {
                Ok(msg) => {
                    if self.handle_user_event(&msg) {
                        self.requeue(MessageType::UserEvent, &msg, event_key(&msg));
                    }
                }
                Err(e) => warn!("bad user event from {}: {}", from, e),
            },
            MessageType::Query => match wire::decode::<QueryMsg>(body) {
                Ok(msg) => {
                    let key = format!("query:{}:{}", msg.ltime, msg.id);
                    if self.handle_query(msg.clone()) {
                        self.requeue(MessageType::Query, &msg, key);
                    }
                }
                Err(e) => warn!("bad query from {}: {}", from, e),
            },
            MessageType::QueryResponse => match wire::decode::<QueryResponseMsg>(body) {
                Ok(msg) => self.handle_query_response(msg),
                Err(e) => warn!("bad query response from {}: {}", from, e),
            },
            MessageType::Relay => match wire::decode::<RelayMsg>(body) {
                Ok(msg) => self.handle_relay(msg),
                Err(e) => warn!("bad relay from {}: {}", from, e),
            },
            other => warn!("unexpected cluster message {:?} from {}", other, from),
        }
    }

    fn requeue<T: Serialize>(&self, ty: MessageType, msg: &T, key: String) {
        match wire::encode(ty, msg) {
            Ok(buf) => self.event_broadcasts.queue(Some(key), buf, None),
            Err(e) => warn!("failed to re-encode {:?} broadcast: {}", ty, e),
        }
    }

    /// Unwrap a relayed response and forward it to its true destination.
    fn handle_relay(self: &Arc<Self>, msg: RelayMsg) {
        let Some(membership) = self.membership() else {
            return;
        };
        let dest = SocketAddr::new(msg.dest_addr, msg.dest_port);
        tokio::spawn(async move {
            if let Err(e) = membership.transport.send_packet(dest, &msg.payload).await {
                debug!("failed to forward relayed response to {}: {}", dest, e);
            }
        });
    }

    // =========================================================================
    // INTENTS
    // =========================================================================

    /// Returns whether the intent was fresh and should keep gossiping.
    pub(crate) fn handle_join_intent(&self, msg: &JoinIntentMsg) -> bool {
        self.member_clock.witness(msg.ltime);

        let mut st = self.state.lock().unwrap();
        match st.members.get_mut(&msg.node) {
            Some(ms) => {
                if msg.ltime <= ms.status_ltime {
                    return false;
                }
                // A Left or Failed member is never revived by an intent, no
                // matter its Lamport time; only a fresh alive through the
                // SWIM path with a higher incarnation may do that.
                if matches!(ms.member.status, MemberStatus::Left | MemberStatus::Failed) {
                    debug!(
                        "ignoring join intent for {} member {}",
                        ms.member.status, msg.node
                    );
                    return false;
                }
                ms.status_ltime = msg.ltime;
                if ms.member.status == MemberStatus::Leaving {
                    ms.member.status = MemberStatus::Alive;
                    info!("member {} cancelled its leave", msg.node);
                }
                true
            }
            None => st.upsert_intent(IntentKind::Join, &msg.node, msg.ltime),
        }
    }

    pub(crate) fn handle_leave_intent(&self, msg: &LeaveIntentMsg) -> bool {
        self.member_clock.witness(msg.ltime);

        enum Action {
            None,
            Rebroadcast,
            EmitLeave(Member),
            RefuteWithJoin,
        }

        let mut action = Action::None;
        {
            let mut st = self.state.lock().unwrap();
            let is_local = msg.node == self.config.node_name;
            let locally_leaving =
                matches!(st.status, ClusterStatus::Leaving | ClusterStatus::Left);

            match st.members.get_mut(&msg.node) {
                Some(ms) => {
                    if msg.ltime <= ms.status_ltime {
                        return false;
                    }
                    if is_local && !locally_leaving {
                        // Someone says we are leaving, but we are not: refute
                        // with a fresh join intent.
                        action = Action::RefuteWithJoin;
                    } else {
                        ms.status_ltime = msg.ltime;
                        match ms.member.status {
                            MemberStatus::Alive | MemberStatus::Leaving => {
                                ms.member.status = MemberStatus::Leaving;
                                action = Action::Rebroadcast;
                            }
                            MemberStatus::Failed => {
                                // Operator-driven transition of a failed
                                // member into a clean departure.
                                ms.member.status = MemberStatus::Left;
                                ms.leave_time = Some(Instant::now());
                                action = Action::EmitLeave(ms.member.clone());
                            }
                            MemberStatus::Left | MemberStatus::None => {
                                action = Action::Rebroadcast;
                            }
                        }

                        if msg.prune {
                            info!("pruning member {}", msg.node);
                            st.members.remove(&msg.node);
                            st.failed_members.retain(|n| n != &msg.node);
                            st.left_members.retain(|n| n != &msg.node);
                        }
                    }
                }
                None => {
                    return st.upsert_intent(IntentKind::Leave, &msg.node, msg.ltime);
                }
            }

            if let Action::EmitLeave(_) = action {
                if !msg.prune {
                    st.failed_members.retain(|n| n != &msg.node);
                    st.left_members.push(msg.node.clone());
                }
            }
        }

        match action {
            Action::None => false,
            Action::Rebroadcast => true,
            Action::EmitLeave(member) => {
                info!("member {} force-left (was failed)", member.name);
                self.emit(Event::Member(MemberEvent {
                    kind: MemberEventKind::Leave,
                    members: vec![member],
                }));
                true
            }
            Action::RefuteWithJoin => {
                let ltime = self.member_clock.increment();
                {
                    let mut st = self.state.lock().unwrap();
                    if let Some(ms) = st.members.get_mut(&self.config.node_name) {
                        ms.status_ltime = ltime;
                    }
                }
                debug!("refuting leave intent about the local node");
                self.broadcast_join_intent(ltime);
                false
            }
        }
    }

    pub(crate) fn broadcast_join_intent(&self, ltime: LamportTime) {
        let msg = JoinIntentMsg {
            ltime,
            node: self.config.node_name.clone(),
        };
        self.requeue(MessageType::JoinIntent, &msg, intent_key(&msg.node));
    }

    // =========================================================================
    // MEMBERSHIP NOTIFICATIONS
    // =========================================================================

    pub(crate) fn handle_node_join(&self, node: &Node) {
        let tags = decode_tags(&node.meta);
        let member = {
            let mut st = self.state.lock().unwrap();
            st.failed_members.retain(|n| n != &node.name);
            st.left_members.retain(|n| n != &node.name);

            let ms = st
                .members
                .entry(node.name.clone())
                .or_insert_with(|| MemberState {
                    member: member_from_node(node, tags.clone()),
                    status_ltime: 0,
                    leave_time: None,
                });
            ms.member.addr = node.addr;
            ms.member.port = node.port;
            ms.member.tags = tags;
            ms.member.status = MemberStatus::Alive;
            apply_vsn(&mut ms.member, node.vsn);
            ms.leave_time = None;

            let buffered = st.recent_intents.remove(&node.name);
            let Some(ms) = st.members.get_mut(&node.name) else {
                return;
            };
            if let Some(intent) = buffered {
                if intent.ltime > ms.status_ltime {
                    ms.status_ltime = intent.ltime;
                    if intent.kind == IntentKind::Leave {
                        ms.member.status = MemberStatus::Leaving;
                    }
                }
            }
            ms.member.clone()
        };

        info!(
            "member joined: {} at {}:{}",
            member.name, member.addr, member.port
        );
        self.emit(Event::Member(MemberEvent {
            kind: MemberEventKind::Join,
            members: vec![member],
        }));
    }

    pub(crate) fn handle_node_leave(&self, node: &Node) {
        let outcome = {
            let mut st = self.state.lock().unwrap();
            let Some(ms) = st.members.get_mut(&node.name) else {
                return;
            };
            let kind = match ms.member.status {
                // A leave intent preceded the death notice: clean departure.
                MemberStatus::Leaving => {
                    ms.member.status = MemberStatus::Left;
                    MemberEventKind::Leave
                }
                MemberStatus::Alive | MemberStatus::None => {
                    ms.member.status = MemberStatus::Failed;
                    MemberEventKind::Failed
                }
                // Already terminal.
                MemberStatus::Left | MemberStatus::Failed => return,
            };
            ms.leave_time = Some(Instant::now());
            let member = ms.member.clone();
            match kind {
                MemberEventKind::Leave => st.left_members.push(node.name.clone()),
                _ => st.failed_members.push(node.name.clone()),
            }
            (kind, member)
        };

        let (kind, member) = outcome;
        match kind {
            MemberEventKind::Failed => warn!("member failed: {}", member.name),
            _ => info!("member left: {}", member.name),
        }
        self.emit(Event::Member(MemberEvent {
            kind,
            members: vec![member],
        }));
    }

    pub(crate) fn handle_node_update(&self, node: &Node) {
        let tags = decode_tags(&node.meta);
        let member = {
            let mut st = self.state.lock().unwrap();
            let Some(ms) = st.members.get_mut(&node.name) else {
                return;
            };
            ms.member.addr = node.addr;
            ms.member.port = node.port;
            ms.member.tags = tags;
            apply_vsn(&mut ms.member, node.vsn);
            ms.member.clone()
        };

        debug!("member updated: {}", member.name);
        self.emit(Event::Member(MemberEvent {
            kind: MemberEventKind::Update,
            members: vec![member],
        }));
    }

    /// A peer claims our name from a different address: put it to a vote.
    pub(crate) fn handle_name_conflict(self: &Arc<Self>, other: &Node) {
        let me = self.clone();
        let other_addr = other.socket_addr();
        tokio::spawn(async move {
            warn!(
                "local name conflict detected (claimed from {}), querying the cluster",
                other_addr
            );
            let Some(membership) = me.membership() else {
                return;
            };
            let advertise = membership.advertise_addr();

            let payload = me.config.node_name.as_bytes().to_vec();
            let mut resp = match me.start_query(
                internal::CONFLICT_QUERY,
                &payload,
                QueryParams::default(),
            ) {
                Ok(r) => r,
                Err(e) => {
                    error!("failed to start conflict query: {}", e);
                    return;
                }
            };

            let mut total = 0usize;
            let mut ours = 0usize;
            while let Some(r) = resp.recv().await {
                let decoded = match r.payload.first() {
                    Some(&t) if t == MessageType::ConflictResponse as u8 => {
                        wire::decode::<wire::ConflictResponseMsg>(&r.payload[1..]).ok()
                    }
                    _ => None,
                };
                let Some(vote) = decoded else { continue };
                total += 1;
                if vote.addr == advertise.ip() && vote.port == advertise.port() {
                    ours += 1;
                }
            }

            if total > 0 && ours <= total / 2 {
                error!(
                    "minority in name conflict ({} of {} votes), shutting down",
                    ours, total
                );
                if let Err(e) = me.shutdown().await {
                    error!("conflict shutdown failed: {}", e);
                }
            } else {
                info!(
                    "majority holds our record in name conflict ({} of {} votes)",
                    ours, total
                );
            }
        });
    }

    // =========================================================================
    // USER EVENTS
    // =========================================================================

    pub(crate) fn user_event(&self, name: &str, payload: &[u8], coalesce: bool) -> Result<()> {
        self.check_alive()?;
        let size = name.len() + payload.len();
        if size > self.config.user_event_size_limit {
            return Err(Error::SizeLimit {
                kind: "user event",
                size,
                limit: self.config.user_event_size_limit,
            });
        }

        let ltime = self.event_clock.time();
        self.event_clock.increment();
        let msg = UserEventMsg {
            ltime,
            name: name.to_string(),
            payload: payload.to_vec(),
            cc: coalesce,
        };

        // Deliver locally first, then gossip.
        self.handle_user_event(&msg);
        self.requeue(MessageType::UserEvent, &msg, event_key(&msg));
        Ok(())
    }

    /// Returns whether the event was fresh (emit + rebroadcast) or a
    /// duplicate/stale (silently dropped).
    pub(crate) fn handle_user_event(&self, msg: &UserEventMsg) -> bool {
        self.event_clock.witness(msg.ltime);

        {
            let mut st = self.state.lock().unwrap();
            if msg.ltime < st.event_min_time {
                return false;
            }

            let size = self.config.event_buffer_size as u64;
            let cur = self.event_clock.time();
            if cur > size && msg.ltime < cur - size {
                warn!(
                    "dropping user event {:?} older than the buffer window ({} < {})",
                    msg.name,
                    msg.ltime,
                    cur - size
                );
                return false;
            }

            let idx = (msg.ltime % size) as usize;
            let slot = &mut st.event_buffer[idx];
            match slot {
                Some(s) if s.ltime == msg.ltime => {
                    if s.events
                        .iter()
                        .any(|(n, p)| n == &msg.name && p == &msg.payload)
                    {
                        return false;
                    }
                    s.events.push((msg.name.clone(), msg.payload.clone()));
                }
                _ => {
                    *slot = Some(EventSlot {
                        ltime: msg.ltime,
                        events: vec![(msg.name.clone(), msg.payload.clone())],
                    });
                }
            }
        }

        self.emit(Event::User(UserEventData {
            ltime: msg.ltime,
            name: msg.name.clone(),
            payload: msg.payload.clone(),
            coalesce: msg.cc,
        }));
        true
    }

    // =========================================================================
    // PUSH/PULL USER STATE
    // =========================================================================

    pub(crate) fn local_user_state(&self) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        let status_ltimes = st
            .members
            .iter()
            .map(|(name, ms)| (name.clone(), ms.status_ltime))
            .collect();
        let left_members = st.left_members.clone();
        let mut events = Vec::new();
        for slot in st.event_buffer.iter().flatten() {
            for (name, payload) in &slot.events {
                events.push(UserEventMsg {
                    ltime: slot.ltime,
                    name: name.clone(),
                    payload: payload.clone(),
                    cc: false,
                });
            }
        }
        drop(st);

        let us = UserState {
            member_ltime: self.member_clock.time(),
            event_ltime: self.event_clock.time(),
            query_ltime: self.query_clock.time(),
            status_ltimes,
            left_members,
            events,
        };
        postcard::to_stdvec(&us).unwrap_or_default()
    }

    pub(crate) fn merge_user_state(self: &Arc<Self>, buf: &[u8], join: bool) {
        let us: UserState = match postcard::from_bytes(buf) {
            Ok(us) => us,
            Err(e) => {
                warn!("failed to decode push/pull user state: {}", e);
                return;
            }
        };

        self.member_clock.witness(us.member_ltime);
        self.event_clock.witness(us.event_ltime);
        self.query_clock.witness(us.query_ltime);

        if join && self.event_join_ignore.load(Ordering::SeqCst) {
            // Replayed events predate us; remember the cutoff.
            let mut st = self.state.lock().unwrap();
            st.event_min_time = us.event_ltime + 1;
        }

        // Replay membership intents so tombstones survive anti-entropy.
        for (name, ltime) in us.status_ltimes {
            if us.left_members.contains(&name) {
                let msg = LeaveIntentMsg {
                    ltime,
                    node: name,
                    prune: false,
                };
                if self.handle_leave_intent(&msg) {
                    self.requeue(MessageType::LeaveIntent, &msg, intent_key(&msg.node));
                }
            } else {
                let msg = JoinIntentMsg { ltime, node: name };
                if self.handle_join_intent(&msg) {
                    self.requeue(MessageType::JoinIntent, &msg, intent_key(&msg.node));
                }
            }
        }

        for ev in us.events {
            self.handle_user_event(&ev);
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub(crate) async fn join<S: AsRef<str>>(
        self: &Arc<Self>,
        addrs: &[S],
        ignore_old: bool,
    ) -> Result<usize> {
        self.check_alive()?;
        let membership = self.membership().ok_or(Error::Shutdown)?;

        let mut resolved = Vec::with_capacity(addrs.len());
        for a in addrs {
            resolved.push(resolve_addr(a.as_ref())?);
        }

        if ignore_old {
            self.event_join_ignore.store(true, Ordering::SeqCst);
        }
        let res = membership.join(&resolved).await;
        if ignore_old {
            self.event_join_ignore.store(false, Ordering::SeqCst);
        }

        let count = res?;
        // Tell the cluster (again) that we are a member as of now.
        let ltime = self.member_clock.increment();
        {
            let mut st = self.state.lock().unwrap();
            if let Some(ms) = st.members.get_mut(&self.config.node_name) {
                ms.status_ltime = ltime;
            }
        }
        self.broadcast_join_intent(ltime);
        Ok(count)
    }

    pub(crate) async fn leave(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            match st.status {
                ClusterStatus::Shutdown => return Err(Error::Shutdown),
                ClusterStatus::Left => return Ok(()),
                _ => st.status = ClusterStatus::Leaving,
            }
        }
        info!("leaving the cluster: {}", self.config.node_name);

        // Record the intentional departure before telling anyone, so a crash
        // mid-leave does not auto-rejoin.
        if let Some(snap) = self.snapshot.get() {
            snap.leave().await;
        }

        let membership = self.membership().ok_or(Error::Shutdown)?;
        let mut timed_out = false;

        let ltime = self.member_clock.increment();
        let msg = LeaveIntentMsg {
            ltime,
            node: self.config.node_name.clone(),
            prune: false,
        };
        self.handle_leave_intent(&msg);

        if membership.num_alive() > 1 {
            let buf = wire::encode(MessageType::LeaveIntent, &msg)?;
            let (tx, rx) = oneshot::channel();
            self.event_broadcasts
                .queue(Some(intent_key(&msg.node)), buf, Some(tx));
            if tokio::time::timeout(self.config.broadcast_timeout, rx)
                .await
                .is_err()
            {
                warn!("leave intent not drained within the broadcast timeout");
                timed_out = true;
            }
        }

        if let Err(Error::LeaveTimeout) = membership.leave(self.config.broadcast_timeout).await {
            timed_out = true;
        }

        {
            let mut st = self.state.lock().unwrap();
            if st.status == ClusterStatus::Leaving {
                st.status = ClusterStatus::Left;
            }
        }

        if timed_out {
            return Err(Error::LeaveTimeout);
        }
        Ok(())
    }

    pub(crate) async fn shutdown(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.status == ClusterStatus::Shutdown {
                return Ok(());
            }
            if st.status == ClusterStatus::Alive {
                warn!("shutdown without a prior leave");
            }
            st.status = ClusterStatus::Shutdown;
        }

        if let Some(membership) = self.membership() {
            membership.shutdown();
        }
        if let Some(snap) = self.snapshot.get() {
            snap.shutdown().await;
        }
        info!("cluster shut down: {}", self.config.node_name);
        Ok(())
    }

    // =========================================================================
    // REAPER / RECONNECT
    // =========================================================================

    fn reap(&self) {
        let mut reaped: Vec<Member> = Vec::new();
        {
            let mut st = self.state.lock().unwrap();

            let failed = std::mem::take(&mut st.failed_members);
            let mut keep_failed = Vec::with_capacity(failed.len());
            for name in failed {
                let timeout = st
                    .members
                    .get(&name)
                    .and_then(|ms| {
                        self.config
                            .reconnect_timeout_override
                            .as_ref()
                            .and_then(|o| o.reconnect_timeout(&ms.member))
                    })
                    .unwrap_or(self.config.reconnect_timeout);
                if expired(&st, &name, timeout) {
                    if let Some(ms) = st.members.remove(&name) {
                        reaped.push(ms.member);
                    }
                } else {
                    keep_failed.push(name);
                }
            }
            st.failed_members = keep_failed;

            let left = std::mem::take(&mut st.left_members);
            let mut keep_left = Vec::with_capacity(left.len());
            for name in left {
                if expired(&st, &name, self.config.tombstone_timeout) {
                    if let Some(ms) = st.members.remove(&name) {
                        reaped.push(ms.member);
                    }
                } else {
                    keep_left.push(name);
                }
            }
            st.left_members = keep_left;
        }

        if reaped.is_empty() {
            return;
        }

        let membership = self.membership();
        for m in &reaped {
            info!("reaping member {}", m.name);
            self.event_broadcasts.invalidate(&intent_key(&m.name));
            if let Some(ms) = &membership {
                ms.broadcasts.invalidate(&m.name);
                ms.forget_node(&m.name);
            }
            self.coord_cache.lock().unwrap().remove(&m.name);
            if let Some(cc) = &self.coord_client {
                cc.forget_node(&m.name);
            }
        }
        self.emit(Event::Member(MemberEvent {
            kind: MemberEventKind::Reap,
            members: reaped,
        }));
    }

    /// Periodically retry a random failed member over push/pull.
    async fn reconnect(self: &Arc<Self>) {
        let target = {
            let st = self.state.lock().unwrap();
            if st.failed_members.is_empty() {
                None
            } else {
                use rand::seq::SliceRandom;
                st.failed_members
                    .choose(&mut rand::thread_rng())
                    .and_then(|name| st.members.get(name))
                    .map(|ms| (ms.member.name.clone(), ms.member.socket_addr()))
            }
        };
        let Some((name, addr)) = target else {
            return;
        };
        let Some(membership) = self.membership() else {
            return;
        };

        debug!("attempting to reconnect to failed member {}", name);
        if membership.join(&[addr]).await.is_ok() {
            info!("reconnected to {}", name);
        }
    }

    // =========================================================================
    // MISC
    // =========================================================================

    pub(crate) fn members(&self) -> Vec<Member> {
        let st = self.state.lock().unwrap();
        st.members.values().map(|ms| ms.member.clone()).collect()
    }

    pub(crate) fn stats(&self) -> HashMap<&'static str, String> {
        let st = self.state.lock().unwrap();
        let alive = st
            .members
            .values()
            .filter(|m| m.member.status == MemberStatus::Alive)
            .count();

        let mut out = HashMap::new();
        out.insert("members", st.members.len().to_string());
        out.insert("members_alive", alive.to_string());
        out.insert("members_failed", st.failed_members.len().to_string());
        out.insert("members_left", st.left_members.len().to_string());
        out.insert("member_time", self.member_clock.time().to_string());
        out.insert("event_time", self.event_clock.time().to_string());
        out.insert("query_time", self.query_clock.time().to_string());
        out.insert("event_queue", self.event_broadcasts.len().to_string());
        out.insert(
            "query_pending",
            self.pending_queries.lock().unwrap().len().to_string(),
        );
        out.insert(
            "intent_buffer",
            st.recent_intents.len().to_string(),
        );
        out.insert("encrypted", self.keyring.is_some().to_string());
        out.insert(
            "uptime_seconds",
            self.start_time.elapsed().as_secs().to_string(),
        );
        out
    }
}

fn expired(st: &ClusterState, name: &str, timeout: Duration) -> bool {
    st.members
        .get(name)
        .and_then(|ms| ms.leave_time)
        .map(|t| t.elapsed() >= timeout)
        .unwrap_or(true)
}

fn intent_key(node: &str) -> String {
    format!("intent:{}", node)
}

fn event_key(msg: &UserEventMsg) -> String {
    use siphasher::sip::SipHasher24;
    use std::hash::Hasher;
    let mut h = SipHasher24::new_with_keys(0, 0);
    h.write_u64(msg.ltime);
    h.write(msg.name.as_bytes());
    h.write(&msg.payload);
    format!("event:{}", hex::encode(h.finish().to_be_bytes()))
}

fn member_from_node(node: &Node, tags: Tags) -> Member {
    let mut m = Member {
        name: node.name.clone(),
        addr: node.addr,
        port: node.port,
        tags,
        status: MemberStatus::Alive,
        protocol_min: 0,
        protocol_max: 0,
        protocol_cur: 0,
        delegate_min: 0,
        delegate_max: 0,
        delegate_cur: 0,
    };
    apply_vsn(&mut m, node.vsn);
    m
}

fn apply_vsn(m: &mut Member, vsn: [u8; 6]) {
    m.protocol_min = vsn[0];
    m.protocol_max = vsn[1];
    m.protocol_cur = vsn[2];
    m.delegate_min = vsn[3];
    m.delegate_max = vsn[4];
    m.delegate_cur = vsn[5];
}

fn resolve_addr(s: &str) -> Result<SocketAddr> {
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = s.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_BIND_PORT));
    }
    use std::net::ToSocketAddrs;
    let candidate = if s.contains(':') {
        s.to_socket_addrs()
    } else {
        (s, DEFAULT_BIND_PORT).to_socket_addrs()
    };
    candidate
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::Config(format!("could not resolve {:?}", s)))
}

// =============================================================================
// DELEGATE WIRING
// =============================================================================

/// Thin adapter the membership engine calls into; holds the orchestrator
/// weakly so shutdown can tear the pair down.
struct ClusterDelegate {
    core: Weak<ClusterCore>,
}

impl Delegate for ClusterDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let Some(core) = self.core.upgrade() else {
            return Vec::new();
        };
        let tags = core.tags.lock().unwrap().clone();
        match encode_tags(&tags) {
            Ok(buf) if buf.len() <= limit => buf,
            Ok(_) | Err(_) => {
                warn!("tags exceed the metadata limit, gossiping none");
                Vec::new()
            }
        }
    }

    fn notify_message(&self, buf: &[u8], from: SocketAddr) {
        if let Some(core) = self.core.upgrade() {
            core.handle_message(buf, from);
        }
    }

    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let Some(core) = self.core.upgrade() else {
            return Vec::new();
        };
        let n = core.membership().map(|m| m.num_alive()).unwrap_or(1);
        core.event_broadcasts
            .get_broadcasts(overhead, limit, core.config.retransmit_mult, n)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.core
            .upgrade()
            .map(|core| core.local_user_state())
            .unwrap_or_default()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if let Some(core) = self.core.upgrade() {
            core.merge_user_state(buf, join);
        }
    }

    fn notify_join(&self, node: &Node) {
        if let Some(core) = self.core.upgrade() {
            core.handle_node_join(node);
        }
    }

    fn notify_leave(&self, node: &Node) {
        if let Some(core) = self.core.upgrade() {
            core.handle_node_leave(node);
        }
    }

    fn notify_update(&self, node: &Node) {
        if let Some(core) = self.core.upgrade() {
            core.handle_node_update(node);
        }
    }

    fn notify_conflict(&self, existing: &Node, other: &Node) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if existing.name == core.config.node_name {
            core.handle_name_conflict(other);
        }
        // For remote names the engine already keeps the existing record.
    }

    fn ack_payload(&self) -> Vec<u8> {
        let Some(core) = self.core.upgrade() else {
            return Vec::new();
        };
        match &core.coord_client {
            Some(cc) => postcard::to_stdvec(&cc.get()).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn notify_ping_rtt(&self, node: &str, payload: &[u8], rtt: Duration) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Some(cc) = &core.coord_client else {
            return;
        };
        if payload.is_empty() {
            return;
        }
        match postcard::from_bytes::<Coordinate>(payload) {
            Ok(coord) => {
                cc.update(node, &coord, rtt);
                core.coord_cache
                    .lock()
                    .unwrap()
                    .insert(node.to_string(), coord);
            }
            Err(e) => debug!("undecodable coordinate in ack from {}: {}", node, e),
        }
    }
}

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// A running cluster node.
pub struct Cluster {
    core: Arc<ClusterCore>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").finish_non_exhaustive()
    }
}

impl Cluster {
    /// Bind sockets, recover the snapshot, start every background task, and
    /// announce the local node.
    pub async fn create(config: Config) -> Result<Cluster> {
        config.validate()?;
        let config = Arc::new(config);

        let keyring = match (&config.keyring_file, &config.encryption_key) {
            (Some(path), _) => Some(Arc::new(Keyring::load(path)?)),
            (None, Some(key)) => Some(Arc::new(Keyring::new(key.clone())?)),
            (None, None) => None,
        };

        // Recover prior state before anything touches the network.
        let replay = match &config.snapshot_path {
            Some(path) => Some(snapshot::replay(path)?),
            None => None,
        };
        if let Some(replay) = &replay {
            if replay.alive.iter().any(|n| n.name == config.node_name) {
                return Err(Error::SnapshotIdentity(config.node_name.clone()));
            }
        }

        let coord_client = if config.disable_coordinates {
            None
        } else {
            let cc = Arc::new(CoordinateClient::new());
            if let Some(coord) = replay.as_ref().and_then(|r| r.coordinate.clone()) {
                cc.set(coord);
            }
            Some(cc)
        };

        let core = Arc::new(ClusterCore {
            config: config.clone(),
            keyring: keyring.clone(),
            tags: Mutex::new(config.tags.clone()),
            member_clock: LamportClock::new(),
            event_clock: LamportClock::new(),
            query_clock: LamportClock::new(),
            state: Mutex::new(ClusterState::new(
                config.event_buffer_size,
                config.query_buffer_size,
            )),
            membership: OnceLock::new(),
            event_broadcasts: TransmitQueue::new(),
            pending_queries: Mutex::new(HashMap::new()),
            query_id: AtomicU32::new(0),
            outbox: Outbox::default(),
            event_join_ignore: AtomicBool::new(false),
            coord_client,
            coord_cache: Mutex::new(HashMap::new()),
            snapshot: OnceLock::new(),
            start_time: Instant::now(),
        });

        // Clocks start at one so time zero stays "never seen", then move past
        // anything the snapshot recorded.
        core.member_clock.increment();
        core.event_clock.increment();
        core.query_clock.increment();
        if let Some(replay) = &replay {
            core.member_clock.witness(replay.last_clock);
            core.event_clock.witness(replay.last_event_clock);
            core.query_clock.witness(replay.last_query_clock);
        }

        // The engine consumes the delegate; the weak reference breaks the
        // orchestrator <-> engine cycle.
        let delegate = Arc::new(ClusterDelegate {
            core: Arc::downgrade(&core),
        });
        let membership = Membership::new(config.clone(), keyring, delegate).await?;
        core.membership
            .set(membership.clone())
            .map_err(|_| Error::Config("membership attached twice".to_string()))?;

        let shutdown_rx = membership.shutdown_rx();

        // Event pipeline, innermost stage first:
        // outbox -> [coalescer] -> [snapshotter] -> host channel.
        let (user_tx, user_rx) = mpsc::channel(config.event_channel_size);

        let snapshot_stage_tx = match &config.snapshot_path {
            Some(path) => {
                let handle = snapshot::start(
                    path.clone(),
                    &config,
                    Arc::downgrade(&core),
                    user_tx.clone(),
                    shutdown_rx.clone(),
                )?;
                let tx = handle.sender();
                let _ = core.snapshot.set(handle);
                tx
            }
            None => user_tx.clone(),
        };

        let head_tx = if config.coalesce_enabled() {
            let (col_tx, col_rx) = mpsc::channel(config.event_channel_size);
            coalesce::spawn(
                col_rx,
                snapshot_stage_tx,
                config.coalesce_period,
                config.quiescent_period,
                shutdown_rx.clone(),
            );
            col_tx
        } else {
            snapshot_stage_tx
        };

        spawn_outbox_drainer(core.clone(), head_tx, shutdown_rx.clone());

        // We are a member as of now.
        let ltime = core.member_clock.increment();
        {
            let mut st = core.state.lock().unwrap();
            if let Some(ms) = st.members.get_mut(&config.node_name) {
                ms.status_ltime = ltime;
            }
        }
        core.broadcast_join_intent(ltime);

        spawn_reaper(core.clone(), shutdown_rx.clone());
        spawn_reconnector(core.clone(), shutdown_rx.clone());

        // Unclean prior shutdown: quietly rejoin the old cluster.
        if let Some(replay) = replay {
            if !replay.clean_leave && !replay.alive.is_empty() {
                spawn_auto_rejoin(core.clone(), replay, shutdown_rx);
            }
        }

        Ok(Cluster {
            core,
            events_rx: Mutex::new(Some(user_rx)),
        })
    }

    /// Take the event stream. Can be taken exactly once.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Join a cluster through any of the given `host:port` addresses.
    /// `ignore_old` suppresses replay of user events that predate us.
    pub async fn join<S: AsRef<str>>(&self, addrs: &[S], ignore_old: bool) -> Result<usize> {
        self.core.join(addrs, ignore_old).await
    }

    /// Gracefully announce departure and wait for it to propagate.
    pub async fn leave(&self) -> Result<()> {
        self.core.leave().await
    }

    /// Hard stop without a leave broadcast. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }

    pub fn members(&self) -> Vec<Member> {
        self.core.members()
    }

    pub fn num_members(&self) -> usize {
        self.core.state.lock().unwrap().members.len()
    }

    pub fn local_member(&self) -> Member {
        let st = self.core.state.lock().unwrap();
        st.members
            .get(&self.core.config.node_name)
            .map(|ms| ms.member.clone())
            .unwrap_or_else(|| {
                let mut m = member_from_node(
                    &Node {
                        name: self.core.config.node_name.clone(),
                        addr: self.core.config.bind_addr,
                        port: self.core.config.bind_port,
                        meta: Vec::new(),
                        vsn: [0; 6],
                    },
                    self.core.tags.lock().unwrap().clone(),
                );
                m.status = MemberStatus::None;
                m
            })
    }

    /// Broadcast a user event. Best-effort, at-most-once per receiver.
    pub fn user_event(&self, name: &str, payload: &[u8], coalesce: bool) -> Result<()> {
        self.core.user_event(name, payload, coalesce)
    }

    /// Fan a query out to the cluster and stream back acks and responses.
    pub fn query(
        &self,
        name: &str,
        payload: &[u8],
        params: Option<QueryParams>,
    ) -> Result<QueryResponse> {
        self.core
            .start_query(name, payload, params.unwrap_or_default())
    }

    /// Replace the local tags and re-announce.
    pub async fn set_tags(&self, tags: Tags) -> Result<()> {
        encode_tags(&tags)?;
        *self.core.tags.lock().unwrap() = tags;
        let membership = self.core.membership().ok_or(Error::Shutdown)?;
        membership
            .update_local_meta(self.core.config.broadcast_timeout)
            .await
    }

    /// Merge in additions and removals, then re-announce.
    pub async fn update_tags(&self, add: Tags, remove: &[String]) -> Result<()> {
        let mut tags = self.core.tags.lock().unwrap().clone();
        for (k, v) in add {
            tags.insert(k, v);
        }
        for k in remove {
            tags.remove(k);
        }
        self.set_tags(tags).await
    }

    /// Transition a failed member to left; `prune` erases it immediately
    /// everywhere.
    pub fn force_leave(&self, node: &str, prune: bool) -> Result<()> {
        self.core.check_alive()?;
        let ltime = self.core.member_clock.increment();
        let msg = LeaveIntentMsg {
            ltime,
            node: node.to_string(),
            prune,
        };
        if self.core.handle_leave_intent(&msg) {
            self.core
                .requeue(MessageType::LeaveIntent, &msg, intent_key(node));
        }
        Ok(())
    }

    /// Cluster-wide keyring administration.
    pub fn key_manager(&self) -> KeyManager {
        KeyManager {
            core: self.core.clone(),
        }
    }

    /// The network coordinate of a node, when coordinates are enabled and the
    /// node has been observed.
    pub fn get_coordinate(&self, node: &str) -> Option<Coordinate> {
        let cc = self.core.coord_client.as_ref()?;
        if node == self.core.config.node_name {
            return Some(cc.get());
        }
        self.core.coord_cache.lock().unwrap().get(node).cloned()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> HashMap<&'static str, String> {
        self.core.stats()
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

fn spawn_outbox_drainer(
    core: Arc<ClusterCore>,
    head_tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let ev = core.outbox.queue.lock().unwrap().pop_front();
            match ev {
                Some(ev) => {
                    if head_tx.send(ev).await.is_err() {
                        return;
                    }
                }
                None => {
                    tokio::select! {
                        _ = core.outbox.notify.notified() => {}
                        res = shutdown.changed() => {
                            if res.is_err() || *shutdown.borrow() {
                                // Drain what is already queued, then stop.
                                loop {
                                    let ev = core.outbox.queue.lock().unwrap().pop_front();
                                    let Some(ev) = ev else { break };
                                    if head_tx.send(ev).await.is_err() {
                                        return;
                                    }
                                }
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
}

fn spawn_reaper(core: Arc<ClusterCore>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(core.config.reap_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() { return; }
                }
                _ = tick.tick() => core.reap(),
            }
        }
    });
}

fn spawn_reconnector(core: Arc<ClusterCore>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(core.config.reconnect_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() { return; }
                }
                _ = tick.tick() => core.reconnect().await,
            }
        }
    });
}

/// After an unclean shutdown, try the previously known peers with exponential
/// backoff.
fn spawn_auto_rejoin(
    core: Arc<ClusterCore>,
    replay: snapshot::SnapshotReplay,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let addrs: Vec<String> = replay.alive.iter().map(|n| n.addr.clone()).collect();
        info!(
            "attempting auto-rejoin of {} previously known peers",
            addrs.len()
        );

        let mut delay = core.config.reconnect_interval.min(Duration::from_secs(1));
        for attempt in 1..=3u32 {
            match core.join(&addrs, true).await {
                Ok(n) if n > 0 => {
                    info!("auto-rejoin succeeded through {} peers", n);
                    return;
                }
                Ok(_) | Err(_) => {
                    debug!("auto-rejoin attempt {} failed", attempt);
                }
            }
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() { return; }
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }
        warn!("auto-rejoin gave up after 3 attempts");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_addr() {
        assert_eq!(
            resolve_addr("127.0.0.1:7000").unwrap(),
            "127.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_addr("10.0.0.9").unwrap().port(),
            DEFAULT_BIND_PORT
        );
        assert!(resolve_addr("not an address").is_err());
    }

    #[test]
    fn test_upsert_intent_keeps_newest() {
        let mut st = ClusterState::new(8, 8);
        assert!(st.upsert_intent(IntentKind::Join, "n1", 5));
        assert!(!st.upsert_intent(IntentKind::Leave, "n1", 4));
        assert!(st.upsert_intent(IntentKind::Leave, "n1", 9));
        assert_eq!(st.recent_intents.len(), 1);
    }

    #[test]
    fn test_upsert_intent_bounded() {
        let mut st = ClusterState::new(8, 8);
        for i in 0..(MAX_RECENT_INTENTS + 16) {
            st.upsert_intent(IntentKind::Join, &format!("n{}", i), i as u64 + 1);
        }
        assert!(st.recent_intents.len() <= MAX_RECENT_INTENTS);
    }

    #[test]
    fn test_event_key_stable() {
        let msg = UserEventMsg {
            ltime: 7,
            name: "deploy".into(),
            payload: b"v1".to_vec(),
            cc: false,
        };
        assert_eq!(event_key(&msg), event_key(&msg.clone()));
    }
}
