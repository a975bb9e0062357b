//! SWIM state transitions, probing, and gossip.

use super::{AckHandler, AckInfo, Membership, Node, NodeState};
use crate::cidr::ip_allowed;
use crate::error::Result;
use crate::types::MAX_NODE_NAME_LEN;
use crate::wire::{
    self, AliveMsg, DeadMsg, IndirectPingMsg, MessageType, NodeStatus, PingMsg, PushNodeState,
    PushPullMsg, SuspectMsg, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD, MAX_COMPOUND_MESSAGES,
};
use rand::seq::SliceRandom;
use serde::Serialize;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Keyed hash of the metadata field, used as the tiebreak when two alive
/// messages carry the same incarnation.
pub(crate) fn meta_hash(meta: &[u8]) -> u64 {
    let mut h = SipHasher24::new_with_keys(0, 0);
    h.write(meta);
    h.finish()
}

impl Membership {
    /// Encode and enqueue a gossip broadcast.
    pub(crate) fn queue_message<T: Serialize>(
        &self,
        ty: MessageType,
        msg: &T,
        key: Option<String>,
        notify: Option<oneshot::Sender<()>>,
    ) {
        match wire::encode(ty, msg) {
            Ok(buf) => self.broadcasts.queue(key, buf, notify),
            Err(e) => warn!("failed to encode {:?} broadcast: {}", ty, e),
        }
    }

    /// Handle an alive message (gossip, push/pull merge, or self-originated
    /// when `self_originated` is set).
    pub(crate) fn alive_node(
        &self,
        a: AliveMsg,
        notify: Option<oneshot::Sender<()>>,
        self_originated: bool,
    ) {
        let is_local = a.node == self.config.node_name;

        let mut deliver_join: Option<Node> = None;
        let mut deliver_update: Option<Node> = None;
        let mut deliver_conflict: Option<(Node, Node)> = None;
        let mut refute_incarnation: Option<u64> = None;
        let mut rebroadcast = false;

        {
            let mut map = self.nodes.lock().unwrap();

            if is_local && self.leaving.load(Ordering::SeqCst) && !self_originated {
                return;
            }

            if !map.states.contains_key(&a.node) {
                if a.node.len() > MAX_NODE_NAME_LEN {
                    warn!("ignoring alive for oversized node name from {}", a.addr);
                    return;
                }
                if !ip_allowed(&self.allowed_cidrs, &a.addr) {
                    warn!(
                        "rejecting node {} at {}: outside allowed CIDR ranges",
                        a.node, a.addr
                    );
                    return;
                }
                // Placeholder in the dead state; the transition below fires
                // the join event.
                map.states.insert(
                    a.node.clone(),
                    NodeState {
                        node: Node {
                            name: a.node.clone(),
                            addr: a.addr,
                            port: a.port,
                            meta: Vec::new(),
                            vsn: a.vsn,
                        },
                        incarnation: 0,
                        status: NodeStatus::Dead,
                        state_change: Instant::now(),
                        suspicion: None,
                    },
                );
            }

            let Some(entry) = map.states.get_mut(&a.node) else {
                return;
            };

            if entry.node.addr != a.addr || entry.node.port != a.port {
                // The name is claimed from a different endpoint. Keep the
                // existing record; resolution happens above us.
                let other = Node {
                    name: a.node.clone(),
                    addr: a.addr,
                    port: a.port,
                    meta: a.meta.clone(),
                    vsn: a.vsn,
                };
                deliver_conflict = Some((entry.node.clone(), other));
                if is_local {
                    // Someone is impersonating us; out-bid their claim.
                    refute_incarnation = Some(a.incarnation);
                }
            } else if is_local && !self_originated {
                // Gossip about ourselves: either an echo of our own alive or
                // a stale claim that needs refuting.
                let cur = self.incarnation.load(Ordering::SeqCst);
                if a.incarnation < cur {
                    return;
                }
                if a.incarnation == cur && a.meta == entry.node.meta {
                    return;
                }
                refute_incarnation = Some(a.incarnation);
            } else {
                let accept = if is_local {
                    // Self-originated (startup, tag update, refutation).
                    true
                } else {
                    let newer = a.incarnation > entry.incarnation;
                    let tiebreak = a.incarnation == entry.incarnation
                        && a.meta != entry.node.meta
                        && meta_hash(&a.meta) > meta_hash(&entry.node.meta);
                    newer || tiebreak
                };
                if !accept {
                    trace!(
                        "ignoring stale alive for {} (incarnation {} <= {})",
                        a.node,
                        a.incarnation,
                        entry.incarnation
                    );
                    return;
                }

                let meta_changed = entry.node.meta != a.meta;
                entry.incarnation = a.incarnation;
                entry.node.meta = a.meta.clone();
                entry.node.vsn = a.vsn;

                let mut insert_ring = false;
                if entry.status != NodeStatus::Alive {
                    let old = entry.status;
                    entry.status = NodeStatus::Alive;
                    entry.state_change = Instant::now();
                    entry.suspicion = None;
                    insert_ring = !is_local;
                    // Suspect -> Alive is a refutation, not a (re)join.
                    if matches!(old, NodeStatus::Dead | NodeStatus::Left) {
                        deliver_join = Some(entry.node.clone());
                    }
                } else if meta_changed {
                    deliver_update = Some(entry.node.clone());
                }
                rebroadcast = true;

                if insert_ring {
                    let name = a.node.clone();
                    map.ring_insert(&name);
                }
            }
        }

        if rebroadcast {
            self.queue_message(MessageType::Alive, &a, Some(a.node.clone()), notify);
        }
        if let Some(inc) = refute_incarnation {
            self.refute(inc);
        }
        if let Some((existing, other)) = deliver_conflict {
            warn!(
                "name conflict for {}: known at {}, claimed from {}",
                existing.name,
                existing.socket_addr(),
                other.socket_addr()
            );
            self.delegate.notify_conflict(&existing, &other);
        }
        if let Some(node) = deliver_join {
            debug!("node joined: {} at {}", node.name, node.socket_addr());
            self.delegate.notify_join(&node);
        }
        if let Some(node) = deliver_update {
            debug!("node updated: {}", node.name);
            self.delegate.notify_update(&node);
        }
    }

    /// Handle a suspect message or a locally failed probe.
    pub(crate) fn suspect_node(self: &Arc<Self>, s: SuspectMsg) {
        let mut rebroadcast = false;
        let mut refute_incarnation: Option<u64> = None;

        {
            let mut map = self.nodes.lock().unwrap();
            let n_alive = map
                .states
                .values()
                .filter(|st| st.probeable())
                .count();

            let Some(entry) = map.states.get_mut(&s.node) else {
                return;
            };
            if s.incarnation < entry.incarnation {
                return;
            }

            if s.node == self.config.node_name {
                refute_incarnation = Some(s.incarnation);
            } else {
                match entry.status {
                    NodeStatus::Suspect => {
                        // Another independent accuser accelerates the timer.
                        if let Some(susp) = &entry.suspicion {
                            rebroadcast = susp.confirm(&s.from);
                        }
                    }
                    NodeStatus::Dead | NodeStatus::Left => {}
                    NodeStatus::Alive => {
                        entry.status = NodeStatus::Suspect;
                        entry.state_change = Instant::now();

                        let (k_max, min, max) = self.suspicion_bounds(n_alive);
                        let me = self.clone();
                        let node = s.node.clone();
                        let incarnation = entry.incarnation;
                        entry.suspicion = Some(super::Suspicion::new(
                            &s.from,
                            k_max,
                            min,
                            max,
                            move |confirmations| {
                                warn!(
                                    "suspicion of {} timed out with {} confirmations, marking dead",
                                    node, confirmations
                                );
                                me.dead_node(DeadMsg {
                                    incarnation,
                                    node: node.clone(),
                                    from: me.config.node_name.clone(),
                                });
                            },
                        ));
                        rebroadcast = true;
                        debug!("node suspected: {} (accused by {})", s.node, s.from);
                    }
                }
            }
        }

        if let Some(inc) = refute_incarnation {
            warn!("refuting suspicion about the local node");
            self.refute(inc);
            return;
        }
        if rebroadcast {
            self.queue_message(MessageType::Suspect, &s, Some(s.node.clone()), None);
        }
    }

    /// Suspicion timer parameters for a cluster of `n` probeable nodes.
    fn suspicion_bounds(&self, n: usize) -> (u32, std::time::Duration, std::time::Duration) {
        let cfg = &self.config;
        let expected = cfg.suspicion_mult.saturating_sub(2);
        // Tiny clusters cannot produce independent confirmations; pin the
        // timer to the floor instead of waiting for them.
        let k_max = if n.saturating_sub(2) < expected as usize {
            0
        } else {
            expected
        };
        let scale = (n.max(1) as f64).log10().max(1.0);
        let min = cfg.probe_interval.mul_f64(cfg.suspicion_mult as f64 * scale);
        let max = min * cfg.suspicion_max_timeout_mult;
        (k_max, min, max)
    }

    /// Handle a dead message (accusation, graceful leave, or suspicion
    /// timeout).
    pub(crate) fn dead_node(&self, d: DeadMsg) {
        let is_local = d.node == self.config.node_name;
        let mut deliver_leave: Option<Node> = None;
        let mut refute_incarnation: Option<u64> = None;
        let mut rebroadcast = false;

        {
            let mut map = self.nodes.lock().unwrap();
            let Some(entry) = map.states.get_mut(&d.node) else {
                return;
            };
            if d.incarnation < entry.incarnation {
                return;
            }

            if is_local && !self.leaving.load(Ordering::SeqCst) {
                // A death notice about a running node is impossible; out-bid
                // it.
                refute_incarnation = Some(d.incarnation);
            } else if !matches!(entry.status, NodeStatus::Dead | NodeStatus::Left) {
                entry.incarnation = d.incarnation;
                // A node declaring its own death is leaving; an accusation
                // from a third party is a failure.
                entry.status = if d.from == d.node {
                    NodeStatus::Left
                } else {
                    NodeStatus::Dead
                };
                entry.state_change = Instant::now();
                entry.suspicion = None;
                deliver_leave = Some(entry.node.clone());
                rebroadcast = true;

                map.ring_remove(&d.node);
            }
        }

        if let Some(inc) = refute_incarnation {
            warn!("refuting death notice about the local node");
            self.refute(inc);
            return;
        }
        if rebroadcast {
            self.queue_message(MessageType::Dead, &d, Some(d.node.clone()), None);
        }
        if let Some(node) = deliver_leave {
            debug!("node left or failed: {}", node.name);
            self.delegate.notify_leave(&node);
        }
    }

    /// Bump our incarnation past an accusation and re-announce.
    pub(crate) fn refute(&self, accused_incarnation: u64) {
        if self.leaving.load(Ordering::SeqCst) {
            return;
        }
        let cur = self.incarnation.load(Ordering::SeqCst);
        let inc = if accused_incarnation >= cur {
            self.skip_incarnation(accused_incarnation - cur + 1)
        } else {
            cur
        };

        let alive = {
            let mut map = self.nodes.lock().unwrap();
            let Some(entry) = map.states.get_mut(self.config.node_name.as_str()) else {
                return;
            };
            entry.incarnation = inc;
            AliveMsg {
                incarnation: inc,
                node: entry.node.name.clone(),
                addr: entry.node.addr,
                port: entry.node.port,
                meta: entry.node.meta.clone(),
                vsn: entry.node.vsn,
            }
        };
        self.queue_message(MessageType::Alive, &alive, Some(alive.node.clone()), None);
    }

    /// Apply a remote node list from a push/pull exchange. Remote death
    /// claims become local suspicions so a single stale peer cannot kill
    /// nodes outright.
    pub(crate) fn merge_state(self: &Arc<Self>, states: Vec<PushNodeState>) {
        for rs in states {
            match rs.state {
                NodeStatus::Alive => self.alive_node(
                    AliveMsg {
                        incarnation: rs.incarnation,
                        node: rs.name,
                        addr: rs.addr,
                        port: rs.port,
                        meta: rs.meta,
                        vsn: rs.vsn,
                    },
                    None,
                    false,
                ),
                NodeStatus::Left => self.dead_node(DeadMsg {
                    incarnation: rs.incarnation,
                    node: rs.name.clone(),
                    from: rs.name,
                }),
                NodeStatus::Dead | NodeStatus::Suspect => self.suspect_node(SuspectMsg {
                    incarnation: rs.incarnation,
                    node: rs.name,
                    from: self.config.node_name.clone(),
                }),
            }
        }
    }

    // =========================================================================
    // PROBING
    // =========================================================================

    /// One SWIM probe round: pick the next ring member and check it.
    pub(crate) async fn probe(self: &Arc<Self>) {
        let target = {
            let mut map = self.nodes.lock().unwrap();
            let mut picked = None;
            let mut checked = 0;
            while checked < map.ring.len() {
                if map.probe_index >= map.ring.len() {
                    map.probe_index = 0;
                    let mut rng = rand::thread_rng();
                    map.ring.shuffle(&mut rng);
                }
                let name = map.ring[map.probe_index].clone();
                map.probe_index += 1;
                checked += 1;

                match map.states.get(&name) {
                    Some(entry)
                        if entry.probeable() && entry.node.name != self.config.node_name =>
                    {
                        picked = Some((entry.node.clone(), entry.incarnation));
                        break;
                    }
                    _ => continue,
                }
            }
            picked
        };

        let Some((node, incarnation)) = target else {
            return;
        };
        self.probe_node(node, incarnation).await;
    }

    /// Direct UDP ping, then indirect probes plus a TCP fallback, then
    /// suspicion.
    pub(crate) async fn probe_node(self: &Arc<Self>, node: Node, incarnation: u64) {
        let seq = self.next_seq_no();
        let (ack_tx, mut ack_rx) = mpsc::channel::<AckInfo>(4);
        let (nack_tx, mut nack_rx) = mpsc::channel::<()>(4);
        self.ack_handlers.lock().unwrap().insert(
            seq,
            AckHandler {
                ack_tx,
                nack_tx: Some(nack_tx),
            },
        );

        let ping = PingMsg {
            seq_no: seq,
            node: node.name.clone(),
            from: self.config.node_name.clone(),
        };

        let sent_at = Instant::now();
        if let Err(e) = self
            .send_with_piggyback(node.socket_addr(), MessageType::Ping, &ping)
            .await
        {
            debug!("failed to ping {}: {}", node.name, e);
        }

        let mut acked = false;
        if let Ok(Some(info)) =
            tokio::time::timeout(self.config.probe_timeout, ack_rx.recv()).await
        {
            acked = true;
            let rtt = info.timestamp.saturating_duration_since(sent_at);
            self.delegate.notify_ping_rtt(&node.name, &info.payload, rtt);
        }

        if !acked {
            // Ask a few peers to probe on our behalf; their ack routes back
            // under our sequence number.
            let relays = self.k_random_nodes(self.config.indirect_checks, &[&node.name]);
            let ind = IndirectPingMsg {
                seq_no: seq,
                target_addr: node.addr,
                target_port: node.port,
                target: node.name.clone(),
                from: self.config.node_name.clone(),
                nack: true,
            };
            for relay in &relays {
                if let Err(e) = self
                    .send_with_piggyback(relay.socket_addr(), MessageType::IndirectPing, &ind)
                    .await
                {
                    debug!("failed to send indirect ping via {}: {}", relay.name, e);
                }
            }

            // TCP fallback catches UDP-only blackholes.
            let (fb_tx, mut fb_rx) = oneshot::channel();
            {
                let me = self.clone();
                let target = node.clone();
                let ping = ping.clone();
                tokio::spawn(async move {
                    let ok = me.tcp_ping(&target, &ping).await.unwrap_or(false);
                    let _ = fb_tx.send(ok);
                });
            }

            let deadline = tokio::time::Instant::now()
                + self
                    .config
                    .probe_interval
                    .saturating_sub(self.config.probe_timeout);
            let mut fallback_pending = true;
            loop {
                tokio::select! {
                    info = ack_rx.recv() => {
                        if info.is_some() {
                            acked = true;
                        }
                        break;
                    }
                    res = &mut fb_rx, if fallback_pending => {
                        fallback_pending = false;
                        if matches!(res, Ok(true)) {
                            warn!(
                                "{} unreachable over UDP but answered over TCP; check for \
                                 UDP packet loss or filtering",
                                node.name
                            );
                            acked = true;
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        self.ack_handlers.lock().unwrap().remove(&seq);

        if !acked {
            let mut nacks = 0;
            while nack_rx.try_recv().is_ok() {
                nacks += 1;
            }
            warn!(
                "probe of {} failed (direct, {} indirect nacks, tcp); suspecting",
                node.name, nacks
            );
            self.suspect_node(SuspectMsg {
                incarnation,
                node: node.name.clone(),
                from: self.config.node_name.clone(),
            });
        }
    }

    /// Ping over TCP; true if the target answered with a matching ack.
    pub(crate) async fn tcp_ping(&self, target: &Node, ping: &PingMsg) -> Result<bool> {
        let mut stream = self.transport.dial(target.socket_addr()).await?;
        let buf = wire::encode(MessageType::Ping, ping)?;
        self.transport.write_frame(&mut stream, &buf).await?;
        let frame = self.transport.read_frame(&mut stream).await?;

        if frame.first() == Some(&(MessageType::Ack as u8)) {
            let ack: wire::AckMsg = wire::decode(&frame[1..])?;
            return Ok(ack.seq_no == ping.seq_no);
        }
        Ok(false)
    }

    // =========================================================================
    // GOSSIP / ANTI-ENTROPY
    // =========================================================================

    /// Send queued broadcasts to a few random peers.
    pub(crate) async fn gossip(&self) {
        let targets = self.k_random_nodes(self.config.gossip_nodes, &[]);
        for target in targets {
            let msgs = self.gather_broadcasts(0);
            if msgs.is_empty() {
                continue;
            }
            let packet = if msgs.len() == 1 {
                msgs.into_iter().next().unwrap()
            } else {
                wire::make_compound(&msgs)
            };
            if let Err(e) = self.transport.send_packet(target.socket_addr(), &packet).await {
                debug!("gossip to {} failed: {}", target.name, e);
            }
        }
    }

    /// Drain broadcasts (engine first, then the upper layer) into at most one
    /// packet's worth of messages.
    pub(crate) fn gather_broadcasts(&self, already_used: usize) -> Vec<Vec<u8>> {
        let budget = self
            .transport
            .max_packet_payload()
            .saturating_sub(already_used + COMPOUND_HEADER_OVERHEAD);
        if budget == 0 {
            return Vec::new();
        }
        let n = self.num_alive();

        let mut msgs =
            self.broadcasts
                .get_broadcasts(COMPOUND_OVERHEAD, budget, self.config.retransmit_mult, n);
        let spent: usize = msgs.iter().map(|m| m.len() + COMPOUND_OVERHEAD).sum();

        let rest = budget.saturating_sub(spent);
        if rest > COMPOUND_OVERHEAD {
            msgs.extend(self.delegate.broadcasts(COMPOUND_OVERHEAD, rest));
        }
        msgs.truncate(MAX_COMPOUND_MESSAGES - 1);
        msgs
    }

    /// Send `msg` plus any piggybacked broadcasts as one datagram.
    pub(crate) async fn send_with_piggyback<T: Serialize>(
        &self,
        addr: SocketAddr,
        ty: MessageType,
        msg: &T,
    ) -> Result<()> {
        let primary = wire::encode(ty, msg)?;
        let extra = self.gather_broadcasts(primary.len());

        let packet = if extra.is_empty() {
            primary
        } else {
            let mut all = Vec::with_capacity(1 + extra.len());
            all.push(primary);
            all.extend(extra);
            wire::make_compound(&all)
        };
        self.transport.send_packet(addr, &packet).await
    }

    /// One anti-entropy exchange with a random live peer.
    pub(crate) async fn push_pull(self: &Arc<Self>) {
        let Some(peer) = self.k_random_nodes(1, &[]).into_iter().next() else {
            return;
        };
        if let Err(e) = self.push_pull_node(peer.socket_addr(), false).await {
            debug!("push/pull with {} failed: {}", peer.name, e);
        }
    }

    /// Snapshot of our full node table plus the upper layer's opaque state.
    pub(crate) fn local_push_pull(&self, join: bool) -> PushPullMsg {
        let states = {
            let map = self.nodes.lock().unwrap();
            map.states
                .values()
                .map(|s| PushNodeState {
                    name: s.node.name.clone(),
                    addr: s.node.addr,
                    port: s.node.port,
                    meta: s.node.meta.clone(),
                    incarnation: s.incarnation,
                    state: s.status,
                    vsn: s.node.vsn,
                })
                .collect()
        };
        PushPullMsg {
            join,
            states,
            user_state: self.delegate.local_state(join),
        }
    }

    pub(crate) fn merge_push_pull(self: &Arc<Self>, remote: PushPullMsg, join_hint: bool) {
        let join = join_hint || remote.join;
        let user_state = remote.user_state;
        self.merge_state(remote.states);
        if !user_state.is_empty() {
            self.delegate.merge_remote_state(&user_state, join);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_hash_differs() {
        assert_ne!(meta_hash(b"a"), meta_hash(b"b"));
        assert_eq!(meta_hash(b"same"), meta_hash(b"same"));
    }
}
