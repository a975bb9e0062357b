//! SWIM membership engine.
//!
//! Keeps the node table, runs failure detection (direct probe, indirect
//! probes, TCP fallback), disseminates alive/suspect/dead messages through
//! gossip, and reconciles full state over TCP push/pull. Everything above
//! this layer (Lamport intents, events, queries) talks to it through the
//! [`Delegate`] trait.

pub mod delegate;
pub mod suspicion;

mod net;
mod state;

pub use delegate::{Delegate, Node};

use crate::broadcast::TransmitQueue;
use crate::cidr::{parse_cidrs, Cidr};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::transport::{Packet, Transport};
use crate::wire::{self, DeadMsg, MessageType, NodeStatus};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use suspicion::Suspicion;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Per-node state held in the node table.
pub(crate) struct NodeState {
    pub(crate) node: Node,
    pub(crate) incarnation: u64,
    pub(crate) status: NodeStatus,
    pub(crate) state_change: Instant,
    pub(crate) suspicion: Option<Suspicion>,
}

impl NodeState {
    pub(crate) fn probeable(&self) -> bool {
        matches!(self.status, NodeStatus::Alive | NodeStatus::Suspect)
    }
}

/// The node table plus the probe ring. All mutations happen while the one
/// mutex is held; decisions and writes are never separated.
#[derive(Default)]
pub(crate) struct NodeMap {
    pub(crate) states: HashMap<String, NodeState>,
    /// Probe order: alive and suspect nodes only, local node excluded.
    pub(crate) ring: Vec<String>,
    pub(crate) probe_index: usize,
}

impl NodeMap {
    /// Insert a name into the probe ring at a random position so fresh nodes
    /// spread probe load instead of clumping at the tail.
    pub(crate) fn ring_insert(&mut self, name: &str) {
        if self.ring.iter().any(|n| n == name) {
            return;
        }
        let idx = rand::thread_rng().gen_range(0..=self.ring.len());
        self.ring.insert(idx, name.to_string());
    }

    pub(crate) fn ring_remove(&mut self, name: &str) {
        if let Some(pos) = self.ring.iter().position(|n| n == name) {
            let removed_before_cursor = pos < self.probe_index;
            self.ring.remove(pos);
            if removed_before_cursor && self.probe_index > 0 {
                self.probe_index -= 1;
            }
        }
    }
}

/// Payload and receive time of an ack, routed back to the waiting prober.
pub(crate) struct AckInfo {
    pub(crate) payload: Vec<u8>,
    pub(crate) timestamp: Instant,
}

pub(crate) struct AckHandler {
    pub(crate) ack_tx: mpsc::Sender<AckInfo>,
    pub(crate) nack_tx: Option<mpsc::Sender<()>>,
}

pub struct Membership {
    pub(crate) config: Arc<Config>,
    pub(crate) delegate: Arc<dyn Delegate>,
    pub(crate) transport: Arc<Transport>,
    pub(crate) advertise: SocketAddr,

    pub(crate) incarnation: AtomicU64,
    pub(crate) seq_no: AtomicU32,

    pub(crate) nodes: Mutex<NodeMap>,
    pub(crate) ack_handlers: Mutex<HashMap<u32, AckHandler>>,
    pub(crate) broadcasts: TransmitQueue,
    pub(crate) allowed_cidrs: Vec<Cidr>,

    shutdown_tx: watch::Sender<bool>,
    pub(crate) leaving: AtomicBool,
    has_shutdown: AtomicBool,
}

impl Membership {
    /// Bind sockets, announce the local node, and start the engine tasks.
    pub async fn new(
        config: Arc<Config>,
        keyring: Option<Arc<Keyring>>,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Self>> {
        let allowed_cidrs = parse_cidrs(&config.allowed_cidrs)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bind = SocketAddr::new(config.bind_addr, config.bind_port);
        let (transport, packet_rx, stream_rx) = Transport::bind(
            bind,
            config.label.clone(),
            keyring,
            config.stream_timeout,
            shutdown_rx,
        )
        .await?;

        let advertise_ip = match config.advertise_addr {
            Some(ip) => ip,
            None if !config.bind_addr.is_unspecified() => config.bind_addr,
            None => detect_advertise_ip().ok_or_else(|| {
                Error::Config(
                    "could not detect an advertise address for a wildcard bind; set \
                     advertise_addr"
                        .to_string(),
                )
            })?,
        };
        let advertise_port = config
            .advertise_port
            .unwrap_or_else(|| transport.local_addr().port());
        let advertise = SocketAddr::new(advertise_ip, advertise_port);

        let me = Arc::new(Self {
            config,
            delegate,
            transport,
            advertise,
            incarnation: AtomicU64::new(0),
            seq_no: AtomicU32::new(0),
            nodes: Mutex::new(NodeMap::default()),
            ack_handlers: Mutex::new(HashMap::new()),
            broadcasts: TransmitQueue::new(),
            allowed_cidrs,
            shutdown_tx,
            leaving: AtomicBool::new(false),
            has_shutdown: AtomicBool::new(false),
        });

        me.set_alive()?;
        me.clone().schedule(packet_rx, stream_rx);

        info!(
            "membership engine started: {} at {}",
            me.config.node_name, me.advertise
        );
        Ok(me)
    }

    pub fn local_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn next_seq_no(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_incarnation(&self) -> u64 {
        self.incarnation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Jump the incarnation past a competing claim when refuting.
    pub(crate) fn skip_incarnation(&self, offset: u64) -> u64 {
        self.incarnation.fetch_add(offset, Ordering::SeqCst) + offset
    }

    /// Alive and suspect nodes, local included.
    pub fn nodes(&self) -> Vec<Node> {
        let map = self.nodes.lock().unwrap();
        map.states
            .values()
            .filter(|s| s.probeable())
            .map(|s| s.node.clone())
            .collect()
    }

    /// Estimated cluster size used to scale gossip and suspicion.
    pub fn num_alive(&self) -> usize {
        let map = self.nodes.lock().unwrap();
        map.states.values().filter(|s| s.probeable()).count()
    }

    /// Pick up to `k` random probeable nodes, excluding `exclude`.
    pub(crate) fn k_random_nodes(&self, k: usize, exclude: &[&str]) -> Vec<Node> {
        let map = self.nodes.lock().unwrap();
        let mut candidates: Vec<&NodeState> = map
            .states
            .values()
            .filter(|s| s.probeable())
            .filter(|s| s.node.name != self.config.node_name)
            .filter(|s| !exclude.contains(&s.node.name.as_str()))
            .collect();
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(k);
        candidates.iter().map(|s| s.node.clone()).collect()
    }

    /// TCP push/pull against each address; returns how many succeeded.
    pub async fn join(self: &Arc<Self>, addrs: &[SocketAddr]) -> Result<usize> {
        let mut count = 0;
        let mut last: Option<Error> = None;
        for addr in addrs {
            match self.push_pull_node(*addr, true).await {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!("failed to join {}: {}", addr, e);
                    last = Some(e);
                }
            }
        }
        if count == 0 {
            if let Some(e) = last {
                return Err(Error::JoinFailed {
                    attempted: addrs.len(),
                    last: Box::new(e),
                });
            }
        }
        Ok(count)
    }

    /// Broadcast a graceful leave and wait for it to drain from the queue.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let dead = DeadMsg {
            incarnation: self.incarnation.load(Ordering::SeqCst),
            node: self.config.node_name.clone(),
            from: self.config.node_name.clone(),
        };
        // Applies the transition locally and queues the broadcast.
        self.dead_node(dead.clone());

        if self.num_alive() == 0 {
            return Ok(());
        }

        // Re-queue the same message with a drain notification; it displaces
        // the entry dead_node queued for the same subject.
        let buf = wire::encode(MessageType::Dead, &dead)?;
        let (tx, rx) = oneshot::channel();
        self.broadcasts
            .queue(Some(dead.node.clone()), buf, Some(tx));

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::LeaveTimeout),
        }
    }

    /// Stop every engine task. Idempotent; never blocks.
    pub fn shutdown(&self) {
        if self.has_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        info!("membership engine shut down: {}", self.config.node_name);
    }

    pub fn is_shutdown(&self) -> bool {
        self.has_shutdown.load(Ordering::SeqCst)
    }

    /// Drop a dead or left node from the table entirely. Called when the
    /// layer above reaps the member; a live node is never forgotten.
    pub fn forget_node(&self, name: &str) {
        let mut map = self.nodes.lock().unwrap();
        let removable = map
            .states
            .get(name)
            .map(|e| !e.probeable())
            .unwrap_or(false);
        if removable {
            map.states.remove(name);
            map.ring_remove(name);
        }
    }

    /// Re-announce the local node with fresh metadata (tag updates).
    pub async fn update_local_meta(&self, timeout: Duration) -> Result<()> {
        let meta = self.delegate.node_meta(crate::types::MAX_TAG_BYTES);
        if meta.len() > crate::types::MAX_TAG_BYTES {
            return Err(Error::SizeLimit {
                kind: "node meta",
                size: meta.len(),
                limit: crate::types::MAX_TAG_BYTES,
            });
        }

        let alive = wire::AliveMsg {
            incarnation: self.next_incarnation(),
            node: self.config.node_name.clone(),
            addr: self.advertise.ip(),
            port: self.advertise.port(),
            meta,
            vsn: self.local_vsn(),
        };

        let (tx, rx) = oneshot::channel();
        self.alive_node(alive, Some(tx), true);

        if self.num_alive() <= 1 {
            return Ok(());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::LeaveTimeout),
        }
    }

    pub(crate) fn local_vsn(&self) -> [u8; 6] {
        use crate::types::*;
        [
            PROTOCOL_MIN,
            PROTOCOL_MAX,
            PROTOCOL_MAX,
            CLUSTER_PROTOCOL_MIN,
            CLUSTER_PROTOCOL_MAX,
            CLUSTER_PROTOCOL_MAX,
        ]
    }

    /// Announce the local node as alive. Called once at startup.
    fn set_alive(&self) -> Result<()> {
        let meta = self.delegate.node_meta(crate::types::MAX_TAG_BYTES);
        let alive = wire::AliveMsg {
            incarnation: self.next_incarnation(),
            node: self.config.node_name.clone(),
            addr: self.advertise.ip(),
            port: self.advertise.port(),
            meta,
            vsn: self.local_vsn(),
        };
        self.alive_node(alive, None, true);
        Ok(())
    }

    /// Spawn the long-lived engine tasks.
    fn schedule(
        self: Arc<Self>,
        mut packet_rx: mpsc::Receiver<Packet>,
        mut stream_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    ) {
        // Probe loop.
        let me = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(me.config.probe_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                    }
                    _ = tick.tick() => {
                        if !me.leaving.load(Ordering::SeqCst) {
                            me.probe().await;
                        }
                    }
                }
            }
        });

        // Gossip loop.
        let me = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(me.config.gossip_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                    }
                    _ = tick.tick() => me.gossip().await,
                }
            }
        });

        // Push/pull anti-entropy loop, interval scaled with cluster size.
        let me = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            loop {
                let interval = push_pull_scale(me.config.push_pull_interval, me.num_alive());
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                    }
                    _ = tokio::time::sleep(interval) => me.push_pull().await,
                }
            }
        });

        // Inbound packets.
        let me = self.clone();
        let mut shutdown = self.shutdown_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                    }
                    pkt = packet_rx.recv() => {
                        let Some(pkt) = pkt else { return };
                        me.handle_packet(pkt).await;
                    }
                }
            }
        });

        // Inbound streams: one task per accepted connection.
        let me = self;
        let mut shutdown = me.shutdown_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                    }
                    accepted = stream_rx.recv() => {
                        let Some((stream, addr)) = accepted else { return };
                        let me = me.clone();
                        tokio::spawn(async move {
                            if let Err(e) = me.handle_stream(stream, addr).await {
                                debug!("stream from {} failed: {}", addr, e);
                            }
                        });
                    }
                }
            }
        });
    }
}

/// Best-effort detection of the outbound interface address for a wildcard
/// bind. The connect never sends a packet; it only asks the OS for a route.
fn detect_advertise_ip() -> Option<std::net::IpAddr> {
    let sock = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:53").ok()?;
    sock.local_addr().ok().map(|a| a.ip())
}

/// Anti-entropy cadence grows logarithmically past 32 nodes to bound the
/// cluster-wide TCP exchange rate.
pub(crate) fn push_pull_scale(interval: Duration, n: usize) -> Duration {
    const THRESHOLD: usize = 32;
    if n <= THRESHOLD {
        return interval;
    }
    let mult = (n as f64 / THRESHOLD as f64).log2().ceil() as u32 + 1;
    interval * mult
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pull_scale() {
        let base = Duration::from_secs(30);
        assert_eq!(push_pull_scale(base, 1), base);
        assert_eq!(push_pull_scale(base, 32), base);
        assert_eq!(push_pull_scale(base, 33), base * 2);
        assert_eq!(push_pull_scale(base, 64), base * 2);
        assert_eq!(push_pull_scale(base, 65), base * 3);
    }

    #[test]
    fn test_ring_insert_remove() {
        let mut map = NodeMap::default();
        map.ring_insert("a");
        map.ring_insert("b");
        map.ring_insert("c");
        map.ring_insert("a");
        assert_eq!(map.ring.len(), 3, "duplicate insert must be a no-op");

        map.probe_index = 2;
        map.ring_remove(map.ring[0].clone().as_str());
        assert_eq!(map.ring.len(), 2);
        assert_eq!(map.probe_index, 1, "cursor shifts when an earlier entry is removed");
    }
}
