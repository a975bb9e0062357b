//! Query fan-out: acknowledgments, streamed responses, and relay.

use super::ClusterCore;
use crate::error::{Error, Result};
use crate::types::LamportTime;
use crate::wire::{
    self, MessageType, QueryFilter, QueryMsg, QueryResponseMsg, RelayMsg, QUERY_FLAG_ACK,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Capacity of the per-query ack and response channels. Slow consumers lose
/// excess replies rather than stalling the packet path.
const RESPONSE_CHANNEL_SIZE: usize = 128;

/// Options for an outgoing query.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Restrict handling to these node names. Empty means all nodes.
    pub filter_nodes: Vec<String>,
    /// Restrict handling to nodes whose tag value matches the regular
    /// expression.
    pub filter_tags: HashMap<String, String>,
    /// Ask matched nodes to send an ack before (or without) responding.
    pub request_ack: bool,
    /// Extra peers each responder bounces its response through.
    pub relay_factor: u8,
    /// Query deadline. `None` picks a default scaled with cluster size.
    pub timeout: Option<Duration>,
}

/// A response from one node.
#[derive(Debug, Clone)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Handle to an in-flight query held by the originator. Dropping it (or
/// calling `close`) deregisters the query.
pub struct QueryResponse {
    ltime: LamportTime,
    id: u32,
    deadline: Instant,
    ack_rx: Option<mpsc::Receiver<String>>,
    resp_rx: mpsc::Receiver<NodeResponse>,
    core: Weak<ClusterCore>,
}

impl QueryResponse {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The ack stream, present when `request_ack` was set. Can be taken once.
    pub fn take_ack_rx(&mut self) -> Option<mpsc::Receiver<String>> {
        self.ack_rx.take()
    }

    /// Receive the next response; `None` once the deadline passed and the
    /// query was deregistered.
    pub async fn recv(&mut self) -> Option<NodeResponse> {
        self.resp_rx.recv().await
    }

    /// Deregister early. Late responses are discarded at the packet layer.
    pub fn close(&self) {
        if let Some(core) = self.core.upgrade() {
            core.pending_queries
                .lock()
                .unwrap()
                .remove(&(self.ltime, self.id));
        }
    }
}

impl Drop for QueryResponse {
    fn drop(&mut self) {
        self.close();
    }
}

/// Originator-side record for routing inbound responses.
pub(crate) struct PendingQuery {
    ack_tx: Option<mpsc::Sender<String>>,
    resp_tx: mpsc::Sender<NodeResponse>,
    acks_seen: HashSet<String>,
    responses_seen: HashSet<String>,
}

pub(crate) type PendingQueries = Mutex<HashMap<(LamportTime, u32), PendingQuery>>;

/// A query delivered to the local handler. `respond` sends the reply back to
/// the originator (directly, or via TCP and relays when needed).
#[derive(Clone)]
pub struct QueryEvent {
    pub ltime: LamportTime,
    pub id: u32,
    pub name: String,
    pub payload: Vec<u8>,
    /// Node that issued the query.
    pub source: String,
    pub(crate) addr: IpAddr,
    pub(crate) port: u16,
    pub(crate) relay_factor: u8,
    pub(crate) deadline: Instant,
    pub(crate) core: Weak<ClusterCore>,
}

impl std::fmt::Debug for QueryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEvent")
            .field("ltime", &self.ltime)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl QueryEvent {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Send `payload` back to the originator.
    pub async fn respond(&self, payload: Vec<u8>) -> Result<()> {
        let core = self.core.upgrade().ok_or(Error::Shutdown)?;

        if Instant::now() > self.deadline {
            return Err(Error::QueryFinished(self.name.clone()));
        }
        if payload.len() > core.config.query_response_size_limit {
            return Err(Error::SizeLimit {
                kind: "query response",
                size: payload.len(),
                limit: core.config.query_response_size_limit,
            });
        }

        let resp = QueryResponseMsg {
            ltime: self.ltime,
            id: self.id,
            from: core.config.node_name.clone(),
            flags: 0,
            payload,
        };
        core.send_query_response(SocketAddr::new(self.addr, self.port), &resp, self.relay_factor)
            .await
    }
}

impl ClusterCore {
    /// Scale the default query deadline with cluster size, mirroring how long
    /// gossip needs to reach everyone.
    pub(crate) fn default_query_timeout(&self) -> Duration {
        let n = self.membership().map(|m| m.num_alive()).unwrap_or(1);
        let scale = ((n + 1) as f64).log10().ceil().max(1.0);
        self.config
            .gossip_interval
            .mul_f64(self.config.query_timeout_mult as f64 * scale)
    }

    /// Issue a query and register for its responses.
    pub(crate) fn start_query(
        self: &Arc<Self>,
        name: &str,
        payload: &[u8],
        params: QueryParams,
    ) -> Result<QueryResponse> {
        self.check_alive()?;

        let timeout = params.timeout.unwrap_or_else(|| self.default_query_timeout());
        let membership = self.membership().ok_or(Error::Shutdown)?;
        let advertise = membership.advertise_addr();

        let mut filters = Vec::new();
        if !params.filter_nodes.is_empty() {
            filters.push(QueryFilter::Nodes(params.filter_nodes.clone()));
        }
        for (tag, expr) in &params.filter_tags {
            filters.push(QueryFilter::Tag {
                tag: tag.clone(),
                expr: expr.clone(),
            });
        }

        let ltime = self.query_clock.time();
        self.query_clock.increment();
        let id = self.next_query_id();

        let msg = QueryMsg {
            ltime,
            id,
            addr: advertise.ip(),
            port: advertise.port(),
            source: self.config.node_name.clone(),
            filters,
            flags: if params.request_ack { QUERY_FLAG_ACK } else { 0 },
            relay_factor: params.relay_factor,
            timeout_ms: timeout.as_millis() as u64,
            name: name.to_string(),
            payload: payload.to_vec(),
        };

        let buf = wire::encode(MessageType::Query, &msg)?;
        if buf.len() > self.config.query_size_limit {
            return Err(Error::SizeLimit {
                kind: "query",
                size: buf.len(),
                limit: self.config.query_size_limit,
            });
        }

        // Register before any delivery so even our own response routes.
        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        let (ack_tx, ack_rx) = if params.request_ack {
            let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let deadline = Instant::now() + timeout;
        self.pending_queries.lock().unwrap().insert(
            (ltime, id),
            PendingQuery {
                ack_tx,
                resp_tx,
                acks_seen: HashSet::new(),
                responses_seen: HashSet::new(),
            },
        );

        // Deadline hygiene: deregister exactly once when the deadline fires;
        // dropping the senders closes both streams.
        let me = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(core) = me.upgrade() {
                if core.pending_queries.lock().unwrap().remove(&(ltime, id)).is_some() {
                    trace!("query ({}, {}) expired", ltime, id);
                }
            }
        });

        // Deliver locally, then gossip.
        self.handle_query(msg);
        self.event_broadcasts
            .queue(Some(format!("query:{}:{}", ltime, id)), buf, None);

        Ok(QueryResponse {
            ltime,
            id,
            deadline,
            ack_rx,
            resp_rx,
            core: Arc::downgrade(self),
        })
    }

    /// Handle an inbound (or locally issued) query message. Returns whether
    /// it was fresh and should be rebroadcast.
    pub(crate) fn handle_query(self: &Arc<Self>, msg: QueryMsg) -> bool {
        self.query_clock.witness(msg.ltime);

        // De-dup within the ring buffer window.
        {
            let mut st = self.state.lock().unwrap();
            let size = self.config.query_buffer_size as u64;
            let cur = self.query_clock.time();
            if cur > size && msg.ltime < cur - size {
                warn!(
                    "dropping query {:?} older than the buffer window ({} < {})",
                    msg.name,
                    msg.ltime,
                    cur - size
                );
                return false;
            }
            let idx = (msg.ltime % size) as usize;
            let slot = &mut st.query_buffer[idx];
            match slot {
                Some(s) if s.ltime == msg.ltime => {
                    if s.ids.contains(&msg.id) {
                        return false;
                    }
                    s.ids.push(msg.id);
                }
                _ => {
                    *slot = Some(super::QuerySlot {
                        ltime: msg.ltime,
                        ids: vec![msg.id],
                    });
                }
            }
        }

        // Cap the claimed timeout so a hostile value cannot overflow the
        // deadline arithmetic or pin state for days.
        let timeout_ms = msg.timeout_ms.min(86_400_000);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        if !self.query_filters_match(&msg.filters) {
            return true;
        }

        // Ack first so the originator learns delivery even if the handler is
        // slow.
        if msg.flags & QUERY_FLAG_ACK != 0 {
            let ack = QueryResponseMsg {
                ltime: msg.ltime,
                id: msg.id,
                from: self.config.node_name.clone(),
                flags: QUERY_FLAG_ACK,
                payload: Vec::new(),
            };
            let dest = SocketAddr::new(msg.addr, msg.port);
            let relay_factor = msg.relay_factor;
            let me = self.clone();
            tokio::spawn(async move {
                if let Err(e) = me.send_query_response(dest, &ack, relay_factor).await {
                    debug!("failed to ack query: {}", e);
                }
            });
        }

        let event = QueryEvent {
            ltime: msg.ltime,
            id: msg.id,
            name: msg.name.clone(),
            payload: msg.payload.clone(),
            source: msg.source.clone(),
            addr: msg.addr,
            port: msg.port,
            relay_factor: msg.relay_factor,
            deadline,
            core: Arc::downgrade(self),
        };

        if super::internal::is_internal(&msg.name) {
            let me = self.clone();
            tokio::spawn(async move {
                super::internal::handle_query(&me, event).await;
            });
        } else {
            self.emit(super::event::Event::Query(event));
        }
        true
    }

    /// Route an inbound query response to its pending query.
    pub(crate) fn handle_query_response(&self, resp: QueryResponseMsg) {
        let mut pending = self.pending_queries.lock().unwrap();
        let Some(query) = pending.get_mut(&(resp.ltime, resp.id)) else {
            trace!(
                "response from {} for unknown or finished query ({}, {})",
                resp.from,
                resp.ltime,
                resp.id
            );
            return;
        };

        if resp.flags & QUERY_FLAG_ACK != 0 {
            if !query.acks_seen.insert(resp.from.clone()) {
                return;
            }
            if let Some(tx) = &query.ack_tx {
                if tx.try_send(resp.from).is_err() {
                    debug!("ack channel full, dropping ack");
                }
            }
        } else {
            if !query.responses_seen.insert(resp.from.clone()) {
                return;
            }
            let node_resp = NodeResponse {
                from: resp.from,
                payload: resp.payload,
            };
            if query.resp_tx.try_send(node_resp).is_err() {
                debug!("response channel full, dropping response");
            }
        }
    }

    /// Whether the local node passes the query's filters.
    fn query_filters_match(&self, filters: &[QueryFilter]) -> bool {
        for filter in filters {
            match filter {
                QueryFilter::Nodes(nodes) => {
                    if !nodes.iter().any(|n| *n == self.config.node_name) {
                        return false;
                    }
                }
                QueryFilter::Tag { tag, expr } => {
                    let re = match regex::Regex::new(expr) {
                        Ok(re) => re,
                        Err(e) => {
                            warn!("invalid tag filter {:?}: {}", expr, e);
                            return false;
                        }
                    };
                    let tags = self.tags.lock().unwrap();
                    let value = tags.get(tag).map(String::as_str).unwrap_or("");
                    if !re.is_match(value) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Send a query response to the originator: UDP when it fits, TCP when
    /// oversized, plus `relay_factor` bounced copies.
    pub(crate) async fn send_query_response(
        &self,
        dest: SocketAddr,
        resp: &QueryResponseMsg,
        relay_factor: u8,
    ) -> Result<()> {
        let membership = self.membership().ok_or(Error::Shutdown)?;
        let buf = wire::encode(MessageType::QueryResponse, resp)?;

        if buf.len() <= membership.transport.max_packet_payload() {
            membership.transport.send_packet(dest, &buf).await?;
        } else {
            // Too big for a datagram; open a stream to the originator.
            let mut stream = membership.transport.dial(dest).await?;
            membership.transport.write_frame(&mut stream, &buf).await?;
        }

        if relay_factor > 0 {
            self.relay_response(relay_factor, dest, buf).await;
        }
        Ok(())
    }

    /// Bounce a copy of the response through random peers to survive
    /// asymmetric partitions between us and the originator.
    async fn relay_response(&self, relay_factor: u8, dest: SocketAddr, packet: Vec<u8>) {
        let Some(membership) = self.membership() else {
            return;
        };
        let relay = RelayMsg {
            dest_addr: dest.ip(),
            dest_port: dest.port(),
            payload: packet,
        };
        let buf = match wire::encode(MessageType::Relay, &relay) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to encode relay: {}", e);
                return;
            }
        };
        if buf.len() > membership.transport.max_packet_payload() {
            debug!("response too large to relay, sending direct only");
            return;
        }

        let peers = membership.k_random_nodes(relay_factor as usize, &[]);
        for peer in peers {
            if let Err(e) = membership.transport.send_packet(peer.socket_addr(), &buf).await {
                debug!("relay via {} failed: {}", peer.name, e);
            }
        }
    }
}
