//! Inbound packet and stream handling.

use super::{AckHandler, AckInfo, Membership};
use crate::error::{Error, Result};
use crate::transport::Packet;
use crate::wire::{
    self, AckMsg, AliveMsg, DeadMsg, IndirectPingMsg, MessageType, NackMsg, PingMsg, PushPullMsg,
    SuspectMsg,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

impl Membership {
    /// Decode one inbound datagram, unpacking compound envelopes.
    pub(crate) async fn handle_packet(self: &Arc<Self>, pkt: Packet) {
        let Some(&tag) = pkt.buf.first() else {
            return;
        };

        if tag == MessageType::Compound as u8 {
            let parts: Vec<Vec<u8>> = match wire::split_compound(&pkt.buf[1..]) {
                Ok((parts, truncated)) => {
                    if truncated > 0 {
                        warn!(
                            "compound packet from {} truncated, {} messages lost",
                            pkt.from, truncated
                        );
                    }
                    parts.into_iter().map(|p| p.to_vec()).collect()
                }
                Err(e) => {
                    warn!("malformed compound packet from {}: {}", pkt.from, e);
                    return;
                }
            };
            for part in parts {
                self.dispatch(&part, pkt.from, pkt.timestamp).await;
            }
            return;
        }

        self.dispatch(&pkt.buf, pkt.from, pkt.timestamp).await;
    }

    async fn dispatch(self: &Arc<Self>, buf: &[u8], from: SocketAddr, timestamp: Instant) {
        let Some(&tag) = buf.first() else {
            return;
        };
        let body = &buf[1..];

        let ty = match MessageType::from_u8(tag) {
            Ok(ty) => ty,
            Err(_) => {
                warn!("unknown message type {} from {}", tag, from);
                return;
            }
        };

        match ty {
            MessageType::Ping => self.handle_ping(body, from).await,
            MessageType::IndirectPing => self.handle_indirect_ping(body, from),
            MessageType::Ack => self.handle_ack(body, timestamp),
            MessageType::Nack => self.handle_nack(body),
            MessageType::Suspect => match wire::decode::<SuspectMsg>(body) {
                Ok(s) => self.suspect_node(s),
                Err(e) => warn!("bad suspect message from {}: {}", from, e),
            },
            MessageType::Alive => match wire::decode::<AliveMsg>(body) {
                Ok(a) => self.alive_node(a, None, false),
                Err(e) => warn!("bad alive message from {}: {}", from, e),
            },
            MessageType::Dead => match wire::decode::<DeadMsg>(body) {
                Ok(d) => self.dead_node(d),
                Err(e) => warn!("bad dead message from {}: {}", from, e),
            },
            MessageType::Compound => {
                warn!("nested compound packet from {} dropped", from);
            }
            MessageType::PushPull => {
                warn!("push/pull over UDP from {} dropped", from);
            }
            // Everything else belongs to the layer above.
            _ => self.delegate.notify_message(buf, from),
        }
    }

    async fn handle_ping(&self, body: &[u8], from: SocketAddr) {
        let ping: PingMsg = match wire::decode(body) {
            Ok(p) => p,
            Err(e) => {
                warn!("bad ping from {}: {}", from, e);
                return;
            }
        };
        if ping.node != self.config.node_name {
            warn!(
                "ping for {:?} arrived at {:?}, dropping",
                ping.node, self.config.node_name
            );
            return;
        }

        let ack = AckMsg {
            seq_no: ping.seq_no,
            payload: self.delegate.ack_payload(),
        };
        if let Err(e) = self
            .send_with_piggyback(from, MessageType::Ack, &ack)
            .await
        {
            debug!("failed to ack ping from {}: {}", from, e);
        }
    }

    /// Probe the target on behalf of the requester; relay an ack (or nack)
    /// under the requester's sequence number.
    fn handle_indirect_ping(self: &Arc<Self>, body: &[u8], from: SocketAddr) {
        let ind: IndirectPingMsg = match wire::decode(body) {
            Ok(i) => i,
            Err(e) => {
                warn!("bad indirect ping from {}: {}", from, e);
                return;
            }
        };

        let me = self.clone();
        tokio::spawn(async move {
            let seq = me.next_seq_no();
            let (ack_tx, mut ack_rx) = mpsc::channel::<AckInfo>(1);
            me.ack_handlers
                .lock()
                .unwrap()
                .insert(seq, AckHandler { ack_tx, nack_tx: None });

            let ping = PingMsg {
                seq_no: seq,
                node: ind.target.clone(),
                from: me.config.node_name.clone(),
            };
            let target = SocketAddr::new(ind.target_addr, ind.target_port);
            if let Err(e) = me
                .send_with_piggyback(target, MessageType::Ping, &ping)
                .await
            {
                debug!("indirect ping to {} failed: {}", target, e);
            }

            let got = tokio::time::timeout(me.config.probe_timeout, ack_rx.recv()).await;
            me.ack_handlers.lock().unwrap().remove(&seq);

            match got {
                Ok(Some(_)) => {
                    let ack = AckMsg {
                        seq_no: ind.seq_no,
                        payload: Vec::new(),
                    };
                    let _ = me.send_with_piggyback(from, MessageType::Ack, &ack).await;
                }
                _ if ind.nack => {
                    let nack = NackMsg { seq_no: ind.seq_no };
                    let _ = me.send_with_piggyback(from, MessageType::Nack, &nack).await;
                }
                _ => {}
            }
        });
    }

    fn handle_ack(&self, body: &[u8], timestamp: Instant) {
        let ack: AckMsg = match wire::decode(body) {
            Ok(a) => a,
            Err(e) => {
                warn!("bad ack: {}", e);
                return;
            }
        };
        let tx = self
            .ack_handlers
            .lock()
            .unwrap()
            .get(&ack.seq_no)
            .map(|h| h.ack_tx.clone());
        match tx {
            Some(tx) => {
                let _ = tx.try_send(AckInfo {
                    payload: ack.payload,
                    timestamp,
                });
            }
            None => trace!("late ack for sequence {}", ack.seq_no),
        }
    }

    fn handle_nack(&self, body: &[u8]) {
        let nack: NackMsg = match wire::decode(body) {
            Ok(n) => n,
            Err(e) => {
                warn!("bad nack: {}", e);
                return;
            }
        };
        let tx = self
            .ack_handlers
            .lock()
            .unwrap()
            .get(&nack.seq_no)
            .and_then(|h| h.nack_tx.clone());
        if let Some(tx) = tx {
            let _ = tx.try_send(());
        }
    }

    // =========================================================================
    // STREAMS
    // =========================================================================

    /// Serve one accepted TCP connection: a push/pull exchange or a fallback
    /// ping.
    pub(crate) async fn handle_stream(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        self.transport.read_stream_label(&mut stream).await?;
        let frame = self.transport.read_frame(&mut stream).await?;
        let Some(&tag) = frame.first() else {
            return Ok(());
        };

        match MessageType::from_u8(tag)? {
            MessageType::Ping => {
                let ping: PingMsg = wire::decode(&frame[1..])?;
                if ping.node != self.config.node_name {
                    warn!("stream ping for {:?} arrived at the wrong node", ping.node);
                    return Ok(());
                }
                let ack = AckMsg {
                    seq_no: ping.seq_no,
                    payload: self.delegate.ack_payload(),
                };
                let buf = wire::encode(MessageType::Ack, &ack)?;
                self.transport.write_frame(&mut stream, &buf).await?;
            }
            MessageType::PushPull => {
                let remote: PushPullMsg = wire::decode(&frame[1..])?;
                let local = self.local_push_pull(false);
                let buf = wire::encode(MessageType::PushPull, &local)?;
                self.transport.write_frame(&mut stream, &buf).await?;

                let join = remote.join;
                self.merge_push_pull(remote, join);
            }
            MessageType::Compound => {
                warn!("compound frame over TCP from {} dropped", addr);
            }
            // Oversized cluster messages (e.g. query responses) arrive as
            // stream frames; hand them up like any other packet.
            _ => self.delegate.notify_message(&frame, addr),
        }
        Ok(())
    }

    /// Initiate a push/pull exchange with `addr`.
    pub(crate) async fn push_pull_node(
        self: &Arc<Self>,
        addr: SocketAddr,
        join: bool,
    ) -> Result<()> {
        debug!("initiating push/pull with {} (join: {})", addr, join);
        let mut stream = self.transport.dial(addr).await?;

        let local = self.local_push_pull(join);
        let buf = wire::encode(MessageType::PushPull, &local)?;
        self.transport.write_frame(&mut stream, &buf).await?;

        let frame = self.transport.read_frame(&mut stream).await?;
        if frame.first() != Some(&(MessageType::PushPull as u8)) {
            return Err(Error::UnknownMessage(
                frame.first().copied().unwrap_or(u8::MAX),
            ));
        }
        let remote: PushPullMsg = wire::decode(&frame[1..])?;
        self.merge_push_pull(remote, join);
        Ok(())
    }
}
