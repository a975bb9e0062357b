//! UDP + TCP transport with label and encryption framing.
//!
//! Packet layout, outermost first:
//! `[label tag + len + label]?` then either the encrypted frame (when a
//! keyring is installed) or the raw tagged message. The label is plaintext so
//! mis-addressed clusters can be told apart cheaply, and doubles as the
//! associated data for AES-GCM so frames cannot be replayed across labels.
//!
//! TCP streams carry the same label as a one-shot preamble after connect,
//! then length-prefixed frames: `[len: u32 BE][payload]`.

use crate::crypto::{decrypt_payload, encrypt_payload, ENCRYPT_OVERHEAD};
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::types::{MAX_STREAM_FRAME, UDP_PACKET_BUDGET, UDP_RECV_BUF};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// First byte of a label block. Distinct from every `MessageType` value.
pub const LABEL_TAG: u8 = 244;

pub const MAX_LABEL_LEN: usize = 255;

/// Inbound UDP packet capacity before backpressure turns into drops.
const PACKET_CHANNEL_SIZE: usize = 1024;
const STREAM_CHANNEL_SIZE: usize = 32;

/// A decoded inbound datagram.
pub struct Packet {
    /// Tagged message bytes, label stripped and decrypted.
    pub buf: Vec<u8>,
    pub from: SocketAddr,
    /// Receive time, used for RTT measurements.
    pub timestamp: Instant,
}

pub struct Transport {
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    label: String,
    keyring: Option<Arc<Keyring>>,
    stream_timeout: Duration,
}

impl Transport {
    /// Bind UDP and TCP on the same endpoint and start the listener tasks.
    /// Returns the inbound packet and stream channels.
    pub async fn bind(
        bind_addr: SocketAddr,
        label: String,
        keyring: Option<Arc<Keyring>>,
        stream_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(
        Arc<Self>,
        mpsc::Receiver<Packet>,
        mpsc::Receiver<(TcpStream, SocketAddr)>,
    )> {
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::Config(format!(
                "label longer than {} bytes",
                MAX_LABEL_LEN
            )));
        }

        let udp = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = udp.local_addr()?;
        // TCP binds the resolved endpoint so an OS-assigned UDP port is
        // mirrored.
        let tcp = TcpListener::bind(local_addr).await?;

        let transport = Arc::new(Self {
            udp,
            local_addr,
            label,
            keyring,
            stream_timeout,
        });

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL_SIZE);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_SIZE);

        tokio::spawn(udp_listen(
            transport.clone(),
            packet_tx,
            shutdown.clone(),
        ));
        tokio::spawn(tcp_accept(tcp, stream_tx, shutdown));

        Ok((transport, packet_rx, stream_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Usable payload bytes in one outbound datagram after framing overhead.
    pub fn max_packet_payload(&self) -> usize {
        let mut budget = UDP_PACKET_BUDGET;
        if !self.label.is_empty() {
            budget -= 2 + self.label.len();
        }
        if self.keyring.is_some() {
            budget -= ENCRYPT_OVERHEAD;
        }
        budget
    }

    /// Send one tagged message (or compound) as a datagram. Best-effort.
    pub async fn send_packet(&self, addr: SocketAddr, msg: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(msg.len() + 2 + self.label.len() + ENCRYPT_OVERHEAD);
        append_label(&mut out, &self.label);

        match &self.keyring {
            Some(ring) => {
                let sealed = encrypt_payload(&ring.keys(), msg, self.label.as_bytes())?;
                out.extend_from_slice(&sealed);
            }
            None => out.extend_from_slice(msg),
        }

        self.udp.send_to(&out, addr).await?;
        Ok(())
    }

    /// Open a TCP stream and write the label preamble.
    pub async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.stream_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::DialTimeout { addr })??;

        if !self.label.is_empty() {
            let mut preamble = Vec::with_capacity(2 + self.label.len());
            append_label(&mut preamble, &self.label);
            let mut stream = stream;
            stream.write_all(&preamble).await?;
            return Ok(stream);
        }
        Ok(stream)
    }

    /// Read the optional label preamble off an accepted stream and verify it.
    pub async fn read_stream_label(&self, stream: &mut TcpStream) -> Result<()> {
        let mut first = [0u8; 1];
        let n = tokio::time::timeout(self.stream_timeout, stream.peek(&mut first))
            .await
            .map_err(|_| Error::DialTimeout {
                addr: self.local_addr,
            })??;

        let remote = if n == 1 && first[0] == LABEL_TAG {
            let mut hdr = [0u8; 2];
            stream.read_exact(&mut hdr).await?;
            let mut label = vec![0u8; hdr[1] as usize];
            stream.read_exact(&mut label).await?;
            String::from_utf8_lossy(&label).into_owned()
        } else {
            String::new()
        };

        if remote != self.label {
            return Err(Error::LabelMismatch {
                remote,
                local: self.label.clone(),
            });
        }
        Ok(())
    }

    /// Write one length-prefixed (and possibly encrypted) frame.
    pub async fn write_frame(&self, stream: &mut TcpStream, msg: &[u8]) -> Result<()> {
        let payload = match &self.keyring {
            Some(ring) => encrypt_payload(&ring.keys(), msg, self.label.as_bytes())?,
            None => msg.to_vec(),
        };
        if payload.len() > MAX_STREAM_FRAME {
            return Err(Error::SizeLimit {
                kind: "stream frame",
                size: payload.len(),
                limit: MAX_STREAM_FRAME,
            });
        }

        let fut = async {
            stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
            stream.write_all(&payload).await?;
            stream.flush().await
        };
        tokio::time::timeout(self.stream_timeout, fut)
            .await
            .map_err(|_| Error::DialTimeout {
                addr: self.local_addr,
            })??;
        Ok(())
    }

    /// Read one frame, decrypting when a keyring is installed.
    pub async fn read_frame(&self, stream: &mut TcpStream) -> Result<Vec<u8>> {
        let fut = async {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_STREAM_FRAME {
                return Err(Error::SizeLimit {
                    kind: "stream frame",
                    size: len,
                    limit: MAX_STREAM_FRAME,
                });
            }
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;
            Ok::<_, Error>(payload)
        };
        let payload = tokio::time::timeout(self.stream_timeout, fut)
            .await
            .map_err(|_| Error::DialTimeout {
                addr: self.local_addr,
            })??;

        match &self.keyring {
            Some(ring) => decrypt_payload(&ring.keys(), &payload, self.label.as_bytes()),
            None => Ok(payload),
        }
    }

    /// Decode a raw datagram into a tagged message buffer.
    fn decode_packet(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut rest = raw;

        let remote_label = if rest.first() == Some(&LABEL_TAG) {
            if rest.len() < 2 {
                return Err(Error::Decode(postcard::Error::DeserializeUnexpectedEnd));
            }
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                return Err(Error::Decode(postcard::Error::DeserializeUnexpectedEnd));
            }
            let label = String::from_utf8_lossy(&rest[2..2 + len]).into_owned();
            rest = &rest[2 + len..];
            label
        } else {
            String::new()
        };

        if remote_label != self.label {
            return Err(Error::LabelMismatch {
                remote: remote_label,
                local: self.label.clone(),
            });
        }

        match &self.keyring {
            Some(ring) => decrypt_payload(&ring.keys(), rest, self.label.as_bytes()),
            None => Ok(rest.to_vec()),
        }
    }
}

fn append_label(out: &mut Vec<u8>, label: &str) {
    if !label.is_empty() {
        out.push(LABEL_TAG);
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
}

async fn udp_listen(
    transport: Arc<Transport>,
    packet_tx: mpsc::Sender<Packet>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            res = transport.udp.recv_from(&mut buf) => {
                let (n, from) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("udp recv error: {}", e);
                        continue;
                    }
                };
                let decoded = match transport.decode_packet(&buf[..n]) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("dropping packet from {}: {}", from, e);
                        continue;
                    }
                };
                let packet = Packet {
                    buf: decoded,
                    from,
                    timestamp: Instant::now(),
                };
                if packet_tx.try_send(packet).is_err() {
                    trace!("inbound packet channel full, dropping datagram from {}", from);
                }
            }
        }
    }
}

async fn tcp_accept(
    tcp: TcpListener,
    stream_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            res = tcp.accept() => {
                match res {
                    Ok((stream, addr)) => {
                        if stream_tx.try_send((stream, addr)).is_err() {
                            debug!("inbound stream channel full, refusing {}", addr);
                        }
                    }
                    Err(e) => debug!("tcp accept error: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(label: &str, key: Option<Vec<u8>>) -> (Arc<Transport>, mpsc::Receiver<Packet>, Arc<Transport>, mpsc::Receiver<Packet>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let keyring = key.map(|k| Arc::new(Keyring::new(k).unwrap()));
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, a_rx, _) = Transport::bind(
            bind,
            label.to_string(),
            keyring.clone(),
            Duration::from_secs(2),
            rx.clone(),
        )
        .await
        .unwrap();
        let (b, b_rx, _) = Transport::bind(
            bind,
            label.to_string(),
            keyring,
            Duration::from_secs(2),
            rx,
        )
        .await
        .unwrap();
        (a, a_rx, b, b_rx, tx)
    }

    #[tokio::test]
    async fn test_plain_packet_round_trip() {
        let (a, _a_rx, b, mut b_rx, _sd) = pair("", None).await;
        a.send_packet(b.local_addr(), &[5, 1, 2, 3]).await.unwrap();
        let pkt = b_rx.recv().await.unwrap();
        assert_eq!(pkt.buf, vec![5, 1, 2, 3]);
        assert_eq!(pkt.from.ip(), a.local_addr().ip());
    }

    #[tokio::test]
    async fn test_labeled_encrypted_round_trip() {
        let (a, _a_rx, b, mut b_rx, _sd) = pair("prod", Some(vec![9u8; 32])).await;
        a.send_packet(b.local_addr(), &[7, 7]).await.unwrap();
        let pkt = b_rx.recv().await.unwrap();
        assert_eq!(pkt.buf, vec![7, 7]);
    }

    #[tokio::test]
    async fn test_label_mismatch_dropped() {
        let (tx, rx) = watch::channel(false);
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, _a_rx, _) = Transport::bind(bind, "one".into(), None, Duration::from_secs(2), rx.clone()).await.unwrap();
        let (b, mut b_rx, _) = Transport::bind(bind, "two".into(), None, Duration::from_secs(2), rx).await.unwrap();

        a.send_packet(b.local_addr(), &[1]).await.unwrap();
        // The packet is dropped at b's listener, so nothing arrives.
        let got = tokio::time::timeout(Duration::from_millis(200), b_rx.recv()).await;
        assert!(got.is_err());
        drop(tx);
    }

    #[tokio::test]
    async fn test_stream_frames() {
        let (tx, rx) = watch::channel(false);
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let keyring = Some(Arc::new(Keyring::new(vec![3u8; 16]).unwrap()));
        let (a, _pa, _sa) = Transport::bind(bind, "x".into(), keyring.clone(), Duration::from_secs(2), rx.clone()).await.unwrap();
        let (b, _pb, mut sb) = Transport::bind(bind, "x".into(), keyring, Duration::from_secs(2), rx).await.unwrap();

        let mut client = a.dial(b.local_addr()).await.unwrap();
        a.write_frame(&mut client, b"push-pull state").await.unwrap();

        let (mut server, _) = sb.recv().await.unwrap();
        b.read_stream_label(&mut server).await.unwrap();
        let frame = b.read_frame(&mut server).await.unwrap();
        assert_eq!(frame, b"push-pull state");
        drop(tx);
    }
}
