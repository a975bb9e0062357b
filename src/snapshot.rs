//! Append-only membership snapshot.
//!
//! A tee off the event pipeline records every membership change and clock
//! advance as one text line, so a restarted node can seed its clocks and
//! quietly rejoin its previous peers. A trailing `leave` record marks an
//! intentional departure and suppresses the auto-rejoin.
//!
//! Record grammar, one per line:
//! ```text
//! alive: <name> <ip>:<port>
//! not-alive: <name>
//! tags: <k1=v1,k2=v2,...>
//! clock: <lamport>
//! event-clock: <lamport>
//! query-clock: <lamport>
//! coordinate: <base64 blob>
//! leave
//! #comment
//! ```

use crate::cluster::{ClusterCore, Event, MemberEventKind};
use crate::config::Config;
use crate::coordinate::Coordinate;
use crate::error::{Error, Result};
use crate::types::{LamportTime, Tags};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Opportunistic flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Bound on waiting for the writer task during leave/shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ingress capacity; producers apply backpressure when the writer lags.
const INGRESS_CHANNEL_SIZE: usize = 1024;

/// A previously alive peer recovered from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousNode {
    pub name: String,
    /// `ip:port` string as written.
    pub addr: String,
}

/// Everything recovered from a snapshot file.
#[derive(Debug, Default)]
pub struct SnapshotReplay {
    pub alive: Vec<PreviousNode>,
    pub last_clock: LamportTime,
    pub last_event_clock: LamportTime,
    pub last_query_clock: LamportTime,
    pub coordinate: Option<Coordinate>,
    pub tags: Option<Tags>,
    /// The log ended in a `leave` record: do not auto-rejoin.
    pub clean_leave: bool,
}

/// Parse a snapshot file. A missing file is an empty history, a malformed
/// line is skipped with a warning; only I/O failures error.
pub(crate) fn replay(path: &Path) -> Result<SnapshotReplay> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SnapshotReplay::default())
        }
        Err(e) => return Err(e.into()),
    };

    let mut out = SnapshotReplay::default();
    let mut alive: HashMap<String, String> = HashMap::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("alive: ") {
            match rest.rsplit_once(' ') {
                Some((name, addr)) => {
                    alive.insert(name.to_string(), addr.to_string());
                    out.clean_leave = false;
                }
                None => warn!("skipping malformed alive record: {:?}", line),
            }
        } else if let Some(name) = line.strip_prefix("not-alive: ") {
            alive.remove(name);
            out.clean_leave = false;
        } else if let Some(rest) = line.strip_prefix("clock: ") {
            match rest.parse() {
                Ok(v) => {
                    out.last_clock = v;
                    out.clean_leave = false;
                }
                Err(_) => warn!("skipping malformed clock record: {:?}", line),
            }
        } else if let Some(rest) = line.strip_prefix("event-clock: ") {
            match rest.parse() {
                Ok(v) => {
                    out.last_event_clock = v;
                    out.clean_leave = false;
                }
                Err(_) => warn!("skipping malformed event-clock record: {:?}", line),
            }
        } else if let Some(rest) = line.strip_prefix("query-clock: ") {
            match rest.parse() {
                Ok(v) => {
                    out.last_query_clock = v;
                    out.clean_leave = false;
                }
                Err(_) => warn!("skipping malformed query-clock record: {:?}", line),
            }
        } else if let Some(rest) = line.strip_prefix("coordinate: ") {
            let decoded = BASE64
                .decode(rest)
                .ok()
                .and_then(|raw| postcard::from_bytes::<Coordinate>(&raw).ok());
            match decoded {
                Some(coord) if coord.is_valid() => out.coordinate = Some(coord),
                _ => warn!("skipping malformed coordinate record"),
            }
        } else if let Some(rest) = line.strip_prefix("tags: ") {
            out.tags = Some(parse_tags(rest));
        } else if line == "leave" {
            alive.clear();
            out.clean_leave = true;
        } else {
            warn!("skipping unknown snapshot record: {:?}", line);
        }
    }

    out.alive = alive
        .into_iter()
        .map(|(name, addr)| PreviousNode { name, addr })
        .collect();
    Ok(out)
}

fn parse_tags(s: &str) -> Tags {
    let mut tags = Tags::new();
    for pair in s.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            tags.insert(k.to_string(), v.to_string());
        }
    }
    tags
}

fn format_tags(tags: &Tags) -> String {
    let mut ordered: Vec<_> = tags.iter().collect();
    ordered.sort();
    ordered
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

enum Ctl {
    Leave(oneshot::Sender<()>),
    Flush(oneshot::Sender<()>),
}

/// Handle held by the orchestrator; events flow in through `sender`.
pub(crate) struct SnapshotHandle {
    in_tx: mpsc::Sender<Event>,
    ctl_tx: mpsc::Sender<Ctl>,
}

impl SnapshotHandle {
    pub(crate) fn sender(&self) -> mpsc::Sender<Event> {
        self.in_tx.clone()
    }

    /// Record the intentional departure and fsync before returning.
    pub(crate) async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ctl_tx.send(Ctl::Leave(tx)).await.is_ok() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, rx).await;
        }
    }

    /// Force-flush on shutdown. Bounded wait; never blocks forever.
    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ctl_tx.send(Ctl::Flush(tx)).await.is_ok() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, rx).await;
        }
    }
}

/// Open the log for appending and start the writer task. Events arriving on
/// the returned handle's sender are recorded, then forwarded to `out_tx`.
pub(crate) fn start(
    path: PathBuf,
    config: &Config,
    core: Weak<ClusterCore>,
    out_tx: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
) -> Result<SnapshotHandle> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::Snapshot(format!("open {:?}: {}", path, e)))?;
    let offset = file
        .metadata()
        .map_err(|e| Error::Snapshot(format!("stat {:?}: {}", path, e)))?
        .len();

    let (in_tx, in_rx) = mpsc::channel(INGRESS_CHANNEL_SIZE);
    let (ctl_tx, ctl_rx) = mpsc::channel(4);

    let writer = Writer {
        path,
        file: BufWriter::new(file),
        offset,
        alive: HashMap::new(),
        last_written_clock: 0,
        last_coordinate_line: String::new(),
        node_name: config.node_name.clone(),
        bytes_per_node: config.snapshot_bytes_per_node as u64,
        min_compact_size: config.snapshot_min_compact_size as u64,
        core,
    };
    tokio::spawn(writer.run(in_rx, ctl_rx, out_tx, shutdown));

    Ok(SnapshotHandle { in_tx, ctl_tx })
}

struct Writer {
    path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    /// Currently alive members, the compaction image.
    alive: HashMap<String, String>,
    last_written_clock: LamportTime,
    last_coordinate_line: String,
    node_name: String,
    bytes_per_node: u64,
    min_compact_size: u64,
    core: Weak<ClusterCore>,
}

impl Writer {
    async fn run(
        mut self,
        mut in_rx: mpsc::Receiver<Event>,
        mut ctl_rx: mpsc::Receiver<Ctl>,
        out_tx: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = in_rx.recv() => {
                    let Some(ev) = ev else {
                        self.force_flush();
                        return;
                    };
                    self.process(&ev);
                    self.maybe_compact();
                    // Backpressure, never drop: the host consumes at its own
                    // pace.
                    if out_tx.send(ev).await.is_err() {
                        self.force_flush();
                        return;
                    }
                }
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(Ctl::Leave(ack)) => {
                            self.append("leave");
                            self.force_flush();
                            let _ = ack.send(());
                        }
                        Some(Ctl::Flush(ack)) => {
                            self.force_flush();
                            let _ = ack.send(());
                        }
                        None => {
                            self.force_flush();
                            return;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    self.write_coordinate();
                    if let Err(e) = self.file.flush() {
                        warn!("snapshot flush failed: {}", e);
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        self.force_flush();
                        return;
                    }
                }
            }
        }
    }

    fn process(&mut self, ev: &Event) {
        match ev {
            Event::Member(me) => {
                for m in &me.members {
                    // The local node is never recorded as a peer: recovering
                    // our own name from a snapshot would read as an identity
                    // collision, and rejoining ourselves is meaningless.
                    if m.name == self.node_name {
                        if matches!(me.kind, MemberEventKind::Join | MemberEventKind::Update) {
                            self.append(&format!("tags: {}", format_tags(&m.tags)));
                        }
                        continue;
                    }
                    match me.kind {
                        MemberEventKind::Join | MemberEventKind::Update => {
                            let addr = format!("{}:{}", m.addr, m.port);
                            self.alive.insert(m.name.clone(), addr.clone());
                            self.append(&format!("alive: {} {}", m.name, addr));
                        }
                        MemberEventKind::Leave
                        | MemberEventKind::Failed
                        | MemberEventKind::Reap => {
                            self.alive.remove(&m.name);
                            self.append(&format!("not-alive: {}", m.name));
                        }
                    }
                }
                self.write_member_clock();
            }
            Event::User(ue) => {
                self.append(&format!("event-clock: {}", ue.ltime));
            }
            Event::Query(q) => {
                self.append(&format!("query-clock: {}", q.ltime));
            }
        }
    }

    fn write_member_clock(&mut self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let t = core.member_clock.time();
        if t != self.last_written_clock {
            self.last_written_clock = t;
            self.append(&format!("clock: {}", t));
        }
    }

    fn write_coordinate(&mut self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Some(cc) = &core.coord_client else {
            return;
        };
        let Ok(raw) = postcard::to_stdvec(&cc.get()) else {
            return;
        };
        let line = format!("coordinate: {}", BASE64.encode(raw));
        if line != self.last_coordinate_line {
            self.last_coordinate_line = line.clone();
            self.append(&line);
        }
    }

    fn append(&mut self, line: &str) {
        if let Err(e) = writeln!(self.file, "{}", line) {
            // Keep running in-memory; the next compaction rewrites the file.
            warn!("snapshot append failed: {}", e);
            return;
        }
        self.offset += line.len() as u64 + 1;
    }

    fn force_flush(&mut self) {
        if let Err(e) = self.file.flush() {
            warn!("snapshot flush failed: {}", e);
            return;
        }
        if let Err(e) = self.file.get_ref().sync_all() {
            warn!("snapshot fsync failed: {}", e);
        }
    }

    fn maybe_compact(&mut self) {
        let threshold = (self.bytes_per_node * self.alive.len().max(1) as u64 * 2)
            .max(self.min_compact_size);
        if self.offset <= threshold {
            return;
        }
        if let Err(e) = self.compact() {
            warn!("snapshot compaction failed: {}", e);
        }
    }

    /// Rewrite the log as one alive line per member plus final clock and
    /// coordinate lines, then atomically rename over the old file. The writer
    /// is single-task, so no append can interleave with the rename.
    fn compact(&mut self) -> std::io::Result<()> {
        debug!("compacting snapshot ({} bytes)", self.offset);
        let tmp_path = self.path.with_extension("compact");
        let tmp = File::create(&tmp_path)?;
        let mut w = BufWriter::new(tmp);

        let mut bytes = 0u64;
        for (name, addr) in &self.alive {
            let line = format!("alive: {} {}\n", name, addr);
            w.write_all(line.as_bytes())?;
            bytes += line.len() as u64;
        }
        if let Some(core) = self.core.upgrade() {
            let tags = core.tags.lock().unwrap().clone();
            for line in [
                format!("tags: {}\n", format_tags(&tags)),
                format!("clock: {}\n", core.member_clock.time()),
                format!("event-clock: {}\n", core.event_clock.time()),
                format!("query-clock: {}\n", core.query_clock.time()),
            ] {
                w.write_all(line.as_bytes())?;
                bytes += line.len() as u64;
            }
            if let Some(cc) = &core.coord_client {
                if let Ok(raw) = postcard::to_stdvec(&cc.get()) {
                    let line = format!("coordinate: {}\n", BASE64.encode(raw));
                    w.write_all(line.as_bytes())?;
                    bytes += line.len() as u64;
                }
            }
        }

        w.flush()?;
        w.get_ref().sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        // The renamed fd is the live log now; keep appending to it.
        let file = w.into_inner().map_err(|e| e.into_error())?;
        self.file = BufWriter::new(file);
        self.offset = bytes;
        self.last_coordinate_line.clear();
        info!("snapshot compacted to {} bytes", bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let replay = replay(&dir.path().join("none.snap")).unwrap();
        assert!(replay.alive.is_empty());
        assert!(!replay.clean_leave);
    }

    #[test]
    fn test_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.snap");
        std::fs::write(
            &path,
            "alive: n1 127.0.0.1:7001\n\
             alive: n2 127.0.0.1:7002\n\
             clock: 42\n\
             event-clock: 7\n\
             query-clock: 3\n\
             not-alive: n2\n\
             tags: role=web\n\
             # a comment\n",
        )
        .unwrap();

        let out = replay(&path).unwrap();
        assert_eq!(
            out.alive,
            vec![PreviousNode {
                name: "n1".to_string(),
                addr: "127.0.0.1:7001".to_string()
            }]
        );
        assert_eq!(out.last_clock, 42);
        assert_eq!(out.last_event_clock, 7);
        assert_eq!(out.last_query_clock, 3);
        assert_eq!(
            out.tags.unwrap().get("role").map(String::as_str),
            Some("web")
        );
        assert!(!out.clean_leave);
    }

    #[test]
    fn test_trailing_leave_suppresses_rejoin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.snap");
        std::fs::write(&path, "alive: n1 127.0.0.1:7001\nleave\n").unwrap();

        let out = replay(&path).unwrap();
        assert!(out.clean_leave);
        assert!(out.alive.is_empty());
    }

    #[test]
    fn test_activity_after_leave_means_unclean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.snap");
        std::fs::write(
            &path,
            "leave\nalive: n1 127.0.0.1:7001\nclock: 9\n",
        )
        .unwrap();

        let out = replay(&path).unwrap();
        assert!(!out.clean_leave);
        assert_eq!(out.alive.len(), 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.snap");
        std::fs::write(
            &path,
            "alive: broken-no-addr\nclock: not-a-number\nwhat is this\nalive: ok 10.0.0.1:7946\n",
        )
        .unwrap();

        let out = replay(&path).unwrap();
        assert_eq!(out.alive.len(), 1);
        assert_eq!(out.alive[0].name, "ok");
        assert_eq!(out.last_clock, 0);
    }

    #[test]
    fn test_tags_format_round_trip() {
        let mut tags = Tags::new();
        tags.insert("role".to_string(), "db".to_string());
        tags.insert("dc".to_string(), "west".to_string());
        assert_eq!(parse_tags(&format_tags(&tags)), tags);
    }
}
