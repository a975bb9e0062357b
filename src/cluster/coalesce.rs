//! Member-event coalescing.
//!
//! A flapping node or a mass join produces bursts of identical member events.
//! The coalescer sits in the event pipeline and keeps only the latest event
//! per member inside a window, flushing when the window expires
//! (`coalesce_period` after the first buffered event) or when the stream goes
//! quiet for `quiescent_period`. User events and queries pass straight
//! through.

use super::event::{Event, MemberEvent, MemberEventKind};
use crate::types::Member;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::trace;

pub(crate) fn spawn(
    mut in_rx: mpsc::Receiver<Event>,
    out_tx: mpsc::Sender<Event>,
    coalesce_period: Duration,
    quiescent_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        // Latest event kind per member name within the open window.
        let mut latest: HashMap<String, (MemberEventKind, Member)> = HashMap::new();
        let mut window_end: Option<Instant> = None;
        let mut quiet_end: Option<Instant> = None;

        loop {
            let flush_at = match (window_end, quiet_end) {
                (Some(w), Some(q)) => Some(w.min(q)),
                (Some(w), None) => Some(w),
                (None, Some(q)) => Some(q),
                (None, None) => None,
            };

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        flush(&mut latest, &out_tx).await;
                        return;
                    }
                }
                ev = in_rx.recv() => {
                    let Some(ev) = ev else {
                        flush(&mut latest, &out_tx).await;
                        return;
                    };
                    match ev {
                        Event::Member(me) => {
                            let now = Instant::now();
                            for m in me.members {
                                latest.insert(m.name.clone(), (me.kind, m));
                            }
                            window_end.get_or_insert(now + coalesce_period);
                            quiet_end = Some(now + quiescent_period);
                        }
                        other => {
                            if out_tx.send(other).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                _ = async { tokio::time::sleep_until(flush_at.unwrap()).await },
                    if flush_at.is_some() =>
                {
                    flush(&mut latest, &out_tx).await;
                    window_end = None;
                    quiet_end = None;
                }
            }
        }
    });
}

/// Emit the buffered window, one event per kind carrying all its members.
async fn flush(
    latest: &mut HashMap<String, (MemberEventKind, Member)>,
    out_tx: &mpsc::Sender<Event>,
) {
    if latest.is_empty() {
        return;
    }
    trace!("coalescer flushing {} member updates", latest.len());

    let mut by_kind: HashMap<MemberEventKind, Vec<Member>> = HashMap::new();
    for (_, (kind, member)) in latest.drain() {
        by_kind.entry(kind).or_default().push(member);
    }

    // Deterministic emission order keeps downstream consumers simple.
    let order = [
        MemberEventKind::Join,
        MemberEventKind::Update,
        MemberEventKind::Leave,
        MemberEventKind::Failed,
        MemberEventKind::Reap,
    ];
    for kind in order {
        if let Some(mut members) = by_kind.remove(&kind) {
            members.sort_by(|a, b| a.name.cmp(&b.name));
            let _ = out_tx.send(Event::Member(MemberEvent { kind, members })).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberStatus, Tags};

    fn member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 7946,
            tags: Tags::new(),
            status: MemberStatus::Alive,
            protocol_min: 1,
            protocol_max: 2,
            protocol_cur: 2,
            delegate_min: 1,
            delegate_max: 2,
            delegate_cur: 2,
        }
    }

    fn member_event(kind: MemberEventKind, name: &str) -> Event {
        Event::Member(MemberEvent {
            kind,
            members: vec![member(name)],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_event() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_sd_tx, sd_rx) = watch::channel(false);
        spawn(
            in_rx,
            out_tx,
            Duration::from_millis(500),
            Duration::from_millis(100),
            sd_rx,
        );

        for _ in 0..5 {
            in_tx
                .send(member_event(MemberEventKind::Join, "n1"))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(700)).await;
        let ev = out_rx.recv().await.unwrap();
        match ev {
            Event::Member(me) => {
                assert_eq!(me.kind, MemberEventKind::Join);
                assert_eq!(me.members.len(), 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(out_rx.try_recv().is_err(), "burst must emit exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_event_per_member_wins() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_sd_tx, sd_rx) = watch::channel(false);
        spawn(
            in_rx,
            out_tx,
            Duration::from_millis(500),
            Duration::from_millis(200),
            sd_rx,
        );

        in_tx
            .send(member_event(MemberEventKind::Join, "n1"))
            .await
            .unwrap();
        in_tx
            .send(member_event(MemberEventKind::Failed, "n1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        let ev = out_rx.recv().await.unwrap();
        match ev {
            Event::Member(me) => assert_eq!(me.kind, MemberEventKind::Failed),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_events_pass_through_uncoalesced() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_sd_tx, sd_rx) = watch::channel(false);
        spawn(
            in_rx,
            out_tx,
            Duration::from_secs(5),
            Duration::from_secs(5),
            sd_rx,
        );

        in_tx
            .send(Event::User(crate::cluster::event::UserEventData {
                ltime: 1,
                name: "deploy".to_string(),
                payload: b"v1".to_vec(),
                coalesce: false,
            }))
            .await
            .unwrap();

        let ev = out_rx.recv().await.unwrap();
        assert!(matches!(ev, Event::User(_)));
    }
}
