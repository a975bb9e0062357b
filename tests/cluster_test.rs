//! End-to-end cluster tests over loopback sockets.

use starling::cluster::{Event, MemberEventKind, QueryParams};
use starling::wire::{self, JoinIntentMsg, MessageType, UserEventMsg};
use starling::{Cluster, Config, MemberStatus};
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

fn test_config(name: &str) -> Config {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut c = Config::local(name, 0);
    c.probe_interval = Duration::from_millis(300);
    c.probe_timeout = Duration::from_millis(150);
    c.gossip_interval = Duration::from_millis(50);
    c.push_pull_interval = Duration::from_secs(5);
    c.reap_interval = Duration::from_millis(500);
    c.reconnect_interval = Duration::from_millis(500);
    c.broadcast_timeout = Duration::from_secs(2);
    c.stream_timeout = Duration::from_secs(2);
    c
}

fn addr_of(cluster: &Cluster) -> String {
    cluster.local_member().socket_addr().to_string()
}

/// Wait until `pred` holds, polling, or panic at the deadline.
async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, pred: F) {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Pull events until one matches, or return None at the deadline.
async fn next_matching<F: Fn(&Event) -> bool>(
    rx: &mut mpsc::Receiver<Event>,
    pred: F,
    deadline: Duration,
) -> Option<Event> {
    let end = Instant::now() + deadline;
    loop {
        let remaining = end.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match timeout(remaining, rx.recv()).await {
            Ok(Some(ev)) => {
                if pred(&ev) {
                    return Some(ev);
                }
            }
            _ => return None,
        }
    }
}

fn is_member_event(ev: &Event, kind: MemberEventKind, name: &str) -> bool {
    matches!(ev, Event::Member(me) if me.kind == kind && me.members.iter().any(|m| m.name == name))
}

#[tokio::test]
async fn test_two_node_join() {
    let a = Cluster::create(test_config("node-a")).await.unwrap();
    let mut a_events = a.events().unwrap();
    let b = Cluster::create(test_config("node-b")).await.unwrap();
    let mut b_events = b.events().unwrap();

    let joined = b.join(&[addr_of(&a)], false).await.unwrap();
    assert_eq!(joined, 1);

    wait_until("both nodes to see two members", Duration::from_secs(2), || {
        a.num_members() == 2 && b.num_members() == 2
    })
    .await;

    for cluster in [&a, &b] {
        let names: HashSet<String> =
            cluster.members().into_iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            HashSet::from(["node-a".to_string(), "node-b".to_string()])
        );
        assert!(cluster
            .members()
            .iter()
            .all(|m| m.status == MemberStatus::Alive));
    }

    // Each side sees exactly one join for the other.
    assert!(next_matching(
        &mut a_events,
        |ev| is_member_event(ev, MemberEventKind::Join, "node-b"),
        Duration::from_secs(2),
    )
    .await
    .is_some());
    assert!(next_matching(
        &mut b_events,
        |ev| is_member_event(ev, MemberEventKind::Join, "node-a"),
        Duration::from_secs(2),
    )
    .await
    .is_some());
    assert!(
        next_matching(
            &mut a_events,
            |ev| is_member_event(ev, MemberEventKind::Join, "node-b"),
            Duration::from_millis(500),
        )
        .await
        .is_none(),
        "duplicate join event for node-b"
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_detection() {
    let a = Cluster::create(test_config("fd-a")).await.unwrap();
    let mut a_events = a.events().unwrap();
    let b = Cluster::create(test_config("fd-b")).await.unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        a.num_members() == 2
    })
    .await;

    // Abrupt death: no leave broadcast.
    b.shutdown().await.unwrap();

    assert!(
        next_matching(
            &mut a_events,
            |ev| is_member_event(ev, MemberEventKind::Failed, "fd-b"),
            Duration::from_secs(10),
        )
        .await
        .is_some(),
        "node-b failure was never detected"
    );
    let failed = a
        .members()
        .into_iter()
        .find(|m| m.name == "fd-b")
        .unwrap();
    assert_eq!(failed.status, MemberStatus::Failed);

    assert!(
        next_matching(
            &mut a_events,
            |ev| is_member_event(ev, MemberEventKind::Failed, "fd-b"),
            Duration::from_secs(1),
        )
        .await
        .is_none(),
        "duplicate failure event for fd-b"
    );

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_leave() {
    let a = Cluster::create(test_config("gl-a")).await.unwrap();
    let mut a_events = a.events().unwrap();
    let b = Cluster::create(test_config("gl-b")).await.unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        a.num_members() == 2
    })
    .await;

    b.leave().await.unwrap();

    assert!(next_matching(
        &mut a_events,
        |ev| is_member_event(ev, MemberEventKind::Leave, "gl-b"),
        Duration::from_secs(5),
    )
    .await
    .is_some());
    let left = a.members().into_iter().find(|m| m.name == "gl-b").unwrap();
    assert_eq!(left.status, MemberStatus::Left);

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_join_intent_cannot_resurrect() {
    let a = Cluster::create(test_config("sr-a")).await.unwrap();
    let mut a_events = a.events().unwrap();
    let b = Cluster::create(test_config("sr-b")).await.unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        a.num_members() == 2
    })
    .await;

    b.leave().await.unwrap();
    b.shutdown().await.unwrap();
    wait_until("b to be marked left", Duration::from_secs(5), || {
        a.members()
            .iter()
            .any(|m| m.name == "sr-b" && m.status == MemberStatus::Left)
    })
    .await;
    // Drain anything already queued.
    while a_events.try_recv().is_ok() {}

    // Inject a synthetic join intent far in the Lamport future.
    let msg = wire::encode(
        MessageType::JoinIntent,
        &JoinIntentMsg {
            ltime: 1_000_000,
            node: "sr-b".to_string(),
        },
    )
    .unwrap();
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a.local_member().socket_addr();
    for _ in 0..3 {
        sock.send_to(&msg, a_addr).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let member = a.members().into_iter().find(|m| m.name == "sr-b").unwrap();
    assert_eq!(
        member.status,
        MemberStatus::Left,
        "a join intent must never revive a left member"
    );
    assert!(
        next_matching(
            &mut a_events,
            |ev| is_member_event(ev, MemberEventKind::Join, "sr-b"),
            Duration::from_millis(300),
        )
        .await
        .is_none(),
        "no join event may fire for the left member"
    );

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_user_event_dedup() {
    let a = Cluster::create(test_config("ue-a")).await.unwrap();
    let b = Cluster::create(test_config("ue-b")).await.unwrap();
    let mut b_events = b.events().unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        b.num_members() == 2
    })
    .await;

    a.user_event("deploy", b"v1", false).unwrap();

    let ev = next_matching(
        &mut b_events,
        |ev| matches!(ev, Event::User(ue) if ue.name == "deploy"),
        Duration::from_secs(3),
    )
    .await
    .expect("user event never arrived");
    let Event::User(ue) = ev else { unreachable!() };
    assert_eq!(ue.payload, b"v1");

    // Replay the identical encoded packet several times.
    let replayed = wire::encode(
        MessageType::UserEvent,
        &UserEventMsg {
            ltime: ue.ltime,
            name: ue.name.clone(),
            payload: ue.payload.clone(),
            cc: ue.coalesce,
        },
    )
    .unwrap();
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b_addr = b.local_member().socket_addr();
    for _ in 0..5 {
        sock.send_to(&replayed, b_addr).await.unwrap();
    }

    assert!(
        next_matching(
            &mut b_events,
            |ev| matches!(ev, Event::User(ue) if ue.name == "deploy"),
            Duration::from_millis(800),
        )
        .await
        .is_none(),
        "replayed event must be deduplicated"
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_with_tag_filter() {
    let mut cfg_a = test_config("q-a");
    cfg_a.tags.insert("role".to_string(), "web".to_string());
    let mut cfg_b = test_config("q-b");
    cfg_b.tags.insert("role".to_string(), "db".to_string());
    let mut cfg_c = test_config("q-c");
    cfg_c.tags.insert("role".to_string(), "web".to_string());

    let a = Cluster::create(cfg_a).await.unwrap();
    let b = Cluster::create(cfg_b).await.unwrap();
    let c = Cluster::create(cfg_c).await.unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    c.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("three nodes to converge", Duration::from_secs(3), || {
        a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
    })
    .await;

    // Each node answers "ping" with its own name.
    for (cluster, name) in [(&a, "q-a"), (&b, "q-b"), (&c, "q-c")] {
        let mut rx = cluster.events().unwrap();
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Event::Query(q) = ev {
                    if q.name == "ping" {
                        let _ = q.respond(name.as_bytes().to_vec()).await;
                    }
                }
            }
        });
    }

    let mut params = QueryParams {
        request_ack: true,
        timeout: Some(Duration::from_secs(1)),
        ..QueryParams::default()
    };
    params
        .filter_tags
        .insert("role".to_string(), "^web$".to_string());

    let started = Instant::now();
    let mut resp = a.query("ping", b"", Some(params)).unwrap();
    let mut ack_rx = resp.take_ack_rx().unwrap();

    let mut responders = HashSet::new();
    while let Some(r) = resp.recv().await {
        responders.insert(String::from_utf8_lossy(&r.payload).into_owned());
    }
    let elapsed = started.elapsed();

    assert_eq!(
        responders,
        HashSet::from(["q-a".to_string(), "q-c".to_string()]),
        "only the two web nodes may respond"
    );
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed <= Duration::from_millis(1400),
        "response stream should close at the deadline, closed after {:?}",
        elapsed
    );

    let mut ackers = HashSet::new();
    while let Ok(from) = ack_rx.try_recv() {
        ackers.insert(from);
    }
    assert_eq!(ackers.len(), 2, "both matching nodes must ack");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_tags_propagates() {
    let a = Cluster::create(test_config("st-a")).await.unwrap();
    let mut a_events = a.events().unwrap();
    let b = Cluster::create(test_config("st-b")).await.unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        a.num_members() == 2
    })
    .await;

    let mut tags = starling::Tags::new();
    tags.insert("version".to_string(), "2".to_string());
    b.set_tags(tags).await.unwrap();

    assert!(next_matching(
        &mut a_events,
        |ev| is_member_event(ev, MemberEventKind::Update, "st-b"),
        Duration::from_secs(5),
    )
    .await
    .is_some());
    wait_until("tags visible on a", Duration::from_secs(2), || {
        a.members().iter().any(|m| {
            m.name == "st-b" && m.tags.get("version").map(String::as_str) == Some("2")
        })
    })
    .await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_key_manager_over_encrypted_cluster() {
    let key = vec![7u8; 32];
    let mut cfg_a = test_config("km-a");
    cfg_a.encryption_key = Some(key.clone());
    let mut cfg_b = test_config("km-b");
    cfg_b.encryption_key = Some(key);

    let a = Cluster::create(cfg_a).await.unwrap();
    let b = Cluster::create(cfg_b).await.unwrap();

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("encrypted join to converge", Duration::from_secs(3), || {
        a.num_members() == 2 && b.num_members() == 2
    })
    .await;

    let resp = a.key_manager().list_keys().await.unwrap();
    assert_eq!(resp.num_err, 0, "errors: {:?}", resp.messages);
    assert_eq!(resp.num_resp, 2, "both nodes must answer the key query");
    assert_eq!(resp.keys.len(), 1);
    assert!(resp.keys.values().all(|&count| count == 2));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
