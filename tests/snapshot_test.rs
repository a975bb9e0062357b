//! Snapshot persistence and auto-rejoin tests.

use starling::{Cluster, Config, Error, MemberStatus};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

fn test_config(name: &str, snapshot: Option<PathBuf>) -> Config {
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
    c.snapshot_path = snapshot;
    c
}

fn addr_of(cluster: &Cluster) -> String {
    cluster.local_member().socket_addr().to_string()
}

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

/// Consume events so the pipeline never backs up.
fn drain_events(cluster: &Cluster) {
    let mut rx = cluster.events().unwrap();
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
}

#[tokio::test]
async fn test_snapshot_records_peers() {
    let dir = tempfile::tempdir().unwrap();
    let snap = dir.path().join("b.snap");

    let a = Cluster::create(test_config("sp-a", None)).await.unwrap();
    drain_events(&a);
    let b = Cluster::create(test_config("sp-b", Some(snap.clone())))
        .await
        .unwrap();
    drain_events(&b);

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        b.num_members() == 2
    })
    .await;

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let contents = std::fs::read_to_string(&snap).unwrap();
    assert!(
        contents.contains("alive: sp-a "),
        "snapshot must record the peer: {:?}",
        contents
    );
    assert!(
        !contents.contains("alive: sp-b "),
        "snapshot must not record the local node as a peer: {:?}",
        contents
    );
    assert!(!contents.contains("leave"), "no leave record was written");
}

#[tokio::test]
async fn test_auto_rejoin_after_unclean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let snap = dir.path().join("b.snap");

    let a = Cluster::create(test_config("ar-a", None)).await.unwrap();
    drain_events(&a);

    // b gets a fixed port so the restarted instance is the same endpoint.
    let mut cfg_b = test_config("ar-b", Some(snap.clone()));
    cfg_b.bind_port = 27946;
    let b = Cluster::create(cfg_b.clone()).await.unwrap();
    drain_events(&b);

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        b.num_members() == 2
    })
    .await;

    // Unclean death: straight shutdown, no leave record. Drop the instance
    // so its sockets release the fixed port.
    b.shutdown().await.unwrap();
    drop(b);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let restarted = Cluster::create(cfg_b).await.unwrap();
    drain_events(&restarted);

    // No explicit join call: the snapshot drives the rejoin.
    wait_until(
        "auto-rejoin to re-form the cluster",
        Duration::from_secs(5),
        || {
            restarted
                .members()
                .iter()
                .any(|m| m.name == "ar-a" && m.status == MemberStatus::Alive)
        },
    )
    .await;

    restarted.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_leave_suppresses_rejoin() {
    let dir = tempfile::tempdir().unwrap();
    let snap = dir.path().join("b.snap");

    let a = Cluster::create(test_config("cl-a", None)).await.unwrap();
    drain_events(&a);
    let mut cfg_b = test_config("cl-b", Some(snap.clone()));
    cfg_b.bind_port = 27956;
    let b = Cluster::create(cfg_b.clone()).await.unwrap();
    drain_events(&b);

    b.join(&[addr_of(&a)], false).await.unwrap();
    wait_until("join to converge", Duration::from_secs(2), || {
        b.num_members() == 2
    })
    .await;

    b.leave().await.unwrap();
    b.shutdown().await.unwrap();
    drop(b);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let contents = std::fs::read_to_string(&snap).unwrap();
    assert!(
        contents.lines().any(|l| l.trim() == "leave"),
        "leave record missing: {:?}",
        contents
    );

    let restarted = Cluster::create(cfg_b).await.unwrap();
    drain_events(&restarted);

    // The operator left on purpose: the restarted node must stay alone.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        restarted.num_members(),
        1,
        "a cleanly departed node must not auto-rejoin"
    );

    restarted.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_identity_collision_refuses_start() {
    let dir = tempfile::tempdir().unwrap();
    let snap = dir.path().join("b.snap");
    std::fs::write(&snap, "alive: ic-b 127.0.0.1:9999\n").unwrap();

    let err = Cluster::create(test_config("ic-b", Some(snap)))
        .await
        .expect_err("a snapshot naming the local node must refuse to start");
    assert!(matches!(err, Error::SnapshotIdentity(name) if name == "ic-b"));
}

#[tokio::test]
async fn test_clocks_seeded_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let snap = dir.path().join("b.snap");
    std::fs::write(
        &snap,
        "alive: other 127.0.0.1:1\nclock: 100\nevent-clock: 200\nquery-clock: 300\nleave\n",
    )
    .unwrap();

    let b = Cluster::create(test_config("cs-b", Some(snap)))
        .await
        .unwrap();
    drain_events(&b);

    let stats = b.stats();
    assert!(stats["member_time"].parse::<u64>().unwrap() > 100);
    assert!(stats["event_time"].parse::<u64>().unwrap() > 200);
    assert!(stats["query_time"].parse::<u64>().unwrap() > 300);

    b.shutdown().await.unwrap();
}
