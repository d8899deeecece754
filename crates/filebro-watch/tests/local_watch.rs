//! Change watcher against the real local driver.

use filebro_drivers::DriverRegistry;
use filebro_protocol::{ChangeKind, Outbound, ServerEvent, SessionId};
use filebro_watch::ChangeWatcher;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

async fn next_change(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for change")
        .expect("outbound channel closed")
}

#[tokio::test]
async fn test_two_subscribers_see_one_deletion() {
    let tmp = TempDir::new().unwrap();
    let victim = tmp.path().join("victim.txt");
    std::fs::write(&victim, "bye").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = ChangeWatcher::new(
        Arc::new(DriverRegistry::with_local()),
        tx,
        Duration::from_millis(200),
    );

    let dir = tmp.path().to_str().unwrap();
    let a = SessionId::new();
    let b = SessionId::new();
    let resolved = watcher.subscribe(a, dir).await.unwrap();
    watcher.subscribe(b, dir).await.unwrap();
    assert_eq!(watcher.active_count(), 1);

    std::fs::remove_file(&victim).unwrap();

    let out = next_change(&mut rx).await;
    let mut recipients = out.recipients.clone();
    recipients.sort();
    assert_eq!(recipients, vec![a, b]);
    match out.event {
        ServerEvent::Change { path, kind, changes } => {
            assert_eq!(path, resolved);
            assert_eq!(kind, ChangeKind::Deleted);
            assert!(changes
                .iter()
                .any(|c| c.path.ends_with("victim.txt") && c.kind == ChangeKind::Deleted));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // One window, one event.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnected_session_stops_receiving() {
    let tmp = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = ChangeWatcher::new(
        Arc::new(DriverRegistry::with_local()),
        tx,
        Duration::from_millis(100),
    );

    let dir = tmp.path().to_str().unwrap();
    let gone = SessionId::new();
    let stays = SessionId::new();
    watcher.subscribe(gone, dir).await.unwrap();
    watcher.subscribe(stays, dir).await.unwrap();
    assert_eq!(watcher.remove_session(gone), 1);

    std::fs::write(tmp.path().join("new.txt"), "hi").unwrap();

    let out = next_change(&mut rx).await;
    assert_eq!(out.recipients, vec![stays]);
}
