//! Full protocol rounds between two in-process peers over the memory
//! transport, each side working on a real temporary tree.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::fs;

use fsync_engine::transport::{recv_message, send_message};
use fsync_engine::{
    memory_pair, LatestWins, MemorySnapshotStore, Session, SessionConfig, SnapshotStore,
    Snapshotter, SnapshotterConfig, SyncSummary,
};
use fsync_shared::{Decision, Hello, Message, MessageKind};

const ROOT_ID: &str = "shared-docs";

struct Peer {
    root: TempDir,
    store: Arc<MemorySnapshotStore>,
    session: Session,
}

fn peer(client: bool) -> Peer {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemorySnapshotStore::new());
    let config = SessionConfig::new(ROOT_ID);
    let session = if client {
        Session::client(root.path(), store.clone(), Arc::new(LatestWins), config)
    } else {
        Session::server(root.path(), store.clone(), Arc::new(LatestWins), config)
    };
    Peer {
        root,
        store,
        session,
    }
}

fn pair() -> (Peer, Peer) {
    (peer(true), peer(false))
}

async fn sync(client: &mut Peer, server: &mut Peer) -> (SyncSummary, SyncSummary) {
    let (mut a, mut b) = memory_pair();
    let (c, s) = tokio::join!(client.session.run(&mut a), server.session.run(&mut b));
    (c.unwrap(), s.unwrap())
}

async fn read(peer: &Peer, rel: &str) -> Vec<u8> {
    fs::read(peer.root.path().join(rel)).await.unwrap()
}

async fn exists(peer: &Peer, rel: &str) -> bool {
    fs::symlink_metadata(peer.root.path().join(rel)).await.is_ok()
}

#[tokio::test]
async fn test_single_file_propagates_and_resyncs_clean() {
    let (mut client, mut server) = pair();
    fs::write(client.root.path().join("hello.txt"), b"hello world")
        .await
        .unwrap();

    let (c, s) = sync(&mut client, &mut server).await;
    assert_eq!(c.seq, 1);
    assert_eq!(s.seq, 1);
    assert_eq!(c.stats.added, 1);
    assert_eq!(c.root_hash, s.root_hash);
    assert_eq!(read(&server, "hello.txt").await, b"hello world");

    // An unchanged pair of trees syncs to an empty change set.
    let (c2, s2) = sync(&mut client, &mut server).await;
    assert_eq!(c2.seq, 2);
    assert_eq!(c2.stats.total(), 0);
    assert_eq!(s2.stats.total(), 0);
    assert_eq!(c2.bytes_sent, 0);
    assert_eq!(s2.bytes_sent, 0);

    let stored = client.store.load(ROOT_ID).await.unwrap().unwrap();
    assert_eq!(stored.seq, 2);
    assert_eq!(stored.root_hash, c2.root_hash);
}

#[tokio::test]
async fn test_bidirectional_merge_with_subdirectories() {
    let (mut client, mut server) = pair();
    fs::write(client.root.path().join("from-client.txt"), b"c")
        .await
        .unwrap();
    fs::create_dir_all(server.root.path().join("docs/drafts"))
        .await
        .unwrap();
    fs::write(server.root.path().join("docs/drafts/plan.md"), b"# plan")
        .await
        .unwrap();

    let (c, s) = sync(&mut client, &mut server).await;
    assert!(c.conflicts.is_empty());
    assert_eq!(c.root_hash, s.root_hash);

    assert_eq!(read(&server, "from-client.txt").await, b"c");
    assert_eq!(read(&client, "docs/drafts/plan.md").await, b"# plan");
    assert!(exists(&client, "docs/drafts").await);
}

#[tokio::test]
async fn test_latest_wins_resolves_concurrent_edit() {
    let (mut client, mut server) = pair();
    fs::write(client.root.path().join("f.txt"), b"client version")
        .await
        .unwrap();
    // Ensure a strictly newer mtime on the server side.
    tokio::time::sleep(Duration::from_millis(30)).await;
    fs::write(server.root.path().join("f.txt"), b"server version")
        .await
        .unwrap();

    let (c, s) = sync(&mut client, &mut server).await;

    assert_eq!(c.conflicts.len(), 1);
    assert_eq!(s.conflicts.len(), 1);
    assert_eq!(c.conflicts[0].decision, Decision::KeepRemote);
    assert_eq!(c.root_hash, s.root_hash);
    assert_eq!(read(&client, "f.txt").await, b"server version");
    assert_eq!(read(&server, "f.txt").await, b"server version");
}

#[tokio::test]
async fn test_rename_moves_no_bytes() {
    let (mut client, mut server) = pair();
    let content = b"quarterly numbers".repeat(50);
    fs::write(client.root.path().join("report.txt"), &content)
        .await
        .unwrap();
    sync(&mut client, &mut server).await;

    fs::rename(
        client.root.path().join("report.txt"),
        client.root.path().join("report-2026.txt"),
    )
    .await
    .unwrap();

    let (c, s) = sync(&mut client, &mut server).await;
    assert_eq!(c.stats.renamed, 1);
    assert_eq!(c.bytes_sent, 0);
    assert_eq!(s.bytes_sent, 0);
    assert!(!exists(&server, "report.txt").await);
    assert_eq!(read(&server, "report-2026.txt").await, content);
}

#[tokio::test]
async fn test_rename_vs_concurrent_edit_converges() {
    let (mut client, mut server) = pair();
    fs::write(client.root.path().join("report.txt"), b"original")
        .await
        .unwrap();
    sync(&mut client, &mut server).await;

    // The client renames the file while the server edits it in place.
    fs::rename(
        client.root.path().join("report.txt"),
        client.root.path().join("moved.txt"),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    fs::write(server.root.path().join("report.txt"), b"edited on server")
        .await
        .unwrap();

    let (c, s) = sync(&mut client, &mut server).await;

    // The vacated source path is a conflict, reported on both sides, and the
    // trees converge: the newer edit survives at the source path while the
    // rename still lands.
    assert_eq!(c.conflicts.len(), 1);
    assert_eq!(s.conflicts.len(), 1);
    assert_eq!(c.conflicts[0].conflict.path, "report.txt");
    assert_eq!(c.root_hash, s.root_hash);

    assert_eq!(read(&client, "report.txt").await, b"edited on server");
    assert_eq!(read(&server, "report.txt").await, b"edited on server");
    assert_eq!(read(&client, "moved.txt").await, b"original");
    assert_eq!(read(&server, "moved.txt").await, b"original");
}

#[tokio::test]
async fn test_deletions_propagate_deepest_first() {
    let (mut client, mut server) = pair();
    fs::create_dir_all(client.root.path().join("old/nested"))
        .await
        .unwrap();
    fs::write(client.root.path().join("old/nested/a.txt"), b"a")
        .await
        .unwrap();
    fs::write(client.root.path().join("old/b.txt"), b"b")
        .await
        .unwrap();
    fs::write(client.root.path().join("keep.txt"), b"keep")
        .await
        .unwrap();
    sync(&mut client, &mut server).await;
    assert!(exists(&server, "old/nested/a.txt").await);

    fs::remove_dir_all(server.root.path().join("old"))
        .await
        .unwrap();

    let (c, _s) = sync(&mut client, &mut server).await;
    assert!(c.stats.deleted >= 4); // dir, nested dir, two files
    assert!(!exists(&client, "old").await);
    assert!(exists(&client, "keep.txt").await);
}

#[tokio::test]
async fn test_empty_file_syncs_without_blocks() {
    let (mut client, mut server) = pair();
    fs::write(client.root.path().join("empty.log"), b"")
        .await
        .unwrap();

    let (c, _s) = sync(&mut client, &mut server).await;
    assert_eq!(c.bytes_sent, 0);
    assert_eq!(read(&server, "empty.log").await, b"");
}

#[tokio::test]
async fn test_default_ignores_never_travel() {
    let (mut client, mut server) = pair();
    fs::create_dir_all(client.root.path().join("node_modules/pkg"))
        .await
        .unwrap();
    fs::write(client.root.path().join("node_modules/pkg/x.js"), b"js")
        .await
        .unwrap();
    fs::write(client.root.path().join("scratch.tmp"), b"scratch")
        .await
        .unwrap();
    fs::write(client.root.path().join("real.txt"), b"real")
        .await
        .unwrap();

    sync(&mut client, &mut server).await;
    assert!(exists(&server, "real.txt").await);
    assert!(!exists(&server, "node_modules").await);
    assert!(!exists(&server, "scratch.tmp").await);
}

#[tokio::test]
async fn test_version_mismatch_aborts_before_exchange() {
    let mut server = peer(false);
    let (mut a, mut b) = memory_pair();

    let fake_client = tokio::spawn(async move {
        send_message(
            &mut a,
            &Message::Hello(Hello {
                version: "2.0.0".to_string(),
                root_id: ROOT_ID.to_string(),
                session_id: "future-peer".to_string(),
                baseline_seq: Some(0),
                baseline_root_hash: None,
                pending_seq: None,
                pending_root_hash: None,
            }),
        )
        .await
        .unwrap();
        recv_message(&mut a).await.unwrap()
    });

    let result = server.session.run(&mut b).await;
    assert!(result.is_err());

    let reply = fake_client.await.unwrap();
    assert_eq!(reply.kind(), MessageKind::Abort);
    // Nothing was committed.
    assert!(server.store.load(ROOT_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_commit_rolls_forward() {
    let (mut client, mut server) = pair();
    fs::write(client.root.path().join("data.txt"), b"payload")
        .await
        .unwrap();
    sync(&mut client, &mut server).await;

    // Simulate a round that died between Commit and CommitAck: the client
    // holds the next snapshot as pending, the server never saw the ack
    // round-trip complete.
    let report = Snapshotter::new(SnapshotterConfig::default())
        .snapshot(client.root.path(), ROOT_ID, 2)
        .await
        .unwrap();
    client
        .store
        .save_pending(ROOT_ID, &report.snapshot)
        .await
        .unwrap();

    let (c, s) = sync(&mut client, &mut server).await;
    // The pending commit landed first (seq 2), then the fresh round
    // committed on top of it.
    assert_eq!(c.seq, 3);
    assert_eq!(s.seq, 3);
    assert_eq!(c.stats.total(), 0);
    assert!(client.store.load_pending(ROOT_ID).await.unwrap().is_none());
    assert_eq!(server.store.load(ROOT_ID).await.unwrap().unwrap().seq, 3);
}
