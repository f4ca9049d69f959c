//! Server side of fsync.
//!
//! A [`SyncServer`] serves one synchronized root to many peers. Each accepted
//! connection becomes an isolated session task; a failure in one session
//! never affects another. Commits on the same root are serialized through a
//! [`RootLocks`] registry, so concurrent sessions cannot interleave their
//! baseline updates.

pub mod locks;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use fsync_engine::{
    ResolutionPolicy, Result, Session, SessionConfig, SnapshotStore, SyncSummary, Transport,
};

pub use fsync_engine::{JsonSnapshotStore, LatestWins, StreamTransport};
pub use locks::RootLocks;

pub struct SyncServer {
    root: PathBuf,
    store: Arc<dyn SnapshotStore>,
    policy: Arc<dyn ResolutionPolicy>,
    config: SessionConfig,
    locks: Arc<RootLocks>,
}

impl SyncServer {
    pub fn new(
        root: impl Into<PathBuf>,
        store: Arc<dyn SnapshotStore>,
        policy: Arc<dyn ResolutionPolicy>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            store,
            policy,
            config,
            locks: Arc::new(RootLocks::new()),
        })
    }

    /// Spawn a session task for one accepted connection. The handle resolves
    /// to the session's outcome; dropping it detaches the session.
    pub fn handle_connection<T>(self: &Arc<Self>, transport: T) -> JoinHandle<Result<SyncSummary>>
    where
        T: Transport + 'static,
    {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let commit_lock = server.locks.for_root(&server.config.root_id);
            let mut session = Session::server(
                &server.root,
                Arc::clone(&server.store),
                Arc::clone(&server.policy),
                server.config.clone(),
            )
            .with_commit_lock(commit_lock);

            let mut transport = transport;
            match session.run(&mut transport).await {
                Ok(summary) => {
                    info!(
                        "session on '{}' committed seq {}: {} changes",
                        server.config.root_id,
                        summary.seq,
                        summary.stats.total()
                    );
                    Ok(summary)
                }
                Err(e) => {
                    warn!("session on '{}' failed: {e}", server.config.root_id);
                    Err(e)
                }
            }
        })
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`, for binaries and manual
/// runs. Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsync_engine::{memory_pair, MemorySnapshotStore};

    fn server_for(root: &std::path::Path) -> Arc<SyncServer> {
        SyncServer::new(
            root,
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(LatestWins),
            SessionConfig::new("root"),
        )
    }

    async fn client_round(root: &std::path::Path, server: &Arc<SyncServer>) -> SyncSummary {
        let mut client = Session::client(
            root,
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(LatestWins),
            SessionConfig::new("root"),
        );
        let (mut a, b) = memory_pair();
        let handle = server.handle_connection(b);
        let summary = client.run(&mut a).await.unwrap();
        handle.await.unwrap().unwrap();
        summary
    }

    #[tokio::test]
    async fn test_connection_becomes_session() {
        let server_root = tempfile::tempdir().unwrap();
        let client_root = tempfile::tempdir().unwrap();
        tokio::fs::write(client_root.path().join("up.txt"), b"up")
            .await
            .unwrap();

        let server = server_for(server_root.path());
        let summary = client_round(client_root.path(), &server).await;

        assert_eq!(summary.seq, 1);
        assert_eq!(
            tokio::fs::read(server_root.path().join("up.txt"))
                .await
                .unwrap(),
            b"up"
        );
    }

    #[tokio::test]
    async fn test_commit_blocks_on_held_root_lock() {
        let server_root = tempfile::tempdir().unwrap();
        let server = server_for(server_root.path());

        // Stand in for another session sitting in its Committing step.
        let lock = server.locks.for_root("root");
        let held = lock.lock().await;

        let (mut a, b) = memory_pair();
        let handle = server.handle_connection(b);
        let client_task = tokio::spawn(async move {
            let client_root = tempfile::tempdir().unwrap();
            tokio::fs::write(client_root.path().join("f.txt"), b"f")
                .await
                .unwrap();
            let mut client = Session::client(
                client_root.path(),
                Arc::new(MemorySnapshotStore::new()),
                Arc::new(LatestWins),
                SessionConfig::new("root"),
            );
            client.run(&mut a).await
        });

        // The round cannot commit while the lock is held elsewhere.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!client_task.is_finished());

        drop(held);
        let summary = client_task.await.unwrap().unwrap();
        assert_eq!(summary.seq, 1);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sessions_on_one_root_both_commit() {
        let server_root = tempfile::tempdir().unwrap();
        let server = server_for(server_root.path());

        let mut rounds = Vec::new();
        for name in ["from-a.txt", "from-b.txt"] {
            let server = Arc::clone(&server);
            rounds.push(tokio::spawn(async move {
                let root = tempfile::tempdir().unwrap();
                tokio::fs::write(root.path().join(name), name.as_bytes())
                    .await
                    .unwrap();
                let mut client = Session::client(
                    root.path(),
                    Arc::new(MemorySnapshotStore::new()),
                    Arc::new(LatestWins),
                    SessionConfig::new("root"),
                );
                let (mut a, b) = memory_pair();
                let handle = server.handle_connection(b);
                let summary = client.run(&mut a).await.unwrap();
                handle.await.unwrap().unwrap();
                summary
            }));
        }
        for round in rounds {
            round.await.unwrap();
        }

        // Both sessions committed and both uploads landed on the shared root.
        for name in ["from-a.txt", "from-b.txt"] {
            assert!(tokio::fs::try_exists(server_root.path().join(name))
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let server_root = tempfile::tempdir().unwrap();
        let server = server_for(server_root.path());

        // A connection that dies mid-handshake fails its own session only.
        let (a, b) = memory_pair();
        let handle = server.handle_connection(b);
        drop(a);
        assert!(handle.await.unwrap().is_err());

        // The next connection syncs normally.
        let client_root = tempfile::tempdir().unwrap();
        tokio::fs::write(client_root.path().join("ok.txt"), b"ok")
            .await
            .unwrap();
        let summary = client_round(client_root.path(), &server).await;
        assert_eq!(summary.stats.added, 1);
    }
}
