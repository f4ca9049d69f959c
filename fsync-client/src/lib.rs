//! Client agent for fsync.
//!
//! [`SyncClient`] owns the client side of one synchronized root. Each call to
//! [`SyncClient::sync`] runs a full round against the peer; the caller brings
//! the transport, so reconnection policy stays outside. State that matters
//! across connections lives in the session: acknowledged-block positions for
//! resumable transfers, and the pending-commit marker in the snapshot store
//! for the roll-forward path.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use fsync_engine::Session;

pub use fsync_engine::{
    JsonSnapshotStore, LatestWins, ManualPolicy, OursWins, Progress, ProgressTracker,
    ResolutionPolicy, Result, SessionConfig, SnapshotStore, StreamTransport, SyncSummary,
    TheirsWins, Transport,
};

pub struct SyncClient {
    session: Session,
    root: PathBuf,
}

impl SyncClient {
    pub fn new(
        root: impl Into<PathBuf>,
        store: Arc<dyn SnapshotStore>,
        policy: Arc<dyn ResolutionPolicy>,
        config: SessionConfig,
    ) -> Self {
        let root = root.into();
        let session = Session::client(&root, store, policy, config);
        Self { session, root }
    }

    /// Run one sync round over a connected transport.
    pub async fn sync(&mut self, transport: &mut dyn Transport) -> Result<SyncSummary> {
        info!("starting sync of {:?}", self.root);
        let summary = self.session.run(transport).await?;
        info!(
            "sync of {:?} committed seq {}: {} changes, {} conflicts, {} failed",
            self.root,
            summary.seq,
            summary.stats.total(),
            summary.conflicts.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Run again after a connection loss. Identical to [`SyncClient::sync`];
    /// the name marks intent at call sites. Because the session object
    /// survives, interrupted transfers pick up at the first unacknowledged
    /// block and an unacknowledged commit is rolled forward instead of
    /// re-diffed.
    pub async fn resume(&mut self, transport: &mut dyn Transport) -> Result<SyncSummary> {
        info!("resuming sync of {:?}", self.root);
        self.session.run(transport).await
    }

    /// Live transfer progress, for rendering by the caller.
    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.session.progress()
    }
}
