//! Bidirectional file-synchronization engine.
//!
//! The engine turns two directory trees and a shared baseline into one
//! converged tree:
//!
//! - [`snapshotter`] walks a root into a deterministic [`fsync_shared::Snapshot`]
//! - [`diff`] computes the change set between two snapshots
//! - [`conflict`] detects concurrent edits and applies a [`ResolutionPolicy`]
//! - [`transfer`] moves file content in resumable, delta-compressed blocks
//! - [`session`] drives the whole protocol round over a [`Transport`]
//!
//! Storage of committed baselines and the byte pipe between peers are seams:
//! [`SnapshotStore`] and [`Transport`] traits with shipped file/stream/memory
//! implementations.

pub mod conflict;
pub mod diff;
pub mod errors;
pub mod ignore;
pub mod progress;
pub mod session;
pub mod snapshotter;
pub mod store;
pub mod transfer;
pub mod transport;

pub use conflict::{
    LatestWins, ManualPolicy, MergePlan, MergedChange, Origin, OursWins, ResolutionPolicy,
    ResolvedConflict, TheirsWins,
};
pub use errors::{Result, SyncError};
pub use ignore::IgnoreSet;
pub use progress::{Progress, ProgressTracker};
pub use session::{FileFailure, Role, Session, SessionConfig, SessionState, SyncSummary};
pub use snapshotter::{SnapshotReport, Snapshotter, SnapshotterConfig};
pub use store::{JsonSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use transfer::{TransferConfig, TransferManager};
pub use transport::{memory_pair, MemoryTransport, StreamTransport, Transport};
