//! Shared data model and wire protocol for fsync.
//!
//! Both the client agent and the server depend on this crate for:
//! - canonical file metadata, snapshots and change sets
//! - the content hash type
//! - the versioned, length-prefixed message framing

pub mod change;
pub mod errors;
pub mod hash;
pub mod model;
pub mod wire;

pub use change::{Change, ChangeSet, ChangeStats, Conflict, Decision};
pub use errors::WireError;
pub use hash::{ContentHash, ContentHasher};
pub use model::{Entry, EntryKind, Snapshot, SnapshotBuilder};
pub use wire::{
    Abort, BlockAck, BlockData, BlockPayload, BlockSignature, ChangeSetMsg, Commit, CommitAck,
    ConflictDecisionMsg, Hello, Message, MessageKind, Signature, VersionNegotiator,
    MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
