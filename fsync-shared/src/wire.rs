//! Wire protocol: message set, versioning and length-prefixed framing.
//!
//! Every message is a frame of `u32` big-endian payload length, one kind
//! byte, and a CBOR-encoded payload. The Hello exchange negotiates the
//! protocol version that governs which subsequent message shapes are valid.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::change::{ChangeSet, Decision};
use crate::errors::{Result, WireError};
use crate::hash::ContentHash;

/// Protocol version advertised in Hello.
pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;

/// Upper bound on a single frame. Blocks are at most 4 MiB; the rest is
/// headroom for CBOR overhead and large change sets.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message kind tag, the single byte following the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0x01,
    ChangeSetMsg = 0x02,
    ConflictDecision = 0x03,
    BlockData = 0x04,
    BlockAck = 0x05,
    Commit = 0x06,
    CommitAck = 0x07,
    Abort = 0x08,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::ChangeSetMsg),
            0x03 => Ok(Self::ConflictDecision),
            0x04 => Ok(Self::BlockData),
            0x05 => Ok(Self::BlockAck),
            0x06 => Ok(Self::Commit),
            0x07 => Ok(Self::CommitAck),
            0x08 => Ok(Self::Abort),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Session handshake. `baseline_seq` is the last committed snapshot sequence
/// the sender holds for the root; a mismatch between peers triggers the full
/// snapshot exchange fallback. A side that committed locally but never saw
/// the peer's ack advertises that snapshot through the `pending` fields so
/// the peer knows whether to expect a commit retry or to treat the pending
/// snapshot as the shared baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
    pub root_id: String,
    pub session_id: String,
    pub baseline_seq: Option<u64>,
    pub baseline_root_hash: Option<ContentHash>,
    pub pending_seq: Option<u64>,
    pub pending_root_hash: Option<ContentHash>,
}

/// Per-block signature of existing destination content: weak rolling
/// checksum for candidate matching plus a strong hash for verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub weak: u32,
    pub strong: ContentHash,
}

/// Block signatures of a whole file, block index implied by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub block_size: u32,
    pub file_size: u64,
    pub blocks: Vec<BlockSignature>,
}

/// One side's change set against the agreed baseline. When baseline
/// negotiation failed, both sides diff against the empty snapshot and the
/// change set doubles as a full tree listing.
///
/// `signatures` carry block signatures of the sender's current content for
/// paths it expects to receive bytes for, keyed by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetMsg {
    pub changes: ChangeSet,
    pub signatures: BTreeMap<String, Signature>,
}

/// The deciding side's record of conflict resolutions, sent after Resolving.
/// With a deterministic policy both sides compute the same decisions and the
/// message is a cross-check; with a manual policy it is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDecisionMsg {
    pub decisions: Vec<(String, Decision)>,
    pub signatures: BTreeMap<String, Signature>,
}

/// Content of one block position of a file in transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockPayload {
    /// Literal block bytes with their hash.
    Data { bytes: Bytes, hash: ContentHash },
    /// Reuse a block of the receiver's own baseline content.
    CopyBaseline { baseline_index: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    pub path: String,
    pub index: u32,
    pub total: u32,
    pub payload: BlockPayload,
    /// Whole-file hash the receiver must observe after assembly.
    pub file_hash: ContentHash,
}

/// Acknowledgement of one block. The ack of the final block of a file also
/// reports whole-file verification through `ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockAck {
    pub path: String,
    pub index: u32,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: u64,
    pub root_hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitAck {
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Abort {
    pub reason: String,
}

/// A protocol message, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    ChangeSetMsg(ChangeSetMsg),
    ConflictDecision(ConflictDecisionMsg),
    BlockData(BlockData),
    BlockAck(BlockAck),
    Commit(Commit),
    CommitAck(CommitAck),
    Abort(Abort),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::ChangeSetMsg(_) => MessageKind::ChangeSetMsg,
            Message::ConflictDecision(_) => MessageKind::ConflictDecision,
            Message::BlockData(_) => MessageKind::BlockData,
            Message::BlockAck(_) => MessageKind::BlockAck,
            Message::Commit(_) => MessageKind::Commit,
            Message::CommitAck(_) => MessageKind::CommitAck,
            Message::Abort(_) => MessageKind::Abort,
        }
    }

    /// Encode into a length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = Vec::new();
        match self {
            Message::Hello(m) => ser(m, &mut payload)?,
            Message::ChangeSetMsg(m) => ser(m, &mut payload)?,
            Message::ConflictDecision(m) => ser(m, &mut payload)?,
            Message::BlockData(m) => ser(m, &mut payload)?,
            Message::BlockAck(m) => ser(m, &mut payload)?,
            Message::Commit(m) => ser(m, &mut payload)?,
            Message::CommitAck(m) => ser(m, &mut payload)?,
            Message::Abort(m) => ser(m, &mut payload)?,
        }

        let body_len = payload.len() + 1;
        if body_len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut frame = BytesMut::with_capacity(4 + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.extend_from_slice(&[self.kind() as u8]);
        frame.extend_from_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode one complete length-prefixed frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 5 {
            return Err(WireError::Truncated {
                expected: 5,
                actual: frame.len(),
            });
        }

        let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if frame.len() < 4 + body_len {
            return Err(WireError::Truncated {
                expected: 4 + body_len,
                actual: frame.len(),
            });
        }

        let kind = MessageKind::try_from(frame[4])?;
        let payload = &frame[5..4 + body_len];

        let message = match kind {
            MessageKind::Hello => Message::Hello(de(payload)?),
            MessageKind::ChangeSetMsg => Message::ChangeSetMsg(de(payload)?),
            MessageKind::ConflictDecision => Message::ConflictDecision(de(payload)?),
            MessageKind::BlockData => Message::BlockData(de(payload)?),
            MessageKind::BlockAck => Message::BlockAck(de(payload)?),
            MessageKind::Commit => Message::Commit(de(payload)?),
            MessageKind::CommitAck => Message::CommitAck(de(payload)?),
            MessageKind::Abort => Message::Abort(de(payload)?),
        };
        Ok(message)
    }
}

fn ser<T: Serialize>(value: &T, out: &mut Vec<u8>) -> Result<()> {
    ciborium::into_writer(value, out).map_err(|e| WireError::Encode(e.to_string()))
}

fn de<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    ciborium::from_reader(payload).map_err(|e| WireError::Decode(e.to_string()))
}

/// Version compatibility checking for the Hello exchange.
pub struct VersionNegotiator;

impl VersionNegotiator {
    /// Peers are compatible when their major versions match.
    pub fn is_compatible(peer_version: &str) -> bool {
        match Self::parse_version(peer_version) {
            Some((major, _, _)) => major == PROTOCOL_VERSION_MAJOR,
            None => false,
        }
    }

    fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() != 3 {
            return None;
        }
        let major = parts[0].parse().ok()?;
        let minor = parts[1].parse().ok()?;
        let patch = parts[2].parse().ok()?;
        Some((major, minor, patch))
    }

    pub fn compatibility_error(peer_version: &str) -> String {
        match Self::parse_version(peer_version) {
            Some(_) => format!(
                "protocol version incompatible: peer {}, we support {} (major must match)",
                peer_version, PROTOCOL_VERSION
            ),
            None => format!(
                "invalid protocol version '{}', expected format like '{}'",
                peer_version, PROTOCOL_VERSION
            ),
        }
    }
}
