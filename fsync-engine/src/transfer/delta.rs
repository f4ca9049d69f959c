//! Block-level delta computation with rsync-style matching.
//!
//! The receiving side publishes a [`Signature`] of its current content: one
//! weak CRC32 plus one strong BLAKE3 hash per fixed-size block. The sending
//! side slides a window over its version, reusing every block the receiver
//! already holds and shipping only the literal runs in between. Literal runs
//! are flushed at block-size boundaries so every transfer unit stays bounded.

use std::collections::HashMap;

use bytes::Bytes;

use fsync_shared::{BlockPayload, BlockSignature, ContentHash, Signature};

/// Default transfer block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Weak per-block checksum, cheap enough to compare before the strong hash.
fn weak_hash(block: &[u8]) -> u32 {
    crc32fast::hash(block)
}

/// Compute the signature of existing destination content.
pub fn signature(data: &[u8], block_size: u32) -> Signature {
    let blocks = data
        .chunks(block_size as usize)
        .map(|chunk| BlockSignature {
            weak: weak_hash(chunk),
            strong: ContentHash::of(chunk),
        })
        .collect();

    Signature {
        block_size,
        file_size: data.len() as u64,
        blocks,
    }
}

/// Plan the transfer of `data` against the receiver's signature.
///
/// Returns the ordered payload sequence whose concatenation reproduces
/// `data` on the receiving side. Without a signature every block is literal.
pub fn plan(data: &[u8], sig: Option<&Signature>, block_size: u32) -> Vec<BlockPayload> {
    let block_size = sig.map_or(block_size, |s| s.block_size) as usize;
    if block_size == 0 {
        return literal_blocks(data, DEFAULT_BLOCK_SIZE as usize);
    }

    let Some(sig) = sig.filter(|s| !s.blocks.is_empty()) else {
        return literal_blocks(data, block_size);
    };

    // weak -> [(strong, baseline index)]
    let mut lookup: HashMap<u32, Vec<(ContentHash, u32)>> = HashMap::new();
    for (i, block) in sig.blocks.iter().enumerate() {
        lookup
            .entry(block.weak)
            .or_default()
            .push((block.strong, i as u32));
    }

    let mut payloads = Vec::new();
    let mut pos = 0;
    let mut literal_start = 0;

    while pos + block_size <= data.len() {
        let window = &data[pos..pos + block_size];
        let weak = weak_hash(window);

        let matched = lookup.get(&weak).and_then(|candidates| {
            let strong = ContentHash::of(window);
            candidates
                .iter()
                .find(|(candidate, _)| *candidate == strong)
                .map(|(_, index)| *index)
        });

        match matched {
            Some(baseline_index) => {
                if literal_start < pos {
                    push_literals(&mut payloads, &data[literal_start..pos], block_size);
                }
                payloads.push(BlockPayload::CopyBaseline { baseline_index });
                pos += block_size;
                literal_start = pos;
            }
            None => pos += 1,
        }
    }

    if literal_start < data.len() {
        push_literals(&mut payloads, &data[literal_start..], block_size);
    }
    payloads
}

/// Reassemble file content from a payload sequence and the receiver's own
/// baseline content. Per-block hashes are checked as the blocks are applied;
/// whole-file verification is the caller's job.
pub fn apply(
    baseline: &[u8],
    block_size: u32,
    payloads: &[BlockPayload],
) -> crate::errors::Result<Vec<u8>> {
    let block_size = block_size as usize;
    let mut result = Vec::new();

    for payload in payloads {
        match payload {
            BlockPayload::Data { bytes, hash } => {
                let actual = ContentHash::of(bytes);
                if actual != *hash {
                    return Err(crate::errors::SyncError::Integrity {
                        path: String::new(),
                        expected: *hash,
                        actual,
                    });
                }
                result.extend_from_slice(bytes);
            }
            BlockPayload::CopyBaseline { baseline_index } => {
                let start = *baseline_index as usize * block_size;
                let end = (start + block_size).min(baseline.len());
                let Some(slice) = baseline.get(start..end) else {
                    return Err(crate::errors::SyncError::Protocol(format!(
                        "copy of baseline block {baseline_index} out of range"
                    )));
                };
                result.extend_from_slice(slice);
            }
        }
    }
    Ok(result)
}

fn literal_blocks(data: &[u8], block_size: usize) -> Vec<BlockPayload> {
    let mut payloads = Vec::new();
    push_literals(&mut payloads, data, block_size);
    payloads
}

fn push_literals(payloads: &mut Vec<BlockPayload>, run: &[u8], block_size: usize) {
    for chunk in run.chunks(block_size) {
        payloads.push(BlockPayload::Data {
            bytes: Bytes::copy_from_slice(chunk),
            hash: ContentHash::of(chunk),
        });
    }
}

/// Bytes a plan puts on the wire, for progress accounting.
pub fn literal_size(payloads: &[BlockPayload]) -> u64 {
    payloads
        .iter()
        .map(|p| match p {
            BlockPayload::Data { bytes, .. } => bytes.len() as u64,
            BlockPayload::CopyBaseline { .. } => 0,
        })
        .sum()
}
