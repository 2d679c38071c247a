//! Partitioning a payload into service blocks.
//!
//! A [`BlockPlan`] fixes, for one upload, how many blocks exist, which byte
//! range each block covers, and the id each block commits under.  Ids are
//! Base64 of the zero-padded decimal block index so that their lexical
//! order equals numeric order; the commit document lists them in plan order
//! and deterministic ids make the commit-race recovery a set comparison.

use std::ops::Range;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::errors::{AzError, Result};

/// Smallest block worth transferring in parallel.
pub const MIN_BLOCK_BYTES: u64 = 32 * 1024 * 1024;

/// Largest block the service accepts.
pub const MAX_BLOCK_BYTES: u64 = 4000 * 1024 * 1024;

/// Most blocks one blob may carry.
pub const MAX_BLOCK_COUNT: u64 = 50_000;

/// The partition of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    n_bytes: u64,
    block_count: u64,
    block_ids: Vec<String>,
}

impl BlockPlan {
    /// Number of blocks in the plan.
    pub fn block_count(&self) -> usize {
        self.block_count as usize
    }

    /// Total payload bytes covered by the plan.
    pub fn n_bytes(&self) -> u64 {
        self.n_bytes
    }

    /// Block ids in plan (numeric) order.
    pub fn block_ids(&self) -> &[String] {
        &self.block_ids
    }

    /// Byte range of block `index` within the payload.
    pub fn range(&self, index: usize) -> Range<u64> {
        partition_range(self.n_bytes, self.block_count, index as u64)
    }
}

/// Compute the block partition for a payload of `n_bytes`.
///
/// The count starts from the largest admissible block, is raised to the
/// thread budget when the payload is large enough that parallelism pays
/// (at least [`MIN_BLOCK_BYTES`] per block), and fails once the payload
/// cannot fit within [`MAX_BLOCK_COUNT`] blocks.
pub fn plan_blocks(
    n_threads: usize,
    n_bytes: u64,
    max_bytes_per_block: Option<u64>,
) -> Result<BlockPlan> {
    let cap = max_bytes_per_block
        .unwrap_or(MAX_BLOCK_BYTES)
        .clamp(1, MAX_BLOCK_BYTES);
    let mut block_count = n_bytes.div_ceil(cap);
    if block_count < n_threads as u64 {
        block_count = n_bytes.div_ceil(MIN_BLOCK_BYTES).clamp(1, n_threads as u64);
    }
    let block_count = block_count.max(1);
    if block_count > MAX_BLOCK_COUNT {
        return Err(AzError::PayloadTooLarge { n_bytes });
    }

    let width = block_id_width(block_count);
    let block_ids = (0..block_count)
        .map(|index| block_id(index, width))
        .collect();

    Ok(BlockPlan {
        n_bytes,
        block_count,
        block_ids,
    })
}

/// Near-equal partition of `n_bytes` across `parts`: the first
/// `n_bytes mod parts` parts carry one extra byte.  Also used by the
/// download engine to slice a range read across workers.
pub(crate) fn partition_range(n_bytes: u64, parts: u64, index: u64) -> Range<u64> {
    let base = n_bytes / parts;
    let remainder = n_bytes % parts;
    let (start, len) = if index < remainder {
        (index * (base + 1), base + 1)
    } else {
        (remainder * (base + 1) + (index - remainder) * base, base)
    };
    start..start + len
}

/// Digit width of the zero-padded decimal ids for a plan of `block_count`
/// blocks: the digit count of the largest index.
fn block_id_width(block_count: u64) -> usize {
    if block_count <= 1 {
        1
    } else {
        (block_count - 1).ilog10() as usize + 1
    }
}

fn block_id(index: u64, width: usize) -> String {
    BASE64_STANDARD.encode(format!("{index:0width$}"))
}

// -- Tests --------------------------------------------------------------------
