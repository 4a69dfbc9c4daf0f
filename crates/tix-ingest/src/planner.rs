//! Batch planning
//!
//! Splits `[0, total)` into contiguous batches and groups them into chunks of
//! at most `chunk_size` batches. Items are never materialized here; a batch
//! is only an `(offset, size)` window fetched later by its task.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: usize,
    pub offset: u64,
    pub size: u64,
}

impl Batch {
    /// Offset one past the last item of the batch
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Batches that run concurrently before the next chunk starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub batches: Vec<Batch>,
}

/// Partition `total_items` into chunks of batches.
///
/// Batch ids are dense and ascending across chunks; the last batch (and the
/// last chunk) may be short. `total_items == 0` yields no chunks.
pub fn plan(total_items: u64, batch_size: u64, chunk_size: usize) -> Result<Vec<Chunk>> {
    if batch_size == 0 {
        return Err(IngestError::config("batch_size must be greater than 0"));
    }
    if chunk_size == 0 {
        return Err(IngestError::config("chunk_size must be greater than 0"));
    }

    let num_batches = total_items.div_ceil(batch_size);
    let batches: Vec<Batch> = (0..num_batches)
        .map(|i| {
            let offset = i * batch_size;
            Batch {
                batch_id: i as usize,
                offset,
                size: batch_size.min(total_items - offset),
            }
        })
        .collect();

    Ok(batches
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, batches)| Chunk {
            index,
            batches: batches.to_vec(),
        })
        .collect())
}
