use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BufferError, BufferResult};

/// Default upper bound for a single chunk (8 MiB).
pub const DEFAULT_CHUNK_LIMIT_SIZE: u64 = 8 * 1024 * 1024;

/// Default upper bound for staged plus queued bytes (512 MiB).
pub const DEFAULT_TOTAL_LIMIT_SIZE: u64 = 512 * 1024 * 1024;

/// Default fraction of `chunk_limit_size` at which a chunk counts as full
/// and becomes eligible for enqueueing.
pub const DEFAULT_CHUNK_FULL_THRESHOLD: f64 = 0.95;

/// Buffer sizing configuration, deserialized from the agent's `buffer`
/// config group.
///
/// All fields have defaults; load from external sources and call
/// [`BufferConfig::normalized`] before handing it to the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum serialized bytes a single chunk may hold.
    ///
    /// An append that pushes a chunk past this limit is rolled back and the
    /// payload is split or redirected into a fresh chunk.
    pub chunk_limit_size: u64,

    /// Maximum bytes the buffer may hold across stage and queue combined.
    ///
    /// Writes are rejected with an overflow error once this is reached.
    pub total_limit_size: u64,

    /// Optional cap expressed as a queue length.
    ///
    /// When set, `total_limit_size` is derived as
    /// `chunk_limit_size * queue_length_limit`.
    pub queue_length_limit: Option<u64>,

    /// Optional cap on the number of records per chunk.
    pub chunk_records_limit: Option<u64>,

    /// Fraction of the chunk limits at which a chunk counts as full.
    ///
    /// Must be within (0, 1].
    pub chunk_full_threshold: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_limit_size: DEFAULT_CHUNK_LIMIT_SIZE,
            total_limit_size: DEFAULT_TOTAL_LIMIT_SIZE,
            queue_length_limit: None,
            chunk_records_limit: None,
            chunk_full_threshold: DEFAULT_CHUNK_FULL_THRESHOLD,
        }
    }
}

impl BufferConfig {
    /// Returns a validated copy with derived limits applied.
    ///
    /// Applies the `queue_length_limit` derivation, rejects out-of-range
    /// values, and clamps `chunk_limit_size` down to `total_limit_size`
    /// when the two are misordered.
    pub fn normalized(mut self) -> BufferResult<Self> {
        if self.chunk_limit_size == 0 {
            return Err(BufferError::invalid_config("chunk_limit_size must not be zero"));
        }
        if !(self.chunk_full_threshold > 0.0 && self.chunk_full_threshold <= 1.0) {
            return Err(BufferError::invalid_config(format!(
                "chunk_full_threshold must be within (0, 1]: {}",
                self.chunk_full_threshold
            )));
        }
        if let Some(limit) = self.chunk_records_limit {
            if limit == 0 {
                return Err(BufferError::invalid_config("chunk_records_limit must not be zero"));
            }
        }
        if let Some(length) = self.queue_length_limit {
            if length == 0 {
                return Err(BufferError::invalid_config("queue_length_limit must not be zero"));
            }
            self.total_limit_size = self.chunk_limit_size.saturating_mul(length);
        }
        if self.chunk_limit_size > self.total_limit_size {
            warn!(
                chunk_limit_size = self.chunk_limit_size,
                total_limit_size = self.total_limit_size,
                "chunk_limit_size is larger than total_limit_size, clamping"
            );
            self.chunk_limit_size = self.total_limit_size;
        }
        Ok(self)
    }
}
