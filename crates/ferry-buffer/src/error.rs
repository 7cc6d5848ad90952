use std::fmt::Display;

/// A specialized error type for buffer operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// An I/O error occurred in a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The combined staged and queued bytes reached the total limit.
    ///
    /// Permanent for the rejected batch until a consumer drains the queue;
    /// the buffer never retries it internally.
    #[error("buffer space has too many data (stage: {stage_size}, queue: {queue_size}, limit: {limit})")]
    Overflow {
        stage_size: u64,
        queue_size: u64,
        limit: u64,
    },
    /// A single record does not fit even in a fresh chunk.
    #[error("a {bytes} bytes record is larger than buffer chunk limit size")]
    ChunkOverflow { bytes: u64 },
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Append or concat was attempted on a queued or closed chunk.
    #[error("chunk is not writable: {0}")]
    NotWritable(String),
    /// A chunk metadata sidecar could not be encoded or decoded.
    #[error("chunk metadata codec error: {0}")]
    MetaCodec(#[from] serde_json::Error),
    /// Storage backend failure that is not a plain I/O error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BufferError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a not-writable error from a displayable value.
    pub fn not_writable<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::NotWritable(msg.to_string())
    }

    /// Create a storage backend error from a displayable value.
    pub fn storage<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Storage(msg.to_string())
    }

    /// True when the error is the total-limit rejection.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }

    /// True when a single record exceeded the chunk limit.
    pub fn is_chunk_overflow(&self) -> bool {
        matches!(self, Self::ChunkOverflow { .. })
    }
}

/// A Result type alias for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = BufferError::invalid_config("bad threshold");
        assert!(matches!(err, BufferError::InvalidConfig(msg) if msg == "bad threshold"));
    }

    #[test]
    fn chunk_overflow_message_references_bytes() {
        let err = BufferError::ChunkOverflow { bytes: 150 };
        assert!(err.to_string().contains("150 bytes"));
        assert!(err.is_chunk_overflow());
    }
}
