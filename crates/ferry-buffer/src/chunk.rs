use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, MutexGuard, RawMutex};
use rand::Rng;

use crate::error::BufferResult;
use crate::metadata::Metadata;

/// One formatted event payload as stored in a chunk.
///
/// The buffer never interprets record bytes; all size accounting is over
/// payload lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    bytes: Vec<u8>,
}

impl Record {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for Record {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Record {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for Record {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

/// Opaque chunk identity, stable for the chunk's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the 32-character lowercase hex form produced by `Display`.
    pub fn parse_hex(text: &str) -> Option<Self> {
        if text.len() != 32 || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Lifecycle state of a chunk.
///
/// Transitions are monotonic: `Unstaged -> Staged -> Queued -> Closed`,
/// with two shortcuts: `Unstaged -> Queued` (overflow chunks produced
/// during step-by-step writes) and `Staged -> Closed` (empty chunks are
/// closed on enqueue instead of entering the queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Constructed but never inserted into the stage map.
    Unstaged,
    /// The active accumulation chunk for its metadata in the stage map.
    Staged,
    /// Placed on the delivery queue (possibly held by a consumer).
    Queued,
    /// Destroyed; no further operation succeeds.
    Closed,
}

impl Display for ChunkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChunkState::Unstaged => write!(f, "unstaged"),
            ChunkState::Staged => write!(f, "staged"),
            ChunkState::Queued => write!(f, "queued"),
            ChunkState::Closed => write!(f, "closed"),
        }
    }
}

/// Append-only record container supplied by a [`ChunkStore`] backend.
///
/// Appends accumulate into an uncommitted batch: `commit` finalizes the
/// batch and `rollback` restores `bytesize`, `size`, and backend state to
/// the last committed snapshot. Implementations are driven strictly under
/// the per-chunk lock owned by [`ChunkRef`], so they need no interior
/// synchronization of their own.
///
/// [`ChunkStore`]: crate::store::ChunkStore
pub trait Chunk: Send {
    fn unique_id(&self) -> ChunkId;

    fn metadata(&self) -> &Arc<Metadata>;

    /// Current serialized byte length, committed plus uncommitted.
    fn bytesize(&self) -> u64;

    /// Current record count, committed plus uncommitted.
    fn size(&self) -> u64;

    fn state(&self) -> ChunkState;

    /// Append records to the uncommitted batch.
    fn append(&mut self, records: &[Record]) -> BufferResult<()>;

    /// Append pre-serialized bytes covering `records` records.
    fn concat(&mut self, bytes: &[u8], records: u64) -> BufferResult<()>;

    /// Finalize the uncommitted batch.
    fn commit(&mut self) -> BufferResult<()>;

    /// Discard the uncommitted batch, restoring the committed snapshot.
    fn rollback(&mut self) -> BufferResult<()>;

    /// Committed content, for transmission by a consumer.
    fn read(&self) -> BufferResult<Vec<u8>>;

    /// Release all backend state. Legal on any non-closed chunk.
    fn purge(&mut self) -> BufferResult<()>;

    /// Release in-memory state; persistent backends keep non-empty chunks
    /// recoverable. Idempotent.
    fn close(&mut self) -> BufferResult<()>;

    /// Transition unstaged -> staged when the buffer promotes the chunk
    /// into the stage map.
    fn mark_staged(&mut self);

    /// Transition into the queued state. Persistent backends may react
    /// here (the file backend renames its data file).
    fn mark_enqueued(&mut self) -> BufferResult<()>;

    fn is_empty(&self) -> bool {
        self.bytesize() == 0 && self.size() == 0
    }

    /// Writable means staged or unstaged but not queued/closed.
    fn is_writable(&self) -> bool {
        matches!(self.state(), ChunkState::Staged | ChunkState::Unstaged)
    }
}

/// Owned per-chunk lock guard, held by the write coordinator across its
/// append and commit phases.
pub(crate) type OwnedChunkGuard = ArcMutexGuard<RawMutex, Box<dyn Chunk>>;

/// Cheap-clone handle to a chunk and its lock.
///
/// The id and metadata never change for the life of a chunk and are kept
/// outside the lock; every other observation or mutation goes through
/// [`ChunkRef::lock`].
#[derive(Clone)]
pub struct ChunkRef {
    id: ChunkId,
    metadata: Arc<Metadata>,
    cell: Arc<Mutex<Box<dyn Chunk>>>,
}

impl ChunkRef {
    pub fn new(chunk: Box<dyn Chunk>) -> Self {
        let id = chunk.unique_id();
        let metadata = chunk.metadata().clone();
        Self {
            id,
            metadata,
            cell: Arc::new(Mutex::new(chunk)),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Acquire the per-chunk lock for the duration of a borrow.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Chunk>> {
        self.cell.lock()
    }

    /// Acquire the per-chunk lock as an owned guard that can outlive the
    /// calling frame; used by the write coordinator to keep chunks locked
    /// from append through commit.
    pub(crate) fn lock_owned(&self) -> OwnedChunkGuard {
        Mutex::lock_arc(&self.cell)
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRef")
            .field("id", &self.id.to_string())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
