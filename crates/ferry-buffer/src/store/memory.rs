use std::collections::HashMap;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkId, ChunkState, Record};
use crate::error::{BufferError, BufferResult};
use crate::metadata::Metadata;
use crate::store::{ChunkStore, ResumeState};

/// Memory-resident chunk backend.
///
/// Chunks live entirely on the heap; nothing survives a restart, so
/// `resume` always reports an empty buffer.
#[derive(Debug, Default)]
pub struct MemoryStore;

impl MemoryStore {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkStore for MemoryStore {
    fn generate_chunk(&self, metadata: Arc<Metadata>) -> BufferResult<Box<dyn Chunk>> {
        Ok(Box::new(MemoryChunk::new(metadata)))
    }

    fn resume(&self) -> BufferResult<ResumeState> {
        Ok((HashMap::new(), Vec::new()))
    }
}

/// Heap-backed chunk with committed byte/record watermarks.
///
/// Rollback truncates the byte buffer to the watermarks; commit advances
/// them to the current end.
pub struct MemoryChunk {
    id: ChunkId,
    metadata: Arc<Metadata>,
    state: ChunkState,
    buffer: Vec<u8>,
    records: u64,
    committed_bytes: usize,
    committed_records: u64,
}

impl MemoryChunk {
    pub fn new(metadata: Arc<Metadata>) -> Self {
        Self {
            id: ChunkId::generate(),
            metadata,
            state: ChunkState::Unstaged,
            buffer: Vec::new(),
            records: 0,
            committed_bytes: 0,
            committed_records: 0,
        }
    }

    fn ensure_writable(&self) -> BufferResult<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(BufferError::not_writable(format!(
                "chunk {} is {}",
                self.id, self.state
            )))
        }
    }

    fn ensure_open(&self) -> BufferResult<()> {
        if self.state == ChunkState::Closed {
            Err(BufferError::storage(format!("chunk {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

impl Chunk for MemoryChunk {
    fn unique_id(&self) -> ChunkId {
        self.id
    }

    fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    fn bytesize(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn size(&self) -> u64 {
        self.records
    }

    fn state(&self) -> ChunkState {
        self.state
    }

    fn append(&mut self, records: &[Record]) -> BufferResult<()> {
        self.ensure_writable()?;
        for record in records {
            self.buffer.extend_from_slice(record.as_bytes());
        }
        self.records += records.len() as u64;
        Ok(())
    }

    fn concat(&mut self, bytes: &[u8], records: u64) -> BufferResult<()> {
        self.ensure_writable()?;
        self.buffer.extend_from_slice(bytes);
        self.records += records;
        Ok(())
    }

    fn commit(&mut self) -> BufferResult<()> {
        self.ensure_open()?;
        self.committed_bytes = self.buffer.len();
        self.committed_records = self.records;
        Ok(())
    }

    fn rollback(&mut self) -> BufferResult<()> {
        self.ensure_open()?;
        self.buffer.truncate(self.committed_bytes);
        self.records = self.committed_records;
        Ok(())
    }

    fn read(&self) -> BufferResult<Vec<u8>> {
        self.ensure_open()?;
        Ok(self.buffer[..self.committed_bytes].to_vec())
    }

    fn purge(&mut self) -> BufferResult<()> {
        self.buffer = Vec::new();
        self.records = 0;
        self.committed_bytes = 0;
        self.committed_records = 0;
        self.state = ChunkState::Closed;
        Ok(())
    }

    fn close(&mut self) -> BufferResult<()> {
        self.purge()
    }

    fn mark_staged(&mut self) {
        debug_assert_eq!(self.state, ChunkState::Unstaged);
        self.state = ChunkState::Staged;
    }

    fn mark_enqueued(&mut self) -> BufferResult<()> {
        self.state = ChunkState::Queued;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> MemoryChunk {
        MemoryChunk::new(Arc::new(Metadata::empty()))
    }

    #[test]
    fn append_commit_read() {
        let mut c = chunk();
        c.append(&[Record::from("hello"), Record::from("world")])
            .expect("append");
        assert_eq!(c.bytesize(), 10);
        assert_eq!(c.size(), 2);
        // uncommitted bytes are invisible to readers
        assert_eq!(c.read().expect("read"), b"");
        c.commit().expect("commit");
        assert_eq!(c.read().expect("read"), b"helloworld");
    }

    #[test]
    fn rollback_restores_committed_snapshot() {
        let mut c = chunk();
        c.append(&[Record::from("abc")]).expect("append");
        c.commit().expect("commit");
        c.concat(b"defgh", 2).expect("concat");
        assert_eq!(c.bytesize(), 8);
        assert_eq!(c.size(), 3);
        c.rollback().expect("rollback");
        assert_eq!(c.bytesize(), 3);
        assert_eq!(c.size(), 1);
        assert_eq!(c.read().expect("read"), b"abc");
    }

    #[test]
    fn append_after_enqueue_is_rejected() {
        let mut c = chunk();
        c.mark_staged();
        c.mark_enqueued().expect("enqueue");
        let err = c.append(&[Record::from("x")]).expect_err("append must fail");
        assert!(matches!(err, BufferError::NotWritable(_)));
    }

    #[test]
    fn purge_releases_everything() {
        let mut c = chunk();
        c.append(&[Record::from("abc")]).expect("append");
        c.commit().expect("commit");
        c.purge().expect("purge");
        assert_eq!(c.state(), ChunkState::Closed);
        assert_eq!(c.bytesize(), 0);
        assert!(c.read().is_err());
        // close after purge stays quiet
        c.close().expect("close");
    }

    #[test]
    fn resume_is_empty() {
        let (stage, queue) = MemoryStore::new().resume().expect("resume");
        assert!(stage.is_empty());
        assert!(queue.is_empty());
    }
}
