mod write;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

pub use write::{FormatFn, WriteOptions};

use crate::chunk::{Chunk, ChunkId, ChunkRef, ChunkState};
use crate::config::BufferConfig;
use crate::error::BufferResult;
use crate::metadata::Metadata;
use crate::store::ChunkStore;

/// Point-in-time copy of the buffer's size counters and collection
/// lengths.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferMetricsSnapshot {
    pub stage_size: u64,
    pub queue_size: u64,
    pub stage_length: usize,
    pub queue_length: usize,
    pub dequeued_length: usize,
}

/// Chunked staging-and-queueing buffer.
///
/// Producers [`write`](Buffer::write) record batches keyed by
/// [`Metadata`]; the buffer accumulates them into size-bounded chunks,
/// moves full chunks onto a FIFO queue, and consumers drive delivery with
/// [`dequeue_chunk`](Buffer::dequeue_chunk) /
/// [`purge_chunk`](Buffer::purge_chunk) /
/// [`takeback_chunk`](Buffer::takeback_chunk). All operations are safe to
/// call from any thread between [`start`](Buffer::start) and
/// [`close`](Buffer::close).
///
/// Two lock levels guard the buffer: one global lock over the tables and
/// counters, and one lock per chunk. Holders of the global lock may take
/// chunk locks; the write coordinator takes its chunk locks first and
/// releases every one of them before touching the global lock.
pub struct Buffer {
    config: BufferConfig,
    store: Box<dyn ChunkStore>,
    state: Mutex<BufferState>,
}

/// Everything behind the buffer-global lock.
struct BufferState {
    /// The accumulating chunk per metadata. Every chunk here is staged.
    stage: HashMap<Arc<Metadata>, ChunkRef>,
    /// Chunks awaiting delivery, strictly FIFO. Every chunk here is queued.
    queue: VecDeque<ChunkRef>,
    /// Chunks handed to a consumer and not yet purged or taken back.
    dequeued: HashMap<ChunkId, ChunkRef>,
    /// Queued-chunk count per metadata; entries linger at zero until the
    /// final purge retires the metadata.
    queued_num: HashMap<Arc<Metadata>, u64>,
    /// Canonical metadata instances, interned by linear search.
    metadata_list: Vec<Arc<Metadata>>,
    /// Bytes across staged chunks. Signed: a racing enqueue may subtract a
    /// chunk's bytes before the write that added them publishes, leaving
    /// the counter negative for that window.
    stage_size: i64,
    /// Bytes across queued and dequeued chunks; decremented at purge.
    queue_size: i64,
}

impl BufferState {
    fn new() -> Self {
        Self {
            stage: HashMap::new(),
            queue: VecDeque::new(),
            dequeued: HashMap::new(),
            queued_num: HashMap::new(),
            metadata_list: Vec::new(),
            stage_size: 0,
            queue_size: 0,
        }
    }

    fn intern(&mut self, metadata: Arc<Metadata>) -> Arc<Metadata> {
        if let Some(existing) = self.metadata_list.iter().find(|m| ***m == *metadata) {
            existing.clone()
        } else {
            self.metadata_list.push(metadata.clone());
            metadata
        }
    }
}

impl Buffer {
    /// Builds a buffer over `store`, recovering any chunks a previous run
    /// left behind.
    pub fn start(config: BufferConfig, store: Box<dyn ChunkStore>) -> BufferResult<Self> {
        let config = config.normalized()?;
        let (staged, queued) = store.resume()?;

        let mut state = BufferState::new();
        for (metadata, chunk) in staged {
            debug_assert_eq!(chunk.state(), ChunkState::Staged);
            let chunk = ChunkRef::new(chunk);
            let metadata = state.intern(metadata);
            state.stage_size += chunk.lock().bytesize() as i64;
            state.stage.insert(metadata, chunk);
        }
        for chunk in queued {
            debug_assert_eq!(chunk.state(), ChunkState::Queued);
            let chunk = ChunkRef::new(chunk);
            let metadata = state.intern(chunk.metadata().clone());
            *state.queued_num.entry(metadata).or_insert(0) += 1;
            state.queue_size += chunk.lock().bytesize() as i64;
            state.queue.push_back(chunk);
        }
        debug!(
            stage_size = state.stage_size,
            queue_size = state.queue_size,
            staged_chunks = state.stage.len(),
            queued_chunks = state.queue.len(),
            "buffer started"
        );

        Ok(Self {
            config,
            store,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Returns the canonical interned instance for the given descriptor
    /// triple, creating it on first use.
    pub fn metadata(
        &self,
        timekey: Option<i64>,
        tag: Option<&str>,
        variables: Option<BTreeMap<String, String>>,
    ) -> Arc<Metadata> {
        self.add_metadata(Metadata::new(timekey, tag.map(str::to_string), variables))
    }

    /// Interns a metadata value, returning the canonical instance.
    pub fn add_metadata(&self, metadata: Metadata) -> Arc<Metadata> {
        self.state.lock().intern(Arc::new(metadata))
    }

    /// Snapshot of the live metadata list, isolated from concurrent
    /// registry changes.
    pub fn metadata_list(&self) -> Vec<Arc<Metadata>> {
        self.state.lock().metadata_list.clone()
    }

    /// True while the buffer still has room below `total_limit_size`.
    pub fn storable(&self) -> bool {
        let state = self.state.lock();
        state.stage_size + state.queue_size < self.config.total_limit_size as i64
    }

    pub fn stage_size(&self) -> u64 {
        self.state.lock().stage_size.max(0) as u64
    }

    pub fn queue_size(&self) -> u64 {
        self.state.lock().queue_size.max(0) as u64
    }

    pub fn metrics(&self) -> BufferMetricsSnapshot {
        let state = self.state.lock();
        BufferMetricsSnapshot {
            stage_size: state.stage_size.max(0) as u64,
            queue_size: state.queue_size.max(0) as u64,
            stage_length: state.stage.len(),
            queue_length: state.queue.len(),
            dequeued_length: state.dequeued.len(),
        }
    }

    /// True when any chunk is queued, or with a metadata given, when at
    /// least one chunk of that metadata is queued.
    pub fn queued(&self, metadata: Option<&Arc<Metadata>>) -> bool {
        let state = self.state.lock();
        match metadata {
            Some(metadata) => state
                .queued_num
                .get(metadata)
                .is_some_and(|count| *count > 0),
            None => !state.queue.is_empty(),
        }
    }

    /// Total record count across currently queued chunks.
    pub fn queued_records(&self) -> u64 {
        let state = self.state.lock();
        state.queue.iter().map(|chunk| chunk.lock().size()).sum()
    }

    /// Moves the staged chunk of `metadata` onto the queue. An empty
    /// staged chunk is closed instead and the queue is left unchanged.
    pub fn enqueue_chunk(&self, metadata: &Arc<Metadata>) {
        let mut state = self.state.lock();
        self.enqueue_chunk_locked(&mut state, metadata);
    }

    fn enqueue_chunk_locked(&self, state: &mut BufferState, metadata: &Arc<Metadata>) {
        let Some(chunk) = state.stage.remove(metadata) else {
            return;
        };
        let (bytesize, queued) = {
            let mut guard = chunk.lock();
            let bytesize = guard.bytesize();
            if guard.is_empty() {
                if let Err(error) = guard.close() {
                    warn!(chunk = %chunk.id(), %error, "failed to close empty staged chunk");
                }
                (bytesize, false)
            } else {
                if let Err(error) = guard.mark_enqueued() {
                    warn!(chunk = %chunk.id(), %error, "enqueued hook failed");
                }
                (bytesize, true)
            }
        };
        state.stage_size -= bytesize as i64;
        if queued {
            *state.queued_num.entry(metadata.clone()).or_insert(0) += 1;
            state.queue_size += bytesize as i64;
            state.queue.push_back(chunk);
        }
    }

    /// Queues a chunk that was never in the stage map (an overflow chunk
    /// from a step-by-step write).
    pub fn enqueue_unstaged_chunk(&self, chunk: ChunkRef) {
        let mut state = self.state.lock();
        self.enqueue_unstaged_chunk_locked(&mut state, chunk);
    }

    fn enqueue_unstaged_chunk_locked(&self, state: &mut BufferState, chunk: ChunkRef) {
        let bytesize = {
            let mut guard = chunk.lock();
            if let Err(error) = guard.mark_enqueued() {
                warn!(chunk = %chunk.id(), %error, "enqueued hook failed");
            }
            guard.bytesize()
        };
        *state.queued_num.entry(chunk.metadata().clone()).or_insert(0) += 1;
        state.queue_size += bytesize as i64;
        state.queue.push_back(chunk);
    }

    /// Enqueues every staged chunk.
    pub fn enqueue_all(&self) {
        self.enqueue_all_if(|_, _| true);
    }

    /// Enqueues the staged chunks the predicate accepts.
    pub fn enqueue_all_if(&self, predicate: impl Fn(&Metadata, &dyn Chunk) -> bool) {
        let mut state = self.state.lock();
        let metadatas: Vec<Arc<Metadata>> = state.stage.keys().cloned().collect();
        for metadata in metadatas {
            let Some(chunk) = state.stage.get(&metadata).cloned() else {
                continue;
            };
            let eligible = {
                let guard = chunk.lock();
                predicate(metadata.as_ref(), &**guard)
            };
            if eligible {
                self.enqueue_chunk_locked(&mut state, &metadata);
            }
        }
    }

    /// Pops the queue head and hands it to the consumer. The chunk stays
    /// tracked in the dequeued map until purged or taken back.
    pub fn dequeue_chunk(&self) -> Option<ChunkRef> {
        let mut state = self.state.lock();
        let chunk = state.queue.pop_front()?;
        if let Some(count) = state.queued_num.get_mut(chunk.metadata()) {
            *count = count.saturating_sub(1);
        }
        state.dequeued.insert(chunk.id(), chunk.clone());
        Some(chunk)
    }

    /// Returns a dequeued chunk to the queue head for redelivery. False
    /// when the id is not currently dequeued.
    pub fn takeback_chunk(&self, chunk_id: ChunkId) -> bool {
        let mut state = self.state.lock();
        let Some(chunk) = state.dequeued.remove(&chunk_id) else {
            return false;
        };
        *state.queued_num.entry(chunk.metadata().clone()).or_insert(0) += 1;
        state.queue.push_front(chunk);
        true
    }

    /// Acknowledges a dequeued chunk: releases its backend state and, when
    /// no chunk of its metadata remains anywhere, retires the metadata
    /// from the registry. Purge failures are logged and swallowed.
    pub fn purge_chunk(&self, chunk_id: ChunkId) {
        let mut state = self.state.lock();
        let Some(chunk) = state.dequeued.remove(&chunk_id) else {
            return;
        };
        let metadata = chunk.metadata().clone();
        {
            let mut guard = chunk.lock();
            state.queue_size -= guard.bytesize() as i64;
            if let Err(error) = guard.purge() {
                error!(chunk = %chunk.id(), %error, "failed to purge buffer chunk");
            }
        }
        let staged = state.stage.contains_key(&metadata);
        let queued = state
            .queued_num
            .get(&metadata)
            .is_some_and(|count| *count > 0);
        if !staged && !queued {
            state.metadata_list.retain(|m| m != &metadata);
            state.queued_num.remove(&metadata);
        }
    }

    /// Drains the queue, purging every chunk in it. Individual purge
    /// failures are logged and the drain continues.
    pub fn clear_queue(&self) {
        let mut state = self.state.lock();
        while let Some(chunk) = state.queue.pop_front() {
            {
                let mut guard = chunk.lock();
                trace!(
                    chunk = %chunk.id(),
                    bytesize = guard.bytesize(),
                    size = guard.size(),
                    "purging a chunk in queue"
                );
                if let Err(error) = guard.purge() {
                    error!(chunk = %chunk.id(), %error, "unexpected error while clearing buffer queue");
                }
            }
            if let Some(count) = state.queued_num.get_mut(chunk.metadata()) {
                *count = count.saturating_sub(1);
            }
        }
        state.queue_size = 0;
    }

    /// Closes every chunk and drains all collections. Persistent backends
    /// keep their files for the next start.
    pub fn close(&self) {
        let mut state = self.state.lock();
        debug!(
            staged_chunks = state.stage.len(),
            queued_chunks = state.queue.len(),
            dequeued_chunks = state.dequeued.len(),
            "closing buffer"
        );
        let dequeued: Vec<ChunkRef> = state.dequeued.drain().map(|(_, chunk)| chunk).collect();
        for chunk in dequeued {
            Self::close_chunk(&chunk);
        }
        while let Some(chunk) = state.queue.pop_front() {
            Self::close_chunk(&chunk);
        }
        let staged: Vec<ChunkRef> = state.stage.drain().map(|(_, chunk)| chunk).collect();
        for chunk in staged {
            Self::close_chunk(&chunk);
        }
        state.queued_num.clear();
        state.stage_size = 0;
        state.queue_size = 0;
    }

    fn close_chunk(chunk: &ChunkRef) {
        if let Err(error) = chunk.lock().close() {
            warn!(chunk = %chunk.id(), %error, "failed to close buffer chunk");
        }
    }

    /// Drops every reference the buffer holds and zeroes the counters.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.stage.clear();
        state.queue.clear();
        state.dequeued.clear();
        state.queued_num.clear();
        state.metadata_list.clear();
        state.stage_size = 0;
        state.queue_size = 0;
    }

    /// Fetches the staged chunk for `metadata`, creating and staging a
    /// fresh one when the slot is empty. Chunk generation runs under the
    /// global lock, same as the stage-slot assignment it guards.
    fn fetch_or_create_staged(&self, metadata: &Arc<Metadata>) -> BufferResult<ChunkRef> {
        let mut state = self.state.lock();
        if let Some(chunk) = state.stage.get(metadata) {
            return Ok(chunk.clone());
        }
        let chunk = ChunkRef::new(self.store.generate_chunk(metadata.clone())?);
        chunk.lock().mark_staged();
        state.stage.insert(metadata.clone(), chunk.clone());
        Ok(chunk)
    }

    /// True when the last append pushed the chunk past a hard limit and
    /// must be rolled back.
    fn chunk_size_over(&self, chunk: &dyn Chunk) -> bool {
        if chunk.bytesize() > self.config.chunk_limit_size {
            return true;
        }
        matches!(self.config.chunk_records_limit, Some(limit) if chunk.size() > limit)
    }

    /// True when the chunk reached the configured fraction of a limit and
    /// should be enqueued.
    fn chunk_size_full(&self, chunk: &dyn Chunk) -> bool {
        let threshold = self.config.chunk_full_threshold;
        if chunk.bytesize() as f64 >= self.config.chunk_limit_size as f64 * threshold {
            return true;
        }
        matches!(
            self.config.chunk_records_limit,
            Some(limit) if chunk.size() as f64 >= limit as f64 * threshold
        )
    }
}
