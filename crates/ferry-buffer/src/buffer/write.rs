use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use super::{Buffer, BufferState};
use crate::chunk::{ChunkRef, ChunkState, OwnedChunkGuard, Record};
use crate::error::{BufferError, BufferResult};
use crate::metadata::Metadata;

/// Serializer for a record slice, supplied by the caller of
/// [`Buffer::write`]. The record count of the serialized slice is the
/// slice length.
pub type FormatFn = dyn Fn(&[Record]) -> Vec<u8> + Send + Sync;

/// Options for [`Buffer::write`].
#[derive(Clone, Copy, Default)]
pub struct WriteOptions<'a> {
    /// Serialize record slices with this callable and store the result via
    /// `concat` instead of appending records individually. A formatted
    /// slice is never split across chunks mid-write.
    pub format: Option<&'a FormatFn>,
    /// Enqueue every staged chunk the write touches, full or not.
    pub enqueue: bool,
}

/// Window count of the first step-by-step pass. One tenth of the payload
/// is small enough to land in a mostly-full chunk; oversize retries grow
/// the count tenfold until windows hold single records.
const INITIAL_SPLITS_COUNT: usize = 10;

/// A chunk the current write appended to, kept locked from the append
/// until its commit or abandonment.
struct HeldChunk {
    chunk: ChunkRef,
    guard: OwnedChunkGuard,
    adding_bytesize: u64,
    /// The chunk was staged (not unstaged) when the append ran.
    staged: bool,
}

/// Chunks locked by the current write call. Entries still present when
/// the call unwinds were never committed and are rolled back.
#[derive(Default)]
struct WriteOperation {
    operated: Vec<HeldChunk>,
}

struct CommittedChunk {
    chunk: ChunkRef,
    adding_bytesize: u64,
    staged: bool,
    enqueue_eligible: bool,
}

impl Buffer {
    /// Admits a batch of per-metadata payloads.
    ///
    /// The batch is rejected whole with [`BufferError::Overflow`] when the
    /// buffer is out of space. Otherwise each payload is appended to its
    /// metadata's staged chunk (splitting into overflow chunks when a
    /// payload does not fit), all touched chunks are committed, and the
    /// full and overflow chunks are enqueued in one critical section, so
    /// observers see the whole write or none of it.
    ///
    /// Commits are best-effort per chunk: after a failure the remaining
    /// chunks still commit, the failed ones are rolled back, and the first
    /// error is returned.
    pub fn write(
        &self,
        batch: Vec<(Arc<Metadata>, Vec<Record>)>,
        options: WriteOptions<'_>,
    ) -> BufferResult<()> {
        if batch.iter().all(|(_, data)| data.is_empty()) {
            return Ok(());
        }
        {
            let state = self.state.lock();
            if state.stage_size + state.queue_size >= self.config.total_limit_size as i64 {
                return Err(BufferError::Overflow {
                    stage_size: state.stage_size.max(0) as u64,
                    queue_size: state.queue_size.max(0) as u64,
                    limit: self.config.total_limit_size,
                });
            }
        }

        let mut op = WriteOperation::default();
        let result = self.write_batch(batch, options, &mut op);

        // Whatever is still operated was never committed: roll it back,
        // purge the unstaged ones so no backend state leaks, and release
        // the locks. Failures here have no recovery and are swallowed.
        for held in op.operated.drain(..) {
            abandon_chunk(&held.chunk, held.guard);
        }
        result
    }

    fn write_batch(
        &self,
        mut batch: Vec<(Arc<Metadata>, Vec<Record>)>,
        options: WriteOptions<'_>,
        op: &mut WriteOperation,
    ) -> BufferResult<()> {
        // lock chunks in one deterministic metadata order across writers
        batch.sort_by(|a, b| a.0.cmp(&b.0));

        for (metadata, data) in &batch {
            if data.is_empty() {
                continue;
            }
            self.write_once(metadata, data, options.format, op)?;
        }
        if op.operated.is_empty() {
            return Ok(());
        }

        // Commit phase. This thread holds every operated chunk's lock, so
        // the global lock is off limits until all of them are released.
        let mut committed: Vec<CommittedChunk> = Vec::with_capacity(op.operated.len());
        let mut first_error: Option<BufferError> = None;
        let mut error_count = 0usize;

        // The first commit decides the batch: backend trouble such as no
        // space left almost always surfaces here.
        let first = op.operated.remove(0);
        match self.commit_one(first, options) {
            Ok(entry) => committed.push(entry),
            Err((held, error)) => {
                op.operated.insert(0, held);
                return Err(error);
            }
        }

        // Remaining chunks commit either way; failures are rolled back
        // individually and only the first error is reported.
        let remaining: Vec<HeldChunk> = op.operated.drain(..).collect();
        for held in remaining {
            match self.commit_one(held, options) {
                Ok(entry) => committed.push(entry),
                Err((held, error)) => {
                    abandon_chunk(&held.chunk, held.guard);
                    error_count += 1;
                    first_error.get_or_insert(error);
                }
            }
        }

        // Publish phase. Every chunk lock is released; the global lock now
        // moves chunks from stage to queue in one critical section.
        {
            let mut state = self.state.lock();

            let mut staged_bytesize = 0i64;
            let mut unstaged_pool: HashMap<Arc<Metadata>, Vec<ChunkRef>> = HashMap::new();
            for entry in &committed {
                if entry.staged {
                    staged_bytesize += entry.adding_bytesize as i64;
                } else {
                    unstaged_pool
                        .entry(entry.chunk.metadata().clone())
                        .or_default()
                        .push(entry.chunk.clone());
                }
            }
            state.stage_size += staged_bytesize;

            for entry in &committed {
                if entry.enqueue_eligible {
                    self.publish_chunk_locked(&mut state, entry, options.enqueue, &mut unstaged_pool);
                }
            }
        }

        if let Some(error) = first_error {
            warn!(
                errors = error_count,
                "error occurs in committing chunks: only first one raised"
            );
            return Err(error);
        }
        Ok(())
    }

    fn commit_one(
        &self,
        mut held: HeldChunk,
        options: WriteOptions<'_>,
    ) -> Result<CommittedChunk, (HeldChunk, BufferError)> {
        if let Err(error) = held.guard.commit() {
            return Err((held, error));
        }
        let enqueue_eligible =
            options.enqueue || !held.staged || self.chunk_size_full(&**held.guard);
        let HeldChunk {
            chunk,
            guard,
            adding_bytesize,
            staged,
        } = held;
        drop(guard);
        Ok(CommittedChunk {
            chunk,
            adding_bytesize,
            staged,
            enqueue_eligible,
        })
    }

    fn publish_chunk_locked(
        &self,
        state: &mut BufferState,
        entry: &CommittedChunk,
        enqueue: bool,
        unstaged_pool: &mut HashMap<Arc<Metadata>, Vec<ChunkRef>>,
    ) {
        let (current_state, full) = {
            let guard = entry.chunk.lock();
            (guard.state(), self.chunk_size_full(&**guard))
        };
        match current_state {
            ChunkState::Staged if enqueue || full => {
                let metadata = entry.chunk.metadata().clone();
                self.enqueue_chunk_locked(state, &metadata);
                // hand the freed stage slot to one overflow chunk from the
                // same write, so the next append finds a chunk in place
                if let Some(pool) = unstaged_pool.get_mut(&metadata) {
                    if let Some(candidate) = pool.pop() {
                        let promoted_bytesize = {
                            let mut guard = candidate.lock();
                            if guard.state() == ChunkState::Unstaged
                                && !self.chunk_size_full(&**guard)
                            {
                                guard.mark_staged();
                                Some(guard.bytesize())
                            } else {
                                None
                            }
                        };
                        if let Some(bytesize) = promoted_bytesize {
                            state.stage_size += bytesize as i64;
                            state.stage.insert(metadata, candidate);
                        }
                    }
                }
            }
            ChunkState::Unstaged => {
                self.enqueue_unstaged_chunk_locked(state, entry.chunk.clone());
            }
            _ => {
                // already enqueued, closed, or purged by a concurrent actor
            }
        }
    }

    /// Appends one payload into the metadata's staged chunk when it fits.
    ///
    /// Restarts itself when the staged chunk was enqueued by a racing
    /// thread between the stage-map read and the chunk lock, or after
    /// flushing a chunk too full to take a formatted stream whole. Falls
    /// back to [`Buffer::write_step_by_step`] when the payload cannot land
    /// in one chunk.
    fn write_once(
        &self,
        metadata: &Arc<Metadata>,
        data: &[Record],
        format: Option<&FormatFn>,
        op: &mut WriteOperation,
    ) -> BufferResult<()> {
        loop {
            let chunk = self.fetch_or_create_staged(metadata)?;
            let mut guard = chunk.lock_owned();
            if guard.state() != ChunkState::Staged {
                // enqueued by a racing thread; fetch its successor
                continue;
            }
            let empty_chunk = guard.is_empty();
            let original_bytesize = guard.bytesize();

            let append_result = match format {
                Some(format) => {
                    let serialized = format(data);
                    guard.concat(&serialized, data.len() as u64)
                }
                None => guard.append(data),
            };
            if let Err(error) = append_result {
                abandon_chunk(&chunk, guard);
                return Err(error);
            }
            let adding_bytesize = guard.bytesize() - original_bytesize;

            if !self.chunk_size_over(&**guard) {
                op.operated.push(HeldChunk {
                    chunk,
                    guard,
                    adding_bytesize,
                    staged: true,
                });
                return Ok(());
            }

            guard.rollback()?;
            match (format.is_some(), empty_chunk) {
                (true, false) => {
                    // a formatted stream must land in one chunk whole:
                    // flush this one and retry on its successor
                    drop(guard);
                    self.enqueue_chunk(metadata);
                }
                (true, true) => {
                    warn!(
                        bytes = adding_bytesize,
                        "chunk bytes limit exceeds for an emitted event stream"
                    );
                    drop(guard);
                    return self.write_step_by_step(metadata, data, format, INITIAL_SPLITS_COUNT, op);
                }
                (false, _) => {
                    drop(guard);
                    return self.write_step_by_step(metadata, data, format, INITIAL_SPLITS_COUNT, op);
                }
            }
        }
    }

    /// Slices an oversize payload into windows and spreads them over the
    /// staged chunk plus as many fresh unstaged chunks as needed.
    ///
    /// A window that overflows a chunk rolls the chunk back and restarts
    /// the whole method, either after enqueueing the effectively full
    /// staged chunk or with a tenfold finer split. Single-record windows
    /// that cannot fit a fresh chunk surface as
    /// [`BufferError::ChunkOverflow`].
    fn write_step_by_step(
        &self,
        metadata: &Arc<Metadata>,
        data: &[Record],
        format: Option<&FormatFn>,
        initial_splits: usize,
        op: &mut WriteOperation,
    ) -> BufferResult<()> {
        let mut splits_count = initial_splits;
        loop {
            let windows = split_windows(data, splits_count);

            let attempt_start = op.operated.len();
            let mut staged_chunk_used = false;
            let mut enqueue_before_retry = false;
            let mut retry = false;
            let mut index = 0usize;

            'chunks: while index < windows.len() {
                let chunk = if staged_chunk_used {
                    // staging overflow chunks mid-write would leave resume
                    // with partially staged sets; they stay unstaged until
                    // the publish phase promotes or enqueues them
                    ChunkRef::new(self.store.generate_chunk(metadata.clone())?)
                } else {
                    self.fetch_or_create_staged(metadata)?
                };
                let mut guard = chunk.lock_owned();
                if !guard.is_writable() {
                    retry = true;
                    break 'chunks;
                }
                if guard.state() == ChunkState::Staged {
                    staged_chunk_used = true;
                }
                let original_bytesize = guard.bytesize();

                loop {
                    let window = windows[index];
                    let append_result = match format {
                        Some(format) => {
                            let serialized = format(window);
                            guard.concat(&serialized, window.len() as u64)
                        }
                        None => guard.append(window),
                    };
                    if let Err(error) = append_result {
                        abandon_chunk(&chunk, guard);
                        return Err(error);
                    }

                    if self.chunk_size_over(&**guard) {
                        if let Err(error) = guard.rollback() {
                            abandon_chunk(&chunk, guard);
                            return Err(error);
                        }
                        if window.len() == 1 && original_bytesize == 0 {
                            // a single record even a fresh chunk cannot hold
                            let record_bytes = match format {
                                Some(format) => format(window).len() as u64,
                                None => window[0].len() as u64,
                            };
                            abandon_chunk(&chunk, guard);
                            return Err(BufferError::ChunkOverflow {
                                bytes: record_bytes,
                            });
                        }
                        if self.chunk_size_full(&**guard) || window.len() == 1 {
                            enqueue_before_retry = true;
                        } else {
                            splits_count *= 10;
                        }
                        if guard.state() == ChunkState::Unstaged {
                            if let Err(error) = guard.purge() {
                                warn!(chunk = %chunk.id(), %error, "failed to purge unstaged chunk before split retry");
                            }
                        }
                        retry = true;
                        break 'chunks;
                    }

                    index += 1;
                    if index == windows.len() {
                        break;
                    }
                    if self.chunk_size_full(&**guard) {
                        break;
                    }
                }

                let staged = guard.state() == ChunkState::Staged;
                let adding_bytesize = guard.bytesize() - original_bytesize;
                op.operated.push(HeldChunk {
                    chunk,
                    guard,
                    adding_bytesize,
                    staged,
                });
            }

            if !retry {
                return Ok(());
            }

            // unwind everything this attempt touched before rerunning the
            // split, finer or behind a flushed stage slot
            for held in op.operated.drain(attempt_start..) {
                abandon_chunk(&held.chunk, held.guard);
            }
            if enqueue_before_retry {
                self.enqueue_chunk(metadata);
            }
        }
    }
}

/// Rolls a chunk back and, when it is unstaged, purges it so no backend
/// state leaks; the lock is released on return. Used on every abandonment
/// path, where errors have no recovery and are logged only.
fn abandon_chunk(chunk: &ChunkRef, mut guard: OwnedChunkGuard) {
    if let Err(error) = guard.rollback() {
        trace!(chunk = %chunk.id(), %error, "rollback of abandoned chunk failed");
    }
    if guard.state() == ChunkState::Unstaged {
        if let Err(error) = guard.purge() {
            warn!(chunk = %chunk.id(), %error, "failed to purge abandoned unstaged chunk");
        }
    }
}

/// Slices `data` into consecutive windows, at most `splits_count` of them.
fn split_windows(data: &[Record], splits_count: usize) -> Vec<&[Record]> {
    let splits_count = splits_count.clamp(1, data.len());
    let window = if data.len() % splits_count == 0 {
        data.len() / splits_count
    } else {
        data.len() / (splits_count - 1)
    };
    data.chunks(window.max(1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::store::MemoryStore;

    fn buffer(chunk_limit: u64, total_limit: u64) -> Buffer {
        let config = BufferConfig {
            chunk_limit_size: chunk_limit,
            total_limit_size: total_limit,
            ..BufferConfig::default()
        };
        Buffer::start(config, Box::new(MemoryStore::new())).expect("start")
    }

    fn bytes(len: usize) -> Record {
        Record::new(vec![b'x'; len])
    }

    #[test]
    fn split_windows_cover_the_payload() {
        let data: Vec<Record> = (0..7).map(|_| bytes(1)).collect();
        for splits in [1, 2, 3, 7, 10, 100] {
            let windows = split_windows(&data, splits);
            let total: usize = windows.iter().map(|w| w.len()).sum();
            assert_eq!(total, 7, "splits_count {splits}");
        }
        assert_eq!(split_windows(&data, 7).len(), 7);
        assert_eq!(split_windows(&data, 1).len(), 1);
    }

    #[test]
    fn small_write_stays_staged() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        buffer
            .write(vec![(m.clone(), vec![bytes(90)])], WriteOptions::default())
            .expect("write");
        let metrics = buffer.metrics();
        assert_eq!(metrics.stage_size, 90);
        assert_eq!(metrics.stage_length, 1);
        assert_eq!(metrics.queue_length, 0);
    }

    #[test]
    fn full_chunk_is_enqueued_after_the_write() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        buffer
            .write(vec![(m.clone(), vec![bytes(96)])], WriteOptions::default())
            .expect("write");
        let metrics = buffer.metrics();
        assert_eq!(metrics.stage_length, 0);
        assert_eq!(metrics.queue_length, 1);
        assert_eq!(metrics.queue_size, 96);
    }

    #[test]
    fn enqueue_flag_flushes_even_small_chunks() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        buffer
            .write(
                vec![(m.clone(), vec![bytes(10)])],
                WriteOptions {
                    enqueue: true,
                    ..WriteOptions::default()
                },
            )
            .expect("write");
        let metrics = buffer.metrics();
        assert_eq!(metrics.stage_length, 0);
        assert_eq!(metrics.queue_length, 1);
        assert_eq!(metrics.queue_size, 10);
    }

    #[test]
    fn oversize_payload_spills_into_overflow_chunks() {
        let buffer = buffer(100, 10_000);
        let m = buffer.metadata(None, Some("t"), None);
        // 30 records of 10 bytes: three full chunks
        buffer
            .write(
                vec![(m.clone(), vec![bytes(10); 30])],
                WriteOptions::default(),
            )
            .expect("write");
        let metrics = buffer.metrics();
        assert_eq!(metrics.stage_size + metrics.queue_size, 300);
        assert!(metrics.queue_length >= 2, "queue: {}", metrics.queue_length);
        assert_eq!(buffer.queued_records() as usize * 10, metrics.queue_size as usize);
    }

    #[test]
    fn single_oversize_record_is_rejected_without_leaks() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        let before = buffer.metrics();
        let err = buffer
            .write(vec![(m.clone(), vec![bytes(150)])], WriteOptions::default())
            .expect_err("write must overflow");
        assert!(matches!(err, BufferError::ChunkOverflow { bytes: 150 }));
        assert!(err.to_string().contains("150 bytes"));
        // stage and queue sizes unchanged, no unstaged chunk left anywhere
        let after = buffer.metrics();
        assert_eq!(after.stage_size, before.stage_size);
        assert_eq!(after.queue_size, before.queue_size);
        assert_eq!(after.queue_length, 0);
    }

    #[test]
    fn total_limit_rejects_the_batch_up_front() {
        let buffer = buffer(100, 200);
        let m = buffer.metadata(None, Some("t"), None);
        buffer
            .write(
                vec![(m.clone(), vec![bytes(95), bytes(95), bytes(10)])],
                WriteOptions::default(),
            )
            .expect("write");
        assert_eq!(buffer.stage_size() + buffer.queue_size(), 200);
        let err = buffer
            .write(vec![(m.clone(), vec![bytes(1)])], WriteOptions::default())
            .expect_err("write must be rejected");
        assert!(err.is_overflow());
        // rejection happens before any chunk is created or touched
        assert_eq!(buffer.stage_size() + buffer.queue_size(), 200);
    }

    #[test]
    fn empty_batches_are_ignored() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        buffer.write(vec![], WriteOptions::default()).expect("empty");
        buffer
            .write(vec![(m.clone(), vec![])], WriteOptions::default())
            .expect("no records");
        assert_eq!(buffer.metrics(), Default::default());
    }

    #[test]
    fn formatted_write_concatenates_the_stream() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        let format: &FormatFn = &|records: &[Record]| {
            let mut out = Vec::new();
            for record in records {
                out.extend_from_slice(record.as_bytes());
                out.push(b'\n');
            }
            out
        };
        buffer
            .write(
                vec![(m.clone(), vec![Record::from("one"), Record::from("two")])],
                WriteOptions {
                    format: Some(format),
                    enqueue: true,
                },
            )
            .expect("write");
        let chunk = buffer.dequeue_chunk().expect("dequeue");
        let guard = chunk.lock();
        assert_eq!(guard.read().expect("read"), b"one\ntwo\n");
        assert_eq!(guard.size(), 2);
    }

    #[test]
    fn formatted_stream_flushes_a_chunk_it_cannot_share() {
        let buffer = buffer(100, 1000);
        let m = buffer.metadata(None, Some("t"), None);
        let format: &FormatFn = &|records: &[Record]| {
            records
                .iter()
                .flat_map(|r| r.as_bytes().to_vec())
                .collect()
        };
        let options = WriteOptions {
            format: Some(format),
            ..WriteOptions::default()
        };
        buffer
            .write(vec![(m.clone(), vec![bytes(60)])], options)
            .expect("first write");
        assert_eq!(buffer.stage_size(), 60);
        // 60 + 50 exceeds the chunk limit: the 60-byte chunk is flushed
        // whole and the 50-byte stream lands in its successor
        buffer
            .write(vec![(m.clone(), vec![bytes(50)])], options)
            .expect("second write");
        let metrics = buffer.metrics();
        assert_eq!(metrics.queue_length, 1);
        assert_eq!(metrics.queue_size, 60);
        assert_eq!(metrics.stage_size, 50);
    }

    #[test]
    fn multi_metadata_write_publishes_together() {
        let buffer = buffer(100, 1000);
        let m1 = buffer.metadata(None, Some("a"), None);
        let m2 = buffer.metadata(None, Some("b"), None);
        buffer
            .write(
                vec![(m1.clone(), vec![bytes(96)]), (m2.clone(), vec![bytes(20)])],
                WriteOptions::default(),
            )
            .expect("write");
        let metrics = buffer.metrics();
        // m1 full and enqueued, m2 still staged
        assert_eq!(metrics.queue_length, 1);
        assert_eq!(metrics.queue_size, 96);
        assert_eq!(metrics.stage_length, 1);
        assert_eq!(metrics.stage_size, 20);
        assert!(buffer.queued(Some(&m1)));
        assert!(!buffer.queued(Some(&m2)));
    }

    #[test]
    fn records_limit_caps_chunks_too() {
        let config = BufferConfig {
            chunk_limit_size: 1000,
            total_limit_size: 10_000,
            chunk_records_limit: Some(4),
            ..BufferConfig::default()
        };
        let buffer = Buffer::start(config, Box::new(MemoryStore::new())).expect("start");
        let m = buffer.metadata(None, Some("t"), None);
        buffer
            .write(
                vec![(m.clone(), vec![bytes(1); 10])],
                WriteOptions::default(),
            )
            .expect("write");
        let metrics = buffer.metrics();
        assert_eq!(metrics.stage_size + metrics.queue_size, 10);
        // no chunk may exceed four records
        assert!(buffer.queued_records() <= 8);
        for chunk in buffer.dequeue_chunk().into_iter() {
            assert!(chunk.lock().size() <= 4);
        }
    }
}
