//! Chunked staging-and-queueing buffer for the ferry event forwarding
//! agent.
//!
//! The buffer decouples event producers from downstream outputs. Producers
//! deliver record batches keyed by a [`Metadata`] descriptor (time window,
//! tag, user variables); the buffer accumulates them into size-bounded
//! chunks, one staged chunk per metadata, and moves chunks onto a FIFO
//! queue when they fill up or on demand. Consumers dequeue chunks for
//! transmission, purge them on success, and take them back for redelivery
//! on failure, giving at-least-once semantics.
//!
//! ## Architecture
//!
//! - [`Buffer`]: the staging/queueing core with its two-level locking
//!   discipline (one global lock over the tables, one lock per chunk)
//! - [`Chunk`] / [`ChunkStore`]: the pluggable storage contract, with the
//!   memory-resident [`MemoryStore`] and restart-surviving [`FileStore`]
//!   backends included
//! - [`BufferConfig`]: sizing limits (chunk limit, total limit, records
//!   limit, full threshold)
//!
//! ## Example
//!
//! ```no_run
//! use ferry_buffer::{Buffer, BufferConfig, MemoryStore, Record, WriteOptions};
//!
//! let buffer = Buffer::start(BufferConfig::default(), Box::new(MemoryStore::new()))?;
//! let metadata = buffer.metadata(None, Some("app.events"), None);
//!
//! buffer.write(
//!     vec![(metadata, vec![Record::from("event payload")])],
//!     WriteOptions::default(),
//! )?;
//!
//! buffer.enqueue_all();
//! while let Some(chunk) = buffer.dequeue_chunk() {
//!     let body = chunk.lock().read()?;
//!     // ... transmit body, then acknowledge:
//!     buffer.purge_chunk(chunk.id());
//! }
//! # Ok::<(), ferry_buffer::BufferError>(())
//! ```
//!
//! ## Thread safety
//!
//! Every operation may be called from any thread between
//! [`Buffer::start`] and [`Buffer::close`]. A multi-metadata `write`
//! publishes all of its chunks under one global-lock critical section, so
//! observers see the whole write or none of it.

mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod metadata;
pub mod store;

pub use buffer::{Buffer, BufferMetricsSnapshot, FormatFn, WriteOptions};
pub use chunk::{Chunk, ChunkId, ChunkRef, ChunkState, Record};
pub use config::BufferConfig;
pub use error::{BufferError, BufferResult};
pub use metadata::Metadata;
pub use store::{ChunkStore, FileStore, MemoryStore};
