use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunk::{Chunk, ChunkId, ChunkState, Record};
use crate::error::{BufferError, BufferResult};
use crate::metadata::Metadata;
use crate::store::{ChunkStore, ResumeState};

const CHUNK_FILE_STEM: &str = "chunk";
const DATA_EXTENSION: &str = "buf";
const META_EXTENSION: &str = "meta";

/// Marker embedded in the file name: `b` while the chunk accumulates,
/// `q` once it is enqueued. Resume relies on the distinction.
const STAGED_MARKER: char = 'b';
const QUEUED_MARKER: char = 'q';

fn data_file_name(marker: char, id: ChunkId) -> String {
    format!("{CHUNK_FILE_STEM}.{marker}{id}.{DATA_EXTENSION}")
}

fn meta_file_name(marker: char, id: ChunkId) -> String {
    format!("{CHUNK_FILE_STEM}.{marker}{id}.{META_EXTENSION}")
}

/// Parses `chunk.<marker><hex id>.buf`; anything else is not ours.
fn parse_data_file_name(name: &str) -> Option<(char, ChunkId)> {
    let rest = name.strip_prefix(CHUNK_FILE_STEM)?.strip_prefix('.')?;
    let rest = rest.strip_suffix(DATA_EXTENSION)?.strip_suffix('.')?;
    let marker = rest.chars().next()?;
    if marker != STAGED_MARKER && marker != QUEUED_MARKER {
        return None;
    }
    let id = ChunkId::parse_hex(&rest[1..])?;
    Some((marker, id))
}

/// Sidecar persisted next to each data file, written at creation and on
/// every commit.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkMeta {
    metadata: Metadata,
    size: u64,
    created_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// File-backed chunk store.
///
/// Every chunk is one append-only data file plus a JSON metadata sidecar
/// under the store root. Staged and queued chunks survive a restart and
/// are recovered by [`ChunkStore::resume`].
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> BufferResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ChunkStore for FileStore {
    fn generate_chunk(&self, metadata: Arc<Metadata>) -> BufferResult<Box<dyn Chunk>> {
        Ok(Box::new(FileChunk::create(&self.root, metadata)?))
    }

    fn resume(&self) -> BufferResult<ResumeState> {
        let mut stage: HashMap<Arc<Metadata>, Box<dyn Chunk>> = HashMap::new();
        let mut queued: Vec<(u64, ChunkId, FileChunk)> = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((marker, id)) = parse_data_file_name(name) else {
                continue;
            };
            let mut chunk = match FileChunk::open(&self.root, marker, id) {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!(file = name, %error, "skipping unrecoverable buffer chunk file");
                    continue;
                }
            };
            if marker == QUEUED_MARKER {
                queued.push((chunk.created_at, id, chunk));
                continue;
            }
            let metadata = chunk.metadata().clone();
            if stage.contains_key(&metadata) {
                // a second staged chunk for the same metadata cannot go back
                // into the stage map; deliver it instead
                if let Err(error) = chunk.mark_enqueued() {
                    warn!(file = name, %error, "failed to enqueue duplicate staged chunk");
                    continue;
                }
                queued.push((chunk.created_at, id, chunk));
            } else {
                stage.insert(metadata, Box::new(chunk));
            }
        }

        queued.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let queue = queued
            .into_iter()
            .map(|(_, _, chunk)| Box::new(chunk) as Box<dyn Chunk>)
            .collect();
        Ok((stage, queue))
    }
}

/// One chunk as an append-only file with committed byte/record watermarks.
///
/// Rollback truncates the data file back to the committed length;
/// `mark_enqueued` renames `b` to `q` so the state survives a restart.
pub struct FileChunk {
    id: ChunkId,
    metadata: Arc<Metadata>,
    state: ChunkState,
    data_path: PathBuf,
    meta_path: PathBuf,
    file: Option<File>,
    bytes: u64,
    records: u64,
    committed_bytes: u64,
    committed_records: u64,
    created_at: u64,
}

impl FileChunk {
    fn create(root: &Path, metadata: Arc<Metadata>) -> BufferResult<Self> {
        let id = ChunkId::generate();
        let data_path = root.join(data_file_name(STAGED_MARKER, id));
        let meta_path = root.join(meta_file_name(STAGED_MARKER, id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)?;
        let chunk = Self {
            id,
            metadata,
            state: ChunkState::Unstaged,
            data_path,
            meta_path,
            file: Some(file),
            bytes: 0,
            records: 0,
            committed_bytes: 0,
            committed_records: 0,
            created_at: now_secs(),
        };
        chunk.write_meta()?;
        Ok(chunk)
    }

    fn open(root: &Path, marker: char, id: ChunkId) -> BufferResult<Self> {
        let data_path = root.join(data_file_name(marker, id));
        let meta_path = root.join(meta_file_name(marker, id));
        let meta: ChunkMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let bytes = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;
        let state = if marker == QUEUED_MARKER {
            ChunkState::Queued
        } else {
            ChunkState::Staged
        };
        Ok(Self {
            id,
            metadata: Arc::new(meta.metadata),
            state,
            data_path,
            meta_path,
            file: Some(file),
            bytes,
            records: meta.size,
            committed_bytes: bytes,
            committed_records: meta.size,
            created_at: meta.created_at,
        })
    }

    fn write_meta(&self) -> BufferResult<()> {
        let meta = ChunkMeta {
            metadata: (*self.metadata).clone(),
            size: self.committed_records,
            created_at: self.created_at,
        };
        fs::write(&self.meta_path, serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    fn open_file(&mut self) -> BufferResult<&mut File> {
        let id = self.id;
        self.file
            .as_mut()
            .ok_or_else(|| BufferError::storage(format!("chunk {id} has no open file")))
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

    fn remove_files(&mut self) -> BufferResult<()> {
        self.file = None;
        match fs::remove_file(&self.data_path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        match fs::remove_file(&self.meta_path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }
}

impl Chunk for FileChunk {
    fn unique_id(&self) -> ChunkId {
        self.id
    }

    fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    fn bytesize(&self) -> u64 {
        self.bytes
    }

    fn size(&self) -> u64 {
        self.records
    }

    fn state(&self) -> ChunkState {
        self.state
    }

    fn append(&mut self, records: &[Record]) -> BufferResult<()> {
        self.ensure_writable()?;
        let file = self.open_file()?;
        let mut written = 0u64;
        for record in records {
            file.write_all(record.as_bytes())?;
            written += record.len() as u64;
        }
        self.bytes += written;
        self.records += records.len() as u64;
        Ok(())
    }

    fn concat(&mut self, bytes: &[u8], records: u64) -> BufferResult<()> {
        self.ensure_writable()?;
        let file = self.open_file()?;
        file.write_all(bytes)?;
        self.bytes += bytes.len() as u64;
        self.records += records;
        Ok(())
    }

    fn commit(&mut self) -> BufferResult<()> {
        let file = self.open_file()?;
        file.flush()?;
        self.committed_bytes = self.bytes;
        self.committed_records = self.records;
        self.write_meta()
    }

    fn rollback(&mut self) -> BufferResult<()> {
        let committed_bytes = self.committed_bytes;
        let file = self.open_file()?;
        file.set_len(committed_bytes)?;
        file.seek(SeekFrom::Start(committed_bytes))?;
        self.bytes = committed_bytes;
        self.records = self.committed_records;
        Ok(())
    }

    fn read(&self) -> BufferResult<Vec<u8>> {
        if self.state == ChunkState::Closed {
            return Err(BufferError::storage(format!("chunk {} is closed", self.id)));
        }
        let mut content = fs::read(&self.data_path)?;
        content.truncate(self.committed_bytes as usize);
        Ok(content)
    }

    fn purge(&mut self) -> BufferResult<()> {
        self.remove_files()?;
        self.bytes = 0;
        self.records = 0;
        self.committed_bytes = 0;
        self.committed_records = 0;
        self.state = ChunkState::Closed;
        Ok(())
    }

    fn close(&mut self) -> BufferResult<()> {
        if self.state == ChunkState::Closed {
            return Ok(());
        }
        if self.is_empty() {
            // nothing worth recovering
            self.remove_files()?;
        } else {
            if let Some(file) = self.file.as_mut() {
                file.flush()?;
            }
            self.file = None;
        }
        self.state = ChunkState::Closed;
        Ok(())
    }

    fn mark_staged(&mut self) {
        debug_assert_eq!(self.state, ChunkState::Unstaged);
        self.state = ChunkState::Staged;
    }

    fn mark_enqueued(&mut self) -> BufferResult<()> {
        if self.state == ChunkState::Queued {
            return Ok(());
        }
        let root = self
            .data_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let data_path = root.join(data_file_name(QUEUED_MARKER, self.id));
        let meta_path = root.join(meta_file_name(QUEUED_MARKER, self.id));
        fs::rename(&self.data_path, &data_path)?;
        fs::rename(&self.meta_path, &meta_path)?;
        self.data_path = data_path;
        self.meta_path = meta_path;
        self.state = ChunkState::Queued;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path()).expect("store")
    }

    fn metadata(tag: &str) -> Arc<Metadata> {
        Arc::new(Metadata::new(None, Some(tag.to_string()), None))
    }

    #[test]
    fn file_name_round_trip() {
        let id = ChunkId::generate();
        let name = data_file_name(STAGED_MARKER, id);
        assert_eq!(parse_data_file_name(&name), Some((STAGED_MARKER, id)));
        assert_eq!(parse_data_file_name("chunk.x00.buf"), None);
        assert_eq!(parse_data_file_name("other.file"), None);
    }

    #[test]
    fn append_commit_rollback_on_disk() {
        let dir = TempDir::new().expect("tempdir");
        let mut chunk = FileChunk::create(dir.path(), metadata("t")).expect("create");
        chunk.append(&[Record::from("hello")]).expect("append");
        chunk.commit().expect("commit");
        chunk.concat(b"garbage", 1).expect("concat");
        assert_eq!(chunk.bytesize(), 12);
        chunk.rollback().expect("rollback");
        assert_eq!(chunk.bytesize(), 5);
        assert_eq!(chunk.size(), 1);
        chunk.append(&[Record::from("!")]).expect("append");
        chunk.commit().expect("commit");
        assert_eq!(chunk.read().expect("read"), b"hello!");
    }

    #[test]
    fn enqueue_renames_and_resume_recovers() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);

        let mut staged = FileChunk::create(dir.path(), metadata("staged")).expect("create");
        staged.mark_staged();
        staged.append(&[Record::from("keep")]).expect("append");
        staged.commit().expect("commit");
        let staged_id = staged.unique_id();
        staged.close().expect("close");

        let mut queued = FileChunk::create(dir.path(), metadata("queued")).expect("create");
        queued.mark_staged();
        queued.append(&[Record::from("sendme")]).expect("append");
        queued.commit().expect("commit");
        queued.mark_enqueued().expect("enqueue");
        let queued_id = queued.unique_id();
        queued.close().expect("close");

        let (stage, queue) = store.resume().expect("resume");
        assert_eq!(stage.len(), 1);
        let recovered = stage.get(&metadata("staged")).expect("staged chunk");
        assert_eq!(recovered.unique_id(), staged_id);
        assert_eq!(recovered.state(), ChunkState::Staged);
        assert_eq!(recovered.bytesize(), 4);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].unique_id(), queued_id);
        assert_eq!(queue[0].state(), ChunkState::Queued);
        assert_eq!(queue[0].read().expect("read"), b"sendme");
    }

    #[test]
    fn duplicate_staged_metadata_is_enqueued_on_resume() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);

        for text in ["first", "second"] {
            let mut chunk = FileChunk::create(dir.path(), metadata("dup")).expect("create");
            chunk.mark_staged();
            chunk.append(&[Record::from(text)]).expect("append");
            chunk.commit().expect("commit");
            chunk.close().expect("close");
        }

        let (stage, queue) = store.resume().expect("resume");
        assert_eq!(stage.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].state(), ChunkState::Queued);
    }

    #[test]
    fn purge_removes_files() {
        let dir = TempDir::new().expect("tempdir");
        let mut chunk = FileChunk::create(dir.path(), metadata("gone")).expect("create");
        chunk.append(&[Record::from("data")]).expect("append");
        chunk.commit().expect("commit");
        let data_path = chunk.data_path.clone();
        chunk.purge().expect("purge");
        assert!(!data_path.exists());
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn close_drops_empty_chunks() {
        let dir = TempDir::new().expect("tempdir");
        let mut chunk = FileChunk::create(dir.path(), metadata("empty")).expect("create");
        chunk.close().expect("close");
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn resume_skips_files_without_sidecar() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        let orphan = dir
            .path()
            .join(data_file_name(STAGED_MARKER, ChunkId::generate()));
        fs::write(&orphan, b"leftover").expect("write orphan");
        fs::write(dir.path().join("unrelated.txt"), b"noise").expect("write noise");

        let (stage, queue) = store.resume().expect("resume");
        assert!(stage.is_empty());
        assert!(queue.is_empty());
    }
}
