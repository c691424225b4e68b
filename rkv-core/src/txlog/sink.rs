/// Byte sinks the transaction log writes into
///
/// `LogSink` is one append-only byte stream; `LogStorage` knows where the
/// live stream lives and how to put a rewritten one in its place.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Append-only byte stream
pub trait LogSink: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Make everything appended so far durable
    fn flush(&mut self) -> Result<()>;

    /// Total bytes appended, buffered or not
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything past `len`
    fn truncate(&mut self, len: u64) -> Result<()>;

    /// Read the stream from the start
    fn reader(&mut self) -> Result<Box<dyn Read + '_>>;
}

/// Where the live log and its rewrite live
pub trait LogStorage: Send + Sync + 'static {
    /// Open (or create) the live log
    fn open(&self) -> Result<Box<dyn LogSink>>;

    /// Create an empty sink for a rewrite in progress
    fn create_rewrite(&self) -> Result<Box<dyn LogSink>>;

    /// Make a durably flushed rewrite the live log; `live` is replaced
    /// with a sink over the new contents. On error `live` must still be the
    /// live log.
    fn replace(&self, live: &mut Box<dyn LogSink>, rewrite: Box<dyn LogSink>) -> Result<()>;

    /// Throw away the output of an unfinished rewrite. Its sink has already
    /// been dropped.
    fn discard_rewrite(&self) -> Result<()>;

    /// Human readable location, for log messages
    fn describe(&self) -> String;
}

impl<S: LogStorage + ?Sized> LogStorage for Arc<S> {
    fn open(&self) -> Result<Box<dyn LogSink>> {
        (**self).open()
    }

    fn create_rewrite(&self) -> Result<Box<dyn LogSink>> {
        (**self).create_rewrite()
    }

    fn replace(&self, live: &mut Box<dyn LogSink>, rewrite: Box<dyn LogSink>) -> Result<()> {
        (**self).replace(live, rewrite)
    }

    fn discard_rewrite(&self) -> Result<()> {
        (**self).discard_rewrite()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Log file on disk
pub struct FileSink {
    writer: BufWriter<File>,
    len: u64,
}

impl FileSink {
    /// Open `path` for appending, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            len,
        })
    }

    /// Create `path`, discarding any previous contents
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        File::create(path)?;
        Self::open(path)
    }
}

impl LogSink for FileSink {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.set_len(len)?;
        file.sync_all()?;
        self.len = len;
        Ok(())
    }

    fn reader(&mut self) -> Result<Box<dyn Read + '_>> {
        self.writer.flush()?;
        // Appends ignore the cursor, so reading can move it freely
        let mut file = self.writer.get_ref();
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Growable in-memory buffer shared with its storage
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn shared(data: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { data }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.data.lock().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.data.lock().truncate(len as usize);
        Ok(())
    }

    fn reader(&mut self) -> Result<Box<dyn Read + '_>> {
        let snapshot = self.data.lock().clone();
        Ok(Box::new(Cursor::new(snapshot)))
    }
}

/// Log kept at `<path>`, rewritten through `<path>.rewrite`
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    rewrite_path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut rewrite = OsString::from(path.as_os_str());
        rewrite.push(".rewrite");
        Self {
            path,
            rewrite_path: PathBuf::from(rewrite),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rewrite_path(&self) -> &Path {
        &self.rewrite_path
    }

    /// Persist the rename in the parent directory. Best effort: not every
    /// platform lets a directory be opened for syncing.
    #[cfg(unix)]
    fn sync_parent(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!("Could not sync directory {:?}: {}", dir, e);
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) {}
}

impl LogStorage for FileStorage {
    fn open(&self) -> Result<Box<dyn LogSink>> {
        if self.rewrite_path.exists() {
            warn!("Removing unfinished rewrite {:?}", self.rewrite_path);
            fs::remove_file(&self.rewrite_path)?;
        }
        Ok(Box::new(FileSink::open(&self.path)?))
    }

    fn create_rewrite(&self) -> Result<Box<dyn LogSink>> {
        Ok(Box::new(FileSink::create(&self.rewrite_path)?))
    }

    fn replace(&self, live: &mut Box<dyn LogSink>, rewrite: Box<dyn LogSink>) -> Result<()> {
        fs::rename(&self.rewrite_path, &self.path).map_err(|e| {
            Error::CompactionError(format!(
                "failed to move {:?} over {:?}: {}",
                self.rewrite_path, self.path, e
            ))
        })?;
        self.sync_parent();
        // The rewrite handle follows the renamed file; the old one now
        // points at an unlinked inode and must not see another append.
        *live = rewrite;
        Ok(())
    }

    fn discard_rewrite(&self) -> Result<()> {
        if self.rewrite_path.exists() {
            fs::remove_file(&self.rewrite_path)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Storage that only lives as long as the process
#[derive(Default)]
pub struct MemoryStorage {
    live: Mutex<Arc<Mutex<Vec<u8>>>>,
    rewrite: Mutex<Option<Arc<Mutex<Vec<u8>>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the live log's bytes
    pub fn contents(&self) -> Vec<u8> {
        self.live.lock().lock().clone()
    }
}

impl LogStorage for MemoryStorage {
    fn open(&self) -> Result<Box<dyn LogSink>> {
        self.rewrite.lock().take();
        let data = self.live.lock().clone();
        Ok(Box::new(MemorySink::shared(data)))
    }

    fn create_rewrite(&self) -> Result<Box<dyn LogSink>> {
        let data = Arc::new(Mutex::new(Vec::new()));
        *self.rewrite.lock() = Some(Arc::clone(&data));
        Ok(Box::new(MemorySink::shared(data)))
    }

    fn replace(&self, live: &mut Box<dyn LogSink>, rewrite: Box<dyn LogSink>) -> Result<()> {
        let data = self
            .rewrite
            .lock()
            .take()
            .ok_or_else(|| Error::CompactionError("no rewrite in progress".into()))?;
        *self.live.lock() = data;
        *live = rewrite;
        Ok(())
    }

    fn discard_rewrite(&self) -> Result<()> {
        self.rewrite.lock().take();
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}
