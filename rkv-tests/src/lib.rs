/// Test utilities and helpers for RadixKV testing
///
/// This module provides common test utilities to simplify writing tests.

use anyhow::Context;
use rkv_core::{Connection, Document, DocumentCodec, EngineConfig, Entity, Version};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Document connection type used throughout the tests
pub type DocConnection = Connection<Document, DocumentCodec>;

/// Test connection wrapper that manages temporary directory lifecycle
pub struct TestConnection {
    pub conn: DocConnection,
    pub path: PathBuf,
    config: EngineConfig,
    _temp_dir: Option<TempDir>,
}

impl TestConnection {
    /// Open a connection on a fresh log in a temporary directory
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Same as `new` with a custom configuration
    pub fn with_config(config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.rkv");
        let conn = Connection::open_with(&path, DocumentCodec, config.clone())
            .expect("Failed to open connection");

        Self {
            conn,
            path,
            config,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Open a connection on the log at `path` (the file may not exist yet)
    pub fn open(path: PathBuf) -> Self {
        let config = EngineConfig::default();
        let conn = Connection::open_with(&path, DocumentCodec, config.clone())
            .expect("Failed to open connection");

        Self {
            conn,
            path,
            config,
            _temp_dir: None,
        }
    }

    /// Get the log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close and reopen the connection over the same log (for testing
    /// persistence). The temporary directory stays alive.
    pub fn reopen(self) -> Self {
        let Self {
            conn,
            path,
            config,
            _temp_dir,
        } = self;
        conn.close().expect("Failed to close connection");
        drop(conn);

        let conn = Connection::open_with(&path, DocumentCodec, config.clone())
            .expect("Failed to reopen connection");
        Self {
            conn,
            path,
            config,
            _temp_dir,
        }
    }
}

impl Default for TestConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock document generator for testing
pub struct DocumentGenerator {
    counter: u64,
    prefix: String,
}

impl DocumentGenerator {
    pub fn new() -> Self {
        Self::with_prefix("key")
    }

    /// Generator whose keys look like `<prefix><n>`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            counter: 0,
            prefix: prefix.into(),
        }
    }

    /// Generate the next key
    pub fn next_key(&mut self) -> String {
        let key = format!("{}{}", self.prefix, self.counter);
        self.counter += 1;
        key
    }

    /// Generate a new, unsaved document with a small body
    pub fn next_document(&mut self) -> Document {
        let key = self.next_key();
        let body = format!("value-of-{}", key);
        Document::new(key, body)
    }

    /// Generate a new, unsaved document with a body of `bytes` bytes
    pub fn sized_document(&mut self, bytes: usize) -> Document {
        Document::new(self.next_key(), vec![b'x'; bytes])
    }
}

impl Default for DocumentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Save `count` generated documents and return what was stored
pub fn write_batch(conn: &DocConnection, count: usize) -> anyhow::Result<Vec<Document>> {
    let mut gen = DocumentGenerator::new();
    (0..count)
        .map(|i| {
            conn.save(gen.next_document())
                .with_context(|| format!("saving document {}", i))
        })
        .collect()
}

/// Save a new version of `doc` with `body`, `times` times in a row
pub fn overwrite(conn: &DocConnection, doc: &Document, times: usize) -> anyhow::Result<Document> {
    let mut current = doc.clone();
    for i in 0..times {
        current = conn
            .save(current.with_body(format!("{}-rev{}", doc.key, i)))
            .with_context(|| format!("overwriting {} (round {})", doc.key, i))?;
    }
    Ok(current)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Install a tracing subscriber honouring `RUST_LOG`, once per process
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// JSON-encoded entity for codec tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub key: String,
    pub version: Version,
    pub deleted: bool,
    pub name: String,
    pub tags: Vec<String>,
}

impl Profile {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: 0,
            deleted: false,
            name: name.into(),
            tags: Vec::new(),
        }
    }
}

impl Entity for Profile {
    fn key(&self) -> &str {
        &self.key
    }

    fn version(&self) -> Version {
        self.version
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn with_version(&self, version: Version) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}
