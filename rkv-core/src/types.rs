use bytes::Bytes;

/// Entity version - bumped by one on every accepted write
pub type Version = u32;

/// Version carried by an entity that has never been stored
pub const NEW_VERSION: Version = 0;

/// Capability every stored value has: a key, a version, a tombstone flag,
/// and a way to be copied with a new version.
///
/// Implementations must leave everything except the version untouched in
/// `with_version`; the store relies on that when it bumps versions.
pub trait Entity: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;

    fn version(&self) -> Version;

    fn is_deleted(&self) -> bool;

    fn with_version(&self, version: Version) -> Self;

    /// Records how many log bytes the entity occupies. Informational only.
    fn with_size_in_store(self, _size: u32) -> Self {
        self
    }
}

/// Versioned byte blob - the stock entity type
#[derive(Debug, Clone)]
pub struct Document {
    pub key: String,
    pub version: Version,
    pub deleted: bool,
    pub body: Bytes,
    size_in_store: u32,
}

impl Document {
    /// A document that has not been stored yet
    pub fn new(key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            version: NEW_VERSION,
            deleted: false,
            body: body.into(),
            size_in_store: 0,
        }
    }

    /// A document at a known version, e.g. one read back from the store
    pub fn with_known_version(key: impl Into<String>, version: Version, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            version,
            deleted: false,
            body: body.into(),
            size_in_store: 0,
        }
    }

    /// Deletion marker for `key`, written against `version`
    pub fn tombstone(key: impl Into<String>, version: Version) -> Self {
        Self {
            key: key.into(),
            version,
            deleted: true,
            body: Bytes::new(),
            size_in_store: 0,
        }
    }

    /// Same document with a replaced body
    pub fn with_body(&self, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..self.clone()
        }
    }

    /// Same document turned into a deletion marker
    pub fn into_tombstone(self) -> Self {
        Self {
            deleted: true,
            body: Bytes::new(),
            ..self
        }
    }

    /// Bytes the document's latest record occupies in the log (0 if unknown)
    pub fn size_in_store(&self) -> u32 {
        self.size_in_store
    }

    pub(crate) fn set_size_in_store(&mut self, size: u32) {
        self.size_in_store = size;
    }
}

// size_in_store is bookkeeping, not part of the document's identity
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.version == other.version
            && self.deleted == other.deleted
            && self.body == other.body
    }
}

impl Eq for Document {}

impl Entity for Document {
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

    fn with_size_in_store(mut self, size: u32) -> Self {
        self.size_in_store = size;
        self
    }
}
