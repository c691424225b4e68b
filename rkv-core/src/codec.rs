/// Codecs turning entities into log records and back
///
/// The engine never looks inside a body; everything it needs (key, version,
/// tombstone flag) lives in the record header.

use crate::record::{ChangeType, TransactionRecord};
use crate::{Document, Entity, Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Pluggable body serialization for an entity type
pub trait EntityCodec<E: Entity>: Send + Sync + 'static {
    /// Serialize the body of `entity`
    fn encode_body(&self, entity: &E) -> Result<Bytes>;

    /// Rebuild an entity from a replayed record
    fn decode(&self, record: &TransactionRecord) -> Result<E>;

    /// Build the record stored for `entity`
    fn to_record(&self, entity: &E) -> Result<TransactionRecord> {
        let body = self.encode_body(entity)?;
        let change_type = if entity.is_deleted() {
            ChangeType::Delete
        } else {
            ChangeType::Set
        };
        Ok(TransactionRecord {
            key: entity.key().to_string(),
            version: entity.version(),
            body,
            change_type,
        })
    }
}

/// Stores a document's body bytes verbatim
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCodec;

impl EntityCodec<Document> for DocumentCodec {
    fn encode_body(&self, entity: &Document) -> Result<Bytes> {
        Ok(entity.body.clone())
    }

    fn decode(&self, record: &TransactionRecord) -> Result<Document> {
        let mut doc = if record.is_delete() {
            Document::tombstone(record.key.clone(), record.version)
        } else {
            Document::with_known_version(record.key.clone(), record.version, record.body.clone())
        };
        doc.set_size_in_store(record.size_in_store() as u32);
        Ok(doc)
    }
}

/// Stores the whole entity as JSON
///
/// Key and version in the record header win over whatever the JSON says.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> EntityCodec<T> for JsonCodec<T>
where
    T: Entity + Serialize + DeserializeOwned,
{
    fn encode_body(&self, entity: &T) -> Result<Bytes> {
        serde_json::to_vec(entity)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("serialize {}: {}", entity.key(), e)))
    }

    fn decode(&self, record: &TransactionRecord) -> Result<T> {
        let entity: T = serde_json::from_slice(&record.body)
            .map_err(|e| Error::Codec(format!("deserialize {}: {}", record.key, e)))?;
        if entity.key() != record.key {
            return Err(Error::Corruption(format!(
                "record key {} does not match body key {}",
                record.key,
                entity.key()
            )));
        }
        if entity.is_deleted() != record.is_delete() {
            return Err(Error::Corruption(format!(
                "tombstone flag of {} disagrees with its change type",
                record.key
            )));
        }
        Ok(entity
            .with_version(record.version)
            .with_size_in_store(record.size_in_store() as u32))
    }
}
