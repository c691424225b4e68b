/// On-disk change records
///
/// Record: [key_len(4) | body_len(4) | version(4) | change_type(1)] [key] [body]
/// All integers little-endian. Records are concatenated with no separator;
/// a short read anywhere inside a record marks the end of valid data.

use crate::{Error, Result, Version};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

pub const RECORD_HEADER_SIZE: usize = 13;

/// Kind of change a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Set,
    Delete,
}

impl ChangeType {
    pub fn as_byte(self) -> u8 {
        match self {
            ChangeType::Set => 1,
            ChangeType::Delete => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(ChangeType::Set),
            2 => Ok(ChangeType::Delete),
            other => Err(Error::Corruption(format!("unknown change type {}", other))),
        }
    }
}

/// One accepted change as it is stored in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub key: String,
    pub version: Version,
    pub body: Bytes,
    pub change_type: ChangeType,
}

impl TransactionRecord {
    pub fn set(key: impl Into<String>, version: Version, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            version,
            body: body.into(),
            change_type: ChangeType::Set,
        }
    }

    pub fn delete(key: impl Into<String>, version: Version, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            version,
            body: body.into(),
            change_type: ChangeType::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.change_type == ChangeType::Delete
    }

    /// Framed size of this record in the log
    pub fn size_in_store(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + self.body.len()
    }

    /// Append the framed record to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| Error::InvalidArgument(format!("key too long: {} bytes", self.key.len())))?;
        let body_len = u32::try_from(self.body.len())
            .map_err(|_| Error::InvalidArgument(format!("body too long: {} bytes", self.body.len())))?;

        buf.reserve(self.size_in_store());
        buf.put_u32_le(key_len);
        buf.put_u32_le(body_len);
        buf.put_u32_le(self.version);
        buf.put_u8(self.change_type.as_byte());
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(&self.body);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size_in_store());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Sequential reader over a record stream
///
/// Yields records until the stream ends. A record cut short by a crash is
/// not an error: iteration stops and `truncated()` reports it.
pub struct RecordReader<R> {
    inner: R,
    valid_len: u64,
    truncated: bool,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            valid_len: 0,
            truncated: false,
            done: false,
        }
    }

    /// Bytes consumed by complete records so far
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// True once a partial trailing record was seen
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn read_record(&mut self) -> Result<Option<TransactionRecord>> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let n = read_full(&mut self.inner, &mut header)?;
        if n == 0 {
            return Ok(None);
        }
        if n < RECORD_HEADER_SIZE {
            self.truncated = true;
            return Ok(None);
        }

        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let body_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let change_byte = header[12];

        // take() keeps a torn length field from forcing a huge allocation
        let mut payload = Vec::new();
        let wanted = key_len + body_len;
        (&mut self.inner).take(wanted).read_to_end(&mut payload)?;
        if (payload.len() as u64) < wanted {
            self.truncated = true;
            return Ok(None);
        }

        let change_type = ChangeType::from_byte(change_byte)?;
        let body = payload.split_off(key_len as usize);
        let key = String::from_utf8(payload)
            .map_err(|e| Error::Corruption(format!("record key is not UTF-8: {}", e)))?;

        self.valid_len += RECORD_HEADER_SIZE as u64 + wanted;

        Ok(Some(TransactionRecord {
            key,
            version,
            body: Bytes::from(body),
            change_type,
        }))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the stream allows; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
