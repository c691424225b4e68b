//! RadixKV core: an embedded key-value engine.
//!
//! Entities live in an in-memory radix tree and every accepted change is
//! appended to a transaction log, which is replayed on open and rewritten
//! in the background once enough of it is superseded. All reads and writes
//! are serialized through one worker thread; writes use optimistic
//! concurrency on a per-key version.
//!
//! ```no_run
//! use rkv_core::{Connection, Document};
//!
//! # fn main() -> rkv_core::Result<()> {
//! let conn = Connection::open("data.rkv")?;
//! let saved = conn.save(Document::new("user#1", "alice"))?;
//! conn.save(saved.with_body("alice v2"))?;
//! let users = conn.get_by_prefix("user#", true)?;
//! assert_eq!(users.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod types;
pub mod record;
pub mod codec;
pub mod radix;
pub mod store;
pub mod txlog;
pub mod background;
pub mod config;
pub mod queue;
pub mod connection;

pub use error::{CurrentVersion, Error, Result};
pub use types::*;
pub use codec::{DocumentCodec, EntityCodec, JsonCodec};
pub use config::EngineConfig;
pub use connection::{Connection, EngineState, EngineStats};
pub use queue::{Pending, Transaction};
pub use record::{ChangeType, TransactionRecord};
pub use txlog::{FileStorage, LogStorage, MemoryStorage, RewriteStats, RewriteTicket};
