/// Engine entry point
///
/// A `Connection` wires the store, the transaction log and the queue worker
/// together and owns their lifecycle:
///
/// ```text
/// Created -> Opening -> Running -> Closing -> Closed
/// ```
///
/// Opening replays the log into the store before the worker accepts
/// requests. Every data operation goes through the worker, so a read always
/// observes the writes acknowledged before it was issued.

use crate::codec::{DocumentCodec, EntityCodec};
use crate::config::EngineConfig;
use crate::queue::{Transaction, TransactionQueue};
use crate::record::TransactionRecord;
use crate::store::EntityStore;
use crate::txlog::{FileStorage, LogStats, LogStorage, MemoryStorage, RewriteSource, RewriteTicket, TransactionLog};
use crate::{Document, Entity, Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Created,
    Opening,
    Running,
    Closing,
    Closed,
}

impl EngineState {
    fn as_u8(self) -> u8 {
        match self {
            EngineState::Created => 0,
            EngineState::Opening => 1,
            EngineState::Running => 2,
            EngineState::Closing => 3,
            EngineState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Opening,
            2 => EngineState::Running,
            3 => EngineState::Closing,
            _ => EngineState::Closed,
        }
    }
}

/// Point-in-time view of engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub entity_count: u64,
    pub dead_entity_count: u64,
    pub dead_space_percentage: f64,
    pub log: LogStats,
}

/// Feeds log rewrites from the store
struct StoreSource<E: Entity, C> {
    store: Arc<EntityStore<E>>,
    codec: Arc<C>,
}

impl<E: Entity, C: EntityCodec<E>> RewriteSource for StoreSource<E, C> {
    fn for_each_live(&self, emit: &mut dyn FnMut(TransactionRecord) -> Result<()>) -> Result<()> {
        for entity in self.store.live_snapshot() {
            emit(self.codec.to_record(&entity)?)?;
        }
        Ok(())
    }

    fn dead_space_ratio(&self) -> f64 {
        self.store.dead_space_ratio()
    }

    fn dead_count(&self) -> u64 {
        self.store.dead_entity_count()
    }

    fn forget_dead(&self, count: u64) {
        self.store.forget_dead(count);
    }
}

struct Runtime<E: Entity> {
    log: Arc<TransactionLog>,
    queue: TransactionQueue<E>,
}

pub struct Connection<E: Entity, C: EntityCodec<E>> {
    state: AtomicU8,
    storage: Mutex<Option<Box<dyn LogStorage>>>,
    codec: Arc<C>,
    config: EngineConfig,
    store: Arc<EntityStore<E>>,
    runtime: RwLock<Option<Runtime<E>>>,
}

impl Connection<Document, DocumentCodec> {
    /// Open (or create) a document store backed by the log file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DocumentCodec, EngineConfig::default())
    }

    /// Open a document store that keeps its log in memory
    pub fn open_transient() -> Result<Self> {
        let connection = Self::with_storage(
            Box::new(MemoryStorage::new()),
            DocumentCodec,
            EngineConfig::default(),
        );
        connection.start()?;
        Ok(connection)
    }
}

impl<E: Entity, C: EntityCodec<E>> Connection<E, C> {
    /// Build an unopened connection; call [`start`](Self::start) to open it
    pub fn with_storage(storage: Box<dyn LogStorage>, codec: C, config: EngineConfig) -> Self {
        Self {
            state: AtomicU8::new(EngineState::Created.as_u8()),
            storage: Mutex::new(Some(storage)),
            codec: Arc::new(codec),
            config,
            store: Arc::new(EntityStore::new()),
            runtime: RwLock::new(None),
        }
    }

    /// Open a connection over the log file at `path`
    pub fn open_with(path: impl AsRef<Path>, codec: C, config: EngineConfig) -> Result<Self> {
        let storage = FileStorage::new(path.as_ref());
        let connection = Self::with_storage(Box::new(storage), codec, config);
        connection.start()?;
        Ok(connection)
    }

    /// Replay the log and start background work
    pub fn start(&self) -> Result<()> {
        self.transition(EngineState::Created, EngineState::Opening)?;

        match self.start_runtime() {
            Ok(runtime) => {
                *self.runtime.write() = Some(runtime);
                self.set_state(EngineState::Running);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open connection: {}", e);
                self.set_state(EngineState::Closed);
                Err(e)
            }
        }
    }

    fn start_runtime(&self) -> Result<Runtime<E>> {
        let started = Instant::now();
        let storage = self
            .storage
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("connection storage already consumed".into()))?;

        let source = Arc::new(StoreSource {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
        });
        let log = Arc::new(TransactionLog::open(storage, source, self.config.clone())?);

        let load = log.load(|record| {
            let entity = self.codec.decode(&record)?;
            self.store.load_change(entity);
            Ok(())
        })?;

        let queue = TransactionQueue::start(
            Arc::clone(&self.store),
            Arc::clone(&log),
            Arc::clone(&self.codec),
            self.config.queue_idle_window,
        )?;

        info!(
            "Connection open: {} records replayed, {} entities, {} dead, in {:?}",
            load.records,
            self.store.entity_count(),
            self.store.dead_entity_count(),
            started.elapsed()
        );
        Ok(Runtime { log, queue })
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> Result<()> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::InvalidState(format!(
                    "expected {:?}, connection is {:?}",
                    from,
                    EngineState::from_u8(actual)
                ))
            })
    }

    /// Run `f` against the running runtime
    fn with_runtime<T>(&self, f: impl FnOnce(&Runtime<E>) -> Result<T>) -> Result<T> {
        let runtime = self.runtime.read();
        match (self.state(), runtime.as_ref()) {
            (EngineState::Running, Some(runtime)) => f(runtime),
            (state, _) => Err(Error::InvalidState(format!("connection is {:?}", state))),
        }
    }

    /// Store a new entity or a new version of one.
    ///
    /// Returns the stored value carrying its new version. Fails with
    /// `Error::Concurrency` when `entity` was not written against the
    /// current version.
    pub fn save(&self, entity: E) -> Result<E> {
        let pending = self.with_runtime(|rt| rt.queue.enqueue_transaction(Transaction::Single(entity)))?;
        pending
            .wait()?
            .pop()
            .ok_or_else(|| Error::Internal("empty reply to a single save".into()))
    }

    /// Store several entities atomically
    pub fn save_batch(&self, entities: Vec<E>) -> Result<Vec<E>> {
        self.with_runtime(|rt| rt.queue.enqueue_transaction(Transaction::Batch(entities)))?
            .wait()
    }

    pub fn get(&self, key: &str) -> Result<Option<E>> {
        self.with_runtime(|rt| rt.queue.enqueue_get(key))?.wait()
    }

    /// Live entities whose key starts with `prefix`, sorted by key if asked
    pub fn get_by_prefix(&self, prefix: &str, sort: bool) -> Result<Vec<E>> {
        self.with_runtime(|rt| rt.queue.enqueue_get_by_prefix(prefix, sort))?
            .wait()
    }

    /// Drop every entity and empty the log
    pub fn remove_all_documents(&self) -> Result<()> {
        self.with_runtime(|rt| {
            if rt.log.is_rewriting() {
                return Err(Error::MaintenanceInProgress);
            }
            rt.queue.enqueue_remove_all()
        })?
        .wait()
    }

    /// Rewrite the log now instead of waiting for the dead space threshold
    pub fn force_maintenance(&self) -> Result<RewriteTicket> {
        self.with_runtime(|rt| rt.log.force_rewrite())
    }

    pub fn entity_count(&self) -> u64 {
        self.store.entity_count()
    }

    pub fn dead_entity_count(&self) -> u64 {
        self.store.dead_entity_count()
    }

    /// Superseded share of the log, 0 - 100
    pub fn dead_space_percentage(&self) -> f64 {
        self.store.dead_space_ratio() * 100.0
    }

    pub fn stats(&self) -> EngineStats {
        let log = self
            .runtime
            .read()
            .as_ref()
            .map(|rt| rt.log.stats())
            .unwrap_or_default();
        EngineStats {
            state: self.state(),
            entity_count: self.entity_count(),
            dead_entity_count: self.dead_entity_count(),
            dead_space_percentage: self.dead_space_percentage(),
            log,
        }
    }

    /// Stop the worker, then close the log. Requests still queued fail
    /// with `Error::ShuttingDown`; a running rewrite is abandoned.
    pub fn close(&self) -> Result<()> {
        match self.state() {
            EngineState::Created => {
                self.set_state(EngineState::Closed);
                return Ok(());
            }
            EngineState::Closing | EngineState::Closed => return Ok(()),
            EngineState::Opening | EngineState::Running => {}
        }
        if self.transition(EngineState::Running, EngineState::Closing).is_err() {
            // Lost a race with another close, or still opening
            return match self.state() {
                EngineState::Closing | EngineState::Closed => Ok(()),
                state => Err(Error::InvalidState(format!("cannot close while {:?}", state))),
            };
        }

        let runtime = self.runtime.write().take();
        let result = match runtime {
            Some(runtime) => {
                runtime.queue.stop();
                runtime.log.close()
            }
            None => Ok(()),
        };

        self.set_state(EngineState::Closed);
        info!("Connection closed");
        result
    }
}

impl<E: Entity, C: EntityCodec<E>> Drop for Connection<E, C> {
    fn drop(&mut self) {
        if self.state() == EngineState::Running {
            if let Err(e) = self.close() {
                warn!("Error closing connection: {}", e);
            }
        }
    }
}
