/// Single-writer request pipeline
///
/// Point gets, prefix gets and writes travel over three channels to one
/// worker thread, which is the only code that reads or mutates the store
/// on behalf of callers. Each pass drains every pending get, then handles
/// one write and one prefix get, so reads never wait behind a long run of
/// writes. Ordering is FIFO within a category only.
///
/// When the channels have been empty for longer than the configured idle
/// window the worker stops spinning and blocks until something arrives.
///
/// The shutdown signal is only looked at on a pass that finds nothing to
/// do, so `stop` lets the worker finish every request already queued.
/// Requests that reach a stopped queue fail with `Error::ShuttingDown`.

use crate::codec::EntityCodec;
use crate::store::EntityStore;
use crate::txlog::TransactionLog;
use crate::{Entity, Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use crossbeam::select;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Entities written together
#[derive(Debug, Clone)]
pub enum Transaction<E> {
    Single(E),
    /// All-or-nothing write of several keys
    Batch(Vec<E>),
}

impl<E> Transaction<E> {
    pub fn into_entities(self) -> Vec<E> {
        match self {
            Transaction::Single(entity) => vec![entity],
            Transaction::Batch(entities) => entities,
        }
    }
}

/// Reply to a queued request, resolved exactly once by the worker
#[must_use = "a pending reply does nothing unless waited on"]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    fn channel() -> (Sender<Result<T>>, Self) {
        let (tx, rx) = channel::bounded(1);
        (tx, Self { rx })
    }

    /// Block until the worker replies
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::ShuttingDown)?
    }

    /// Block until the worker replies or `timeout` passes
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ShuttingDown),
        }
    }
}

struct GetRequest<E> {
    key: String,
    reply: Sender<Result<Option<E>>>,
}

struct PrefixRequest<E> {
    prefix: String,
    sort: bool,
    reply: Sender<Result<Vec<E>>>,
}

enum WriteRequest<E> {
    Transaction {
        entities: Vec<E>,
        reply: Sender<Result<Vec<E>>>,
    },
    RemoveAll {
        reply: Sender<Result<()>>,
    },
}

pub struct TransactionQueue<E: Entity> {
    gets: Sender<GetRequest<E>>,
    prefixes: Sender<PrefixRequest<E>>,
    writes: Sender<WriteRequest<E>>,
    shutdown: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<E: Entity> TransactionQueue<E> {
    /// Start the worker thread over `store` and `log`
    pub fn start<C: EntityCodec<E>>(
        store: Arc<EntityStore<E>>,
        log: Arc<TransactionLog>,
        codec: Arc<C>,
        idle_window: Duration,
    ) -> Result<Self> {
        let (gets_tx, gets_rx) = channel::unbounded();
        let (prefixes_tx, prefixes_rx) = channel::unbounded();
        let (writes_tx, writes_rx) = channel::unbounded();
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);

        let worker = Worker {
            store,
            log,
            codec,
            gets: gets_rx,
            prefixes: prefixes_rx,
            writes: writes_rx,
            shutdown: shutdown_rx,
            idle_window,
        };

        let handle = thread::Builder::new()
            .name("rkv-queue".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::Internal(format!("failed to spawn queue worker: {}", e)))?;

        info!("Transaction queue worker started");

        Ok(Self {
            gets: gets_tx,
            prefixes: prefixes_tx,
            writes: writes_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn enqueue_transaction(&self, transaction: Transaction<E>) -> Result<Pending<Vec<E>>> {
        self.check_running()?;
        let (reply, pending) = Pending::channel();
        self.writes
            .send(WriteRequest::Transaction {
                entities: transaction.into_entities(),
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        Ok(pending)
    }

    pub fn enqueue_get(&self, key: &str) -> Result<Pending<Option<E>>> {
        self.check_running()?;
        let (reply, pending) = Pending::channel();
        self.gets
            .send(GetRequest {
                key: key.to_string(),
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        Ok(pending)
    }

    pub fn enqueue_get_by_prefix(&self, prefix: &str, sort: bool) -> Result<Pending<Vec<E>>> {
        self.check_running()?;
        let (reply, pending) = Pending::channel();
        self.prefixes
            .send(PrefixRequest {
                prefix: prefix.to_string(),
                sort,
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        Ok(pending)
    }

    /// Clear the store and the log, in order with other writes
    pub fn enqueue_remove_all(&self) -> Result<Pending<()>> {
        self.check_running()?;
        let (reply, pending) = Pending::channel();
        self.writes
            .send(WriteRequest::RemoveAll { reply })
            .map_err(|_| Error::ShuttingDown)?;
        Ok(pending)
    }

    /// Stop the worker and wait for it. Requests it has not picked up yet
    /// are dropped; their callers see `Error::ShuttingDown`.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.lock().take();

        if let Some(handle) = self.handle.lock().take() {
            debug!("Waiting for queue worker to exit");
            if let Err(e) = handle.join() {
                warn!("Error joining queue worker: {:?}", e);
            }
        }
        info!("Transaction queue worker stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }
}

impl<E: Entity> Drop for TransactionQueue<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<E: Entity, C> {
    store: Arc<EntityStore<E>>,
    log: Arc<TransactionLog>,
    codec: Arc<C>,
    gets: Receiver<GetRequest<E>>,
    prefixes: Receiver<PrefixRequest<E>>,
    writes: Receiver<WriteRequest<E>>,
    shutdown: Receiver<()>,
    idle_window: Duration,
}

impl<E: Entity, C: EntityCodec<E>> Worker<E, C> {
    fn run(self) {
        debug!("Queue worker loop started");
        let mut last_work = Instant::now();

        loop {
            let mut worked = false;

            while let Ok(request) = self.gets.try_recv() {
                self.handle_get(request);
                worked = true;
            }
            if let Ok(request) = self.writes.try_recv() {
                self.handle_write(request);
                worked = true;
            }
            if let Ok(request) = self.prefixes.try_recv() {
                self.handle_prefix(request);
                worked = true;
            }

            if worked {
                last_work = Instant::now();
                continue;
            }

            match self.shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            if last_work.elapsed() < self.idle_window {
                thread::yield_now();
                continue;
            }

            // Idle: block until any request (or shutdown) arrives
            let keep_going = select! {
                recv(self.gets) -> msg => msg.map(|r| self.handle_get(r)).is_ok(),
                recv(self.writes) -> msg => msg.map(|r| self.handle_write(r)).is_ok(),
                recv(self.prefixes) -> msg => msg.map(|r| self.handle_prefix(r)).is_ok(),
                recv(self.shutdown) -> _ => false,
            };
            if !keep_going {
                break;
            }
            last_work = Instant::now();
        }

        debug!("Queue worker loop exited");
    }

    fn handle_get(&self, request: GetRequest<E>) {
        let _ = request.reply.send(Ok(self.store.get(&request.key)));
    }

    fn handle_prefix(&self, request: PrefixRequest<E>) {
        let entities = self.store.get_by_prefix(&request.prefix, request.sort);
        let _ = request.reply.send(Ok(entities));
    }

    fn handle_write(&self, request: WriteRequest<E>) {
        match request {
            WriteRequest::Transaction { entities, reply } => {
                let result = self.apply(entities);
                if let Err(e) = &result {
                    debug!("Transaction rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            WriteRequest::RemoveAll { reply } => {
                let result = self.log.truncate_with(|| self.store.remove_all());
                match &result {
                    Ok(()) => info!("All documents removed"),
                    Err(e) => debug!("Remove all refused: {}", e),
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Validate, apply and log one transaction. Records are encoded before
    /// anything is applied so a codec failure leaves the store untouched.
    fn apply(&self, entities: Vec<E>) -> Result<Vec<E>> {
        let mut records = Vec::with_capacity(entities.len());
        let stored = self.store.process_transaction_with(entities, |versioned| {
            versioned
                .into_iter()
                .map(|entity| {
                    let record = self.codec.to_record(&entity)?;
                    let size = u32::try_from(record.size_in_store()).unwrap_or(u32::MAX);
                    records.push(record);
                    Ok(entity.with_size_in_store(size))
                })
                .collect()
        })?;

        self.log.append(&records)?;
        Ok(stored)
    }
}
