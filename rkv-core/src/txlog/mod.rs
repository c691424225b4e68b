/// Append-only transaction log
///
/// Every accepted transaction is framed (see [`crate::record`]) and appended
/// to the live sink. A background thread flushes on an interval; the write
/// path flushes early once enough bytes pile up. When the store reports
/// enough superseded records, the log is rewritten in the background from a
/// snapshot of the live entities while appends continue (see [`rewrite`]).

pub mod rewrite;
pub mod sink;

pub use rewrite::{RewriteStats, RewriteTicket};
pub use sink::{FileSink, FileStorage, LogSink, LogStorage, MemorySink, MemoryStorage};

use crate::background::FlushWorker;
use crate::config::EngineConfig;
use crate::record::{RecordReader, TransactionRecord};
use crate::{Error, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// What a rewrite reads the live data set from
pub trait RewriteSource: Send + Sync + 'static {
    /// Hand every live record to `emit`, stopping at the first error
    fn for_each_live(&self, emit: &mut dyn FnMut(TransactionRecord) -> Result<()>) -> Result<()>;

    /// Share of log records that are superseded (0.0 - 1.0)
    fn dead_space_ratio(&self) -> f64;

    /// Superseded records counted so far
    fn dead_count(&self) -> u64;

    /// Called once a rewrite has dropped the `count` superseded records
    /// that existed when it started
    fn forget_dead(&self, count: u64);
}

/// Outcome of replaying the log at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub records: u64,
    pub valid_bytes: u64,
    /// Bytes of a partially written trailing record that were cut off
    pub truncated_bytes: u64,
}

/// Counters describing log activity since open
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub log_bytes: u64,
    pub unflushed_bytes: u64,
    pub records_appended: u64,
    pub flushes: u64,
    pub rewrites_completed: u64,
    pub rewrites_abandoned: u64,
    pub rewrites_failed: u64,
    pub rewrite_active: bool,
}

#[derive(Default)]
struct LogCounters {
    records_appended: AtomicU64,
    flushes: AtomicU64,
    rewrites_completed: AtomicU64,
    rewrites_abandoned: AtomicU64,
    rewrites_failed: AtomicU64,
}

struct ActiveRewrite {
    handle: Option<JoinHandle<()>>,
    ticket: RewriteTicket,
}

struct LogState {
    /// Live sink; `None` once closed
    output: Option<Box<dyn LogSink>>,
    unflushed: u64,
    /// Appends made while a rewrite runs, waiting to be copied into it
    tail: Option<BytesMut>,
    rewrite: Option<ActiveRewrite>,
}

pub(crate) struct LogShared {
    storage: Box<dyn LogStorage>,
    source: Arc<dyn RewriteSource>,
    config: EngineConfig,
    state: Mutex<LogState>,
    closing: AtomicBool,
    counters: LogCounters,
}

impl LogShared {
    fn flush_locked(&self, state: &mut LogState) -> Result<()> {
        if state.unflushed == 0 {
            return Ok(());
        }
        if let Some(output) = state.output.as_mut() {
            output.flush()?;
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        }
        state.unflushed = 0;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn should_rewrite(&self, state: &LogState) -> bool {
        if !self.config.auto_compaction || state.rewrite.is_some() {
            return false;
        }
        let Some(output) = state.output.as_ref() else {
            return false;
        };
        output.len() >= self.config.rewrite_min_log_bytes
            && self.source.dead_space_ratio() >= self.config.rewrite_dead_ratio
    }
}

pub struct TransactionLog {
    shared: Arc<LogShared>,
    flusher: Mutex<Option<FlushWorker>>,
}

impl TransactionLog {
    /// Open the live log from `storage` and start the background flusher
    pub fn open(
        storage: Box<dyn LogStorage>,
        source: Arc<dyn RewriteSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;

        let output = storage.open()?;
        info!(
            "Opened transaction log {} ({} bytes)",
            storage.describe(),
            output.len()
        );

        let shared = Arc::new(LogShared {
            storage,
            source,
            config,
            state: Mutex::new(LogState {
                output: Some(output),
                unflushed: 0,
                tail: None,
                rewrite: None,
            }),
            closing: AtomicBool::new(false),
            counters: LogCounters::default(),
        });

        let flush_target = Arc::clone(&shared);
        let flusher = FlushWorker::start(shared.config.flush_interval, move || flush_target.flush())?;

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Replay every complete record through `apply`, in log order.
    ///
    /// A partially written record at the end is not an error: it is cut off
    /// so later appends start on a record boundary.
    pub fn load<F>(&self, mut apply: F) -> Result<LoadStats>
    where
        F: FnMut(TransactionRecord) -> Result<()>,
    {
        let mut state = self.shared.state.lock();
        let output = state.output.as_mut().ok_or(Error::ShuttingDown)?;
        let total = output.len();

        let mut stats = LoadStats::default();
        let truncated = {
            let mut reader = RecordReader::new(output.reader()?);
            for record in reader.by_ref() {
                apply(record?)?;
                stats.records += 1;
            }
            stats.valid_bytes = reader.valid_len();
            reader.truncated()
        };

        if truncated || stats.valid_bytes < total {
            stats.truncated_bytes = total - stats.valid_bytes;
            warn!(
                "Transaction log ends with a partial record, dropping {} trailing bytes",
                stats.truncated_bytes
            );
            output.truncate(stats.valid_bytes)?;
        }

        info!(
            "Replayed {} records ({} bytes) from transaction log",
            stats.records, stats.valid_bytes
        );
        Ok(stats)
    }

    /// Append the records of one transaction.
    ///
    /// The records land in the live sink as one contiguous write. They are
    /// durable once the next flush completes.
    pub fn append(&self, records: &[TransactionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = BytesMut::with_capacity(records.iter().map(|r| r.size_in_store()).sum());
        for record in records {
            record.encode_into(&mut buf)?;
        }

        let mut state = self.shared.state.lock();
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let output = state.output.as_mut().ok_or(Error::ShuttingDown)?;
        output.append(&buf)?;

        state.unflushed += buf.len() as u64;
        if let Some(tail) = state.tail.as_mut() {
            tail.extend_from_slice(&buf);
        }
        self.shared
            .counters
            .records_appended
            .fetch_add(records.len() as u64, Ordering::Relaxed);

        if state.unflushed >= self.shared.config.flush_threshold_bytes {
            self.shared.flush_locked(&mut state)?;
        }

        if self.shared.should_rewrite(&state) {
            info!(
                "Dead space ratio {:.2} reached, starting log rewrite",
                self.shared.source.dead_space_ratio()
            );
            if let Err(e) = rewrite::start(&self.shared, &mut state) {
                warn!("Could not start log rewrite: {}", e);
            }
        }
        Ok(())
    }

    /// Make every appended record durable now
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Start a rewrite, or join the one already running
    pub fn force_rewrite(&self) -> Result<RewriteTicket> {
        let mut state = self.shared.state.lock();
        if self.shared.closing.load(Ordering::Acquire) || state.output.is_none() {
            return Err(Error::ShuttingDown);
        }
        if let Some(active) = state.rewrite.as_ref() {
            debug!("Log rewrite already running");
            return Ok(active.ticket.clone());
        }
        rewrite::start(&self.shared, &mut state)
    }

    /// Drop every record. Refused while a rewrite is running.
    pub fn truncate(&self) -> Result<()> {
        self.truncate_with(|| ())
    }

    /// Drop every record, then run `cleared` before releasing the log lock.
    /// No rewrite can start in between, so it never snapshots data the
    /// caller is about to throw away.
    pub fn truncate_with<F: FnOnce()>(&self, cleared: F) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.rewrite.is_some() {
            return Err(Error::MaintenanceInProgress);
        }
        let output = state.output.as_mut().ok_or(Error::ShuttingDown)?;
        output.truncate(0)?;
        output.flush()?;
        state.unflushed = 0;
        cleared();
        info!("Transaction log truncated");
        Ok(())
    }

    pub fn is_rewriting(&self) -> bool {
        self.shared.state.lock().rewrite.is_some()
    }

    /// Current size of the live log in bytes
    pub fn len(&self) -> u64 {
        self.shared
            .state
            .lock()
            .output
            .as_ref()
            .map(|o| o.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LogStats {
        let state = self.shared.state.lock();
        let counters = &self.shared.counters;
        LogStats {
            log_bytes: state.output.as_ref().map(|o| o.len()).unwrap_or(0),
            unflushed_bytes: state.unflushed,
            records_appended: counters.records_appended.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            rewrites_completed: counters.rewrites_completed.load(Ordering::Relaxed),
            rewrites_abandoned: counters.rewrites_abandoned.load(Ordering::Relaxed),
            rewrites_failed: counters.rewrites_failed.load(Ordering::Relaxed),
            rewrite_active: state.rewrite.is_some(),
        }
    }

    /// Stop background work, flush and release the sink.
    ///
    /// A rewrite still running is abandoned; the call waits for it to let
    /// go of its output. Calling close again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.shutdown();
        }

        let in_flight = self
            .shared
            .state
            .lock()
            .rewrite
            .as_mut()
            .and_then(|active| active.handle.take());
        if let Some(handle) = in_flight {
            debug!("Waiting for log rewrite to stop");
            if handle.join().is_err() {
                warn!("Log rewrite thread panicked");
            }
        }

        let mut state = self.shared.state.lock();
        let result = self.shared.flush_locked(&mut state);
        state.output = None;
        state.tail = None;
        state.rewrite = None;
        info!("Transaction log closed");
        result
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing transaction log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ChangeType;
    use parking_lot::RwLock;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Minimal rewrite source: the latest record per key
    #[derive(Default)]
    struct Latest {
        records: RwLock<BTreeMap<String, TransactionRecord>>,
        dead: AtomicU64,
    }

    impl Latest {
        fn apply(&self, record: TransactionRecord) {
            if self.records.write().insert(record.key.clone(), record).is_some() {
                self.dead.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    impl RewriteSource for Latest {
        fn for_each_live(&self, emit: &mut dyn FnMut(TransactionRecord) -> Result<()>) -> Result<()> {
            let snapshot: Vec<_> = self.records.read().values().cloned().collect();
            for record in snapshot {
                if record.change_type == ChangeType::Set {
                    emit(record)?;
                }
            }
            Ok(())
        }

        fn dead_space_ratio(&self) -> f64 {
            let dead = self.dead.load(Ordering::Relaxed) as f64;
            let live = self.records.read().len() as f64;
            if dead + live == 0.0 {
                0.0
            } else {
                dead / (dead + live)
            }
        }

        fn dead_count(&self) -> u64 {
            self.dead.load(Ordering::Relaxed)
        }

        fn forget_dead(&self, count: u64) {
            self.dead.fetch_sub(count, Ordering::Relaxed);
        }
    }

    fn manual_config() -> EngineConfig {
        EngineConfig::new()
            .with_auto_compaction(false)
            .with_flush_interval(Duration::from_millis(10))
    }

    fn replay(log: &TransactionLog) -> Vec<TransactionRecord> {
        let mut records = Vec::new();
        log.load(|r| {
            records.push(r);
            Ok(())
        })
        .unwrap();
        records
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let source = Arc::new(Latest::default());

        let written = vec![
            TransactionRecord::set("a", 1, "one"),
            TransactionRecord::set("b", 1, "two"),
        ];
        {
            let log = TransactionLog::open(Box::new(FileStorage::new(&path)), source.clone(), manual_config())
                .unwrap();
            log.append(&written[..1]).unwrap();
            log.append(&written[1..]).unwrap();
            log.close().unwrap();
        }

        let log = TransactionLog::open(Box::new(FileStorage::new(&path)), source, manual_config()).unwrap();
        assert_eq!(replay(&log), written);
    }

    #[test]
    fn test_load_truncates_partial_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");

        let first = TransactionRecord::set("a", 1, "complete");
        let mut bytes = first.encode().unwrap().to_vec();
        let second = TransactionRecord::set("b", 1, "cut short").encode().unwrap();
        bytes.extend_from_slice(&second[..second.len() - 3]);
        std::fs::write(&path, &bytes).unwrap();

        let source = Arc::new(Latest::default());
        let log = TransactionLog::open(Box::new(FileStorage::new(&path)), source, manual_config()).unwrap();

        let mut seen = Vec::new();
        let stats = log
            .load(|r| {
                seen.push(r);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![first.clone()]);
        assert_eq!(stats.records, 1);
        assert_eq!(stats.truncated_bytes, (second.len() - 3) as u64);
        assert_eq!(log.len(), first.size_in_store() as u64);

        // New appends start on a record boundary
        let third = TransactionRecord::set("c", 1, "after");
        log.append(std::slice::from_ref(&third)).unwrap();
        log.close().unwrap();

        let log = TransactionLog::open(
            Box::new(FileStorage::new(&path)),
            Arc::new(Latest::default()),
            manual_config(),
        )
        .unwrap();
        assert_eq!(replay(&log), vec![first, third]);
    }

    #[test]
    fn test_load_propagates_corruption() {
        let storage = Arc::new(MemoryStorage::new());
        let mut raw = TransactionRecord::set("a", 1, "x").encode().unwrap().to_vec();
        raw[12] = 7;
        storage.open().unwrap().append(&raw).unwrap();

        let log = TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), manual_config()).unwrap();
        assert!(matches!(log.load(|_| Ok(())), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_flush_threshold() {
        let storage = Arc::new(MemoryStorage::new());
        let config = manual_config()
            .with_flush_interval(Duration::from_secs(3600))
            .with_flush_threshold_bytes(100);
        let log = TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), config).unwrap();

        log.append(&[TransactionRecord::set("k", 1, "small")]).unwrap();
        assert!(log.stats().unflushed_bytes > 0);
        assert_eq!(log.stats().flushes, 0);

        log.append(&[TransactionRecord::set("k", 2, vec![0u8; 200])]).unwrap();
        assert_eq!(log.stats().unflushed_bytes, 0);
        assert_eq!(log.stats().flushes, 1);
    }

    #[test]
    fn test_background_flush() {
        let storage = Arc::new(MemoryStorage::new());
        let log = TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), manual_config()).unwrap();
        log.append(&[TransactionRecord::set("k", 1, "v")]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while log.stats().unflushed_bytes > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(log.stats().unflushed_bytes, 0);
    }

    #[test]
    fn test_truncate() {
        let storage = Arc::new(MemoryStorage::new());
        let log = TransactionLog::open(Box::new(storage.clone()), Arc::new(Latest::default()), manual_config())
            .unwrap();
        log.append(&[TransactionRecord::set("k", 1, "v")]).unwrap();
        log.truncate().unwrap();
        assert!(log.is_empty());
        assert!(storage.contents().is_empty());
    }

    #[test]
    fn test_forced_rewrite_keeps_live_records() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(Latest::default());
        let log = TransactionLog::open(Box::new(storage.clone()), source.clone(), manual_config()).unwrap();

        for version in 1..=5 {
            let record = TransactionRecord::set("hot", version, format!("v{}", version));
            source.apply(record.clone());
            log.append(&[record]).unwrap();
        }
        let tombstone = TransactionRecord::delete("cold", 1, "");
        source.apply(TransactionRecord::set("cold", 0, "x"));
        source.apply(tombstone.clone());
        log.append(&[tombstone]).unwrap();

        let before = log.len();
        let stats = log.force_rewrite().unwrap().wait().unwrap();
        assert_eq!(stats.records_written, 1);
        assert_eq!(stats.bytes_before, before);
        assert!(stats.bytes_after < before);
        assert!(!log.is_rewriting());
        assert_eq!(source.dead_space_ratio(), 0.0);

        let expected = TransactionRecord::set("hot", 5, "v5");
        assert_eq!(storage.contents(), expected.encode().unwrap().to_vec());
        assert_eq!(log.stats().rewrites_completed, 1);
    }

    #[test]
    fn test_truncate_refused_during_rewrite() {
        let storage = Arc::new(MemoryStorage::new());
        let log = TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), manual_config()).unwrap();

        // Hold the state lock so the rewrite cannot finish
        let ticket = {
            let mut state = log.shared.state.lock();
            let ticket = rewrite::start(&log.shared, &mut state).unwrap();
            assert!(state.rewrite.is_some());
            ticket
        };
        // The rewrite may already be done by the time we get here
        match log.truncate() {
            Ok(()) => assert!(ticket.is_finished()),
            Err(e) => assert!(matches!(e, Error::MaintenanceInProgress)),
        }
        ticket.wait().unwrap();
        log.truncate().unwrap();
    }

    #[test]
    fn test_auto_rewrite_on_dead_ratio() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(Latest::default());
        let config = EngineConfig::new()
            .with_rewrite_dead_ratio(0.5)
            .with_rewrite_min_log_bytes(0);
        let log = TransactionLog::open(Box::new(storage.clone()), source.clone(), config).unwrap();

        for version in 1..=4 {
            let record = TransactionRecord::set("k", version, "value");
            source.apply(record.clone());
            log.append(&[record]).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while log.stats().rewrites_completed == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(log.stats().rewrites_completed >= 1);

        let log = {
            log.close().unwrap();
            TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), manual_config()).unwrap()
        };
        let records = replay(&log);
        assert_eq!(records.last(), Some(&TransactionRecord::set("k", 4, "value")));
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_appends() {
        let log = TransactionLog::open(
            Box::new(MemoryStorage::new()),
            Arc::new(Latest::default()),
            manual_config(),
        )
        .unwrap();
        log.close().unwrap();
        log.close().unwrap();

        let err = log.append(&[TransactionRecord::set("k", 1, "v")]).unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert!(matches!(log.force_rewrite(), Err(Error::ShuttingDown)));
    }

    /// Storage whose swap always fails
    struct FailingSwap(Arc<MemoryStorage>);

    impl LogStorage for FailingSwap {
        fn open(&self) -> Result<Box<dyn LogSink>> {
            self.0.open()
        }

        fn create_rewrite(&self) -> Result<Box<dyn LogSink>> {
            self.0.create_rewrite()
        }

        fn replace(&self, _live: &mut Box<dyn LogSink>, _rewrite: Box<dyn LogSink>) -> Result<()> {
            Err(Error::CompactionError("swap refused".into()))
        }

        fn discard_rewrite(&self) -> Result<()> {
            self.0.discard_rewrite()
        }

        fn describe(&self) -> String {
            "failing swap".to_string()
        }
    }

    /// Holds the rewrite snapshot back until the gate opens
    struct Gated {
        inner: Arc<Latest>,
        gate: crossbeam::channel::Receiver<()>,
    }

    impl RewriteSource for Gated {
        fn for_each_live(&self, emit: &mut dyn FnMut(TransactionRecord) -> Result<()>) -> Result<()> {
            let _ = self.gate.recv();
            self.inner.for_each_live(emit)
        }

        fn dead_space_ratio(&self) -> f64 {
            self.inner.dead_space_ratio()
        }

        fn dead_count(&self) -> u64 {
            self.inner.dead_count()
        }

        fn forget_dead(&self, count: u64) {
            self.inner.forget_dead(count)
        }
    }

    fn gated() -> (Arc<Latest>, Arc<Gated>, crossbeam::channel::Sender<()>) {
        let (open, gate) = crossbeam::channel::unbounded();
        let inner = Arc::new(Latest::default());
        let source = Arc::new(Gated {
            inner: inner.clone(),
            gate,
        });
        (inner, source, open)
    }

    #[test]
    fn test_failed_swap_keeps_live_log() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(Latest::default());
        let log = TransactionLog::open(Box::new(FailingSwap(storage.clone())), source.clone(), manual_config())
            .unwrap();

        let before = TransactionRecord::set("a", 1, "before");
        source.apply(before.clone());
        log.append(std::slice::from_ref(&before)).unwrap();

        let result = log.force_rewrite().unwrap().wait();
        assert!(matches!(result, Err(Error::CompactionError(_))));
        assert!(!log.is_rewriting());
        assert_eq!(log.stats().rewrites_failed, 1);

        let after = TransactionRecord::set("b", 1, "after");
        log.append(std::slice::from_ref(&after)).unwrap();
        log.close().unwrap();

        let log = TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), manual_config()).unwrap();
        assert_eq!(replay(&log), vec![before, after]);
    }

    #[test]
    fn test_close_abandons_running_rewrite() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("tx.log"));
        let rewrite_path = storage.rewrite_path().to_path_buf();
        let (inner, source, open) = gated();
        let log = TransactionLog::open(Box::new(storage.clone()), source, manual_config()).unwrap();

        let mut written = Vec::new();
        for version in 1..=3 {
            let record = TransactionRecord::set("k", version, format!("v{}", version));
            inner.apply(record.clone());
            log.append(std::slice::from_ref(&record)).unwrap();
            written.push(record);
        }

        let ticket = log.force_rewrite().unwrap();
        assert!(rewrite_path.exists());

        // Let the snapshot go only once close has begun
        let shared = Arc::clone(&log.shared);
        let opener = std::thread::spawn(move || {
            while !shared.closing.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            open.send(()).unwrap();
        });
        log.close().unwrap();
        opener.join().unwrap();

        assert!(matches!(ticket.wait(), Err(Error::ShuttingDown)));
        assert_eq!(log.stats().rewrites_abandoned, 1);
        assert!(!rewrite_path.exists());

        let log = TransactionLog::open(Box::new(storage), Arc::new(Latest::default()), manual_config()).unwrap();
        assert_eq!(replay(&log), written);
    }

    #[test]
    fn test_dead_records_from_tail_stay_counted() {
        let storage = Arc::new(MemoryStorage::new());
        let (inner, source, open) = gated();
        let log = TransactionLog::open(Box::new(storage.clone()), source, manual_config()).unwrap();

        for version in 1..=3 {
            let record = TransactionRecord::set("k", version, "v");
            inner.apply(record.clone());
            log.append(&[record]).unwrap();
        }
        assert_eq!(inner.dead_count(), 2);

        let ticket = log.force_rewrite().unwrap();
        // Lands in the tail and in the snapshot, so the new log holds it twice
        let during = TransactionRecord::set("k", 4, "v");
        inner.apply(during.clone());
        log.append(std::slice::from_ref(&during)).unwrap();
        open.send(()).unwrap();

        let stats = ticket.wait().unwrap();
        assert_eq!(stats.records_written, 1);
        assert_eq!(inner.dead_count(), 1);

        let mut expected = during.encode().unwrap().to_vec();
        expected.extend_from_slice(&during.encode().unwrap());
        assert_eq!(storage.contents(), expected);
    }

    #[test]
    fn test_truncate_with_runs_under_lock() {
        let storage = Arc::new(MemoryStorage::new());
        let (_inner, source, open) = gated();
        let log = TransactionLog::open(Box::new(storage.clone()), source, manual_config()).unwrap();
        log.append(&[TransactionRecord::set("k", 1, "v")]).unwrap();

        let mut cleared = false;
        log.truncate_with(|| cleared = true).unwrap();
        assert!(cleared);
        assert!(storage.contents().is_empty());

        // The rewrite is parked on the gate, so it is still running
        let ticket = log.force_rewrite().unwrap();
        let mut ran = false;
        assert!(matches!(
            log.truncate_with(|| ran = true),
            Err(Error::MaintenanceInProgress)
        ));
        assert!(!ran);

        open.send(()).unwrap();
        ticket.wait().unwrap();
    }
}
