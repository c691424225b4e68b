/// Online log rewrite
///
/// Protocol:
/// 1. Under the log lock: create the rewrite sink and an empty tail buffer.
///    From here on every append is also copied into the tail.
/// 2. Without the lock: write a snapshot of the live entities into the
///    rewrite sink. Whenever a chunk fills up, also move what the tail holds
///    so far into the rewrite sink.
/// 3. Under the log lock: move the rest of the tail, flush the rewrite sink
///    and swap it in as the live log. The superseded records counted when
///    the rewrite started are gone; those counted since came in with the
///    tail and stay on the books.
///
/// Snapshot records and tail chunks can interleave in any order; replay
/// keeps the highest version per key, so the result is the same.
///
/// A rewrite that sees the log closing gives up and deletes its output.

use super::{ActiveRewrite, LogShared, LogSink, LogState};
use crate::{Error, Result};
use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Summary of a finished rewrite
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteStats {
    /// Live records copied from the snapshot
    pub records_written: u64,
    /// Bytes copied from appends made during the rewrite
    pub tail_bytes: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
enum Outcome {
    Finished(RewriteStats),
    Abandoned,
    Failed(String),
}

/// Handle on a running (or finished) rewrite
#[derive(Clone)]
pub struct RewriteTicket {
    inner: Arc<(Mutex<Option<Outcome>>, Condvar)>,
}

impl RewriteTicket {
    fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn complete(&self, outcome: Outcome) {
        let (slot, done) = &*self.inner;
        *slot.lock() = Some(outcome);
        done.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.0.lock().is_some()
    }

    /// Block until the rewrite ends
    pub fn wait(&self) -> Result<RewriteStats> {
        let (slot, done) = &*self.inner;
        let mut outcome = slot.lock();
        while outcome.is_none() {
            done.wait(&mut outcome);
        }
        Self::resolve(outcome.clone())
    }

    /// Block until the rewrite ends or `timeout` passes
    pub fn wait_timeout(&self, timeout: Duration) -> Result<RewriteStats> {
        let deadline = Instant::now() + timeout;
        let (slot, done) = &*self.inner;
        let mut outcome = slot.lock();
        while outcome.is_none() {
            if done.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        match outcome.clone() {
            None => Err(Error::Timeout),
            finished => Self::resolve(finished),
        }
    }

    fn resolve(outcome: Option<Outcome>) -> Result<RewriteStats> {
        match outcome {
            Some(Outcome::Finished(stats)) => Ok(stats),
            Some(Outcome::Abandoned) => Err(Error::ShuttingDown),
            Some(Outcome::Failed(reason)) => Err(Error::CompactionError(reason)),
            None => Err(Error::Timeout),
        }
    }
}

impl std::fmt::Debug for RewriteTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteTicket")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Kick off a rewrite. The caller holds the log lock and has checked that
/// none is running.
pub(super) fn start(shared: &Arc<LogShared>, state: &mut LogState) -> Result<RewriteTicket> {
    let bytes_before = state.output.as_ref().map(|o| o.len()).unwrap_or(0);
    let dead_before = shared.source.dead_count();
    let sink = shared.storage.create_rewrite()?;
    state.tail = Some(BytesMut::new());

    let ticket = RewriteTicket::new();
    let worker_shared = Arc::clone(shared);
    let worker_ticket = ticket.clone();
    let spawned = thread::Builder::new()
        .name("rkv-rewrite".to_string())
        .spawn(move || run(worker_shared, sink, worker_ticket, bytes_before, dead_before));

    match spawned {
        Ok(handle) => {
            info!("Log rewrite started ({} bytes in live log)", bytes_before);
            state.rewrite = Some(ActiveRewrite {
                handle: Some(handle),
                ticket: ticket.clone(),
            });
            Ok(ticket)
        }
        Err(e) => {
            // The sink moved into the closure and was dropped with it
            state.tail = None;
            discard(shared);
            Err(Error::from(e).with_context("failed to spawn rewrite thread"))
        }
    }
}

enum Step {
    Swapped(RewriteStats),
    Abandoned,
}

fn run(
    shared: Arc<LogShared>,
    mut sink: Box<dyn LogSink>,
    ticket: RewriteTicket,
    bytes_before: u64,
    dead_before: u64,
) {
    let started = Instant::now();
    let result = match copy_snapshot(&shared, sink.as_mut()) {
        Ok((records, tail_bytes)) => finish(
            &shared,
            sink,
            Copied {
                records,
                tail_bytes,
                bytes_before,
                dead_before,
            },
            started,
        ),
        Err(e) => {
            drop(sink);
            discard(&shared);
            Err(e)
        }
    };

    let outcome = match result {
        Ok(Step::Swapped(stats)) => {
            shared.counters.rewrites_completed.fetch_add(1, Ordering::Relaxed);
            info!(
                "Log rewrite finished: {} records, {} -> {} bytes in {} ms",
                stats.records_written, stats.bytes_before, stats.bytes_after, stats.duration_ms
            );
            Outcome::Finished(stats)
        }
        Ok(Step::Abandoned) | Err(Error::ShuttingDown) => {
            shared.counters.rewrites_abandoned.fetch_add(1, Ordering::Relaxed);
            info!("Log rewrite abandoned, log is closing");
            Outcome::Abandoned
        }
        Err(e) => {
            shared.counters.rewrites_failed.fetch_add(1, Ordering::Relaxed);
            warn!("Log rewrite failed: {}", e);
            Outcome::Failed(e.to_string())
        }
    };

    let mut state = shared.state.lock();
    state.tail = None;
    state.rewrite = None;
    ticket.complete(outcome);
}

/// Write every live record into `sink`, moving tail chunks in as it goes.
/// Returns the number of snapshot records and the tail bytes copied.
fn copy_snapshot(shared: &LogShared, sink: &mut dyn LogSink) -> Result<(u64, u64)> {
    let chunk_size = shared.config.rewrite_tail_flush_bytes;
    let mut pending = BytesMut::with_capacity(chunk_size);
    let mut records = 0u64;
    let mut tail_bytes = 0u64;

    shared.source.for_each_live(&mut |record| {
        if shared.closing.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        record.encode_into(&mut pending)?;
        records += 1;
        if pending.len() >= chunk_size {
            sink.append(&pending)?;
            pending.clear();
            tail_bytes += drain_tail(shared, &mut *sink)?;
        }
        Ok(())
    })?;

    sink.append(&pending)?;
    debug!("Rewrite snapshot copied: {} records", records);
    Ok((records, tail_bytes))
}

/// Move what the tail holds right now into `sink`
fn drain_tail(shared: &LogShared, sink: &mut dyn LogSink) -> Result<u64> {
    let chunk = {
        let mut state = shared.state.lock();
        match state.tail.as_mut() {
            Some(tail) if !tail.is_empty() => tail.split().freeze(),
            _ => return Ok(0),
        }
    };
    sink.append(&chunk)?;
    Ok(chunk.len() as u64)
}

/// What the rewrite thread copied before the final swap
struct Copied {
    records: u64,
    tail_bytes: u64,
    bytes_before: u64,
    dead_before: u64,
}

/// Final drain and swap, under the log lock
fn finish(shared: &LogShared, mut sink: Box<dyn LogSink>, copied: Copied, started: Instant) -> Result<Step> {
    let mut tail_bytes = copied.tail_bytes;
    let mut state = shared.state.lock();

    if shared.closing.load(Ordering::Acquire) || state.output.is_none() {
        drop(state);
        drop(sink);
        discard(shared);
        return Ok(Step::Abandoned);
    }

    let drained = match state.tail.take() {
        Some(rest) => {
            tail_bytes += rest.len() as u64;
            sink.append(&rest)
        }
        None => Ok(()),
    };
    if let Err(e) = drained.and_then(|_| sink.flush()) {
        drop(state);
        drop(sink);
        discard(shared);
        return Err(e);
    }

    let Some(output) = state.output.as_mut() else {
        return Err(Error::Internal("live log vanished during rewrite".into()));
    };
    if let Err(e) = shared.storage.replace(output, sink) {
        drop(state);
        discard(shared);
        return Err(e);
    }

    state.unflushed = 0;
    shared.source.forget_dead(copied.dead_before);

    let bytes_after = state.output.as_ref().map(|o| o.len()).unwrap_or(0);
    Ok(Step::Swapped(RewriteStats {
        records_written: copied.records,
        tail_bytes,
        bytes_before: copied.bytes_before,
        bytes_after,
        duration_ms: started.elapsed().as_millis() as u64,
    }))
}

fn discard(shared: &LogShared) {
    if let Err(e) = shared.storage.discard_rewrite() {
        warn!("Could not remove rewrite output: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_wait_timeout() {
        let ticket = RewriteTicket::new();
        assert!(!ticket.is_finished());
        assert!(matches!(
            ticket.wait_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_ticket_completion_wakes_waiters() {
        let ticket = RewriteTicket::new();
        let waiter = {
            let ticket = ticket.clone();
            thread::spawn(move || ticket.wait())
        };

        let stats = RewriteStats {
            records_written: 3,
            ..Default::default()
        };
        ticket.complete(Outcome::Finished(stats.clone()));

        assert_eq!(waiter.join().unwrap().unwrap(), stats);
        assert_eq!(ticket.wait_timeout(Duration::ZERO).unwrap(), stats);
    }

    #[test]
    fn test_ticket_failure_outcomes() {
        let abandoned = RewriteTicket::new();
        abandoned.complete(Outcome::Abandoned);
        assert!(matches!(abandoned.wait(), Err(Error::ShuttingDown)));

        let failed = RewriteTicket::new();
        failed.complete(Outcome::Failed("disk full".into()));
        match failed.wait() {
            Err(Error::CompactionError(reason)) => assert_eq!(reason, "disk full"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
