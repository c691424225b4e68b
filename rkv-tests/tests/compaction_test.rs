/// Log rewrite tests
///
/// Rewrites drop superseded records from the log while writers keep going.
use rkv_core::{Document, EngineConfig, Error};
use rkv_test_utils::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn manual() -> EngineConfig {
    EngineConfig::default().with_auto_compaction(false)
}

#[test]
fn test_forced_rewrite_shrinks_log() {
    init_test_logging();
    let test_conn = TestConnection::with_config(manual());
    let conn = &test_conn.conn;

    let docs = write_batch(conn, 50).unwrap();
    let mut latest = Vec::new();
    for doc in &docs {
        latest.push(overwrite(conn, doc, 4).unwrap());
    }
    assert_eq!(conn.dead_entity_count(), 200);
    let before = conn.stats().log.log_bytes;

    let stats = conn.force_maintenance().unwrap().wait().unwrap();
    assert_eq!(stats.records_written, 50);
    assert!(stats.bytes_after < stats.bytes_before);
    assert_eq!(conn.dead_entity_count(), 0);
    assert_eq!(conn.dead_space_percentage(), 0.0);

    let after = conn.stats().log.log_bytes;
    assert_eq!(after, stats.bytes_after);
    assert!(after < before, "log should shrink: {} -> {}", before, after);

    let test_conn = test_conn.reopen();
    assert_eq!(test_conn.conn.entity_count(), 50);
    assert_eq!(test_conn.conn.dead_entity_count(), 0);
    for doc in &latest {
        assert_eq!(test_conn.conn.get(&doc.key).unwrap().as_ref(), Some(doc));
    }
}

#[test]
fn test_rewrite_drops_deleted_keys() {
    let test_conn = TestConnection::with_config(manual());
    let conn = &test_conn.conn;

    let docs = write_batch(conn, 10).unwrap();
    for doc in docs.iter().take(5) {
        conn.save(doc.clone().into_tombstone()).unwrap();
    }
    conn.force_maintenance().unwrap().wait().unwrap();
    // Tombstones are still held in memory until the log is replayed
    assert_eq!(conn.entity_count(), 10);

    let test_conn = test_conn.reopen();
    assert_eq!(test_conn.conn.entity_count(), 5);
    for doc in docs.iter().take(5) {
        assert!(test_conn.conn.get(&doc.key).unwrap().is_none());
        // Gone from the log, so the key starts over
        let fresh = test_conn.conn.save(Document::new(doc.key.clone(), "again")).unwrap();
        assert_eq!(fresh.version, 1);
    }
}

#[test]
fn test_auto_rewrite_on_dead_space() {
    let config = EngineConfig::default()
        .with_rewrite_dead_ratio(0.5)
        .with_rewrite_min_log_bytes(0);
    let test_conn = TestConnection::with_config(config);
    let conn = &test_conn.conn;

    let doc = conn.save(Document::new("hot", "v0")).unwrap();
    let latest = overwrite(conn, &doc, 20).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || conn.stats().log.rewrites_completed > 0),
        "auto rewrite did not run"
    );
    assert!(wait_until(Duration::from_secs(5), || !conn.stats().log.rewrite_active));

    let test_conn = test_conn.reopen();
    assert_eq!(test_conn.conn.get("hot").unwrap(), Some(latest));
}

#[test]
fn test_writes_during_rewrite_are_kept() {
    let config = manual().with_rewrite_tail_flush_bytes(256);
    let test_conn = TestConnection::with_config(config);
    let conn = Arc::new(test_conn.conn);
    let path = test_conn.path.clone();

    let mut gen = DocumentGenerator::with_prefix("base#");
    for _ in 0..2_000 {
        conn.save(gen.sized_document(128)).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let conn = Arc::clone(&conn);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut gen = DocumentGenerator::with_prefix("live#");
            let mut saved = Vec::new();
            while !stop.load(Ordering::Relaxed) {
                saved.push(conn.save(gen.next_document()).unwrap());
            }
            saved
        })
    };

    let mut rewrites = 0;
    for _ in 0..3 {
        match conn.force_maintenance().unwrap().wait() {
            Ok(_) => rewrites += 1,
            Err(e) => panic!("rewrite failed: {}", e),
        }
    }
    stop.store(true, Ordering::Relaxed);
    let saved = writer.join().unwrap();
    assert_eq!(rewrites, 3);

    let conn = Arc::try_unwrap(conn).ok().unwrap();
    conn.close().unwrap();
    drop(conn);

    let reopened = TestConnection::open(path);
    assert_eq!(reopened.conn.entity_count(), 2_000 + saved.len() as u64);
    for doc in &saved {
        assert_eq!(reopened.conn.get(&doc.key).unwrap().as_ref(), Some(doc));
    }
}

#[test]
fn test_remove_all_refused_during_rewrite() {
    let test_conn = TestConnection::with_config(manual());
    let conn = &test_conn.conn;
    let mut gen = DocumentGenerator::new();
    for _ in 0..5_000 {
        conn.save(gen.sized_document(256)).unwrap();
    }

    let ticket = conn.force_maintenance().unwrap();
    let result = conn.remove_all_documents();
    let rewrite_finished = ticket.wait();
    rewrite_finished.unwrap();

    match result {
        // The rewrite can win the race and finish first
        Ok(()) => assert_eq!(conn.entity_count(), 0),
        Err(Error::MaintenanceInProgress) => assert_eq!(conn.entity_count(), 5_000),
        Err(e) => panic!("unexpected error {}", e),
    }
}

#[test]
fn test_forced_rewrite_joins_running_one() {
    let test_conn = TestConnection::with_config(manual());
    let conn = &test_conn.conn;
    let mut gen = DocumentGenerator::new();
    for _ in 0..2_000 {
        conn.save(gen.sized_document(256)).unwrap();
    }

    let first = conn.force_maintenance().unwrap();
    let second = conn.force_maintenance().unwrap();
    let a = first.wait().unwrap();
    let b = second.wait().unwrap();
    // Either the same rewrite, or a second one started after the first ended
    assert_eq!(a.records_written, 2_000);
    assert_eq!(b.records_written, 2_000);
}

#[test]
fn test_close_abandons_running_rewrite() {
    let test_conn = TestConnection::with_config(manual());
    let rewrite_path = test_conn.path().with_extension("rkv.rewrite");

    let mut gen = DocumentGenerator::new();
    let mut latest: Vec<Document> = (0..3_000)
        .map(|_| test_conn.conn.save(gen.next_document()).unwrap())
        .collect();

    let mut test_conn = test_conn;
    let mut abandoned = 0;
    for round in 0..5 {
        for doc in latest.iter_mut() {
            *doc = test_conn
                .conn
                .save(doc.with_body(format!("{}-round{}", doc.key, round)))
                .unwrap();
        }

        let ticket = test_conn.conn.force_maintenance().unwrap();
        test_conn.conn.close().unwrap();

        match ticket.wait() {
            Err(Error::ShuttingDown) => abandoned += 1,
            // The rewrite can finish before close gets to it
            Ok(_) => {}
            Err(e) => panic!("unexpected rewrite error {}", e),
        }
        assert!(!rewrite_path.exists(), "round {} left a rewrite file", round);

        test_conn = test_conn.reopen();
        assert_eq!(test_conn.conn.entity_count(), 3_000);
        for doc in &latest {
            assert_eq!(test_conn.conn.get(&doc.key).unwrap().as_ref(), Some(doc));
        }
    }
    assert!(abandoned > 0, "no rewrite was abandoned in 5 rounds");
}
