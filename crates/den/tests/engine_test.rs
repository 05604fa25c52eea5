//! Integration tests for the engine across every strategy.
//!
//! These tests verify:
//! - Routing of writes and reads per strategy
//! - Rejection of writes into the past
//! - Drains, flushes and recovery after reopen
//! - Compaction and retention through the engine

use alopex_den::meas::flags::NO_DATA;
use alopex_den::{
    DenError, Engine, EngineConfig, EraseOlderThan, Measurement, QueryInterval, QueryTimePoint,
    ReadCallback, Strategy,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn config(dir: &Path, strategy: Strategy) -> EngineConfig {
    EngineConfig::new(dir)
        .with_strategy(strategy)
        .with_chunk_capacity(256)
        .with_segment_capacity(100)
        .with_threads(2, 1)
}

fn all(id: u64) -> QueryInterval {
    QueryInterval::new(vec![id], 0, 0, u64::MAX)
}

// ============================================================================
// Write Path
// ============================================================================

#[test]
fn test_wal_flush_moves_everything_to_pages() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();

    for t in 1..=100u64 {
        for id in 0..10u64 {
            let result = engine.append(&Measurement::new(id, t, (id * t) as f64));
            assert_eq!(result.writed, 1);
        }
    }
    engine.flush().unwrap();

    let description = engine.description();
    assert!(description.pages_count >= 1);
    assert_eq!(description.wal_count, 0);
    assert_eq!(description.active_works, 0);

    let values = engine
        .read_interval(&QueryInterval::new(Vec::new(), 0, 0, 1000))
        .unwrap();
    assert_eq!(values.len(), 1000);
    for id in 0..10u64 {
        let series: Vec<u64> = values.iter().filter(|m| m.id == id).map(|m| m.time).collect();
        assert_eq!(series, (1..=100).collect::<Vec<_>>());
    }
}

#[test]
fn test_write_into_the_past_is_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Memory)).unwrap();

    assert_eq!(engine.append(&Measurement::new(1, 100, 1.0)).writed, 1);
    let same = engine.append(&Measurement::new(1, 100, 2.0));
    assert_eq!(same.ignored, 1);
    assert!(same.error_message.is_some());
    assert_eq!(engine.append(&Measurement::new(1, 50, 2.0)).ignored, 1);
    // Other series keep their own clock.
    assert_eq!(engine.append(&Measurement::new(2, 50, 2.0)).writed, 1);

    let batch = engine.append_batch(&[
        Measurement::new(1, 101, 1.0),
        Measurement::new(1, 99, 1.0),
        Measurement::new(1, 102, 1.0),
    ]);
    assert_eq!(batch.writed, 2);
    assert_eq!(batch.ignored, 1);

    let times: Vec<u64> = engine
        .read_interval(&all(1))
        .unwrap()
        .iter()
        .map(|m| m.time)
        .collect();
    assert_eq!(times, vec![100, 101, 102]);
}

#[test]
fn test_concurrent_writers() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Arc::new(Engine::open(config(temp_dir.path(), Strategy::Cache)).unwrap());

    let handles: Vec<_> = (0..4u64)
        .map(|id| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for t in 1..=500u64 {
                    assert_eq!(engine.append(&Measurement::new(id, t, t as f64)).writed, 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    engine.wait_all_asyncs();

    for id in 0..4u64 {
        assert_eq!(engine.read_interval(&all(id)).unwrap().len(), 500);
        assert_eq!(engine.min_max_time(id), Some((1, 500)));
    }
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn test_time_point_without_data() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    engine.append(&Measurement::new(5, 999, 1.0));

    let result = engine
        .read_time_point(&QueryTimePoint::new(vec![5], 0, 50))
        .unwrap();
    assert_eq!(result[&5].flag, NO_DATA);
    assert!(result[&5].is_empty());

    let result = engine
        .read_time_point(&QueryTimePoint::new(vec![5, 6], 0, 1000))
        .unwrap();
    assert_eq!(result[&5].time, 999);
    assert!(result[&6].is_empty());
}

#[test]
fn test_time_point_across_tiers() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    for t in 1..=50u64 {
        engine.append(&Measurement::new(1, t * 10, t as f64));
    }
    engine.flush().unwrap();
    for t in 51..=60u64 {
        engine.append(&Measurement::new(1, t * 10, t as f64));
    }

    let query = |t| {
        engine
            .read_time_point(&QueryTimePoint::new(vec![1], 0, t))
            .unwrap()[&1]
    };
    assert_eq!(query(255).time, 250);
    assert_eq!(query(555).time, 550);
    assert_eq!(query(u64::MAX).time, 600);
}

#[test]
fn test_time_point_without_ids_for_every_strategy() {
    for strategy in [Strategy::Wal, Strategy::Memory, Strategy::Cache] {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path(), strategy)).unwrap();
        engine.append(&Measurement::new(1, 10, 1.0));
        engine.append(&Measurement::new(2, 20, 2.0));
        engine.flush().unwrap();
        // Newer than the flushed value, held only by the write tier.
        engine.append(&Measurement::new(1, 30, 3.0));

        let every = engine
            .read_time_point(&QueryTimePoint::new(Vec::new(), 0, u64::MAX))
            .unwrap();
        let listed = engine
            .read_time_point(&QueryTimePoint::new(vec![1, 2], 0, u64::MAX))
            .unwrap();
        assert_eq!(every.len(), 2, "{strategy}");
        assert_eq!(every[&1].time, 30, "{strategy}");
        assert_eq!(every[&2].time, 20, "{strategy}");
        assert_eq!(every, listed, "{strategy}");
    }
}

#[test]
fn test_current_value_and_flags() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Memory)).unwrap();
    engine.append(&Measurement::with_flag(1, 10, 1.0, 3, 0));
    engine.append(&Measurement::with_flag(1, 20, 2.0, 4, 0));
    engine.append(&Measurement::with_flag(2, 15, 5.0, 3, 0));

    let current = engine.current_value(&[], 0).unwrap();
    assert_eq!(current.len(), 2);
    assert_eq!(current[&1].time, 20);
    assert_eq!(current[&2].time, 15);

    let flagged = engine.current_value(&[1], 3).unwrap();
    assert_eq!(flagged[&1].time, 10);

    let only_flag_4 = engine
        .read_interval(&QueryInterval::new(Vec::new(), 4, 0, 100))
        .unwrap();
    assert_eq!(only_flag_4.len(), 1);
    assert_eq!(only_flag_4[0].id, 1);
}

#[test]
fn test_min_max_and_stat() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Cache)).unwrap();
    for t in 1..=100u64 {
        engine.append(&Measurement::new(1, t, t as f64));
    }
    engine.append(&Measurement::new(2, 500, 1.0));

    assert_eq!(engine.min_max_time(1), Some((1, 100)));
    assert_eq!(engine.min_max_time(3), None);
    assert_eq!(engine.min_time(), Some(1));
    assert_eq!(engine.max_time(), Some(500));

    let stat = engine.stat(1, 11, 20);
    assert_eq!(stat.count, 10);
    assert_eq!(stat.min_time, 11);
    assert_eq!(stat.max_time, 20);
    assert_eq!(stat.sum, (11..=20).sum::<u64>() as f64);
}

#[test]
fn test_foreach_cancel() {
    struct Limited {
        seen: Vec<u64>,
        limit: usize,
    }

    impl ReadCallback for Limited {
        fn apply(&mut self, m: &Measurement) {
            self.seen.push(m.time);
        }

        fn is_canceled(&self) -> bool {
            self.seen.len() >= self.limit
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Memory)).unwrap();
    for t in 1..=20u64 {
        engine.append(&Measurement::new(1, t, 0.0));
    }

    let mut limited = Limited {
        seen: Vec::new(),
        limit: 5,
    };
    engine.foreach(&all(1), &mut limited).unwrap();
    assert_eq!(limited.seen, vec![1, 2, 3, 4, 5]);

    let mut count = 0;
    engine.foreach(&all(1), &mut |_: &Measurement| count += 1).unwrap();
    assert_eq!(count, 20);
}

#[test]
fn test_foreach_cancel_skips_remaining_tiers() {
    struct CancelAfterPolls {
        polls: std::cell::Cell<usize>,
        limit: usize,
        seen: usize,
    }

    impl ReadCallback for CancelAfterPolls {
        fn apply(&mut self, _: &Measurement) {
            self.seen += 1;
        }

        fn is_canceled(&self) -> bool {
            self.polls.set(self.polls.get() + 1);
            self.polls.get() > self.limit
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    for t in 1..=50u64 {
        engine.append(&Measurement::new(1, t, 0.0));
    }
    engine.flush().unwrap();
    for t in 51..=60u64 {
        engine.append(&Measurement::new(1, t, 0.0));
    }

    // Pages are read, then the cancellation lands before the log.
    let mut callback = CancelAfterPolls {
        polls: std::cell::Cell::new(0),
        limit: 1,
        seen: 0,
    };
    engine.foreach(&all(1), &mut callback).unwrap();
    assert_eq!(callback.polls.get(), 2);
    assert_eq!(callback.seen, 0);

    let mut canceled = CancelAfterPolls {
        polls: std::cell::Cell::new(0),
        limit: 0,
        seen: 0,
    };
    engine.foreach(&all(1), &mut canceled).unwrap();
    assert_eq!(canceled.polls.get(), 1);
    assert_eq!(canceled.seen, 0);
}

// ============================================================================
// Strategies
// ============================================================================

#[test]
fn test_cache_reads_split_at_sync_point() {
    let temp_dir = TempDir::new().unwrap();
    // A tiny budget keeps only the newest chunks in memory.
    let engine = Engine::open(
        config(temp_dir.path(), Strategy::Cache)
            .with_chunk_capacity(64)
            .with_memory_limit(1024),
    )
    .unwrap();
    for t in 1..=2000u64 {
        engine.append(&Measurement::new(1, t, t as f64));
    }
    engine.wait_all_asyncs();

    let description = engine.description();
    assert!(description.memory.resident_bytes <= 1024 + 1024);

    let values = engine.read_interval(&all(1)).unwrap();
    let times: Vec<u64> = values.iter().map(|m| m.time).collect();
    assert_eq!(times, (1..=2000).collect::<Vec<_>>());

    let tail = engine
        .read_interval(&QueryInterval::new(vec![1], 0, 1990, 3000))
        .unwrap();
    assert_eq!(tail.len(), 11);
}

#[test]
fn test_memory_strategy_flushes_on_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp_dir.path(), Strategy::Memory)).unwrap();
        for t in 1..=300u64 {
            engine.append(&Measurement::new(9, t, 1.0));
        }
        assert_eq!(engine.description().wal_count, 0);
        assert_eq!(engine.description().pages_count, 0);
    }

    let engine = Engine::open(config(temp_dir.path(), Strategy::Memory)).unwrap();
    assert!(engine.description().pages_count >= 1);
    assert_eq!(engine.read_interval(&all(9)).unwrap().len(), 300);
    assert_eq!(engine.min_max_time(9), Some((1, 300)));
    // The cache survives reopen, so the past stays closed.
    assert_eq!(engine.append(&Measurement::new(9, 300, 1.0)).ignored, 1);
}

#[test]
fn test_age_eviction_keeps_data_reachable() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(
        config(temp_dir.path(), Strategy::Memory)
            .with_chunk_capacity(64)
            .with_retention_window(1000),
    )
    .unwrap();
    // Times near zero are far older than the window, so every closed chunk expires.
    for t in 1..=500u64 {
        engine.append(&Measurement::new(1, t, t as f64));
    }
    engine.wait_all_asyncs();

    let description = engine.description();
    assert_eq!(description.memory.chunks, 1);
    assert!(description.pages_count >= 1);

    let times: Vec<u64> = engine
        .read_interval(&all(1))
        .unwrap()
        .iter()
        .map(|m| m.time)
        .collect();
    assert_eq!(times, (1..=500).collect::<Vec<_>>());
}

#[test]
fn test_memory_drop_part() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(
        config(temp_dir.path(), Strategy::Memory).with_chunk_capacity(64),
    )
    .unwrap();
    for t in 1..=500u64 {
        engine.append(&Measurement::new(1, t, t as f64));
    }
    let before = engine.description().memory.chunks;
    assert!(before > 2);

    assert_eq!(engine.drop_part(2).unwrap(), 2);
    assert_eq!(engine.description().memory.chunks, before - 2);
    assert_eq!(engine.description().pages_count, 1);
    assert_eq!(engine.read_interval(&all(1)).unwrap().len(), 500);
}

#[test]
fn test_wal_drop_part_and_compress_all() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(
        config(temp_dir.path(), Strategy::Wal).with_max_closed_segments(100),
    )
    .unwrap();
    for t in 1..=350u64 {
        engine.append(&Measurement::new(1, t, 0.5));
    }
    engine.wait_all_asyncs();
    // Rotated segments are drained in the background.
    assert_eq!(engine.description().wal_count, 1);
    assert_eq!(engine.description().dropper.drained, 3);

    assert_eq!(engine.drop_part(1).unwrap(), 1);
    assert_eq!(engine.description().wal_count, 0);

    engine.append(&Measurement::new(1, 351, 0.5));
    engine.compress_all().unwrap();
    assert_eq!(engine.description().wal_count, 0);
    assert_eq!(engine.read_interval(&all(1)).unwrap().len(), 351);
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn test_reopen_drains_leftover_segments() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp_dir.path(), Strategy::Cache)).unwrap();
        for t in 1..=250u64 {
            engine.append(&Measurement::new(4, t, t as f64));
        }
        engine.wait_all_asyncs();
        // Simulate a crash: nothing is flushed and the lock file stays behind.
        std::mem::forget(engine);
    }

    let engine = Engine::open(
        config(temp_dir.path(), Strategy::Wal).with_ignore_lock_file(true),
    )
    .unwrap();
    assert_eq!(engine.strategy(), Strategy::Cache);
    engine.wait_all_asyncs();
    assert_eq!(engine.description().wal_count, 0);

    let values = engine.read_interval(&all(4)).unwrap();
    assert_eq!(values.len(), 250);
    assert_eq!(values.iter().map(|m| m.time).collect::<HashSet<_>>().len(), 250);
    assert_eq!(engine.min_max_time(4), Some((1, 250)));
}

#[test]
fn test_reopen_keeps_wal_data() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
        for t in 1..=42u64 {
            engine.append(&Measurement::new(8, t, -(t as f64)));
        }
    }
    assert!(!temp_dir.path().join(alopex_den::engine::LOCK_FILE_NAME).exists());

    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    let values = engine.read_interval(&all(8)).unwrap();
    assert_eq!(values.len(), 42);
    assert_eq!(values[41].value, -42.0);
}

#[test]
fn test_second_engine_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let _engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    let second = Engine::open(config(temp_dir.path(), Strategy::Wal));
    assert!(matches!(second, Err(DenError::StorageLocked(_))));
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let result = Engine::open(config(temp_dir.path(), Strategy::Wal).with_segment_capacity(0));
    assert!(matches!(result, Err(DenError::InvalidConfig(_))));
}

// ============================================================================
// Subscriptions
// ============================================================================

#[test]
fn test_subscription_sees_matching_appends() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Memory)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = engine.subscribe(vec![1], 0, move |m| sink.lock().unwrap().push(m.time));
    let all_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&all_count);
    engine.subscribe(Vec::new(), 0, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    engine.append(&Measurement::new(1, 10, 0.0));
    engine.append(&Measurement::new(2, 10, 0.0));
    // Refused writes are not delivered.
    engine.append(&Measurement::new(1, 5, 0.0));
    engine.append(&Measurement::new(1, 11, 0.0));
    assert_eq!(*seen.lock().unwrap(), vec![10, 11]);
    assert_eq!(all_count.load(Ordering::SeqCst), 3);

    assert!(engine.unsubscribe(subscription));
    engine.append(&Measurement::new(1, 12, 0.0));
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(all_count.load(Ordering::SeqCst), 4);
}

// ============================================================================
// Maintenance
// ============================================================================

#[test]
fn test_repack_keeps_every_measurement() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    for batch in 0..4u64 {
        for t in 1..=50u64 {
            engine.append(&Measurement::new(1, batch * 50 + t, 1.0));
        }
        engine.flush().unwrap();
    }
    assert_eq!(engine.description().pages_count, 4);

    assert_eq!(engine.compact_to(2).unwrap(), 3);
    assert_eq!(engine.description().pages_count, 2);
    assert_eq!(engine.repack().unwrap(), 2);
    assert_eq!(engine.description().pages_count, 1);
    assert_eq!(engine.repack().unwrap(), 0);

    let times: Vec<u64> = engine
        .read_interval(&all(1))
        .unwrap()
        .iter()
        .map(|m| m.time)
        .collect();
    assert_eq!(times, (1..=200).collect::<Vec<_>>());
    assert!(engine.fsck().is_clean());
}

#[test]
fn test_erase_old_pages() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    for t in 1..=100u64 {
        engine.append(&Measurement::new(1, t, 1.0));
    }
    engine.flush().unwrap();
    for t in 101..=200u64 {
        engine.append(&Measurement::new(1, t, 1.0));
    }
    engine.flush().unwrap();

    assert_eq!(engine.erase_old(150).unwrap(), 1);
    assert_eq!(engine.min_max_time(1), Some((101, 200)));
    assert_eq!(engine.read_interval(&all(1)).unwrap().len(), 100);
}

#[test]
fn test_erase_old_series() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Cache)).unwrap();
    for t in 1..=100u64 {
        engine.append(&Measurement::new(1, t, 1.0));
        engine.append(&Measurement::new(2, t, 1.0));
    }

    assert_eq!(engine.erase_old_series(1, 61).unwrap(), 60);
    assert_eq!(engine.min_max_time(1), Some((61, 100)));
    assert_eq!(engine.read_interval(&all(1)).unwrap().len(), 40);
    assert_eq!(engine.read_interval(&all(2)).unwrap().len(), 100);
}

#[test]
fn test_compact_with_controller() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(temp_dir.path(), Strategy::Wal)).unwrap();
    for t in 1..=100u64 {
        engine.append(&Measurement::new(3, t, 1.0));
    }
    engine.flush().unwrap();

    let mut controller = EraseOlderThan::new(vec![3], 91);
    assert_eq!(engine.compact(&mut controller).unwrap(), 1);
    assert_eq!(controller.erased(), 90);
    assert_eq!(engine.read_interval(&all(3)).unwrap().len(), 10);
}
