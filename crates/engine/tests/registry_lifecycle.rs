//! Registry lifecycle tests
//!
//! Restart consistency, process locking, retention purge and concurrent
//! publishers, all through the public registry API.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use changelog_core::{now_millis, BaseDn, ChangelogError, Csn, ServerState, UpdateMsg};
use changelog_engine::{ChangelogConfig, ChangelogRegistry};
use changelog_storage::ChangelogCursor;
use rand::Rng;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(compute_change_number: bool) -> ChangelogConfig {
    init_tracing();
    ChangelogConfig {
        compute_change_number,
        purge_delay_secs: 0,
        purge_interval_ms: 20,
        indexer_wake_interval_ms: 20,
        ..ChangelogConfig::default()
    }
}

fn dn(s: &str) -> BaseDn {
    BaseDn::new(s).unwrap()
}

fn update(time: i64, server_id: i32) -> UpdateMsg {
    UpdateMsg::new(Csn::new(time, 0, server_id), b"payload".to_vec())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn test_reopen_resumes_numbering_and_state() {
    let dir = TempDir::new().unwrap();
    let domain = dn("dc=example,dc=com");
    {
        let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
        registry.publish_update(&domain, &update(10, 1)).unwrap();
        registry.publish_update(&domain, &update(11, 2)).unwrap();
        registry.publish_heartbeat(&domain, &Csn::new(20, 0, 1)).unwrap();
        registry.publish_heartbeat(&domain, &Csn::new(20, 0, 2)).unwrap();
        assert!(registry.await_medium_consistency(&Csn::new(11, 0, 2), WAIT));
        registry.sync().unwrap();
    }

    let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
    assert_eq!(registry.domains(), vec![domain.clone()]);
    assert_eq!(
        registry.medium_consistency(),
        Some((domain.clone(), Csn::new(11, 0, 2)))
    );
    assert_eq!(
        registry.newest_cookie().csn(&domain, 2),
        Some(&Csn::new(11, 0, 2))
    );

    registry.publish_update(&domain, &update(30, 1)).unwrap();
    registry.publish_heartbeat(&domain, &Csn::new(31, 0, 1)).unwrap();
    registry.publish_heartbeat(&domain, &Csn::new(31, 0, 2)).unwrap();
    assert!(registry.await_medium_consistency(&Csn::new(30, 0, 1), WAIT));

    let index = registry.change_number_index();
    let newest = index.newest_record().unwrap();
    assert_eq!(newest.change_number(), 3);
    assert_eq!(newest.csn(), Csn::new(30, 0, 1));
}

#[test]
fn test_offline_marker_survives_restart() {
    let dir = TempDir::new().unwrap();
    let domain = dn("o=offline");
    {
        let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
        registry.publish_update(&domain, &update(10, 1)).unwrap();
        registry.publish_update(&domain, &update(5, 2)).unwrap();
        registry.replica_offline(&domain, &Csn::new(5, 0, 2)).unwrap();
    }

    let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
    registry.publish_heartbeat(&domain, &Csn::new(11, 0, 1)).unwrap();
    assert!(registry.await_medium_consistency(&Csn::new(10, 0, 1), WAIT));
    assert_eq!(registry.change_number_index().number_of_records(), 2);
}

#[test]
fn test_wide_replica_ids_survive_restart() {
    let dir = TempDir::new().unwrap();
    let domain = dn("o=a");
    let widest = changelog_core::MAX_SERVER_ID;
    {
        let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
        let rejected = registry.publish_update(&domain, &update(10, 70000));
        assert!(matches!(rejected, Err(ChangelogError::InvalidOperation(_))));

        for time in [10, 11, 12] {
            registry.publish_update(&domain, &update(time, widest)).unwrap();
        }
        registry.publish_heartbeat(&domain, &Csn::new(13, 0, widest)).unwrap();
        assert!(registry.await_medium_consistency(&Csn::new(12, 0, widest), WAIT));
    }

    let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
    assert_eq!(
        registry.medium_consistency(),
        Some((domain.clone(), Csn::new(12, 0, widest)))
    );
    let newest = registry.change_number_index().newest_record().unwrap();
    assert_eq!(
        newest.previous_cookie(),
        format!("o=a:{};", Csn::new(11, 0, widest))
    );
    assert_eq!(registry.replica_record_count(&domain, 70000), 0);
}

// ============================================================================
// Process lock
// ============================================================================

#[test]
fn test_second_open_is_refused_while_locked() {
    let dir = TempDir::new().unwrap();
    let first = ChangelogRegistry::open_with_config(dir.path(), config(false)).unwrap();

    match ChangelogRegistry::open_with_config(dir.path(), config(false)) {
        Err(ChangelogError::Storage(msg)) => assert!(msg.contains("already in use")),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("second open should fail"),
    }

    first.shutdown();
    drop(first);
    ChangelogRegistry::open_with_config(dir.path(), config(false)).unwrap();
}

// ============================================================================
// Purge
// ============================================================================

#[test]
fn test_purge_removes_only_expired_updates() {
    let dir = TempDir::new().unwrap();
    let registry = ChangelogRegistry::open_with_config(dir.path(), config(false)).unwrap();
    let domain = dn("o=retention");
    let recent = now_millis();
    for time in 1..=5 {
        registry.publish_update(&domain, &update(time, 1)).unwrap();
    }
    registry.publish_update(&domain, &update(recent, 1)).unwrap();

    registry.set_purge_delay(Duration::from_secs(3600));
    assert!(wait_until(|| registry.replica_record_count(&domain, 1) == 1));
    assert_eq!(
        registry.domain_oldest_state(&domain).csn(1),
        Some(&Csn::new(recent, 0, 1))
    );

    registry.publish_update(&domain, &update(recent + 1, 1)).unwrap();
    let mut cursor = registry.get_cursor_from(&domain, &ServerState::new()).unwrap();
    let mut csns = Vec::new();
    while cursor.advance().unwrap() {
        csns.push(cursor.record().unwrap().csn());
    }
    assert_eq!(csns, vec![Csn::new(recent, 0, 1), Csn::new(recent + 1, 0, 1)]);
    registry.check_health().unwrap();
}

#[test]
fn test_purge_keeps_newest_indexed_update() {
    let dir = TempDir::new().unwrap();
    let registry = ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap();
    let domain = dn("o=retention");
    for time in 1..=5 {
        registry.publish_update(&domain, &update(time, 1)).unwrap();
    }
    registry.publish_heartbeat(&domain, &Csn::new(6, 0, 1)).unwrap();
    assert!(registry.await_medium_consistency(&Csn::new(5, 0, 1), WAIT));

    registry.set_purge_delay(Duration::from_secs(1));
    assert!(wait_until(|| registry.replica_record_count(&domain, 1) == 1));

    let index = registry.change_number_index();
    assert_eq!(index.number_of_records(), 1);
    assert_eq!(index.oldest_record().unwrap().csn(), Csn::new(5, 0, 1));
    assert_eq!(
        registry.domain_oldest_state(&domain).csn(1),
        Some(&Csn::new(5, 0, 1))
    );
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_publishers_are_indexed_in_csn_order() {
    const WRITERS: i32 = 4;
    const PER_WRITER: i64 = 100;

    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap());
    let domain = dn("o=concurrent");
    let barrier = Arc::new(Barrier::new(WRITERS as usize));

    let handles: Vec<_> = (1..=WRITERS)
        .map(|server_id| {
            let registry = Arc::clone(&registry);
            let domain = domain.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                barrier.wait();
                for i in 1..=PER_WRITER {
                    registry
                        .publish_update(&domain, &update(i * 10 + server_id as i64, server_id))
                        .unwrap();
                    if rng.gen_bool(0.1) {
                        thread::yield_now();
                    }
                }
                registry
                    .publish_heartbeat(&domain, &Csn::new(100_000, 0, server_id))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let last = Csn::new(PER_WRITER * 10 + WRITERS as i64, 0, WRITERS);
    assert!(registry.await_medium_consistency(&last, WAIT));

    let mut cursor = registry.change_number_cursor(1).unwrap();
    let mut csns = Vec::new();
    while cursor.advance().unwrap() {
        csns.push(cursor.record().unwrap().value().csn());
    }
    assert_eq!(csns.len(), (WRITERS as i64 * PER_WRITER) as usize);
    assert!(csns.windows(2).all(|w| w[0] < w[1]));
    for server_id in 1..=WRITERS {
        assert_eq!(
            registry.replica_record_count(&domain, server_id),
            PER_WRITER as u64
        );
    }
}

#[test]
fn test_clear_during_publishing() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ChangelogRegistry::open_with_config(dir.path(), config(true)).unwrap());
    let domain = dn("o=clear");
    let (started_tx, started_rx) = std::sync::mpsc::channel();

    let writer = {
        let registry = Arc::clone(&registry);
        let domain = domain.clone();
        thread::spawn(move || {
            for time in 1..=200 {
                registry.publish_update(&domain, &update(time, 1)).unwrap();
                if time == 50 {
                    started_tx.send(()).unwrap();
                }
            }
        })
    };
    started_rx.recv().unwrap();
    registry.clear_all().unwrap();
    writer.join().unwrap();

    registry.publish_update(&domain, &update(300, 1)).unwrap();
    registry.publish_heartbeat(&domain, &Csn::new(1000, 0, 1)).unwrap();
    assert!(registry.await_medium_consistency(&Csn::new(300, 0, 1), WAIT));
    registry.check_health().unwrap();

    let stored = registry.replica_record_count(&domain, 1);
    assert!(stored <= 151);
    let index = registry.change_number_index();
    assert_eq!(index.number_of_records() as u64, stored);
    assert_eq!(index.newest_record().unwrap().csn(), Csn::new(300, 0, 1));
}
