//! Changelog append and read benchmarks
//!
//! - `replica_append/*`: append path of one replica log, standard durability
//! - `merge_read/*`: draining a composite cursor over N replica logs
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench changelog_append
//! ```

use changelogdb::{BaseDn, ChangelogConfig, ChangelogCursor, ChangelogRegistry, Csn, ServerState, UpdateMsg};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicI64, Ordering};
use tempfile::TempDir;

/// Fixed seed so runs are comparable
const BENCH_SEED: u64 = 0xC4A9_6E10;

fn bench_config() -> ChangelogConfig {
    ChangelogConfig {
        compute_change_number: false,
        purge_delay_secs: 0,
        ..ChangelogConfig::default()
    }
}

fn replica_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("replica_append");
    group.throughput(Throughput::Elements(1));

    for payload_size in [64usize, 1024] {
        let dir = TempDir::new().unwrap();
        let registry = ChangelogRegistry::open_with_config(dir.path(), bench_config()).unwrap();
        let domain = BaseDn::new("dc=bench").unwrap();
        let payload = vec![0x5a; payload_size];
        let time = AtomicI64::new(1);

        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &payload_size,
            |b, _| {
                b.iter(|| {
                    let csn = Csn::new(time.fetch_add(1, Ordering::Relaxed), 0, 1);
                    registry
                        .publish_update(&domain, &UpdateMsg::new(csn, payload.clone()))
                        .unwrap();
                })
            },
        );
    }
    group.finish();
}

fn merge_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_read");
    const TOTAL: i64 = 10_000;

    for replicas in [1i32, 4, 16] {
        let dir = TempDir::new().unwrap();
        let registry = ChangelogRegistry::open_with_config(dir.path(), bench_config()).unwrap();
        let domain = BaseDn::new("dc=bench").unwrap();

        let mut owners: Vec<i32> = (0..TOTAL).map(|t| (t % replicas as i64) as i32 + 1).collect();
        owners.shuffle(&mut rand::rngs::StdRng::seed_from_u64(BENCH_SEED));
        for (time, server_id) in owners.into_iter().enumerate() {
            let csn = Csn::new(time as i64 + 1, 0, server_id);
            registry
                .publish_update(&domain, &UpdateMsg::new(csn, vec![0u8; 32]))
                .unwrap();
        }

        group.throughput(Throughput::Elements(TOTAL as u64));
        group.bench_with_input(BenchmarkId::from_parameter(replicas), &replicas, |b, _| {
            b.iter(|| {
                let mut cursor = registry.get_cursor_from(&domain, &ServerState::new()).unwrap();
                let mut read = 0u64;
                while cursor.advance().unwrap() {
                    black_box(cursor.record());
                    read += 1;
                }
                assert_eq!(read, TOTAL as u64);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, replica_append, merge_read);
criterion_main!(benches);
