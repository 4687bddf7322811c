//! Benchmarks for the replica log and the merging cursors.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench log              # run all benchmarks
//! cargo bench --bench log -- append    # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;

use replchangelog::cursor::{CursorOptions, DbCursor};
use replchangelog::file::ReplicaDbParser;
use replchangelog::log::{KeyMatchingStrategy, Log, LogOptions, PositionStrategy, Record, RepositionableCursor};
use replchangelog::ports::NoEncryption;
use replchangelog::{ChangelogConfig, ChangelogDb, Collaborators, Csn, Dn, ServerState, UpdateMsg};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Small update payload (128 bytes).
const PAYLOAD_128B: &[u8; 128] = &[0xAB; 128];

/// Larger update payload (1 KiB).
const PAYLOAD_1K: &[u8; 1024] = &[0xCD; 1024];

fn record(timestamp: u64, payload: &[u8]) -> Record<Csn, UpdateMsg> {
    let csn = Csn::new(timestamp, 0, 1);
    Record::new(csn, UpdateMsg::update(csn, payload.to_vec()))
}

/// Opens a replica log rotating every 256 KiB so that seeks cross files.
fn open_log(dir: &std::path::Path) -> Log<Csn, UpdateMsg> {
    Log::open(
        dir,
        Arc::new(ReplicaDbParser::new(Arc::new(NoEncryption))),
        LogOptions {
            size_limit_per_file: 256 * 1024,
            ..LogOptions::default()
        },
    )
    .unwrap()
}

/// A log holding t=1..=`count`.
fn prepopulate(dir: &std::path::Path, count: u64) -> Log<Csn, UpdateMsg> {
    let log = open_log(dir);
    for t in 1..=count {
        log.append(record(t, PAYLOAD_128B)).unwrap();
    }
    log
}

// ================================================================================================
// Append
// ================================================================================================

/// Benchmark group for appends to one replica log.
///
/// # Sub-benchmarks
///
/// ## `append/128B` and `append/1K`
///
/// **Scenario:** Appends one update with an ever-increasing CSN to a log
/// that rotates every 256 KiB.
///
/// **What it measures:** Record encoding, framing and the buffered write
/// of the head file, plus the amortised cost of rotation.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for &(label, payload) in &[("128B", PAYLOAD_128B.as_slice()), ("1K", PAYLOAD_1K.as_slice())] {
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let dir = TempDir::new().unwrap();
            let log = open_log(dir.path());
            let mut t = 0u64;

            b.iter(|| {
                t += 1;
                log.append(black_box(record(t, payload))).unwrap();
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Seek
// ================================================================================================

/// Benchmark group for positioned cursors.
///
/// # Sub-benchmarks
///
/// ## `seek/equal` and `seek/less_or_equal`
///
/// **Scenario:** Opens a cursor on a random CSN of a 20,000-record log
/// spread over several files, then reads one record.
///
/// **What it measures:** File selection by key range, the block-level
/// binary search and the final scan inside one block.
fn bench_seek(c: &mut Criterion) {
    const RECORDS: u64 = 20_000;

    let dir = TempDir::new().unwrap();
    let log = prepopulate(dir.path(), RECORDS);
    let mut group = c.benchmark_group("seek");

    for &(label, matching) in &[
        ("equal", KeyMatchingStrategy::EqualToKey),
        ("less_or_equal", KeyMatchingStrategy::LessThanOrEqualToKey),
    ] {
        group.bench_function(label, |b| {
            let mut rng = rand::rng();
            b.iter_batched(
                || Csn::new(rng.random_range(1..=RECORDS), 0, 1),
                |key| {
                    let mut cursor = log
                        .cursor_from(Some(&key), matching, PositionStrategy::OnMatchingKey)
                        .unwrap();
                    assert!(cursor.next().unwrap());
                    black_box(cursor.record());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// ================================================================================================
// Merge
// ================================================================================================

/// Benchmark group for the domain cursor.
///
/// # Sub-benchmarks
///
/// ## `merge/domain_scan`
///
/// **Scenario:** Drains a domain cursor over three replicas holding
/// 2,000 interleaved updates each.
///
/// **What it measures:** The cost of the merging cursor on top of plain
/// log reads.
fn bench_merge(c: &mut Criterion) {
    const PER_REPLICA: u64 = 2_000;

    let dir = TempDir::new().unwrap();
    let config = ChangelogConfig {
        compute_change_numbers: false,
        ..ChangelogConfig::default()
    };
    let db = ChangelogDb::open(dir.path(), config, Collaborators::default()).unwrap();
    let base_dn = Dn::from("dc=example,dc=com");
    for t in 1..=PER_REPLICA {
        for sid in 1..=3 {
            db.publish_update(&base_dn, UpdateMsg::update(Csn::new(t, 0, sid), PAYLOAD_128B.to_vec()))
                .unwrap();
        }
    }

    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Elements(3 * PER_REPLICA));
    group.bench_function("domain_scan", |b| {
        b.iter(|| {
            let mut cursor = db
                .domain_cursor(&base_dn, &ServerState::new(), CursorOptions::default())
                .unwrap();
            let mut count = 0u64;
            while cursor.next().unwrap() {
                count += 1;
            }
            assert_eq!(count, 3 * PER_REPLICA);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_seek, bench_merge);
criterion_main!(benches);
