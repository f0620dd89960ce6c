//! End-to-end tests for the row store: the full insert → buffer → flush →
//! merged-read lifecycle, retention, and the concurrency invariants.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fennec::{
    DenseCodec, Field, FieldValues, Insert, RowKey, RowStore, RowStoreConfig, Schema, Sequence,
    StoreError, Timestamp,
};
use tempfile::TempDir;

const RES: Duration = Duration::from_secs(1);
const STEP: i64 = 1_000_000_000;

/// Schema with two fields and an effectively infinite retention window, so
/// tests can use small fixed timestamps without racing the wall clock.
fn schema() -> Arc<Schema> {
    schema_with_retention(Duration::MAX)
}

fn schema_with_retention(retention: Duration) -> Arc<Schema> {
    let codec = Arc::new(DenseCodec::new());
    Arc::new(Schema::new(
        vec![
            Field::new("requests", codec.clone()),
            Field::new("load", codec),
        ],
        RES,
        retention,
    ))
}

fn key(host: &str) -> RowKey {
    RowKey::from_pairs([("host", host.as_bytes())])
}

fn insert(store: &RowStore, host: &str, ts: Timestamp, requests: f64, load: f64) {
    let mut values = FieldValues::new();
    values.insert("requests".to_string(), requests);
    values.insert("load".to_string(), load);
    store
        .insert(Insert::new(key(host), ts, values))
        .expect("insert");
}

fn collect(store: &RowStore) -> Vec<(RowKey, Vec<Sequence>)> {
    let mut rows = Vec::new();
    store
        .iterate(|key, columns| rows.push((key, columns)))
        .expect("iterate");
    rows
}

/// Inserts and flushes apply asynchronously; poll until the store reaches
/// the expected state or the deadline passes.
fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn wait_for_rows(store: &RowStore, count: usize) {
    wait_until("row count", || collect(store).len() == count);
}

fn data_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("filestore_") && name.ends_with(".dat"))
        .collect();
    names.sort();
    names
}

fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

#[test]
fn test_empty_store_yields_nothing() {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();
    assert!(collect(&store).is_empty());
    assert!(store.durable_file().is_none());
}

#[test]
fn test_open_creates_nested_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("tables").join("requests");
    let store = RowStore::open(schema(), RowStoreConfig::new(&nested)).unwrap();
    assert!(nested.is_dir());
    assert!(collect(&store).is_empty());
}

#[test]
fn test_open_rejects_zero_thresholds() {
    let dir = TempDir::new().unwrap();
    let config = RowStoreConfig::new(dir.path()).with_max_mem_store_bytes(0);
    assert!(matches!(
        RowStore::open(schema(), config),
        Err(StoreError::InvalidConfig(_))
    ));

    let config = RowStoreConfig::new(dir.path()).with_max_flush_latency(Duration::ZERO);
    assert!(matches!(
        RowStore::open(schema(), config),
        Err(StoreError::InvalidConfig(_))
    ));
}

#[test]
fn test_insert_then_read_before_flush() {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();

    insert(&store, "web1", 0, 1.0, 0.5);
    wait_for_rows(&store, 1);

    let rows = collect(&store);
    assert_eq!(rows[0].0, key("web1"));
    assert_eq!(DenseCodec::samples(&rows[0].1[0], RES), vec![(0, 1.0)]);
    assert_eq!(DenseCodec::samples(&rows[0].1[1], RES), vec![(0, 0.5)]);
    // Nothing flushed yet.
    assert!(store.durable_file().is_none());
    assert!(data_files(dir.path()).is_empty());
}

#[test]
fn test_size_triggered_flush_then_read() {
    let dir = TempDir::new().unwrap();
    // One insert exceeds a one-byte threshold.
    let config = RowStoreConfig::new(dir.path()).with_max_mem_store_bytes(1);
    let store = RowStore::open(schema(), config).unwrap();

    insert(&store, "web1", 0, 1.0, 0.5);
    wait_until("flush commit", || {
        store.durable_file().is_some() && store.live_generations() == 1
    });

    // Exactly one durable file, and the frozen generation is gone.
    assert_eq!(data_files(dir.path()).len(), 1);

    let rows = collect(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, key("web1"));
    assert_eq!(DenseCodec::samples(&rows[0].1[0], RES), vec![(0, 1.0)]);
}

#[test]
fn test_explicit_flush() {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();

    insert(&store, "web1", 0, 1.0, 0.5);
    store.flush().unwrap();
    wait_until("flush commit", || store.durable_file().is_some());

    let rows = collect(&store);
    assert_eq!(rows.len(), 1);

    // A flush with nothing buffered is a no-op: still one durable file.
    store.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(data_files(dir.path()).len(), 1);
}

#[test]
fn test_merge_across_generations() {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();

    insert(&store, "web1", 0, 1.0, 0.5);
    store.flush().unwrap();
    wait_until("flush commit", || store.durable_file().is_some());

    insert(&store, "web1", STEP, 2.0, 0.6);
    wait_until("merged row", || {
        let rows = collect(&store);
        rows.len() == 1 && DenseCodec::samples(&rows[0].1[0], RES).len() == 2
    });

    let rows = collect(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        DenseCodec::samples(&rows[0].1[0], RES),
        vec![(0, 1.0), (STEP, 2.0)]
    );
    assert_eq!(
        DenseCodec::samples(&rows[0].1[1], RES),
        vec![(0, 0.5), (STEP, 0.6)]
    );
}

#[test]
fn test_retention_drops_expired_rows_at_flush() {
    let dir = TempDir::new().unwrap();
    let schema = schema_with_retention(Duration::from_secs(3600));
    let store = RowStore::open(schema, RowStoreConfig::new(dir.path())).unwrap();

    // A sample half an hour old: live under the one-hour window.
    let t0 = DenseCodec::period(now_nanos() - 30 * 60 * STEP, RES);
    insert(&store, "web1", t0, 1.0, 0.5);
    wait_for_rows(&store, 1);

    // Tighten retention so the sample is now expired, then flush.
    store.schema().set_retention(Duration::from_nanos(1));
    store.flush().unwrap();
    wait_until("flush commit", || store.durable_file().is_some());

    // The row was dropped at flush: nothing on disk, nothing yielded.
    assert_eq!(data_files(dir.path()).len(), 1);
    assert!(collect(&store).is_empty());
    assert_eq!(store.live_generations(), 1);
}

#[test]
fn test_flush_filenames_sort_in_creation_order() {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();

    let mut created = Vec::new();
    for (i, host) in ["web1", "web2", "web3"].iter().enumerate() {
        insert(&store, host, i as i64 * STEP, 1.0, 0.5);
        store.flush().unwrap();
        wait_until("flush commit", || {
            store.durable_file().map(|path| {
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                !created.contains(&name)
            }) == Some(true)
        });
        let path = store.durable_file().unwrap();
        created.push(path.file_name().unwrap().to_string_lossy().into_owned());
    }

    // Lexicographic order matches creation order.
    let mut sorted = created.clone();
    sorted.sort();
    assert_eq!(created, sorted);

    // Superseded files linger for the grace period, so all three exist and
    // the directory listing agrees with creation order.
    assert_eq!(data_files(dir.path()), sorted);
}

#[test]
fn test_every_key_yielded_exactly_once() {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();

    for i in 0..5 {
        insert(&store, &format!("host{i}"), 0, i as f64, 0.0);
    }
    store.flush().unwrap();
    wait_until("flush commit", || store.durable_file().is_some());

    // Half the keys live in the durable file only, half in memory, and one
    // ("host0") in both.
    insert(&store, "host0", STEP, 10.0, 0.0);
    for i in 5..10 {
        insert(&store, &format!("host{i}"), 0, i as f64, 0.0);
    }
    wait_for_rows(&store, 10);

    let rows = collect(&store);
    assert_eq!(rows.len(), 10);
    let mut keys: Vec<RowKey> = rows.iter().map(|(k, _)| k.clone()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 10);

    // The overlapping key carries samples from both sides.
    let merged = rows.iter().find(|(k, _)| *k == key("host0")).unwrap();
    assert_eq!(
        DenseCodec::samples(&merged.1[0], RES),
        vec![(0, 0.0), (STEP, 10.0)]
    );
}

#[test]
fn test_reopen_after_close_recovers_flushed_rows() {
    let dir = TempDir::new().unwrap();
    {
        let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();
        insert(&store, "web1", 0, 1.0, 0.5);
        wait_for_rows(&store, 1);
        // Close flushes whatever is still buffered.
        store.close();
    }
    assert_eq!(data_files(dir.path()).len(), 1);

    let store = RowStore::open(schema(), RowStoreConfig::new(dir.path())).unwrap();
    assert!(store.durable_file().is_some());
    let rows = collect(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, key("web1"));
    assert_eq!(DenseCodec::samples(&rows[0].1[0], RES), vec![(0, 1.0)]);
}

/// A reader must observe each insert either fully applied or not at all:
/// never a row with one field updated and the other not. Both fields carry
/// the same value per insert, so any torn row shows up as a mismatch. A
/// small flush threshold keeps generation swaps happening under the
/// readers.
#[test]
fn test_no_torn_reads_under_concurrent_flushes() {
    let dir = TempDir::new().unwrap();
    let config = RowStoreConfig::new(dir.path()).with_max_mem_store_bytes(256);
    let store = Arc::new(RowStore::open(schema(), config).unwrap());

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..500 {
                insert(&store, "web1", (i % 8) * STEP, i as f64, i as f64);
            }
        })
    };

    for _ in 0..100 {
        store
            .iterate(|_key, columns| {
                let requests = DenseCodec::samples(&columns[0], RES);
                let load = DenseCodec::samples(&columns[1], RES);
                for (sample, other) in requests.iter().zip(load.iter()) {
                    assert_eq!(sample, other, "torn row observed");
                }
                assert_eq!(requests.len(), load.len(), "torn row observed");
            })
            .unwrap();
    }
    writer.join().unwrap();

    wait_for_rows(&store, 1);
    let rows = collect(&store);
    assert_eq!(rows.len(), 1);
}
