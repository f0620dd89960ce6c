//! The row store: ingest pipeline, flush worker, merged reads.
//!
//! # Architecture
//!
//! Two long-lived worker threads cooperate over channels, Go-pipeline
//! style:
//!
//! ```text
//! insert() ──rendezvous──▶ ingest loop ──cap 1──▶ flush worker
//!                              ▲                       │
//!                              └──── flush duration ───┘
//! ```
//!
//! The **ingest loop** owns the active generation and its byte accounting.
//! Each insert folds into the active generation under the write lock; when
//! the accounted bytes reach the configured threshold, or the adaptive
//! flush timer fires, the active generation is frozen (it stays readable),
//! a fresh one takes its place, and a flush request goes out. The flush
//! channel holds one request, so a second freeze blocks the loop until the
//! worker catches up. That bound keeps at most two generations alive: one
//! in flight, one filling.
//!
//! The **flush worker** merges the frozen generation with the current
//! durable file into a new durable file, renames it into place, and commits
//! the swap under the write lock. The measured wall time feeds back to the
//! ingest loop, which widens its flush window to ten times the last flush
//! duration so slow storage is flushed less eagerly.
//!
//! Readers snapshot the durable-file pointer and every live generation
//! under the read lock, then merge with no further locking.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{after, bounded, Receiver, Sender};
use crossbeam::select;
use parking_lot::RwLock;
use snap::write::FrameEncoder;
use tempfile::NamedTempFile;
use tracing::{debug, error};

use crate::codec::Sequence;
use crate::error::{Result, StoreError};
use crate::key::RowKey;
use crate::schema::{current_timestamp_nanos, Insert, Schema};
use crate::store::file::{
    data_file_name, latest_data_file, write_record, FileStore, IO_BUFFER_SIZE,
};
use crate::store::mem::MemStore;

/// Default byte threshold that freezes the active generation: 64 MiB.
pub const DEFAULT_MAX_MEM_STORE_BYTES: usize = 64 * 1024 * 1024;

/// Default upper bound on the time between flushes.
pub const DEFAULT_MAX_FLUSH_LATENCY: Duration = Duration::from_secs(60);

/// Grace period before a superseded durable file is deleted, so in-flight
/// readers can finish streaming it.
const RETIRED_FILE_GRACE: Duration = Duration::from_secs(5 * 60);

/// The flush window widens to this many times the last flush duration.
const FLUSH_WINDOW_FACTOR: u32 = 10;

/// Configuration for a [`RowStore`].
#[derive(Debug, Clone)]
pub struct RowStoreConfig {
    /// Directory holding the durable files. Created at open.
    pub dir: PathBuf,
    /// Accounted-byte threshold that triggers a flush.
    pub max_mem_store_bytes: usize,
    /// Initial period of the flush timer.
    pub max_flush_latency: Duration,
}

impl RowStoreConfig {
    /// Creates a configuration with default thresholds.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_mem_store_bytes: DEFAULT_MAX_MEM_STORE_BYTES,
            max_flush_latency: DEFAULT_MAX_FLUSH_LATENCY,
        }
    }

    /// Sets the byte threshold that triggers a flush.
    pub fn with_max_mem_store_bytes(mut self, bytes: usize) -> Self {
        self.max_mem_store_bytes = bytes;
        self
    }

    /// Sets the initial flush timer period.
    pub fn with_max_flush_latency(mut self, latency: Duration) -> Self {
        self.max_flush_latency = latency;
        self
    }
}

enum IngestMessage {
    Insert(Insert),
    Flush,
}

struct FlushRequest {
    idx: u64,
    snapshot: MemStore,
}

/// State guarded by the single readers/writer lock: the live generations,
/// keyed by creation index, and the current durable file. The file pointer
/// only ever changes by replacement; the frozen generation is retired in
/// the same critical section, so readers never see a torn view.
struct SharedState {
    generations: BTreeMap<u64, MemStore>,
    file: FileStore,
}

/// The write-path, buffering, flush and read-merge engine for one table.
///
/// Rows are keyed by an opaque [`RowKey`]; each row holds one encoded
/// sample sequence per schema field. Inserts buffer in memory, flushes
/// compact the buffer into a single immutable durable file, and iteration
/// merges the file with everything still buffered. Retention is enforced by
/// truncating stale samples on every write, flush and read.
///
/// # Example
///
/// ```rust,ignore
/// use fennec::{DenseCodec, Field, Insert, RowKey, RowStore, RowStoreConfig, Schema};
///
/// let schema = Arc::new(Schema::new(fields, resolution, retention));
/// let store = RowStore::open(schema, RowStoreConfig::new("/var/lib/tsdb/cpu"))?;
///
/// store.insert(Insert::new(key, now_nanos, values))?;
/// store.iterate(|key, columns| {
///     // one call per surviving row
/// })?;
/// ```
pub struct RowStore {
    schema: Arc<Schema>,
    state: Arc<RwLock<SharedState>>,
    ingest: Option<Sender<IngestMessage>>,
    ingest_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,
}

impl RowStore {
    /// Opens a row store over `config.dir`, resuming from the newest
    /// durable file if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] when a threshold is zero and
    /// [`StoreError::Dir`] when the directory cannot be created or listed.
    pub fn open(schema: Arc<Schema>, config: RowStoreConfig) -> Result<Self> {
        if config.max_mem_store_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "max_mem_store_bytes must be greater than zero",
            ));
        }
        if config.max_flush_latency.is_zero() {
            return Err(StoreError::InvalidConfig(
                "max_flush_latency must be greater than zero",
            ));
        }

        fs::create_dir_all(&config.dir).map_err(|source| StoreError::Dir {
            path: config.dir.clone(),
            source,
        })?;
        let existing = latest_data_file(&config.dir).map_err(|source| StoreError::Dir {
            path: config.dir.clone(),
            source,
        })?;
        if let Some(path) = &existing {
            debug!(file = %path.display(), "initializing row store from durable file");
        }

        let state = Arc::new(RwLock::new(SharedState {
            generations: BTreeMap::new(),
            file: FileStore::new(schema.clone(), existing),
        }));

        let (ingest_tx, ingest_rx) = bounded(0);
        let (flush_tx, flush_rx) = bounded(1);
        let (finished_tx, finished_rx) = bounded(1);

        let ingest_loop = IngestLoop {
            schema: schema.clone(),
            state: state.clone(),
            config: config.clone(),
            messages: ingest_rx,
            flushes: flush_tx,
            flush_finished: finished_rx,
        };
        let ingest_handle = thread::Builder::new()
            .name("fennec-ingest".to_string())
            .spawn(move || ingest_loop.run())?;

        let flush_worker = FlushWorker {
            schema: schema.clone(),
            state: state.clone(),
            config,
            requests: flush_rx,
            finished: finished_tx,
        };
        let flush_handle = thread::Builder::new()
            .name("fennec-flush".to_string())
            .spawn(move || flush_worker.run())?;

        Ok(Self {
            schema,
            state,
            ingest: Some(ingest_tx),
            ingest_handle: Some(ingest_handle),
            flush_handle: Some(flush_handle),
        })
    }

    /// The schema this store was opened with.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Hands an insert to the ingest loop. Blocks until the loop accepts
    /// it; the loop applies it asynchronously.
    pub fn insert(&self, insert: Insert) -> Result<()> {
        self.send(IngestMessage::Insert(insert))
    }

    /// Asks the ingest loop to freeze and flush the active generation.
    /// Returns once the request is accepted; the flush itself completes in
    /// the background. A generation with nothing buffered is not flushed.
    pub fn flush(&self) -> Result<()> {
        self.send(IngestMessage::Flush)
    }

    fn send(&self, message: IngestMessage) -> Result<()> {
        let ingest = self.ingest.as_ref().ok_or(StoreError::Closed)?;
        ingest.send(message).map_err(|_| StoreError::Closed)
    }

    /// Calls `on_row` exactly once per surviving key across the union of
    /// the durable file and all live generations.
    ///
    /// The snapshot is point-in-time: the durable-file pointer and shallow
    /// copies of every generation are captured under the read lock, then
    /// the merge runs without further locking. Writes landing after the
    /// snapshot are not observed.
    pub fn iterate(&self, mut on_row: impl FnMut(RowKey, Vec<Sequence>)) -> Result<()> {
        let (file, mut snapshots) = {
            let state = self.state.read();
            let snapshots: Vec<MemStore> =
                state.generations.values().map(MemStore::snapshot).collect();
            (state.file.clone(), snapshots)
        };
        file.iterate(&mut snapshots, &mut |key, columns| {
            on_row(key, columns);
            Ok(())
        })
    }

    /// Number of live in-memory generations (active plus frozen).
    pub fn live_generations(&self) -> usize {
        self.state.read().generations.len()
    }

    /// Path of the current durable file, if one has been written.
    pub fn durable_file(&self) -> Option<PathBuf> {
        self.state.read().file.path().map(Path::to_path_buf)
    }

    /// Shuts the store down: the ingest loop flushes whatever is still
    /// buffered, the flush worker drains, and both threads are joined.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Closing the ingest channel is the shutdown signal; the loop
        // performs a final flush and hangs up on the worker in turn.
        drop(self.ingest.take());
        if let Some(handle) = self.ingest_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.flush_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RowStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The single-threaded ingest worker. Sole owner of the active-generation
/// index and the byte accounting counter; all generation mutation happens
/// here, under the write lock.
struct IngestLoop {
    schema: Arc<Schema>,
    state: Arc<RwLock<SharedState>>,
    config: RowStoreConfig,
    messages: Receiver<IngestMessage>,
    flushes: Sender<FlushRequest>,
    flush_finished: Receiver<Duration>,
}

impl IngestLoop {
    fn run(self) {
        let mut active_idx: u64 = 0;
        let mut mem_bytes: i64 = 0;
        self.state
            .write()
            .generations
            .insert(active_idx, MemStore::new());

        let mut flush_timer = after(self.config.max_flush_latency);
        loop {
            select! {
                recv(self.messages) -> message => match message {
                    Ok(IngestMessage::Insert(insert)) => {
                        self.apply(active_idx, &mut mem_bytes, insert);
                        if mem_bytes >= self.config.max_mem_store_bytes as i64 {
                            self.trigger_flush(&mut active_idx, &mut mem_bytes);
                        }
                    }
                    Ok(IngestMessage::Flush) => {
                        self.trigger_flush(&mut active_idx, &mut mem_bytes);
                    }
                    // Channel closed: the store is shutting down.
                    Err(_) => break,
                },
                recv(flush_timer) -> _ => {
                    self.trigger_flush(&mut active_idx, &mut mem_bytes);
                    // Re-arm unconditionally; an empty-generation tick must
                    // not leave the loop timerless.
                    flush_timer = after(self.config.max_flush_latency);
                },
                recv(self.flush_finished) -> duration => {
                    if let Ok(duration) = duration {
                        flush_timer = after(duration * FLUSH_WINDOW_FACTOR);
                    }
                },
            }
        }

        // Flush anything still buffered before the store goes away.
        self.trigger_flush(&mut active_idx, &mut mem_bytes);
    }

    /// Folds one insert into the active generation.
    fn apply(&self, active_idx: u64, mem_bytes: &mut i64, insert: Insert) {
        let truncate_before = self.schema.truncate_before();
        let fields = self.schema.fields();
        let resolution = self.schema.resolution();

        let mut state = self.state.write();
        let generation = state.generations.entry(active_idx).or_default();

        if !generation.contains_key(&insert.key) {
            *mem_bytes += insert.key.len() as i64;
        }
        let columns = generation.columns_mut(&insert.key);
        // Grow the column vector to the schema width; rows created under an
        // older schema carry fewer slots.
        while columns.len() < fields.len() {
            columns.push(Sequence::empty());
        }
        for (i, field) in fields.iter().enumerate() {
            let previous = columns[i].len() as i64;
            let updated = field.codec().update(
                &columns[i],
                field,
                insert.ts,
                &insert.values,
                resolution,
                truncate_before,
            );
            // Truncation can shrink the sequence, so the delta may be
            // negative.
            *mem_bytes += updated.len() as i64 - previous;
            columns[i] = updated;
        }
    }

    /// Freezes the active generation and hands it to the flush worker.
    fn trigger_flush(&self, active_idx: &mut u64, mem_bytes: &mut i64) {
        if *mem_bytes <= 0 {
            // Nothing to flush.
            return;
        }
        debug!(
            bytes = *mem_bytes,
            generation = *active_idx,
            "requesting flush"
        );

        let request = {
            let mut state = self.state.write();
            let snapshot = state
                .generations
                .get(&*active_idx)
                .map(MemStore::snapshot)
                .unwrap_or_default();
            let frozen_idx = *active_idx;
            *active_idx += 1;
            state
                .generations
                .insert(*active_idx, MemStore::with_capacity(snapshot.len()));
            *mem_bytes = 0;
            FlushRequest {
                idx: frozen_idx,
                snapshot,
            }
        };

        // Sent outside the lock: a full channel blocks here until the
        // worker catches up, which is the intended backpressure, and
        // readers must not stall behind it.
        if self.flushes.send(request).is_err() {
            error!("flush worker unavailable; frozen generation not flushed");
        }
    }
}

/// The single-threaded flush worker. Serialised by its capacity-1 input
/// channel; any I/O failure aborts the process, because a partial file must
/// never replace a good one and there is no recovery log to replay.
struct FlushWorker {
    schema: Arc<Schema>,
    state: Arc<RwLock<SharedState>>,
    config: RowStoreConfig,
    requests: Receiver<FlushRequest>,
    finished: Sender<Duration>,
}

impl FlushWorker {
    fn run(self) {
        for request in self.requests.iter() {
            let started = Instant::now();
            match self.flush(request) {
                Ok((path, size)) => {
                    let elapsed = started.elapsed();
                    debug!(file = %path.display(), ?elapsed, size, "flushed row store");
                    // The loop may already be gone during shutdown.
                    let _ = self.finished.send(elapsed);
                }
                Err(err) => {
                    error!(error = %err, "flush failed; aborting to avoid replacing a good file");
                    process::abort();
                }
            }
        }
    }

    fn flush(&self, request: FlushRequest) -> Result<(PathBuf, u64)> {
        let mut tmp = NamedTempFile::new()?;

        {
            let mut out =
                BufWriter::with_capacity(IO_BUFFER_SIZE, FrameEncoder::new(tmp.as_file_mut()));
            let truncate_before = self.schema.truncate_before();
            let resolution = self.schema.resolution();
            let fields = self.schema.fields();

            let file = self.state.read().file.clone();
            let mut snapshots = [request.snapshot];
            file.iterate(&mut snapshots, &mut |key, mut columns| {
                let mut has_live_sequence = false;
                for (i, column) in columns.iter_mut().enumerate() {
                    *column = fields[i].codec().truncate(column, resolution, truncate_before);
                    if !column.is_empty() {
                        has_live_sequence = true;
                    }
                }
                if !has_live_sequence {
                    // Every sample expired; the row is not persisted.
                    return Ok(());
                }
                write_record(&mut out, &key, &columns).map_err(StoreError::from)
            })?;

            let mut encoder = out
                .into_inner()
                .map_err(|err| StoreError::Io(err.into_error()))?;
            encoder.flush()?;
        }

        let size = tmp.as_file().metadata().map(|m| m.len()).unwrap_or(0);
        tmp.as_file().sync_all()?;

        let path = self.config.dir.join(data_file_name(current_timestamp_nanos()));
        // The rename is the commit point; everything before it is
        // recoverable by discarding the temp file.
        tmp.persist(&path).map_err(|err| StoreError::Io(err.error))?;

        let superseded = {
            let mut state = self.state.write();
            state.generations.remove(&request.idx);
            let old = state.file.path().map(Path::to_path_buf);
            state.file = FileStore::new(self.schema.clone(), Some(path.clone()));
            old
        };
        if let Some(old) = superseded {
            retire_data_file(old);
        }

        Ok((path, size))
    }
}

/// Deletes a superseded durable file after the grace period, from a
/// detached thread. Failure only costs disk space, so it is logged and
/// never escalated.
fn retire_data_file(path: PathBuf) {
    let _ = thread::Builder::new()
        .name("fennec-retire".to_string())
        .spawn(move || {
            thread::sleep(RETIRED_FILE_GRACE);
            if let Err(err) = fs::remove_file(&path) {
                error!(
                    file = %path.display(),
                    error = %err,
                    "unable to delete retired durable file; it still consumes disk space"
                );
            }
        });
}
