//! The durable row file.
//!
//! A row store owns at most one durable file at a time: an immutable,
//! snappy-framed stream of row records written by the flush worker and
//! replaced wholesale on every flush. There is no header, footer, checksum
//! or index; end-of-stream at a record boundary is the clean terminator,
//! anywhere else is corruption.
//!
//! ## Record framing
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  key_len         u16 BE                                     │
//! │  key             key_len bytes                              │
//! │  num_columns     u16 BE                                     │
//! │  col_len[0..n)   u64 BE each                                │
//! │  col_bytes[0..n) concatenated in column order               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! File names embed the creation time left-padded to 20 digits so that
//! lexicographic order on a directory listing matches creation order.

use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use snap::read::FrameDecoder;
use tracing::trace;

use crate::codec::Sequence;
use crate::error::{Result, StoreError};
use crate::key::RowKey;
use crate::schema::{Schema, Timestamp};
use crate::store::mem::MemStore;

/// Buffer size for reading and writing the durable file.
pub(crate) const IO_BUFFER_SIZE: usize = 64 * 1024;

const DATA_FILE_PREFIX: &str = "filestore_";
const DATA_FILE_SUFFIX: &str = ".dat";

/// Builds a durable file name for the given creation time.
pub(crate) fn data_file_name(unix_nanos: Timestamp) -> String {
    // Left-pad to the widest possible length so lexicographic order matches
    // creation order on a directory listing.
    format!("{DATA_FILE_PREFIX}{unix_nanos:020}{DATA_FILE_SUFFIX}")
}

/// Finds the current durable file at startup: the lexicographically last
/// entry in the directory, or `None` when the directory is empty. No
/// validation happens here; corruption surfaces at first iteration.
pub(crate) fn latest_data_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name());
    }
    names.sort();
    Ok(names.pop().map(|name| dir.join(name)))
}

/// Handle on the current durable file plus the schema needed to merge it
/// with in-memory generations. Cloning shares the schema and copies the
/// path; the file itself is immutable, so clones stay valid until the
/// deferred delete fires.
#[derive(Debug, Clone)]
pub(crate) struct FileStore {
    schema: Arc<Schema>,
    path: Option<PathBuf>,
}

impl FileStore {
    pub(crate) fn new(schema: Arc<Schema>, path: Option<PathBuf>) -> Self {
        Self { schema, path }
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Streams the union of the durable file and the given generation
    /// snapshots, invoking `on_row` exactly once per surviving key.
    ///
    /// File records come first, each fused with every snapshot's entry for
    /// that key (file side as the older operand). Afterwards the remaining
    /// snapshot rows are drained in generation order, each fused with all
    /// later snapshots before emission. Snapshots are consumed destructively
    /// and must not be reused.
    pub(crate) fn iterate(
        &self,
        mem_stores: &mut [MemStore],
        on_row: &mut dyn FnMut(RowKey, Vec<Sequence>) -> Result<()>,
    ) -> Result<()> {
        trace!(
            mem_stores = mem_stores.len(),
            file = ?self.path,
            "iterating row store"
        );
        let truncate_before = self.schema.truncate_before();

        if let Some(path) = &self.path {
            match File::open(path) {
                Ok(file) => {
                    let mut reader =
                        FrameDecoder::new(BufReader::with_capacity(IO_BUFFER_SIZE, file));
                    while let Some((key, mut columns)) = read_record(&mut reader)? {
                        for ms in mem_stores.iter_mut() {
                            if let Some(taken) = ms.remove(&key) {
                                self.merge_columns(&mut columns, taken, truncate_before);
                            }
                        }
                        on_row(key, columns)?;
                    }
                }
                // A deleted or never-written file reads as empty.
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        // Whatever the file didn't claim still lives in the generations.
        // Walk them oldest-first, fusing each row with all newer snapshots
        // so every key is emitted exactly once.
        for i in 0..mem_stores.len() {
            let rows = mem_stores[i].take_rows();
            let (_, newer) = mem_stores.split_at_mut(i + 1);
            for (key, mut columns) in rows {
                for ms in newer.iter_mut() {
                    if let Some(taken) = ms.remove(&key) {
                        self.merge_columns(&mut columns, taken, truncate_before);
                    }
                }
                on_row(key, columns)?;
            }
        }

        Ok(())
    }

    /// Pairwise column fusion: `columns` is the older side and stays in
    /// place, `taken` is folded in through the codec. Columns beyond the
    /// older side's width are appended as-is.
    fn merge_columns(
        &self,
        columns: &mut Vec<Sequence>,
        taken: Vec<Sequence>,
        truncate_before: Timestamp,
    ) {
        let fields = self.schema.fields();
        let resolution = self.schema.resolution();
        for (i, incoming) in taken.into_iter().enumerate() {
            if i >= columns.len() {
                columns.push(incoming);
            } else {
                let field = &fields[i];
                columns[i] = field
                    .codec()
                    .merge(&columns[i], &incoming, field, resolution, truncate_before);
            }
        }
    }
}

/// Writes one framed record.
pub(crate) fn write_record<W: Write>(
    out: &mut W,
    key: &RowKey,
    columns: &[Sequence],
) -> io::Result<()> {
    debug_assert!(key.len() <= u16::MAX as usize);
    out.write_u16::<BigEndian>(key.len() as u16)?;
    out.write_all(key.as_bytes())?;
    out.write_u16::<BigEndian>(columns.len() as u16)?;
    for column in columns {
        out.write_u64::<BigEndian>(column.len() as u64)?;
    }
    for column in columns {
        out.write_all(column.as_bytes())?;
    }
    Ok(())
}

/// Reads one framed record. `Ok(None)` is the clean end of the stream;
/// running out of bytes anywhere inside a record is a corruption fault.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<(RowKey, Vec<Sequence>)>> {
    let mut len_buf = [0u8; 2];
    match reader.read(&mut len_buf[..1]) {
        // End of stream on a record boundary: clean termination.
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(err) => return Err(StoreError::corrupt("key length")(err)),
    }
    reader
        .read_exact(&mut len_buf[1..])
        .map_err(StoreError::corrupt("key length"))?;
    let key_len = u16::from_be_bytes(len_buf) as usize;

    let mut key = vec![0u8; key_len];
    reader
        .read_exact(&mut key)
        .map_err(StoreError::corrupt("key"))?;

    let num_columns = reader
        .read_u16::<BigEndian>()
        .map_err(StoreError::corrupt("column count"))?;

    let mut lengths = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let len = reader
            .read_u64::<BigEndian>()
            .map_err(StoreError::corrupt("column length"))?;
        lengths.push(len as usize);
    }

    let mut columns = Vec::with_capacity(num_columns as usize);
    for len in lengths {
        let mut column = vec![0u8; len];
        reader
            .read_exact(&mut column)
            .map_err(StoreError::corrupt("column bytes"))?;
        columns.push(Sequence::from(column));
    }

    Ok(Some((RowKey::from_bytes(key), columns)))
}
