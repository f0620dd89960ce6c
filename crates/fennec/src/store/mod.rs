//! The row store pipeline: in-memory generations, the durable file, and
//! the merged read path.

mod file;
mod mem;
mod row;

pub use row::{RowStore, RowStoreConfig, DEFAULT_MAX_FLUSH_LATENCY, DEFAULT_MAX_MEM_STORE_BYTES};
