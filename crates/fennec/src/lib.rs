//! Fennec - row store engine for an embedded time series database.
//!
//! This crate provides the write path, buffering, flush and read-merge core
//! of a time series table: keyed rows whose values are per-field encoded
//! sample sequences.
//!
//! # Components
//!
//! - [`RowStore`]: ingest pipeline, flush scheduling and merged reads
//! - [`Schema`] / [`Field`]: the table shape the store operates against
//! - [`SampleCodec`]: the per-field sample encoding seam ([`DenseCodec`]
//!   is the built-in reference codec)
//! - [`RowKey`]: opaque row identity that decodes to dimension pairs
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fennec::{DenseCodec, Field, Insert, RowKey, RowStore, RowStoreConfig, Schema};
//!
//! let codec = Arc::new(DenseCodec::new());
//! let schema = Arc::new(Schema::new(
//!     vec![Field::new("requests", codec)],
//!     Duration::from_secs(1),          // resolution
//!     Duration::from_secs(24 * 3600),  // retention
//! ));
//! let store = RowStore::open(schema, RowStoreConfig::new("/var/lib/tsdb/requests"))?;
//!
//! store.insert(Insert::new(key, now_nanos, values))?;
//! store.iterate(|key, columns| {
//!     // exactly one call per surviving row, merged across the durable
//!     // file and every in-memory generation
//! })?;
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod error;
pub mod key;
pub mod schema;
pub mod store;

pub use codec::{DenseCodec, SampleCodec, Sequence};
pub use error::{Result, StoreError};
pub use key::RowKey;
pub use schema::{Field, FieldValues, Insert, Schema, Timestamp};
pub use store::{RowStore, RowStoreConfig};
