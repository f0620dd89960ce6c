//! Table schema consumed by the row store.
//!
//! The store itself is schema-agnostic: it needs the ordered field list to
//! size per-row column vectors, the sample resolution to hand to the codec,
//! and the retention horizon to expire old samples. Everything else about a
//! table (expressions, views, virtual fields) lives in the query layer.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::SampleCodec;
use crate::key::RowKey;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Field-name to sample mapping carried by one insert.
///
/// The store never looks inside; each field's codec pulls its own value out.
pub type FieldValues = HashMap<String, f64>;

/// One ingest message: a row key plus per-field samples observed at `ts`.
#[derive(Debug, Clone)]
pub struct Insert {
    /// Row the samples belong to.
    pub key: RowKey,
    /// When the samples were observed, in nanoseconds.
    pub ts: Timestamp,
    /// Per-field sample values.
    pub values: FieldValues,
}

impl Insert {
    /// Creates an insert message.
    pub fn new(key: RowKey, ts: Timestamp, values: FieldValues) -> Self {
        Self { key, ts, values }
    }
}

/// One field of a table: a name plus the codec that encodes its samples.
#[derive(Clone)]
pub struct Field {
    name: String,
    codec: Arc<dyn SampleCodec>,
}

impl Field {
    /// Creates a field backed by the given sample codec.
    pub fn new(name: impl Into<String>, codec: Arc<dyn SampleCodec>) -> Self {
        Self {
            name: name.into(),
            codec,
        }
    }

    /// The field name, as it appears in insert values.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sample codec for this field.
    pub fn codec(&self) -> &dyn SampleCodec {
        self.codec.as_ref()
    }

    /// Bytes per encoded sample for this field.
    pub fn encoded_width(&self) -> usize {
        self.codec.encoded_width()
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("name", &self.name).finish()
    }
}

/// Schema of one table: ordered fields, sample resolution, retention window.
///
/// The retention window is stored atomically so it can be tightened or
/// widened at runtime; the new horizon takes effect on the next write, flush
/// or read.
#[derive(Debug)]
pub struct Schema {
    fields: Vec<Field>,
    resolution: Duration,
    retention_nanos: AtomicU64,
}

impl Schema {
    /// Creates a schema.
    ///
    /// `resolution` is the sample period; `retention` is how far back samples
    /// are kept before being truncated.
    pub fn new(fields: Vec<Field>, resolution: Duration, retention: Duration) -> Self {
        Self {
            fields,
            resolution,
            retention_nanos: AtomicU64::new(duration_nanos(retention)),
        }
    }

    /// The ordered field list.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The sample period.
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// The current retention window.
    pub fn retention(&self) -> Duration {
        Duration::from_nanos(self.retention_nanos.load(Ordering::Relaxed))
    }

    /// Adjusts the retention window.
    pub fn set_retention(&self, retention: Duration) {
        self.retention_nanos
            .store(duration_nanos(retention), Ordering::Relaxed);
    }

    /// The current retention horizon: samples with timestamps before this
    /// are expired and will be truncated on the next write, flush or read.
    pub fn truncate_before(&self) -> Timestamp {
        let retention = self.retention_nanos.load(Ordering::Relaxed);
        let retention = i64::try_from(retention).unwrap_or(i64::MAX);
        current_timestamp_nanos().saturating_sub(retention)
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub(crate) fn current_timestamp_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DenseCodec, SampleCodec};

    #[test]
    fn test_truncate_before_tracks_retention() {
        let schema = Schema::new(vec![], Duration::from_secs(1), Duration::from_secs(3600));
        let horizon = schema.truncate_before();
        let now = current_timestamp_nanos();
        assert!(horizon <= now - Duration::from_secs(3599).as_nanos() as i64);
        assert!(horizon > now - Duration::from_secs(3700).as_nanos() as i64);
    }

    #[test]
    fn test_set_retention_moves_horizon() {
        let schema = Schema::new(vec![], Duration::from_secs(1), Duration::from_secs(3600));
        let wide = schema.truncate_before();
        schema.set_retention(Duration::from_nanos(1));
        let narrow = schema.truncate_before();
        assert!(narrow > wide);
        assert_eq!(schema.retention(), Duration::from_nanos(1));
    }

    #[test]
    fn test_field_width_delegates_to_codec() {
        let field = Field::new("requests", Arc::new(DenseCodec::new()));
        assert_eq!(field.encoded_width(), DenseCodec::new().encoded_width());
        assert_eq!(field.name(), "requests");
    }
}
