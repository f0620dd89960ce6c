//! Sample sequences and the per-field codec seam.
//!
//! A [`Sequence`] is the encoded time series of samples for one field of one
//! row. The store treats sequences as opaque byte buffers: it moves them
//! between memory and disk, and hands them back to the [`SampleCodec`] that
//! produced them whenever samples must be folded in, merged, or expired.
//!
//! The two invariants the store relies on:
//!
//! - codec operations return **new** buffers and never mutate their inputs,
//!   which is what makes shallow generation snapshots safe to read without
//!   a lock;
//! - an **empty** buffer means every sample has expired, and such entries
//!   are dropped rather than persisted or yielded.
//!
//! [`DenseCodec`] is the reference codec: one fixed-width slot per
//! resolution period. Production deployments plug their own encoding in
//! through the trait.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::schema::{Field, FieldValues, Timestamp};

/// An encoded time series of samples for one field of one row.
///
/// Immutable once created; cloning shares the underlying buffer.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Sequence(Bytes);

impl Sequence {
    /// The empty sequence: every sample expired.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Length in bytes of the encoded form.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the sequence holds no samples.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Sequence {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for Sequence {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Sequence {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({} bytes)", self.0.len())
    }
}

/// Per-field sample codec consumed by the row store.
pub trait SampleCodec: Send + Sync {
    /// Bytes per encoded sample.
    fn encoded_width(&self) -> usize;

    /// Folds the sample for `field` out of `values` (observed at `ts`) into
    /// `seq`, dropping samples older than `truncate_before`.
    fn update(
        &self,
        seq: &Sequence,
        field: &Field,
        ts: Timestamp,
        values: &FieldValues,
        resolution: Duration,
        truncate_before: Timestamp,
    ) -> Sequence;

    /// Merges two sequences for the same field. `a` is the older side, `b`
    /// the newer; samples older than `truncate_before` are dropped.
    fn merge(
        &self,
        a: &Sequence,
        b: &Sequence,
        field: &Field,
        resolution: Duration,
        truncate_before: Timestamp,
    ) -> Sequence;

    /// Drops samples older than `truncate_before`. Returns the empty
    /// sequence when none survive.
    fn truncate(&self, seq: &Sequence, resolution: Duration, truncate_before: Timestamp)
        -> Sequence;

    /// Timestamp of the first sample, if any. Consumed by the query layer.
    fn start(&self, seq: &Sequence) -> Option<Timestamp>;
}

/// Byte width of the period-start header.
const HEADER_WIDTH: usize = 8;

/// Byte width of one sample slot: presence flag plus f64 value.
const SLOT_WIDTH: usize = 9;

/// Reference sample codec: one fixed-width slot per resolution period.
///
/// Layout: `start_period i64 BE | slot[0..n)` where each slot is a presence
/// byte followed by an f64 value in big-endian, and slots ascend one
/// resolution period at a time from the header. Sample timestamps are
/// period-aligned. Within a period, the last write wins on `update` and the
/// newer operand wins on `merge`.
///
/// The dense layout suits samples landing in nearby periods; sequences
/// spanning wildly separated periods grow proportionally to the span.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseCodec;

impl DenseCodec {
    /// Creates the reference codec.
    pub fn new() -> Self {
        Self
    }

    /// Decodes the live samples of `seq` as `(period_start, value)` pairs.
    pub fn samples(seq: &Sequence, resolution: Duration) -> Vec<(Timestamp, f64)> {
        Self::decode(seq, resolution).into_iter().collect()
    }

    /// Floors `ts` to the start of its resolution period.
    pub fn period(ts: Timestamp, resolution: Duration) -> Timestamp {
        let step = step_nanos(resolution);
        ts.div_euclid(step) * step
    }

    fn decode(seq: &Sequence, resolution: Duration) -> BTreeMap<Timestamp, f64> {
        let mut samples = BTreeMap::new();
        let bytes = seq.as_bytes();
        if bytes.len() < HEADER_WIDTH {
            return samples;
        }
        let step = step_nanos(resolution);
        let mut period = BigEndian::read_i64(&bytes[..HEADER_WIDTH]);
        for slot in bytes[HEADER_WIDTH..].chunks_exact(SLOT_WIDTH) {
            if slot[0] != 0 {
                samples.insert(period, BigEndian::read_f64(&slot[1..]));
            }
            period += step;
        }
        samples
    }

    fn encode(samples: &BTreeMap<Timestamp, f64>, resolution: Duration) -> Sequence {
        let (first, last) = match (samples.keys().next(), samples.keys().next_back()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Sequence::empty(),
        };
        let step = step_nanos(resolution);
        let slots = ((last - first) / step) as usize + 1;
        let mut bytes = vec![0u8; HEADER_WIDTH + slots * SLOT_WIDTH];
        BigEndian::write_i64(&mut bytes[..HEADER_WIDTH], first);
        for (&period, &value) in samples {
            let offset = HEADER_WIDTH + ((period - first) / step) as usize * SLOT_WIDTH;
            bytes[offset] = 1;
            BigEndian::write_f64(&mut bytes[offset + 1..offset + SLOT_WIDTH], value);
        }
        Sequence::from(bytes)
    }

    fn drop_expired(
        samples: &mut BTreeMap<Timestamp, f64>,
        resolution: Duration,
        truncate_before: Timestamp,
    ) {
        let horizon = Self::period(truncate_before, resolution);
        samples.retain(|&period, _| period >= horizon);
    }
}

fn step_nanos(resolution: Duration) -> i64 {
    resolution.as_nanos().clamp(1, i64::MAX as u128) as i64
}

impl SampleCodec for DenseCodec {
    fn encoded_width(&self) -> usize {
        SLOT_WIDTH
    }

    fn update(
        &self,
        seq: &Sequence,
        field: &Field,
        ts: Timestamp,
        values: &FieldValues,
        resolution: Duration,
        truncate_before: Timestamp,
    ) -> Sequence {
        let mut samples = Self::decode(seq, resolution);
        if let Some(value) = values.get(field.name()) {
            samples.insert(Self::period(ts, resolution), *value);
        }
        Self::drop_expired(&mut samples, resolution, truncate_before);
        Self::encode(&samples, resolution)
    }

    fn merge(
        &self,
        a: &Sequence,
        b: &Sequence,
        _field: &Field,
        resolution: Duration,
        truncate_before: Timestamp,
    ) -> Sequence {
        let mut samples = Self::decode(a, resolution);
        for (period, value) in Self::decode(b, resolution) {
            samples.insert(period, value);
        }
        Self::drop_expired(&mut samples, resolution, truncate_before);
        Self::encode(&samples, resolution)
    }

    fn truncate(
        &self,
        seq: &Sequence,
        resolution: Duration,
        truncate_before: Timestamp,
    ) -> Sequence {
        let mut samples = Self::decode(seq, resolution);
        Self::drop_expired(&mut samples, resolution, truncate_before);
        Self::encode(&samples, resolution)
    }

    fn start(&self, seq: &Sequence) -> Option<Timestamp> {
        let bytes = seq.as_bytes();
        if bytes.len() < HEADER_WIDTH {
            return None;
        }
        Some(BigEndian::read_i64(&bytes[..HEADER_WIDTH]))
    }
}
