//! Property tests for the reference sample codec.
//!
//! The store relies on three codec behaviors: truncation never leaks
//! samples from before the horizon, merge presents every live sample from
//! both sides, and update folds inserts in without losing earlier periods.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fennec::{DenseCodec, Field, FieldValues, SampleCodec, Sequence, Timestamp};
use proptest::prelude::*;

const RES: Duration = Duration::from_secs(1);
const STEP: i64 = 1_000_000_000;

fn field() -> Field {
    Field::new("requests", Arc::new(DenseCodec::new()))
}

fn values(v: f64) -> FieldValues {
    let mut values = FieldValues::new();
    values.insert("requests".to_string(), v);
    values
}

/// Builds a sequence by folding the samples in through `update`.
fn sequence_of(samples: &[(i64, f64)]) -> Sequence {
    let codec = DenseCodec::new();
    let field = field();
    let mut seq = Sequence::empty();
    for &(period, value) in samples {
        seq = codec.update(&seq, &field, period * STEP, &values(value), RES, 0);
    }
    seq
}

/// Samples as `(period index, value)` pairs in nearby periods.
fn samples_strategy() -> impl Strategy<Value = Vec<(i64, f64)>> {
    prop::collection::vec((0_i64..64, -1.0e6_f64..1.0e6), 0..32)
}

proptest! {
    #[test]
    fn truncate_never_leaks_expired_samples(
        samples in samples_strategy(),
        horizon in 0_i64..64,
    ) {
        let codec = DenseCodec::new();
        let seq = sequence_of(&samples);
        let truncated = codec.truncate(&seq, RES, horizon * STEP);

        for (ts, _) in DenseCodec::samples(&truncated, RES) {
            prop_assert!(ts >= horizon * STEP);
        }
        // All samples expired means the empty sequence, never a husk.
        if DenseCodec::samples(&truncated, RES).is_empty() {
            prop_assert!(truncated.is_empty());
        }
    }

    #[test]
    fn merge_is_the_union_of_live_periods(
        left in samples_strategy(),
        right in samples_strategy(),
    ) {
        let codec = DenseCodec::new();
        let a = sequence_of(&left);
        let b = sequence_of(&right);
        let merged = codec.merge(&a, &b, &field(), RES, 0);

        let mut expected: BTreeMap<Timestamp, f64> = BTreeMap::new();
        for (ts, value) in DenseCodec::samples(&a, RES) {
            expected.insert(ts, value);
        }
        // The newer side wins shared periods.
        for (ts, value) in DenseCodec::samples(&b, RES) {
            expected.insert(ts, value);
        }

        let got: BTreeMap<Timestamp, f64> =
            DenseCodec::samples(&merged, RES).into_iter().collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn update_keeps_every_distinct_period(samples in samples_strategy()) {
        let seq = sequence_of(&samples);

        let mut expected: BTreeMap<Timestamp, f64> = BTreeMap::new();
        for &(period, value) in &samples {
            // Later writes to the same period win.
            expected.insert(period * STEP, value);
        }

        let got: BTreeMap<Timestamp, f64> =
            DenseCodec::samples(&seq, RES).into_iter().collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn start_is_the_first_live_period(samples in samples_strategy()) {
        let codec = DenseCodec::new();
        let seq = sequence_of(&samples);
        let first = DenseCodec::samples(&seq, RES).first().map(|&(ts, _)| ts);
        prop_assert_eq!(codec.start(&seq), first);
    }
}
