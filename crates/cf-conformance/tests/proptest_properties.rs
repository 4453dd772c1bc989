#![forbid(unsafe_code)]

//! Property-based checks of the engine-wide behavioral guarantees: filter
//! identity, sort idempotence, group sizes, join null safety and
//! cardinality, and the degenerate rolling window.

use proptest::prelude::*;

use cf_columnar::Series;
use cf_conformance::{check_frame_invariants, check_permutation};
use cf_frame::{DataFrame, SortKey, SortOptions};
use cf_groupby::GroupByExt;
use cf_join::{JoinOptions, JoinType, join};
use cf_types::{DType, Scalar};
use cf_window::{RollingOptions, WindowExt};

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// Small key domain so joins and groups see plenty of duplicates.
fn arb_key() -> impl Strategy<Value = Option<i64>> {
    prop_oneof![
        5 => (0i64..5).prop_map(Some),
        1 => Just(None),
    ]
}

fn arb_value() -> impl Strategy<Value = Option<f64>> {
    prop_oneof![
        5 => (-1e6_f64..1e6_f64).prop_map(Some),
        1 => Just(None),
    ]
}

fn arb_rows(max_len: usize) -> impl Strategy<Value = Vec<(Option<i64>, Option<f64>)>> {
    proptest::collection::vec((arb_key(), arb_value()), 0..=max_len)
}

fn keyed_frame(rows: &[(Option<i64>, Option<f64>)], value_name: &str) -> DataFrame {
    let keys = rows.iter().map(|(k, _)| Scalar::from(*k)).collect();
    let values = rows.iter().map(|(_, v)| Scalar::from(*v)).collect();
    DataFrame::new(vec![
        Series::from_values_with_dtype("k", DType::Int64, keys).expect("keys"),
        Series::from_values_with_dtype(value_name, DType::Float64, values).expect("values"),
    ])
    .expect("frame")
}

fn matching_pairs(
    left: &[(Option<i64>, Option<f64>)],
    right: &[(Option<i64>, Option<f64>)],
) -> usize {
    left.iter()
        .map(|(lk, _)| {
            right
                .iter()
                .filter(|(rk, _)| lk.is_some() && lk == rk)
                .count()
        })
        .sum()
}

fn unmatched(
    side: &[(Option<i64>, Option<f64>)],
    other: &[(Option<i64>, Option<f64>)],
) -> usize {
    side.iter()
        .filter(|(k, _)| k.is_none() || other.iter().all(|(o, _)| o != k))
        .count()
}

// ---------------------------------------------------------------------------
// Selection and sort
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// An always-true filter keeps every row; an always-false one keeps none.
    #[test]
    fn prop_filter_identity(rows in arb_rows(30)) {
        let frame = keyed_frame(&rows, "v");
        let all = frame.filter(|_| true).expect("filter all");
        prop_assert_eq!(all.num_rows(), frame.num_rows());
        prop_assert_eq!(&all, &frame);
        let none = frame.filter(|_| false).expect("filter none");
        prop_assert_eq!(none.num_rows(), 0);
        prop_assert_eq!(none.column_names(), frame.column_names());
        check_frame_invariants(&none).expect("empty invariants");
    }

    /// Re-sorting a sorted table by the same keys leaves the rows in place.
    #[test]
    fn prop_sort_is_idempotent(rows in arb_rows(30), stable in any::<bool>()) {
        let frame = keyed_frame(&rows, "v");
        let keys = [SortKey::asc("k"), SortKey::desc("v")];
        let options = SortOptions { stable, ..SortOptions::default() };
        let order = frame.argsort(&keys, &options).expect("argsort");
        check_permutation(&order, frame.num_rows()).expect("permutation");

        let once = frame.sort_by(&keys, &options).expect("sort");
        let twice = once.sort_by(&keys, &options).expect("resort");
        prop_assert_eq!(&once, &twice);
        check_frame_invariants(&once).expect("sorted invariants");
    }
}

// ---------------------------------------------------------------------------
// GroupBy
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Group sizes add up to the source row count, null-key group included.
    #[test]
    fn prop_group_sizes_sum_to_rows(rows in arb_rows(40)) {
        let frame = keyed_frame(&rows, "v");
        let sizes = frame.groupby(&["k"]).expect("groupby").size().expect("size");
        let total: i64 = sizes
            .column("size")
            .expect("size column")
            .iter()
            .map(|s| match s {
                Scalar::Int64(n) => n,
                other => panic!("size must be Int64, got {other:?}"),
            })
            .sum();
        prop_assert_eq!(total as usize, rows.len());
        check_frame_invariants(&sizes).expect("size invariants");
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Null keys never match, not even each other.
    #[test]
    fn prop_inner_join_never_matches_null_keys(left in arb_rows(20), right in arb_rows(20)) {
        let out = join(
            &keyed_frame(&left, "lv"),
            &keyed_frame(&right, "rv"),
            &JoinOptions::on(JoinType::Inner, &["k"]),
        )
        .expect("inner join");
        prop_assert_eq!(out.column("k").expect("key").null_count(), 0);
        prop_assert_eq!(out.num_rows(), matching_pairs(&left, &right));
        check_frame_invariants(&out).expect("inner invariants");
    }

    /// Outer rows = matched pairs + unmatched left + unmatched right.
    #[test]
    fn prop_outer_join_cardinality(left in arb_rows(20), right in arb_rows(20)) {
        let out = join(
            &keyed_frame(&left, "lv"),
            &keyed_frame(&right, "rv"),
            &JoinOptions::on(JoinType::Outer, &["k"]).with_indicator(),
        )
        .expect("outer join");
        let expected = matching_pairs(&left, &right)
            + unmatched(&left, &right)
            + unmatched(&right, &left);
        prop_assert_eq!(out.num_rows(), expected);
        check_frame_invariants(&out).expect("outer invariants");
    }

    /// Left joins keep every probe row at least once.
    #[test]
    fn prop_left_join_keeps_left_rows(left in arb_rows(20), right in arb_rows(20)) {
        let out = join(
            &keyed_frame(&left, "lv"),
            &keyed_frame(&right, "rv"),
            &JoinOptions::on(JoinType::Left, &["k"]),
        )
        .expect("left join");
        prop_assert_eq!(
            out.num_rows(),
            matching_pairs(&left, &right) + unmatched(&left, &right)
        );
    }

    #[test]
    fn prop_cross_join_cardinality(left in arb_rows(12), right in arb_rows(12)) {
        let out = join(
            &keyed_frame(&left, "lv"),
            &keyed_frame(&right, "rv"),
            &JoinOptions::cross(),
        )
        .expect("cross join");
        prop_assert_eq!(out.num_rows(), left.len() * right.len());
        prop_assert_eq!(out.num_columns(), 4);
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A one-row rolling mean reproduces the input, nulls included.
    #[test]
    fn prop_rolling_mean_size_one_is_identity(rows in arb_rows(40)) {
        let frame = keyed_frame(&rows, "v");
        let source = frame.column("v").expect("v");
        let rolled = source
            .rolling(RollingOptions::new(1))
            .expect("rolling")
            .mean()
            .expect("mean");
        prop_assert_eq!(rolled.to_values(), source.to_values());
    }
}
