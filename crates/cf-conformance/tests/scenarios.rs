#![forbid(unsafe_code)]

//! Worked scenarios that span several crates, from ingestion text through
//! grouping, joining, sorting and windowing.

use cf_columnar::Series;
use cf_conformance::{check_frame_invariants, grouped_values, ids, orders};
use cf_frame::{DataFrame, IngestOptions, SortKey, SortOptions, Transformer};
use cf_groupby::{AggFunc, GroupByExt};
use cf_join::{JoinOptions, JoinType, join};
use cf_types::{DType, Scalar};
use cf_window::{RollingOptions, WindowExt, WindowReducer, rolling_frame};

fn text(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: group sum
// ---------------------------------------------------------------------------

#[test]
fn scenario_group_sum() {
    let frame = grouped_values().expect("fixture");
    let out = frame
        .groupby(&["k"])
        .expect("groupby")
        .agg(&[("v", AggFunc::Sum)])
        .expect("agg");
    assert_eq!(
        out.column("k").expect("k").to_values(),
        vec![Scalar::Int64(1), Scalar::Int64(2)]
    );
    assert_eq!(
        out.column("v").expect("v").to_values(),
        vec![Scalar::Float64(30.0), Scalar::Float64(30.0)]
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: inner and outer join
// ---------------------------------------------------------------------------

#[test]
fn scenario_inner_and_outer_join() {
    let left = ids(&[1, 2, 3]).expect("left");
    let right = ids(&[2, 3, 4]).expect("right");

    let inner = join(&left, &right, &JoinOptions::on(JoinType::Inner, &["id"])).expect("inner");
    assert_eq!(
        inner.column("id").expect("id").to_values(),
        vec![Scalar::Int64(2), Scalar::Int64(3)]
    );

    let outer = join(&left, &right, &JoinOptions::on(JoinType::Outer, &["id"])).expect("outer");
    let mut keys: Vec<i64> = outer
        .column("id")
        .expect("id")
        .iter()
        .filter_map(|s| match s {
            Scalar::Int64(v) => Some(v),
            _ => None,
        })
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![1, 2, 3, 4]);
}

// ---------------------------------------------------------------------------
// Scenario 3: fill and drop nulls
// ---------------------------------------------------------------------------

#[test]
fn scenario_fill_and_drop_na() {
    let series = Series::from_values(
        "x",
        vec![Scalar::Float64(1.0), Scalar::Null, Scalar::Float64(3.0)],
    )
    .expect("series");

    let filled = series.fill_na(&Scalar::Float64(0.0)).expect("fill");
    assert_eq!(
        filled.to_values(),
        vec![Scalar::Float64(1.0), Scalar::Float64(0.0), Scalar::Float64(3.0)]
    );
    assert_eq!(filled.null_count(), 0);

    let dropped = series.drop_na();
    assert_eq!(dropped.len(), 2);
    assert_eq!(
        dropped.to_values(),
        vec![Scalar::Float64(1.0), Scalar::Float64(3.0)]
    );
}

// ---------------------------------------------------------------------------
// Scenario 4: single-key sort
// ---------------------------------------------------------------------------

#[test]
fn scenario_sort_permutation() {
    let frame = DataFrame::new(vec![Series::from_i64("v", vec![3, 1, 2])]).expect("frame");
    let keys = [SortKey::asc("v")];
    assert_eq!(
        frame.argsort(&keys, &SortOptions::default()).expect("argsort"),
        vec![1, 2, 0]
    );
    let sorted = frame.sort_by(&keys, &SortOptions::default()).expect("sort");
    assert_eq!(
        sorted.column("v").expect("v").to_values(),
        vec![Scalar::Int64(1), Scalar::Int64(2), Scalar::Int64(3)]
    );
    assert!(sorted.index().is_default_range());
}

// ---------------------------------------------------------------------------
// Scenario 5: text in, report out
// ---------------------------------------------------------------------------

#[test]
fn scenario_ingest_group_join_sort() {
    let sales = DataFrame::from_text_columns(
        vec![
            ("region", text(&["north", "south", "north", "NA", "south"])),
            ("units", text(&["3", "5", "", "2", "1"])),
            ("price", text(&["2.5", "1.0", "4.0", "3.0", "N/A"])),
        ],
        &IngestOptions::default(),
    )
    .expect("ingest");
    assert_eq!(
        sales.dtypes(),
        vec![
            ("region".to_owned(), DType::Utf8),
            ("units".to_owned(), DType::Int64),
            ("price".to_owned(), DType::Float64),
        ]
    );
    assert_eq!(
        sales.null_counts(),
        vec![
            ("region".to_owned(), 1),
            ("units".to_owned(), 1),
            ("price".to_owned(), 1),
        ]
    );

    // The null region is its own group.
    let totals = sales
        .groupby(&["region"])
        .expect("groupby")
        .agg(&[("units", AggFunc::Sum), ("price", AggFunc::Mean)])
        .expect("agg");
    assert_eq!(totals.num_rows(), 3);
    assert_eq!(totals.value(0, "units").expect("north units"), Scalar::Int64(3));
    assert_eq!(totals.value(2, "region").expect("null region"), Scalar::Null);

    let managers = DataFrame::new(vec![
        Series::from_strings("region", vec!["south", "north"]),
        Series::from_strings("manager", vec!["sam", "nia"]),
    ])
    .expect("managers");

    // ...but a null region never matches in a join.
    let report = join(
        &totals,
        &managers,
        &JoinOptions::on(JoinType::Left, &["region"]).with_indicator(),
    )
    .expect("join")
    .sort_values("units", false)
    .expect("sort");
    check_frame_invariants(&report).expect("report invariants");
    assert_eq!(
        report.column_names(),
        &["region", "units", "price", "manager", "_merge"]
    );
    assert_eq!(report.value(0, "region").expect("top"), Scalar::from("south"));
    assert_eq!(report.value(0, "manager").expect("top"), Scalar::from("sam"));
    assert_eq!(
        report.value(2, "_merge").expect("null region"),
        Scalar::from("left_only")
    );

    let rows = report.to_text_rows("NA");
    assert_eq!(rows[0], text(&["region", "units", "price", "manager", "_merge"]));
    assert_eq!(rows[3][0], "NA");
}

// ---------------------------------------------------------------------------
// Scenario 6: windows over a frame
// ---------------------------------------------------------------------------

#[test]
fn scenario_rolling_over_frame_columns() {
    let frame = DataFrame::new(vec![
        Series::from_strings("day", vec!["mon", "tue", "wed", "thu"]),
        Series::from_f64("temp", vec![10.0, 12.0, 14.0, 16.0]),
    ])
    .expect("frame");
    let smoothed = rolling_frame(
        &frame,
        &["temp"],
        RollingOptions::new(2),
        WindowReducer::Mean,
    )
    .expect("rolling");
    assert_eq!(smoothed.column("day").expect("day"), frame.column("day").expect("day"));
    assert_eq!(
        smoothed.column("temp").expect("temp").to_values(),
        vec![
            Scalar::Null,
            Scalar::Float64(11.0),
            Scalar::Float64(13.0),
            Scalar::Float64(15.0)
        ]
    );

    let temp = frame.column("temp").expect("temp");
    let centered = temp
        .rolling(RollingOptions::new(3).min_periods(1).centered())
        .expect("rolling")
        .max()
        .expect("max");
    assert_eq!(
        centered.to_values(),
        vec![
            Scalar::Float64(12.0),
            Scalar::Float64(14.0),
            Scalar::Float64(16.0),
            Scalar::Float64(16.0)
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario 7: fit on one frame, transform another
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MissingPrice {
    fill: Option<f64>,
}

impl Transformer for MissingPrice {
    fn fit(&mut self, frame: &DataFrame) -> Result<(), cf_frame::FrameError> {
        self.fill = Some(frame.column("price")?.median()?);
        Ok(())
    }

    fn transform(&self, frame: &DataFrame) -> Result<DataFrame, cf_frame::FrameError> {
        let fill = self.fill.ok_or_else(|| {
            cf_frame::FrameError::InvalidArgument("transform before fit".to_owned())
        })?;
        frame.fill_na_columns(&[("price", Scalar::Float64(fill))])
    }
}

#[test]
fn scenario_transformer_fills_from_training_statistics() {
    let train = orders().expect("orders");
    let mut imputer = MissingPrice::default();
    assert!(imputer.transform(&train).is_err());

    let out = imputer.fit_transform(&train).expect("fit_transform");
    assert_eq!(out.column("price").expect("price").null_count(), 0);
    // median of [9.5, 3.25, 1.0, 7.75]
    assert_eq!(out.value(1, "price").expect("filled"), Scalar::Float64(5.5));
    assert_eq!(out.column("qty").expect("qty").null_count(), 1);
}
