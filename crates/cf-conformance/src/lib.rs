#![forbid(unsafe_code)]

//! Structural invariant checks shared by the cross-crate test suites, plus
//! the small fixture tables those suites start from.

use std::collections::BTreeSet;

use cf_columnar::{ColumnData, Series};
use cf_frame::{DataFrame, FrameError};
use cf_types::Scalar;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("series '{name}' has {mask} mask bits for {values} values")]
    MaskLength {
        name: String,
        mask: usize,
        values: usize,
    },
    #[error("series '{name}' stores NaN at valid position {position}")]
    ValidNaN { name: String, position: usize },
    #[error("column '{name}' has {len} rows but the frame has {rows}")]
    ColumnLength { name: String, len: usize, rows: usize },
    #[error("index has {index} labels but the frame has {rows} rows")]
    IndexLength { index: usize, rows: usize },
    #[error("column '{0}' appears more than once in the column order")]
    DuplicateColumn(String),
    #[error("column order lists {listed} names but {stored} columns are stored")]
    OrphanColumns { listed: usize, stored: usize },
    #[error("{0:?} is not a permutation of 0..{1}")]
    NotAPermutation(Vec<usize>, usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Check the per-column invariants: mask length equals value length and no
/// valid Float64 cell holds NaN.
pub fn check_series_invariants(series: &Series) -> Result<(), InvariantViolation> {
    if let Some(mask) = series.null_mask() {
        if mask.len() != series.data().len() {
            return Err(InvariantViolation::MaskLength {
                name: series.name().to_owned(),
                mask: mask.len(),
                values: series.data().len(),
            });
        }
    }
    if let ColumnData::Float64(values) = series.data() {
        if let Some(position) = values
            .iter()
            .enumerate()
            .position(|(i, v)| v.is_nan() && series.is_valid(i))
        {
            return Err(InvariantViolation::ValidNaN {
                name: series.name().to_owned(),
                position,
            });
        }
    }
    Ok(())
}

/// Check a frame: unique column order backed by stored columns, every column
/// and the index as long as the row count, and every column well formed.
pub fn check_frame_invariants(frame: &DataFrame) -> Result<(), InvariantViolation> {
    let rows = frame.num_rows();
    let mut seen = BTreeSet::new();
    for name in frame.column_names() {
        if !seen.insert(name.as_str()) {
            return Err(InvariantViolation::DuplicateColumn(name.clone()));
        }
    }
    let stored = frame.columns().count();
    if stored != frame.column_names().len() {
        return Err(InvariantViolation::OrphanColumns {
            listed: frame.column_names().len(),
            stored,
        });
    }
    if frame.index().len() != rows {
        return Err(InvariantViolation::IndexLength {
            index: frame.index().len(),
            rows,
        });
    }
    for series in frame.columns() {
        if series.len() != rows {
            return Err(InvariantViolation::ColumnLength {
                name: series.name().to_owned(),
                len: series.len(),
                rows,
            });
        }
        check_series_invariants(series)?;
    }
    Ok(())
}

pub fn check_permutation(positions: &[usize], len: usize) -> Result<(), InvariantViolation> {
    let mut seen = vec![false; len];
    for &p in positions {
        if p >= len || seen[p] {
            return Err(InvariantViolation::NotAPermutation(positions.to_vec(), len));
        }
        seen[p] = true;
    }
    if positions.len() != len {
        return Err(InvariantViolation::NotAPermutation(positions.to_vec(), len));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// `{k: [1, 1, 2], v: [10.0, 20.0, 30.0]}`
pub fn grouped_values() -> Result<DataFrame, FrameError> {
    DataFrame::new(vec![
        Series::from_i64("k", vec![1, 1, 2]),
        Series::from_f64("v", vec![10.0, 20.0, 30.0]),
    ])
}

/// Single `id` column.
pub fn ids(values: &[i64]) -> Result<DataFrame, FrameError> {
    DataFrame::new(vec![Series::from_i64("id", values.to_vec())])
}

/// Mixed-dtype table with nulls in every column.
pub fn orders() -> Result<DataFrame, FrameError> {
    DataFrame::from_columns(vec![
        (
            "customer",
            vec![
                Scalar::from("ana"),
                Scalar::from("bo"),
                Scalar::from("ana"),
                Scalar::Null,
                Scalar::from("cy"),
            ],
        ),
        (
            "qty",
            vec![
                Scalar::Int64(2),
                Scalar::Int64(1),
                Scalar::Null,
                Scalar::Int64(4),
                Scalar::Int64(3),
            ],
        ),
        (
            "price",
            vec![
                Scalar::Float64(9.5),
                Scalar::Null,
                Scalar::Float64(3.25),
                Scalar::Float64(1.0),
                Scalar::Float64(7.75),
            ],
        ),
        (
            "paid",
            vec![
                Scalar::Bool(true),
                Scalar::Bool(false),
                Scalar::Null,
                Scalar::Bool(true),
                Scalar::Bool(true),
            ],
        ),
    ])
}

#[cfg(test)]
mod tests {
    use cf_columnar::{Bitset, ColumnData, Series};
    use cf_frame::DataFrame;
    use cf_types::Scalar;

    use super::{
        InvariantViolation, check_frame_invariants, check_permutation, check_series_invariants,
        grouped_values, orders,
    };

    #[test]
    fn fixtures_are_well_formed() {
        check_frame_invariants(&grouped_values().expect("grouped")).expect("grouped invariants");
        let orders = orders().expect("orders");
        check_frame_invariants(&orders).expect("orders invariants");
        assert_eq!(orders.shape(), (5, 4));
    }

    #[test]
    fn nan_behind_a_null_bit_is_allowed() {
        let series = Series::with_nulls(
            "x",
            ColumnData::Float64(vec![1.0, f64::NAN]),
            Some(Bitset::from_bools(&[false, true])),
        )
        .expect("series");
        check_series_invariants(&series).expect("masked NaN");
    }

    #[test]
    fn permutation_check() {
        check_permutation(&[2, 0, 1], 3).expect("permutation");
        assert_eq!(
            check_permutation(&[0, 0, 1], 3),
            Err(InvariantViolation::NotAPermutation(vec![0, 0, 1], 3))
        );
        assert!(check_permutation(&[0, 1], 3).is_err());
        assert!(check_permutation(&[0, 3, 1], 3).is_err());
    }

    #[test]
    fn projections_and_copies_keep_invariants() {
        let orders = orders().expect("orders");
        let checks: Vec<DataFrame> = vec![
            orders.select(&["price", "customer"]).expect("select"),
            orders.head(2).expect("head"),
            orders.isna(),
            orders.fill_na(&Scalar::Float64(0.0)).expect("fill"),
        ];
        for frame in &checks {
            check_frame_invariants(frame).expect("invariants");
        }
    }
}
