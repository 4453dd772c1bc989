#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use cf_columnar::{Bitset, ColumnData, ColumnError, Series};
use cf_index::{Index, IndexError, IndexLabel};
use cf_types::{DType, Scalar, TypeError, cast_scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outward error taxonomy of the table engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("column '{0}' not found")]
    ColumnNotFound(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("position {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("shared frame lock poisoned by a panicked writer")]
    LockPoisoned,
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl From<ColumnError> for FrameError {
    fn from(err: ColumnError) -> Self {
        match err {
            ColumnError::LengthMismatch { .. } | ColumnError::MaskLengthMismatch { .. } => {
                Self::InvalidShape(err.to_string())
            }
            ColumnError::IndexOutOfBounds { index, len } => Self::IndexOutOfBounds { index, len },
            ColumnError::NonNumeric { .. } | ColumnError::InvalidArgument(_) => {
                Self::InvalidArgument(err.to_string())
            }
            ColumnError::Type(inner) => Self::Type(inner),
        }
    }
}

impl From<IndexError> for FrameError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::LabelNotFound { label } => Self::KeyNotFound(label),
            IndexError::PositionOutOfBounds { position, len } => Self::IndexOutOfBounds {
                index: position,
                len,
            },
            IndexError::InvalidStep
            | IndexError::UnsortedTimestamps { .. }
            | IndexError::NotTimestampIndex => Self::InvalidArgument(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

pub const DEFAULT_NA_TOKENS: [&str; 8] = ["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

/// How text cells become typed, nullable columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    /// Cells equal to any of these (after optional trimming) are null.
    pub na_tokens: Vec<String>,
    /// When false every column is ingested as Utf8.
    pub infer_dtypes: bool,
    pub trim: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            na_tokens: DEFAULT_NA_TOKENS.iter().map(|t| (*t).to_owned()).collect(),
            infer_dtypes: true,
            trim: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropNaHow {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropNaOptions {
    pub how: DropNaHow,
    /// Columns to inspect; `None` inspects every column.
    pub subset: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Where nulls land, independent of [`SortDirection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPlacement {
    First,
    #[default]
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortOptions {
    pub nulls: NullPlacement,
    /// Residual ties keep their original relative order.
    pub stable: bool,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            nulls: NullPlacement::Last,
            stable: true,
        }
    }
}

// ---------------------------------------------------------------------------
// DataFrame
// ---------------------------------------------------------------------------

/// Ordered, equal-length named columns sharing one row [`Index`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    index: Index,
    columns: BTreeMap<String, Series>,
    column_order: Vec<String>,
}

impl Default for DataFrame {
    fn default() -> Self {
        Self::empty()
    }
}

/// Borrowed view of one row, handed to [`DataFrame::filter`] predicates.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    frame: &'a DataFrame,
    row: usize,
}

impl RowRef<'_> {
    #[must_use]
    pub fn position(&self) -> usize {
        self.row
    }

    #[must_use]
    pub fn label(&self) -> Option<IndexLabel> {
        self.frame.index.label_at(self.row)
    }

    /// Cell value, `Some(Scalar::Null)` for a null cell, `None` for an
    /// unknown column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Scalar> {
        self.frame.columns.get(column).map(|s| s.value(self.row))
    }

    #[must_use]
    pub fn f64(&self, column: &str) -> Option<f64> {
        self.frame.columns.get(column).and_then(|s| s.f64_at(self.row))
    }

    #[must_use]
    pub fn is_null(&self, column: &str) -> bool {
        self.frame
            .columns
            .get(column)
            .is_none_or(|s| s.is_null(self.row))
    }
}

fn normalize_iloc_position(position: i64, len: usize) -> Result<usize, FrameError> {
    let len_i = len as i64;
    let normalized = if position < 0 { len_i + position } else { position };
    if normalized < 0 || normalized >= len_i {
        return Err(FrameError::IndexOutOfBounds {
            index: position.unsigned_abs() as usize,
            len,
        });
    }
    Ok(normalized as usize)
}

impl DataFrame {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            index: Index::default_range(0),
            columns: BTreeMap::new(),
            column_order: Vec::new(),
        }
    }

    /// Build from series with a default range index. Lengths must agree
    /// and names must be unique.
    pub fn new(columns: Vec<Series>) -> Result<Self, FrameError> {
        let rows = columns.first().map_or(0, Series::len);
        Self::with_index(columns, Index::default_range(rows))
    }

    pub fn with_index(columns: Vec<Series>, index: Index) -> Result<Self, FrameError> {
        let rows = index.len();
        let mut map = BTreeMap::new();
        let mut order = Vec::with_capacity(columns.len());
        for series in columns {
            if series.len() != rows {
                return Err(FrameError::InvalidShape(format!(
                    "column '{}' has length {} but the frame has {rows} rows",
                    series.name(),
                    series.len()
                )));
            }
            let name = series.name().to_owned();
            if map.insert(name.clone(), series).is_some() {
                return Err(FrameError::InvalidArgument(format!(
                    "duplicate column name '{name}'"
                )));
            }
            order.push(name);
        }
        Ok(Self {
            index,
            columns: map,
            column_order: order,
        })
    }

    /// Build from dynamically-typed cell vectors, inferring each dtype.
    pub fn from_columns<S: Into<String>>(data: Vec<(S, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let mut series = Vec::with_capacity(data.len());
        for (name, values) in data {
            series.push(Series::from_values(name, values)?);
        }
        Self::new(series)
    }

    // ── Shape and metadata ─────────────────────────────────────────────

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.column_order.len()
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows(), self.num_columns())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    /// Columns in display order.
    pub fn columns(&self) -> impl Iterator<Item = &Series> + '_ {
        self.column_order
            .iter()
            .filter_map(|name| self.columns.get(name))
    }

    #[must_use]
    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Result<&Series, FrameError> {
        self.columns
            .get(name)
            .ok_or_else(|| FrameError::ColumnNotFound(name.to_owned()))
    }

    #[must_use]
    pub fn dtypes(&self) -> Vec<(String, DType)> {
        self.columns()
            .map(|s| (s.name().to_owned(), s.dtype()))
            .collect()
    }

    /// `(value, valid)` at a cell.
    pub fn get(&self, row: usize, column: &str) -> Result<(Scalar, bool), FrameError> {
        let series = self.column(column)?;
        if row >= self.num_rows() {
            return Err(FrameError::IndexOutOfBounds {
                index: row,
                len: self.num_rows(),
            });
        }
        Ok(series.get(row))
    }

    pub fn value(&self, row: usize, column: &str) -> Result<Scalar, FrameError> {
        Ok(match self.get(row, column)? {
            (value, true) => value,
            (_, false) => Scalar::Null,
        })
    }

    fn require_columns(&self, names: &[&str]) -> Result<(), FrameError> {
        match names.iter().find(|name| !self.columns.contains_key(**name)) {
            Some(missing) => Err(FrameError::ColumnNotFound((*missing).to_owned())),
            None => Ok(()),
        }
    }

    fn rebuild(&self, index: Index, columns: Vec<Series>) -> Self {
        let column_order = columns.iter().map(|s| s.name().to_owned()).collect();
        let columns = columns
            .into_iter()
            .map(|s| (s.name().to_owned(), s))
            .collect();
        Self {
            index,
            columns,
            column_order,
        }
    }

    // ── Selection ──────────────────────────────────────────────────────

    /// Projection onto `names`, in request order. The result aliases the
    /// source column storage.
    pub fn select(&self, names: &[&str]) -> Result<Self, FrameError> {
        self.require_columns(names)?;
        let mut seen = BTreeSet::new();
        let mut picked = Vec::with_capacity(names.len());
        for &name in names {
            if !seen.insert(name) {
                return Err(FrameError::InvalidArgument(format!(
                    "duplicate column selector '{name}'"
                )));
            }
            picked.push(self.columns[name].clone());
        }
        Ok(self.rebuild(self.index.clone(), picked))
    }

    /// Rows for which `predicate` holds, in original order, copied into
    /// fresh storage.
    pub fn filter<F>(&self, mut predicate: F) -> Result<Self, FrameError>
    where
        F: FnMut(&RowRef<'_>) -> bool,
    {
        let positions: Vec<usize> = (0..self.num_rows())
            .filter(|&row| predicate(&RowRef { frame: self, row }))
            .collect();
        self.take(&positions)
    }

    /// Rows whose bit is set in `keep`.
    pub fn filter_mask(&self, keep: &Bitset) -> Result<Self, FrameError> {
        if keep.len() != self.num_rows() {
            return Err(FrameError::InvalidShape(format!(
                "mask length {} does not match row count {}",
                keep.len(),
                self.num_rows()
            )));
        }
        let positions: Vec<usize> = keep.iter_ones().collect();
        self.take(&positions)
    }

    /// Gather rows by position (duplicates allowed) into fresh storage.
    pub fn take(&self, positions: &[usize]) -> Result<Self, FrameError> {
        let index = self.index.take(positions)?;
        let mut columns = Vec::with_capacity(self.num_columns());
        for series in self.columns() {
            columns.push(series.take(positions)?);
        }
        Ok(self.rebuild(index, columns))
    }

    /// Position-based selection; negative positions count from the end.
    pub fn iloc(&self, positions: &[i64]) -> Result<Self, FrameError> {
        let rows = self.num_rows();
        let resolved = positions
            .iter()
            .map(|&p| normalize_iloc_position(p, rows))
            .collect::<Result<Vec<_>, _>>()?;
        self.take(&resolved)
    }

    /// Label-based selection resolved through the index. A duplicated label
    /// returns every row carrying it.
    pub fn loc(&self, labels: &[IndexLabel]) -> Result<Self, FrameError> {
        let positions = self.index.resolve(labels)?;
        self.take(&positions)
    }

    /// Rows whose timestamp label lies in `[lo, hi]`.
    pub fn loc_time_range(&self, lo: i64, hi: i64) -> Result<Self, FrameError> {
        let range = self.index.time_range(lo, hi)?;
        self.slice(range.start, range.end)
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<Self, FrameError> {
        let index = self.index.slice(start, end)?;
        let mut columns = Vec::with_capacity(self.num_columns());
        for series in self.columns() {
            columns.push(series.slice(start, end)?);
        }
        Ok(self.rebuild(index, columns))
    }

    /// First `n` rows (all rows when `n` exceeds the row count).
    pub fn head(&self, n: usize) -> Result<Self, FrameError> {
        self.slice(0, n.min(self.num_rows()))
    }

    /// Last `n` rows.
    pub fn tail(&self, n: usize) -> Result<Self, FrameError> {
        let rows = self.num_rows();
        self.slice(rows - n.min(rows), rows)
    }

    // ── Column management ──────────────────────────────────────────────

    /// Add `series`, or replace the same-named column in place.
    pub fn with_column(&self, series: Series) -> Result<Self, FrameError> {
        if series.len() != self.num_rows() && !(self.column_order.is_empty() && self.is_empty()) {
            return Err(FrameError::InvalidShape(format!(
                "column '{}' has length {} but the frame has {} rows",
                series.name(),
                series.len(),
                self.num_rows()
            )));
        }
        let mut out = self.clone();
        if out.column_order.is_empty() {
            out.index = Index::default_range(series.len());
        }
        let name = series.name().to_owned();
        if out.columns.insert(name.clone(), series).is_none() {
            out.column_order.push(name);
        }
        Ok(out)
    }

    pub fn drop_columns(&self, names: &[&str]) -> Result<Self, FrameError> {
        self.require_columns(names)?;
        let mut out = self.clone();
        for &name in names {
            out.columns.remove(name);
        }
        out.column_order.retain(|name| out.columns.contains_key(name));
        Ok(out)
    }

    /// Rename columns by `(old, new)` pairs. The renamed set must stay
    /// free of duplicates.
    pub fn rename_columns(&self, renames: &[(&str, &str)]) -> Result<Self, FrameError> {
        let olds: Vec<&str> = renames.iter().map(|(old, _)| *old).collect();
        self.require_columns(&olds)?;
        let mut order = self.column_order.clone();
        for (old, new) in renames {
            if let Some(slot) = order.iter_mut().find(|name| name.as_str() == *old) {
                *slot = (*new).to_owned();
            }
        }
        let unique: BTreeSet<&String> = order.iter().collect();
        if unique.len() != order.len() {
            return Err(FrameError::InvalidArgument(
                "rename would produce duplicate column names".to_owned(),
            ));
        }
        let columns = self
            .column_order
            .iter()
            .zip(&order)
            .map(|(old, new)| self.columns[old].clone().with_name(new.clone()))
            .collect();
        Ok(self.rebuild(self.index.clone(), columns))
    }

    /// Replace the index. The new index must have one label per row.
    pub fn with_index_values(&self, index: Index) -> Result<Self, FrameError> {
        let mut out = self.clone();
        out.replace_index(index)?;
        Ok(out)
    }

    /// In-place index assignment.
    pub fn replace_index(&mut self, index: Index) -> Result<(), FrameError> {
        if index.len() != self.num_rows() {
            return Err(FrameError::InvalidShape(format!(
                "index length {} does not match row count {}",
                index.len(),
                self.num_rows()
            )));
        }
        self.index = index;
        Ok(())
    }

    /// Promote an Int64 or Utf8 column to the row index.
    pub fn set_index(&self, column: &str, drop: bool) -> Result<Self, FrameError> {
        let series = self.column(column)?;
        if series.has_nulls() {
            return Err(FrameError::InvalidArgument(format!(
                "index column '{column}' contains nulls"
            )));
        }
        let index = match series.data() {
            ColumnData::Int64(values) => Index::from_i64(values.clone()),
            ColumnData::Utf8(values) => Index::from_utf8(values.clone()),
            other => {
                return Err(FrameError::InvalidArgument(format!(
                    "cannot index by {} column '{column}'",
                    other.dtype()
                )));
            }
        };
        let base = if drop { self.drop_columns(&[column])? } else { self.clone() };
        base.with_index_values(index)
    }

    /// Promote an Int64 column of epoch nanoseconds to a timestamp index.
    pub fn set_time_index(&self, column: &str, drop: bool) -> Result<Self, FrameError> {
        let series = self.column(column)?;
        let ColumnData::Int64(values) = series.data() else {
            return Err(FrameError::InvalidArgument(format!(
                "timestamp index column '{column}' must be int64"
            )));
        };
        if series.has_nulls() {
            return Err(FrameError::InvalidArgument(format!(
                "index column '{column}' contains nulls"
            )));
        }
        let index = Index::timestamps(values.clone())?;
        let base = if drop { self.drop_columns(&[column])? } else { self.clone() };
        base.with_index_values(index)
    }

    /// Move the index into a leading column named `name` and reset to a
    /// default range.
    pub fn reset_index(&self, name: &str) -> Result<Self, FrameError> {
        if self.contains_column(name) {
            return Err(FrameError::InvalidArgument(format!(
                "column '{name}' already exists"
            )));
        }
        let labels = self.index.to_labels();
        let all_int = labels
            .iter()
            .all(|l| matches!(l, IndexLabel::Int64(_) | IndexLabel::Timestamp(_)));
        let series = if all_int {
            Series::from_i64(
                name,
                labels
                    .iter()
                    .map(|l| match l {
                        IndexLabel::Int64(v) | IndexLabel::Timestamp(v) => *v,
                        IndexLabel::Utf8(_) => 0,
                    })
                    .collect(),
            )
        } else {
            Series::from_strings(name, labels.iter().map(ToString::to_string).collect())
        };
        let mut columns = vec![series];
        columns.extend(self.columns().cloned());
        Ok(self.rebuild(Index::default_range(self.num_rows()), columns))
    }

    // ── In-place mutators ──────────────────────────────────────────────
    //
    // A column aliased by a projection detaches on first write, so the
    // frame it was selected from is never changed.

    pub fn set_cell(&mut self, row: usize, column: &str, value: Scalar) -> Result<(), FrameError> {
        let series = self
            .columns
            .get_mut(column)
            .ok_or_else(|| FrameError::ColumnNotFound(column.to_owned()))?;
        series.set(row, value)?;
        Ok(())
    }

    pub fn set_null(&mut self, row: usize, column: &str) -> Result<(), FrameError> {
        let series = self
            .columns
            .get_mut(column)
            .ok_or_else(|| FrameError::ColumnNotFound(column.to_owned()))?;
        series.set_null(row)?;
        Ok(())
    }

    // ── Missing values ─────────────────────────────────────────────────

    #[must_use]
    pub fn null_counts(&self) -> Vec<(String, usize)> {
        self.columns()
            .map(|s| (s.name().to_owned(), s.null_count()))
            .collect()
    }

    /// Boolean frame marking null cells.
    #[must_use]
    pub fn isna(&self) -> Self {
        let rows = self.num_rows();
        let columns = self
            .columns()
            .map(|s| Series::from_bool(s.name(), (0..rows).map(|row| s.is_null(row)).collect()))
            .collect();
        self.rebuild(self.index.clone(), columns)
    }

    /// Fill nulls with `fill` in every column whose dtype accepts it;
    /// other columns pass through unchanged.
    pub fn fill_na(&self, fill: &Scalar) -> Result<Self, FrameError> {
        if fill.is_missing() {
            return Err(FrameError::InvalidArgument(
                "fill value must not be missing".to_owned(),
            ));
        }
        let mut columns = Vec::with_capacity(self.num_columns());
        for series in self.columns() {
            if series.has_nulls() && cast_scalar(fill, series.dtype()).is_ok() {
                columns.push(series.fill_na(fill)?);
            } else {
                columns.push(series.clone());
            }
        }
        Ok(self.rebuild(self.index.clone(), columns))
    }

    /// Per-column fills; every named column must exist and accept its fill.
    pub fn fill_na_columns(&self, fills: &[(&str, Scalar)]) -> Result<Self, FrameError> {
        let names: Vec<&str> = fills.iter().map(|(name, _)| *name).collect();
        self.require_columns(&names)?;
        for (name, fill) in fills {
            cast_scalar(fill, self.columns[*name].dtype())?;
        }
        let mut out = self.clone();
        for (name, fill) in fills {
            let filled = self.columns[*name].fill_na(fill)?;
            out.columns.insert((*name).to_owned(), filled);
        }
        Ok(out)
    }

    /// Drop rows with nulls in the inspected columns.
    pub fn drop_na(&self, options: &DropNaOptions) -> Result<Self, FrameError> {
        let inspected: Vec<&Series> = match &options.subset {
            Some(names) => {
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                self.require_columns(&refs)?;
                refs.iter().map(|name| &self.columns[*name]).collect()
            }
            None => self.columns().collect(),
        };
        let keep: Bitset = (0..self.num_rows())
            .map(|row| {
                let mut nulls = inspected.iter().filter(|s| s.is_null(row));
                match options.how {
                    DropNaHow::Any => nulls.next().is_none(),
                    DropNaHow::All => {
                        inspected.is_empty() || nulls.count() < inspected.len()
                    }
                }
            })
            .collect();
        self.filter_mask(&keep)
    }

    // ── Sort engine ────────────────────────────────────────────────────

    /// Row permutation ordering the frame by `keys`.
    pub fn argsort(&self, keys: &[SortKey], options: &SortOptions) -> Result<Vec<usize>, FrameError> {
        if keys.is_empty() {
            return Err(FrameError::InvalidArgument(
                "sort requires at least one key".to_owned(),
            ));
        }
        let resolved = keys
            .iter()
            .map(|key| Ok((self.column(&key.column)?, key.direction)))
            .collect::<Result<Vec<_>, FrameError>>()?;

        let mut order: Vec<usize> = (0..self.num_rows()).collect();
        let compare = |&a: &usize, &b: &usize| compare_rows(&resolved, options.nulls, a, b);
        if options.stable {
            order.sort_by(compare);
        } else {
            order.sort_unstable_by(compare);
        }
        log::debug!(
            "sort: rows={} keys={} stable={}",
            order.len(),
            keys.len(),
            options.stable
        );
        Ok(order)
    }

    /// Rows reordered by `keys`; the index resets to a default range.
    pub fn sort_by(&self, keys: &[SortKey], options: &SortOptions) -> Result<Self, FrameError> {
        let order = self.argsort(keys, options)?;
        let mut columns = Vec::with_capacity(self.num_columns());
        for series in self.columns() {
            columns.push(series.take(&order)?);
        }
        Ok(self.rebuild(Index::default_range(order.len()), columns))
    }

    /// Single-key stable sort with nulls last.
    pub fn sort_values(&self, column: &str, ascending: bool) -> Result<Self, FrameError> {
        let key = if ascending {
            SortKey::asc(column)
        } else {
            SortKey::desc(column)
        };
        self.sort_by(&[key], &SortOptions::default())
    }

    // ── Reshape ────────────────────────────────────────────────────────

    /// Unpivot `value_vars` into `(variable, value)` rows, repeating
    /// `id_vars`. An empty `value_vars` melts every non-id column.
    pub fn melt(
        &self,
        id_vars: &[&str],
        value_vars: &[&str],
        var_name: &str,
        value_name: &str,
    ) -> Result<Self, FrameError> {
        self.require_columns(id_vars)?;
        self.require_columns(value_vars)?;
        let melted: Vec<&str> = if value_vars.is_empty() {
            self.column_order
                .iter()
                .map(String::as_str)
                .filter(|name| !id_vars.contains(name))
                .collect()
        } else {
            value_vars.to_vec()
        };
        if melted.is_empty() {
            return Err(FrameError::InvalidArgument(
                "melt needs at least one value column".to_owned(),
            ));
        }
        if id_vars.contains(&var_name) || id_vars.contains(&value_name) || var_name == value_name {
            return Err(FrameError::InvalidArgument(
                "melt output column names collide".to_owned(),
            ));
        }

        let rows = self.num_rows();
        let repeat: Vec<usize> = (0..melted.len()).flat_map(|_| 0..rows).collect();
        let mut columns = Vec::with_capacity(id_vars.len() + 2);
        for &id in id_vars {
            columns.push(self.columns[id].take(&repeat)?);
        }
        let variables: Vec<&str> = melted
            .iter()
            .flat_map(|name| std::iter::repeat_n(*name, rows))
            .collect();
        columns.push(Series::from_strings(var_name, variables));

        let mut values = self.columns[melted[0]].clone().with_name(value_name);
        for name in &melted[1..] {
            values = values.append(&self.columns[*name])?;
        }
        columns.push(values);
        Ok(self.rebuild(Index::default_range(rows * melted.len()), columns))
    }

    /// Stack frames row-wise. Every frame must carry the same column set;
    /// column dtypes are promoted to a common type.
    pub fn concat(frames: &[&Self]) -> Result<Self, FrameError> {
        let Some(first) = frames.first() else {
            return Ok(Self::empty());
        };
        let expected: BTreeSet<&String> = first.column_order.iter().collect();
        for frame in &frames[1..] {
            let got: BTreeSet<&String> = frame.column_order.iter().collect();
            if got != expected {
                return Err(FrameError::InvalidShape(
                    "concat requires identical column sets".to_owned(),
                ));
            }
        }
        let mut columns = Vec::with_capacity(first.num_columns());
        for name in &first.column_order {
            let mut acc = first.columns[name].clone();
            for frame in &frames[1..] {
                acc = acc.append(&frame.columns[name])?;
            }
            columns.push(acc);
        }
        let total: usize = frames.iter().map(|f| f.num_rows()).sum();
        let index = if frames.iter().all(|f| f.index.is_default_range()) {
            Index::default_range(total)
        } else {
            Index::labels(frames.iter().flat_map(|f| f.index.iter()).collect())
        };
        Ok(first.rebuild(index, columns))
    }

    // ── Ingestion and egestion ─────────────────────────────────────────

    /// Build a frame from raw text columns. Each column's dtype is inferred
    /// from its non-NA cells; NA cells are marked through [`DataFrame::set_null`].
    pub fn from_text_columns<S: Into<String>>(
        data: Vec<(S, Vec<String>)>,
        options: &IngestOptions,
    ) -> Result<Self, FrameError> {
        let mut series = Vec::with_capacity(data.len());
        let mut na_cells: Vec<(String, Vec<usize>)> = Vec::new();
        for (name, raw) in data {
            let name = name.into();
            let cells: Vec<&str> = raw
                .iter()
                .map(|cell| if options.trim { cell.trim() } else { cell.as_str() })
                .collect();
            let na: Vec<usize> = cells
                .iter()
                .enumerate()
                .filter_map(|(pos, cell)| {
                    options
                        .na_tokens
                        .iter()
                        .any(|token| token == cell)
                        .then_some(pos)
                })
                .collect();
            let present = || {
                cells
                    .iter()
                    .enumerate()
                    .filter(|(pos, _)| na.binary_search(pos).is_err())
                    .map(|(_, cell)| *cell)
            };
            let dtype = if options.infer_dtypes {
                infer_text_dtype(present())
            } else {
                DType::Utf8
            };
            let data = parse_text_cells(&cells, &na, dtype)?;
            series.push(Series::new(name.clone(), data));
            if !na.is_empty() {
                na_cells.push((name, na));
            }
        }

        let mut frame = Self::new(series)?;
        let mut marked = 0_usize;
        for (name, positions) in &na_cells {
            for &row in positions {
                frame.set_null(row, name)?;
                marked += 1;
            }
        }
        log::debug!(
            "ingest: columns={} rows={} dtypes={:?} nulls_marked={marked}",
            frame.num_columns(),
            frame.num_rows(),
            frame.dtypes()
        );
        Ok(frame)
    }

    /// Header row followed by one row of rendered cells per record; nulls
    /// render as `na_rep`.
    #[must_use]
    pub fn to_text_rows(&self, na_rep: &str) -> Vec<Vec<String>> {
        let mut rows = Vec::with_capacity(self.num_rows() + 1);
        rows.push(self.column_order.clone());
        for row in 0..self.num_rows() {
            rows.push(
                self.columns()
                    .map(|s| match s.get(row) {
                        (value, true) => value.to_string(),
                        (_, false) => na_rep.to_owned(),
                    })
                    .collect(),
            );
        }
        rows
    }
}

fn compare_rows(
    keys: &[(&Series, SortDirection)],
    nulls: NullPlacement,
    a: usize,
    b: usize,
) -> Ordering {
    for (series, direction) in keys {
        let ord = match (series.is_null(a), series.is_null(b)) {
            (true, true) => Ordering::Equal,
            (true, false) => match nulls {
                NullPlacement::First => Ordering::Less,
                NullPlacement::Last => Ordering::Greater,
            },
            (false, true) => match nulls {
                NullPlacement::First => Ordering::Greater,
                NullPlacement::Last => Ordering::Less,
            },
            (false, false) => {
                let ord = series.cmp_positions(a, b);
                match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn parse_bool_token(cell: &str) -> Option<bool> {
    match cell {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

fn infer_text_dtype<'a>(mut cells: impl Iterator<Item = &'a str> + Clone) -> DType {
    if cells.clone().next().is_none() {
        return DType::Float64;
    }
    if cells.clone().all(|c| parse_bool_token(c).is_some()) {
        DType::Bool
    } else if cells.clone().all(|c| c.parse::<i64>().is_ok()) {
        DType::Int64
    } else if cells.all(|c| c.parse::<f64>().is_ok()) {
        DType::Float64
    } else {
        DType::Utf8
    }
}

/// Parse text into typed storage; NA positions get zero placeholders.
fn parse_text_cells(cells: &[&str], na: &[usize], dtype: DType) -> Result<ColumnData, FrameError> {
    let mut data = ColumnData::with_capacity(dtype, cells.len());
    for (pos, cell) in cells.iter().enumerate() {
        if na.binary_search(&pos).is_ok() {
            data.push_zero();
            continue;
        }
        let bad = || {
            FrameError::InvalidArgument(format!("cannot parse '{cell}' as {dtype}"))
        };
        match &mut data {
            ColumnData::Bool(d) => d.push(parse_bool_token(cell).ok_or_else(bad)?),
            ColumnData::Int64(d) => d.push(cell.parse().map_err(|_| bad())?),
            ColumnData::Float64(d) => d.push(cell.parse().map_err(|_| bad())?),
            ColumnData::Utf8(d) => d.push((*cell).to_owned()),
        }
    }
    Ok(data)
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut grid: Vec<Vec<String>> = Vec::with_capacity(self.num_rows() + 1);
        let mut header = vec![String::new()];
        header.extend(self.column_order.iter().cloned());
        grid.push(header);
        for row in 0..self.num_rows() {
            let mut line = vec![
                self.index
                    .label_at(row)
                    .map(|l| l.to_string())
                    .unwrap_or_default(),
            ];
            line.extend(self.columns().map(|s| s.value(row).to_string()));
            grid.push(line);
        }
        let widths: Vec<usize> = (0..grid[0].len())
            .map(|col| grid.iter().map(|line| line[col].len()).max().unwrap_or(0))
            .collect();
        for line in &grid {
            let rendered: Vec<String> = line
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:>width$}"))
                .collect();
            writeln!(f, "{}", rendered.join("  ").trim_end())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared access
// ---------------------------------------------------------------------------

/// A frame behind a reader–writer lock: any number of concurrent readers,
/// writers exclusive. Clones share the same frame.
#[derive(Debug, Clone, Default)]
pub struct SharedFrame {
    inner: Arc<RwLock<DataFrame>>,
}

impl SharedFrame {
    #[must_use]
    pub fn new(frame: DataFrame) -> Self {
        Self {
            inner: Arc::new(RwLock::new(frame)),
        }
    }

    pub fn read_guard(&self) -> Result<RwLockReadGuard<'_, DataFrame>, FrameError> {
        self.inner.read().map_err(|_| FrameError::LockPoisoned)
    }

    /// Run `f` under a read lock.
    pub fn read<R>(&self, f: impl FnOnce(&DataFrame) -> R) -> Result<R, FrameError> {
        let guard = self.read_guard()?;
        Ok(f(&*guard))
    }

    /// Run `f` under the write lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut DataFrame) -> R) -> Result<R, FrameError> {
        let mut guard = self.inner.write().map_err(|_| FrameError::LockPoisoned)?;
        Ok(f(&mut *guard))
    }

    /// Column-aliasing copy of the current frame.
    pub fn snapshot(&self) -> Result<DataFrame, FrameError> {
        self.read(Clone::clone)
    }

    /// True when both handles guard the same frame.
    #[must_use]
    pub fn same_frame(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ---------------------------------------------------------------------------
// Transformer seam
// ---------------------------------------------------------------------------

/// Fit/transform contract for feature-engineering collaborators.
pub trait Transformer {
    /// Learn whatever state `transform` needs from `frame`.
    fn fit(&mut self, frame: &DataFrame) -> Result<(), FrameError>;

    /// Build a new frame from `frame` using the fitted state.
    fn transform(&self, frame: &DataFrame) -> Result<DataFrame, FrameError>;

    fn fit_transform(&mut self, frame: &DataFrame) -> Result<DataFrame, FrameError> {
        self.fit(frame)?;
        self.transform(frame)
    }
}
