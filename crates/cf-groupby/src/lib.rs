#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use cf_columnar::{ColumnData, ColumnError, KeyPart, Series};
use cf_frame::{DataFrame, FrameError};
use cf_types::{DType, Scalar, mean_f64, median_f64, std_f64, var_f64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("invalid groupby argument: {0}")]
    InvalidArgument(String),
    #[error("unknown aggregation '{0}'")]
    UnknownAggregation(String),
    #[error("aggregation {func} needs a numeric column, '{column}' is {dtype}")]
    NonNumeric {
        column: String,
        func: AggFunc,
        dtype: DType,
    },
    #[error("integer overflow while summing column '{0}'")]
    SumOverflow(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Aggregation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    Mean,
    Median,
    Std,
    Var,
    Min,
    Max,
    /// Non-null values.
    Count,
    /// Rows, nulls included.
    Size,
    /// First non-null value in scan order.
    First,
    /// Last non-null value in scan order.
    Last,
    #[serde(rename = "nunique")]
    NUnique,
}

impl AggFunc {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Std => "std",
            Self::Var => "var",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Size => "size",
            Self::First => "first",
            Self::Last => "last",
            Self::NUnique => "nunique",
        }
    }

    #[must_use]
    pub fn requires_numeric(self) -> bool {
        matches!(
            self,
            Self::Sum | Self::Mean | Self::Median | Self::Std | Self::Var
        )
    }

    /// Dtype of the aggregated column for a `source` column.
    #[must_use]
    pub fn result_dtype(self, source: DType) -> DType {
        match self {
            Self::Sum => match source {
                DType::Bool | DType::Int64 => DType::Int64,
                _ => DType::Float64,
            },
            Self::Mean | Self::Median | Self::Std | Self::Var => DType::Float64,
            Self::Count | Self::Size | Self::NUnique => DType::Int64,
            Self::Min | Self::Max | Self::First | Self::Last => source,
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggFunc {
    type Err = GroupByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sum" => Self::Sum,
            "mean" => Self::Mean,
            "median" => Self::Median,
            "std" => Self::Std,
            "var" => Self::Var,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            "size" => Self::Size,
            "first" => Self::First,
            "last" => Self::Last,
            "nunique" => Self::NUnique,
            other => return Err(GroupByError::UnknownAggregation(other.to_owned())),
        })
    }
}

// ---------------------------------------------------------------------------
// Aggregation kernels
// ---------------------------------------------------------------------------

fn check_numeric(series: &Series, func: AggFunc) -> Result<(), GroupByError> {
    if func.requires_numeric() && !series.dtype().is_numeric() {
        return Err(GroupByError::NonNumeric {
            column: series.name().to_owned(),
            func,
            dtype: series.dtype(),
        });
    }
    Ok(())
}

/// Reduce the values of `series` at `rows` (in scan order) with `func`.
fn aggregate(series: &Series, rows: &[usize], func: AggFunc) -> Result<Scalar, GroupByError> {
    let present = move || rows.iter().copied().filter(move |&row| !series.is_null(row));
    let floats = || present().filter_map(|row| series.f64_at(row)).collect::<Vec<_>>();
    let out = match func {
        AggFunc::Size => Scalar::Int64(rows.len() as i64),
        AggFunc::Count => Scalar::Int64(present().count() as i64),
        AggFunc::NUnique => {
            let distinct: HashSet<KeyPart<'_>> = present().map(|row| series.key_part(row)).collect();
            Scalar::Int64(distinct.len() as i64)
        }
        AggFunc::First => present().next().map_or(Scalar::Null, |row| series.value(row)),
        AggFunc::Last => present().last().map_or(Scalar::Null, |row| series.value(row)),
        AggFunc::Min | AggFunc::Max => {
            let wanted = if func == AggFunc::Min {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            };
            present()
                .reduce(|best, row| {
                    if series.cmp_positions(row, best) == wanted {
                        row
                    } else {
                        best
                    }
                })
                .map_or(Scalar::Null, |row| series.value(row))
        }
        AggFunc::Sum => match series.data() {
            ColumnData::Int64(values) => {
                let mut total = 0_i64;
                for row in present() {
                    total = total
                        .checked_add(values[row])
                        .ok_or_else(|| GroupByError::SumOverflow(series.name().to_owned()))?;
                }
                Scalar::Int64(total)
            }
            ColumnData::Bool(values) => {
                Scalar::Int64(present().filter(|&row| values[row]).count() as i64)
            }
            ColumnData::Float64(_) => Scalar::Float64(floats().iter().sum()),
            ColumnData::Utf8(_) => {
                return Err(GroupByError::NonNumeric {
                    column: series.name().to_owned(),
                    func,
                    dtype: DType::Utf8,
                });
            }
        },
        AggFunc::Mean => Scalar::Float64(mean_f64(&floats())),
        AggFunc::Median => Scalar::Float64(median_f64(&floats())),
        AggFunc::Std => Scalar::Float64(std_f64(&floats(), 1)),
        AggFunc::Var => Scalar::Float64(var_f64(&floats(), 1)),
    };
    Ok(out)
}

// ---------------------------------------------------------------------------
// GroupBy
// ---------------------------------------------------------------------------

/// Rows of a frame bucketed by a composite key.
///
/// Buckets are kept in first-occurrence order; a null key component is a
/// key value of its own, so rows with null keys form groups rather than
/// being dropped. The buckets are built on first use, after the requested
/// operation has been validated.
#[derive(Debug)]
pub struct GroupBy<'a> {
    frame: &'a DataFrame,
    keys: Vec<String>,
    groups: OnceCell<Vec<Vec<usize>>>,
}

impl<'a> GroupBy<'a> {
    pub fn new(frame: &'a DataFrame, keys: &[&str]) -> Result<Self, GroupByError> {
        if keys.is_empty() {
            return Err(GroupByError::InvalidArgument(
                "groupby requires at least one key column".to_owned(),
            ));
        }
        for key in keys {
            frame.column(key)?;
        }
        Ok(Self {
            frame,
            keys: keys.iter().map(|k| (*k).to_owned()).collect(),
            groups: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    fn key_series(&self) -> Vec<&'a Series> {
        self.keys
            .iter()
            .filter_map(|k| self.frame.column(k).ok())
            .collect()
    }

    /// Row positions per group, in first-occurrence order.
    fn buckets(&self) -> &[Vec<usize>] {
        self.groups.get_or_init(|| {
            let key_series = self.key_series();
            let rows = self.frame.num_rows();
            let mut lookup: HashMap<Vec<KeyPart<'a>>, usize> = HashMap::new();
            let mut buckets: Vec<Vec<usize>> = Vec::new();
            for row in 0..rows {
                let key: Vec<KeyPart<'a>> = key_series.iter().map(|s| s.key_part(row)).collect();
                let slot = *lookup.entry(key).or_insert_with(|| {
                    buckets.push(Vec::new());
                    buckets.len() - 1
                });
                buckets[slot].push(row);
            }
            log::debug!(
                "groupby: rows={rows} keys={:?} groups={}",
                self.keys,
                buckets.len()
            );
            log::trace!("groupby: hash table entries={}", lookup.len());
            buckets
        })
    }

    #[must_use]
    pub fn ngroups(&self) -> usize {
        self.buckets().len()
    }

    fn first_rows(&self) -> Vec<usize> {
        self.buckets().iter().map(|rows| rows[0]).collect()
    }

    fn key_columns(&self) -> Result<Vec<Series>, GroupByError> {
        let first_rows = self.first_rows();
        self.key_series()
            .into_iter()
            .map(|s| s.take(&first_rows).map_err(GroupByError::from))
            .collect()
    }

    fn validate_specs(&self, specs: &[(&str, AggFunc)]) -> Result<(), GroupByError> {
        for (column, func) in specs {
            check_numeric(self.frame.column(column)?, *func)?;
        }
        Ok(())
    }

    fn aggregate_column(
        &self,
        column: &str,
        func: AggFunc,
        out_name: String,
    ) -> Result<Series, GroupByError> {
        let source = self.frame.column(column)?;
        let values = self
            .buckets()
            .iter()
            .map(|rows| aggregate(source, rows, func))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Series::from_values_with_dtype(
            out_name,
            func.result_dtype(source.dtype()),
            values,
        )?)
    }

    /// One row per group: key columns, then one column per `(column, func)`
    /// named after its source column.
    pub fn agg(&self, specs: &[(&str, AggFunc)]) -> Result<DataFrame, GroupByError> {
        self.validate_specs(specs)?;
        let mut columns = self.key_columns()?;
        for (column, func) in specs {
            columns.push(self.aggregate_column(column, *func, (*column).to_owned())?);
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Like [`GroupBy::agg`] with aggregation names parsed from strings.
    pub fn agg_by_name(&self, specs: &[(&str, &str)]) -> Result<DataFrame, GroupByError> {
        let parsed = specs
            .iter()
            .map(|(column, name)| Ok((*column, name.parse::<AggFunc>()?)))
            .collect::<Result<Vec<_>, GroupByError>>()?;
        self.agg(&parsed)
    }

    /// Several functions per column; outputs are named `<col>_<func>`.
    pub fn agg_multiple(&self, specs: &[(&str, &[AggFunc])]) -> Result<DataFrame, GroupByError> {
        let flat: Vec<(&str, AggFunc)> = specs
            .iter()
            .flat_map(|(column, funcs)| funcs.iter().map(move |f| (*column, *f)))
            .collect();
        self.validate_specs(&flat)?;
        let mut columns = self.key_columns()?;
        for (column, func) in flat {
            columns.push(self.aggregate_column(column, func, format!("{column}_{func}"))?);
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Key columns plus a `size` column of row counts.
    pub fn size(&self) -> Result<DataFrame, GroupByError> {
        let mut columns = self.key_columns()?;
        let sizes = self
            .buckets()
            .iter()
            .map(|rows| rows.len() as i64)
            .collect();
        columns.push(Series::from_i64("size", sizes));
        Ok(DataFrame::new(columns)?)
    }

    /// Key values and source row positions of every group.
    #[must_use]
    pub fn groups(&self) -> Vec<(Vec<Scalar>, Vec<usize>)> {
        let key_series = self.key_series();
        self.buckets()
            .iter()
            .map(|rows| {
                let key = key_series.iter().map(|s| s.value(rows[0])).collect();
                (key, rows.clone())
            })
            .collect()
    }

    /// Materialized rows of the group whose key equals `key`.
    pub fn get_group(&self, key: &[Scalar]) -> Result<DataFrame, GroupByError> {
        if key.len() != self.keys.len() {
            return Err(GroupByError::InvalidArgument(format!(
                "expected {} key values, got {}",
                self.keys.len(),
                key.len()
            )));
        }
        let key_series = self.key_series();
        let found = self.buckets().iter().find(|rows| {
            key_series
                .iter()
                .zip(key)
                .all(|(s, wanted)| s.value(rows[0]).semantic_eq(wanted))
        });
        match found {
            Some(rows) => Ok(self.frame.take(rows)?),
            None => {
                let rendered: Vec<String> = key.iter().map(ToString::to_string).collect();
                Err(FrameError::KeyNotFound(rendered.join(", ")).into())
            }
        }
    }

    /// Call `f` once per group on a materialized sub-frame and emit one row
    /// per group: key columns followed by the named values `f` returns.
    /// Every call must return the same names in the same order.
    pub fn apply<F>(&self, mut f: F) -> Result<DataFrame, GroupByError>
    where
        F: FnMut(&DataFrame) -> Result<Vec<(String, Scalar)>, GroupByError>,
    {
        let mut names: Option<Vec<String>> = None;
        let mut cells: Vec<Vec<Scalar>> = Vec::new();
        for rows in self.buckets() {
            let sub = self.frame.take(rows)?;
            let row = f(&sub)?;
            let row_names: Vec<String> = row.iter().map(|(name, _)| name.clone()).collect();
            match &names {
                None => {
                    cells = vec![Vec::with_capacity(self.ngroups()); row.len()];
                    names = Some(row_names);
                }
                Some(expected) if *expected != row_names => {
                    return Err(GroupByError::InvalidArgument(format!(
                        "apply returned columns {row_names:?}, expected {expected:?}"
                    )));
                }
                Some(_) => {}
            }
            for (slot, (_, value)) in cells.iter_mut().zip(row) {
                slot.push(value);
            }
        }
        let mut columns = self.key_columns()?;
        for (name, values) in names.unwrap_or_default().into_iter().zip(cells) {
            columns.push(Series::from_values(name, values)?);
        }
        Ok(DataFrame::new(columns)?)
    }
}

/// Group constructor on [`DataFrame`].
pub trait GroupByExt {
    fn groupby(&self, keys: &[&str]) -> Result<GroupBy<'_>, GroupByError>;
}

impl GroupByExt for DataFrame {
    fn groupby(&self, keys: &[&str]) -> Result<GroupBy<'_>, GroupByError> {
        GroupBy::new(self, keys)
    }
}

// ---------------------------------------------------------------------------
// Pivot
// ---------------------------------------------------------------------------

/// Spread `values` into one column per distinct value of `columns`, one row
/// per distinct value of `index`, reducing each cell with `func`. Rows and
/// columns follow first-occurrence order; empty cells are null.
pub fn pivot_table(
    frame: &DataFrame,
    index: &str,
    columns: &str,
    values: &str,
    func: AggFunc,
) -> Result<DataFrame, GroupByError> {
    let index_series = frame.column(index)?;
    let column_series = frame.column(columns)?;
    let value_series = frame.column(values)?;
    check_numeric(value_series, func)?;

    let mut row_lookup: HashMap<KeyPart<'_>, usize> = HashMap::new();
    let mut col_lookup: HashMap<KeyPart<'_>, usize> = HashMap::new();
    let mut row_firsts: Vec<usize> = Vec::new();
    let mut col_firsts: Vec<usize> = Vec::new();
    let mut cells: Vec<Vec<Vec<usize>>> = Vec::new();
    for row in 0..frame.num_rows() {
        let r = *row_lookup.entry(index_series.key_part(row)).or_insert_with(|| {
            row_firsts.push(row);
            row_firsts.len() - 1
        });
        let c = *col_lookup.entry(column_series.key_part(row)).or_insert_with(|| {
            col_firsts.push(row);
            col_firsts.len() - 1
        });
        if cells.len() <= r {
            cells.resize_with(r + 1, Vec::new);
        }
        if cells[r].len() <= c {
            cells[r].resize_with(c + 1, Vec::new);
        }
        cells[r][c].push(row);
    }

    let mut names: Vec<String> = Vec::with_capacity(col_firsts.len());
    for &first in &col_firsts {
        let name = column_series.value(first).to_string();
        if name == index || names.contains(&name) {
            let clash = if name == index {
                format!("the index column '{index}'")
            } else {
                "another pivoted value".to_owned()
            };
            return Err(GroupByError::InvalidArgument(format!(
                "pivot column '{name}' rendered from '{columns}' collides with {clash}"
            )));
        }
        names.push(name);
    }

    let mut out = vec![index_series.take(&row_firsts)?];
    let dtype = func.result_dtype(value_series.dtype());
    for (c, name) in names.into_iter().enumerate() {
        let mut column_values = Vec::with_capacity(row_firsts.len());
        for row_cells in &cells {
            column_values.push(match row_cells.get(c) {
                Some(rows) if !rows.is_empty() => aggregate(value_series, rows, func)?,
                _ => Scalar::Null,
            });
        }
        out.push(Series::from_values_with_dtype(name, dtype, column_values)?);
    }
    log::debug!(
        "pivot_table: rows={} columns={} func={func}",
        row_firsts.len(),
        col_firsts.len()
    );
    Ok(DataFrame::new(out)?)
}
