#![forbid(unsafe_code)]

use std::collections::hash_map::RandomState;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::mem::size_of;
use std::str::FromStr;

use bumpalo::{Bump, collections::Vec as BumpVec};
use cf_columnar::{ColumnError, KeyPart, Series};
use cf_frame::{DataFrame, FrameError, SharedFrame};
use cf_types::{DType, Scalar, common_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    #[serde(alias = "full")]
    Outer,
    Cross,
}

impl JoinType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Left => "left",
            Self::Right => "right",
            Self::Outer => "outer",
            Self::Cross => "cross",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JoinType {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "inner" => Self::Inner,
            "left" => Self::Left,
            "right" => Self::Right,
            "outer" | "full" => Self::Outer,
            "cross" => Self::Cross,
            other => return Err(JoinError::InvalidJoinType(other.to_owned())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Left,
    Right,
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "left",
            Self::Right => "right",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JoinError {
    #[error("invalid join type '{0}'")]
    InvalidJoinType(String),
    #[error("join needs key columns on both sides")]
    EmptyKeys,
    #[error("left_on has {left} keys but right_on has {right}")]
    KeyCountMismatch { left: usize, right: usize },
    #[error("cross join takes no key columns")]
    KeysNotAllowedForCross,
    #[error("{side} key column '{column}' not found")]
    ColumnNotFound { side: JoinSide, column: String },
    #[error("cannot join key '{left_column}' ({left}) with '{right_column}' ({right})")]
    IncompatibleKeyTypes {
        left_column: String,
        left: DType,
        right_column: String,
        right: DType,
    },
    #[error("invalid join argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

pub const DEFAULT_LEFT_SUFFIX: &str = "_left";
pub const DEFAULT_RIGHT_SUFFIX: &str = "_right";
pub const DEFAULT_INDICATOR_NAME: &str = "_merge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOptions {
    pub how: JoinType,
    pub left_on: Vec<String>,
    pub right_on: Vec<String>,
    /// Appended to overlapping non-key column names.
    pub suffixes: (String, String),
    /// Name of a `both` / `left_only` / `right_only` column, when wanted.
    pub indicator: Option<String>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            how: JoinType::Inner,
            left_on: Vec::new(),
            right_on: Vec::new(),
            suffixes: (DEFAULT_LEFT_SUFFIX.to_owned(), DEFAULT_RIGHT_SUFFIX.to_owned()),
            indicator: None,
        }
    }
}

impl JoinOptions {
    /// Join on identically named key columns.
    #[must_use]
    pub fn on(how: JoinType, keys: &[&str]) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_owned()).collect();
        Self {
            how,
            left_on: keys.clone(),
            right_on: keys,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn on_pairs(how: JoinType, left_on: &[&str], right_on: &[&str]) -> Self {
        Self {
            how,
            left_on: left_on.iter().map(|k| (*k).to_owned()).collect(),
            right_on: right_on.iter().map(|k| (*k).to_owned()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cross() -> Self {
        Self {
            how: JoinType::Cross,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn suffixes(mut self, left: &str, right: &str) -> Self {
        self.suffixes = (left.to_owned(), right.to_owned());
        self
    }

    /// Add an indicator column named [`DEFAULT_INDICATOR_NAME`].
    #[must_use]
    pub fn with_indicator(mut self) -> Self {
        self.indicator = Some(DEFAULT_INDICATOR_NAME.to_owned());
        self
    }
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
    unmatched_build_rows: usize,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Validated key columns. `promote[i]` is set when key pair `i` mixes
/// Int64 and Float64 and must be compared as floats.
struct KeyPlan<'a> {
    left: Vec<&'a Series>,
    right: Vec<&'a Series>,
    promote: Vec<bool>,
}

fn resolve_keys<'a>(
    frame: &'a DataFrame,
    names: &[String],
    side: JoinSide,
) -> Result<Vec<&'a Series>, JoinError> {
    names
        .iter()
        .map(|name| {
            frame.column(name).map_err(|_| JoinError::ColumnNotFound {
                side,
                column: name.clone(),
            })
        })
        .collect()
}

fn plan_keys<'a>(
    left: &'a DataFrame,
    right: &'a DataFrame,
    options: &JoinOptions,
) -> Result<KeyPlan<'a>, JoinError> {
    if options.how == JoinType::Cross {
        if !options.left_on.is_empty() || !options.right_on.is_empty() {
            return Err(JoinError::KeysNotAllowedForCross);
        }
        return Ok(KeyPlan {
            left: Vec::new(),
            right: Vec::new(),
            promote: Vec::new(),
        });
    }
    if options.left_on.is_empty() || options.right_on.is_empty() {
        return Err(JoinError::EmptyKeys);
    }
    if options.left_on.len() != options.right_on.len() {
        return Err(JoinError::KeyCountMismatch {
            left: options.left_on.len(),
            right: options.right_on.len(),
        });
    }
    let left_keys = resolve_keys(left, &options.left_on, JoinSide::Left)?;
    let right_keys = resolve_keys(right, &options.right_on, JoinSide::Right)?;
    let mut promote = Vec::with_capacity(left_keys.len());
    for (l, r) in left_keys.iter().zip(&right_keys) {
        let same = l.dtype() == r.dtype();
        let numeric_pair = matches!(
            (l.dtype(), r.dtype()),
            (DType::Int64, DType::Float64) | (DType::Float64, DType::Int64)
        );
        if !same && !numeric_pair {
            return Err(JoinError::IncompatibleKeyTypes {
                left_column: l.name().to_owned(),
                left: l.dtype(),
                right_column: r.name().to_owned(),
                right: r.dtype(),
            });
        }
        promote.push(numeric_pair);
    }
    Ok(KeyPlan {
        left: left_keys,
        right: right_keys,
        promote,
    })
}

/// Composite key of `row`, or `None` when any component is null.
fn key_of<'a>(keys: &[&'a Series], promote: &[bool], row: usize) -> Option<Vec<KeyPart<'a>>> {
    keys.iter()
        .zip(promote)
        .map(|(&series, &p)| {
            let part = series.key_part(row);
            if part.is_null() {
                None
            } else if p {
                Some(part.promote_numeric())
            } else {
                Some(part)
            }
        })
        .collect()
}

fn keys_equal(
    probe: &[&Series],
    probe_row: usize,
    build: &[&Series],
    build_row: usize,
    promote: &[bool],
) -> bool {
    probe
        .iter()
        .zip(build)
        .zip(promote)
        .all(|((p, b), &promote)| {
            let (pp, bp) = (p.key_part(probe_row), b.key_part(build_row));
            if promote {
                pp.promote_numeric() == bp.promote_numeric()
            } else {
                pp == bp
            }
        })
}

/// Build-side hash table: key hash → build rows. Rows with a null key
/// component never enter the table.
fn build_table<S: BuildHasher>(
    keys: &[&Series],
    promote: &[bool],
    rows: usize,
    hasher: &S,
) -> HashMap<u64, Vec<usize>> {
    let mut table: HashMap<u64, Vec<usize>> = HashMap::new();
    for row in 0..rows {
        if let Some(key) = key_of(keys, promote, row) {
            table.entry(hasher.hash_one(&key)).or_default().push(row);
        }
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeMode {
    Inner,
    /// Unmatched probe rows are kept.
    Left,
    /// Unmatched rows on both sides are kept.
    Outer,
}

/// Probe `table` with every probe row and report `(probe, build)` pairs in
/// probe order; outer mode then reports never-matched build rows. Hash hits
/// are re-verified against the full key. Returns the unmatched build count.
#[allow(clippy::too_many_arguments)]
fn probe_pairs<S, F>(
    probe: &[&Series],
    probe_rows: usize,
    build: &[&Series],
    build_rows: usize,
    promote: &[bool],
    table: &HashMap<u64, Vec<usize>>,
    hasher: &S,
    mode: ProbeMode,
    mut emit: F,
) -> usize
where
    S: BuildHasher,
    F: FnMut(Option<usize>, Option<usize>),
{
    let mut build_matched = vec![false; if mode == ProbeMode::Outer { build_rows } else { 0 }];
    for row in 0..probe_rows {
        let mut matched = false;
        if let Some(key) = key_of(probe, promote, row) {
            if let Some(candidates) = table.get(&hasher.hash_one(&key)) {
                for &candidate in candidates {
                    if keys_equal(probe, row, build, candidate, promote) {
                        matched = true;
                        if mode == ProbeMode::Outer {
                            build_matched[candidate] = true;
                        }
                        emit(Some(row), Some(candidate));
                    }
                }
            }
        }
        if !matched && mode != ProbeMode::Inner {
            emit(Some(row), None);
        }
    }
    let mut unmatched = 0;
    for (row, seen) in build_matched.iter().enumerate() {
        if !seen {
            unmatched += 1;
            emit(None, Some(row));
        }
    }
    unmatched
}

fn estimate_output_rows<S: BuildHasher>(
    plan: &KeyPlan<'_>,
    how: JoinType,
    probe_rows: usize,
    build_rows: usize,
    probe: &[&Series],
    table: &HashMap<u64, Vec<usize>>,
    hasher: &S,
) -> usize {
    if how == JoinType::Cross {
        return probe_rows.saturating_mul(build_rows);
    }
    let keep_unmatched = how != JoinType::Inner;
    let probed: usize = (0..probe_rows)
        .map(|row| {
            let hits = key_of(probe, &plan.promote, row)
                .and_then(|key| table.get(&hasher.hash_one(&key)))
                .map_or(0, Vec::len);
            if hits == 0 && keep_unmatched { 1 } else { hits }
        })
        .sum();
    if how == JoinType::Outer {
        probed.saturating_add(build_rows)
    } else {
        probed
    }
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_mul(2))
}

// ---------------------------------------------------------------------------
// Output assembly
// ---------------------------------------------------------------------------

fn indicator_label(left: Option<usize>, right: Option<usize>) -> &'static str {
    match (left, right) {
        (Some(_), Some(_)) => "both",
        (Some(_), None) => "left_only",
        _ => "right_only",
    }
}

fn coalesce_key(
    name: &str,
    left: &Series,
    right: &Series,
    left_positions: &[Option<usize>],
    right_positions: &[Option<usize>],
) -> Result<Series, JoinError> {
    let dtype = common_dtype(left.dtype(), right.dtype()).map_err(ColumnError::from)?;
    let values = left_positions
        .iter()
        .zip(right_positions)
        .map(|(l, r)| match (l, r) {
            (Some(l), _) => left.value(*l),
            (None, Some(r)) => right.value(*r),
            (None, None) => Scalar::Null,
        })
        .collect();
    Ok(Series::from_values_with_dtype(name, dtype, values)?)
}

fn assemble(
    left: &DataFrame,
    right: &DataFrame,
    options: &JoinOptions,
    left_positions: &[Option<usize>],
    right_positions: &[Option<usize>],
) -> Result<DataFrame, JoinError> {
    let shared_keys: BTreeSet<&str> = options
        .left_on
        .iter()
        .zip(&options.right_on)
        .filter(|(l, r)| l == r)
        .map(|(l, _)| l.as_str())
        .collect();
    let right_names: Vec<&str> = right
        .column_names()
        .iter()
        .map(String::as_str)
        .filter(|name| !shared_keys.contains(name))
        .collect();
    let left_names: BTreeSet<&str> = left.column_names().iter().map(String::as_str).collect();
    let overlap: BTreeSet<&str> = right_names
        .iter()
        .copied()
        .filter(|name| left_names.contains(name))
        .collect();

    let (left_suffix, right_suffix) = &options.suffixes;
    let mut columns = Vec::with_capacity(left.num_columns() + right_names.len() + 1);
    for series in left.columns() {
        let name = series.name();
        let out = if shared_keys.contains(name) {
            coalesce_key(name, series, right.column(name)?, left_positions, right_positions)?
        } else {
            let taken = series.take_optional(left_positions)?;
            if overlap.contains(name) {
                taken.with_name(format!("{name}{left_suffix}"))
            } else {
                taken
            }
        };
        columns.push(out);
    }
    for name in &right_names {
        let taken = right.column(name)?.take_optional(right_positions)?;
        columns.push(if overlap.contains(name) {
            taken.with_name(format!("{name}{right_suffix}"))
        } else {
            taken
        });
    }
    if let Some(indicator) = &options.indicator {
        let labels: Vec<&str> = left_positions
            .iter()
            .zip(right_positions)
            .map(|(l, r)| indicator_label(*l, *r))
            .collect();
        columns.push(Series::from_strings(indicator.as_str(), labels));
    }

    let mut seen = BTreeSet::new();
    if let Some(dup) = columns.iter().find(|s| !seen.insert(s.name().to_owned())) {
        return Err(JoinError::InvalidArgument(format!(
            "output column '{}' is produced twice; choose different suffixes",
            dup.name()
        )));
    }
    Ok(DataFrame::new(columns)?)
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn join(left: &DataFrame, right: &DataFrame, options: &JoinOptions) -> Result<DataFrame, JoinError> {
    join_with_options(left, right, options, JoinExecutionOptions::default())
}

pub fn join_with_options(
    left: &DataFrame,
    right: &DataFrame,
    options: &JoinOptions,
    exec_options: JoinExecutionOptions,
) -> Result<DataFrame, JoinError> {
    let (joined, _) = join_with_trace(left, right, options, exec_options, &RandomState::new())?;
    Ok(joined)
}

/// Join two shared frames while holding both read locks.
pub fn join_shared(
    left: &SharedFrame,
    right: &SharedFrame,
    options: &JoinOptions,
) -> Result<DataFrame, JoinError> {
    let left_guard = left.read_guard()?;
    if left.same_frame(right) {
        return join(&left_guard, &left_guard, options);
    }
    let right_guard = right.read_guard()?;
    join(&left_guard, &right_guard, options)
}

fn join_with_trace<S: BuildHasher>(
    left: &DataFrame,
    right: &DataFrame,
    options: &JoinOptions,
    exec_options: JoinExecutionOptions,
    hasher: &S,
) -> Result<(DataFrame, JoinExecutionTrace), JoinError> {
    let plan = plan_keys(left, right, options)?;

    // Right joins run as left joins with the sides swapped.
    let swapped = options.how == JoinType::Right;
    let (probe, build) = if swapped {
        (&plan.right, &plan.left)
    } else {
        (&plan.left, &plan.right)
    };
    let (probe_rows, build_rows) = if swapped {
        (right.num_rows(), left.num_rows())
    } else {
        (left.num_rows(), right.num_rows())
    };
    let mode = match options.how {
        JoinType::Inner => ProbeMode::Inner,
        JoinType::Left | JoinType::Right => ProbeMode::Left,
        JoinType::Outer => ProbeMode::Outer,
        JoinType::Cross => ProbeMode::Inner,
    };

    let table = if options.how == JoinType::Cross {
        HashMap::new()
    } else {
        build_table(build, &plan.promote, build_rows, hasher)
    };
    log::trace!(
        "join: build table buckets={} build_rows={build_rows}",
        table.len()
    );

    let output_rows = estimate_output_rows(
        &plan,
        options.how,
        probe_rows,
        build_rows,
        probe,
        &table,
        hasher,
    );
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = exec_options.use_arena && estimated_bytes <= exec_options.arena_budget_bytes;
    if exec_options.use_arena && !use_arena {
        log::warn!(
            "join: estimated {estimated_bytes} bytes exceeds arena budget {}, using global allocator",
            exec_options.arena_budget_bytes
        );
    }

    let run = |emit: &mut dyn FnMut(Option<usize>, Option<usize>)| -> usize {
        if options.how == JoinType::Cross {
            for l in 0..left.num_rows() {
                for r in 0..right.num_rows() {
                    emit(Some(l), Some(r));
                }
            }
            return 0;
        }
        probe_pairs(
            probe,
            probe_rows,
            build,
            build_rows,
            &plan.promote,
            &table,
            hasher,
            mode,
            |p, b| {
                if swapped {
                    emit(b, p);
                } else {
                    emit(p, b);
                }
            },
        )
    };

    let (joined, emitted, unmatched_build_rows) = if use_arena {
        let arena = Bump::new();
        let mut left_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
        let mut right_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
        let unmatched = run(&mut |l, r| {
            left_positions.push(l);
            right_positions.push(r);
        });
        let joined = assemble(
            left,
            right,
            options,
            left_positions.as_slice(),
            right_positions.as_slice(),
        )?;
        (joined, left_positions.len(), unmatched)
    } else {
        let mut left_positions = Vec::<Option<usize>>::with_capacity(output_rows);
        let mut right_positions = Vec::<Option<usize>>::with_capacity(output_rows);
        let unmatched = run(&mut |l, r| {
            left_positions.push(l);
            right_positions.push(r);
        });
        let joined = assemble(left, right, options, &left_positions, &right_positions)?;
        (joined, left_positions.len(), unmatched)
    };

    log::trace!("join: unmatched build rows={unmatched_build_rows}");
    log::debug!(
        "join: how={} left_rows={} right_rows={} output_rows={emitted} arena={use_arena}",
        options.how,
        left.num_rows(),
        right.num_rows()
    );
    Ok((
        joined,
        JoinExecutionTrace {
            used_arena: use_arena,
            output_rows: emitted,
            estimated_bytes,
            unmatched_build_rows,
        },
    ))
}

/// Join entry point on [`DataFrame`].
pub trait JoinExt {
    fn join(&self, right: &DataFrame, options: &JoinOptions) -> Result<DataFrame, JoinError>;
}

impl JoinExt for DataFrame {
    fn join(&self, right: &DataFrame, options: &JoinOptions) -> Result<DataFrame, JoinError> {
        join(self, right, options)
    }
}
