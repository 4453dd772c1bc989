#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use cf_columnar::{ColumnData, ColumnError, Series};
use cf_frame::{DataFrame, FrameError};
use cf_types::{DType, mean_f64, std_f64, sum_f64, var_f64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WindowError {
    #[error("invalid window argument: {0}")]
    InvalidArgument(String),
    #[error("window aggregation needs a numeric column, '{column}' is {dtype}")]
    NonNumeric { column: String, dtype: DType },
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Aggregation applied to each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowReducer {
    Mean,
    Sum,
    /// Sample standard deviation (n − 1).
    Std,
    /// Sample variance (n − 1).
    Var,
    Min,
    Max,
    /// Non-null observations in the window.
    Count,
}

impl WindowReducer {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Std => "std",
            Self::Var => "var",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
        }
    }
}

impl fmt::Display for WindowReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WindowReducer {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mean" => Self::Mean,
            "sum" => Self::Sum,
            "std" => Self::Std,
            "var" => Self::Var,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            other => {
                return Err(WindowError::InvalidArgument(format!(
                    "unknown window reducer '{other}'"
                )));
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingOptions {
    pub size: usize,
    /// Defaults to `size`.
    #[serde(default)]
    pub min_periods: Option<usize>,
    /// Center the window on each position instead of ending it there.
    #[serde(default)]
    pub center: bool,
}

impl RollingOptions {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            min_periods: None,
            center: false,
        }
    }

    #[must_use]
    pub fn min_periods(mut self, min_periods: usize) -> Self {
        self.min_periods = Some(min_periods);
        self
    }

    #[must_use]
    pub fn centered(mut self) -> Self {
        self.center = true;
        self
    }

    fn validate(&self) -> Result<usize, WindowError> {
        if self.size == 0 {
            return Err(WindowError::InvalidArgument(
                "rolling window size must be at least 1".to_owned(),
            ));
        }
        let min_periods = self.min_periods.unwrap_or(self.size);
        if min_periods > self.size {
            return Err(WindowError::InvalidArgument(format!(
                "min_periods {min_periods} exceeds window size {}",
                self.size
            )));
        }
        Ok(min_periods)
    }

    /// Half-open position range of the window ending at `i`, or centered on
    /// it as `[i - size/2, i + size/2]` clipped to the series.
    fn bounds(&self, i: usize, len: usize) -> (usize, usize) {
        if self.center {
            let lo = i.saturating_sub(self.size / 2);
            let hi = (i + self.size / 2 + 1).min(len);
            (lo, hi)
        } else {
            ((i + 1).saturating_sub(self.size), i + 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpandingOptions {
    pub min_periods: usize,
}

impl Default for ExpandingOptions {
    fn default() -> Self {
        Self { min_periods: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EwmOptions {
    /// Smoothing factor in `(0, 1]`.
    pub alpha: f64,
    #[serde(default = "default_ewm_min_periods")]
    pub min_periods: usize,
}

fn default_ewm_min_periods() -> usize {
    1
}

impl EwmOptions {
    pub fn with_alpha(alpha: f64) -> Result<Self, WindowError> {
        let options = Self {
            alpha,
            min_periods: 1,
        };
        options.validate()?;
        Ok(options)
    }

    /// `alpha = 2 / (span + 1)`, `span >= 1`.
    pub fn from_span(span: f64) -> Result<Self, WindowError> {
        if span.is_nan() || span < 1.0 {
            return Err(WindowError::InvalidArgument(format!(
                "span must be >= 1, got {span}"
            )));
        }
        Self::with_alpha(2.0 / (span + 1.0))
    }

    /// `alpha = 1 / (1 + com)`, `com >= 0`.
    pub fn from_com(com: f64) -> Result<Self, WindowError> {
        if com.is_nan() || com < 0.0 {
            return Err(WindowError::InvalidArgument(format!(
                "center of mass must be >= 0, got {com}"
            )));
        }
        Self::with_alpha(1.0 / (1.0 + com))
    }

    fn validate(&self) -> Result<(), WindowError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(WindowError::InvalidArgument(format!(
                "alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Incremental window state
// ---------------------------------------------------------------------------

/// Present values of a window whose bounds only move forward.
///
/// While values have only been appended (expanding windows, or a rolling
/// window still filling up) sum, mean and variance come from running
/// Welford accumulators. Once a value has been evicted they are recomputed
/// from the live values with the two-pass kernels, so an early outlier
/// leaving the window cannot skew later results. Min/max use monotonic
/// deques of `(position, value)`.
#[derive(Debug, Default)]
struct WindowState {
    live: VecDeque<f64>,
    evicted: bool,
    sum: f64,
    mean: f64,
    m2: f64,
    min_queue: VecDeque<(usize, f64)>,
    max_queue: VecDeque<(usize, f64)>,
}

impl WindowState {
    fn count(&self) -> usize {
        self.live.len()
    }

    fn push(&mut self, pos: usize, value: f64) {
        self.live.push_back(value);
        if !self.evicted {
            self.sum += value;
            let delta = value - self.mean;
            self.mean += delta / self.live.len() as f64;
            self.m2 += delta * (value - self.mean);
        }

        while self.min_queue.back().is_some_and(|&(_, v)| v >= value) {
            self.min_queue.pop_back();
        }
        self.min_queue.push_back((pos, value));
        while self.max_queue.back().is_some_and(|&(_, v)| v <= value) {
            self.max_queue.pop_back();
        }
        self.max_queue.push_back((pos, value));
    }

    /// Evict the oldest present value, which sits at `pos`.
    fn pop(&mut self, pos: usize) {
        self.live.pop_front();
        self.evicted = true;
        if self.min_queue.front().is_some_and(|&(p, _)| p == pos) {
            self.min_queue.pop_front();
        }
        if self.max_queue.front().is_some_and(|&(p, _)| p == pos) {
            self.max_queue.pop_front();
        }
    }

    fn reduce(&mut self, reducer: WindowReducer) -> f64 {
        let n = self.live.len();
        match reducer {
            WindowReducer::Count => n as f64,
            _ if n == 0 => f64::NAN,
            WindowReducer::Min => self.min_queue.front().map_or(f64::NAN, |&(_, v)| v),
            WindowReducer::Max => self.max_queue.front().map_or(f64::NAN, |&(_, v)| v),
            _ if self.evicted => {
                let values = self.live.make_contiguous();
                match reducer {
                    WindowReducer::Sum => sum_f64(values),
                    WindowReducer::Mean => mean_f64(values),
                    WindowReducer::Var => var_f64(values, 1),
                    _ => std_f64(values, 1),
                }
            }
            WindowReducer::Sum => self.sum,
            WindowReducer::Mean => self.sum / n as f64,
            WindowReducer::Var | WindowReducer::Std => {
                let var = if n < 2 {
                    f64::NAN
                } else {
                    (self.m2 / (n - 1) as f64).max(0.0)
                };
                if reducer == WindowReducer::Std {
                    var.sqrt()
                } else {
                    var
                }
            }
        }
    }
}

fn numeric_values(series: &Series) -> Result<Vec<Option<f64>>, WindowError> {
    if !series.dtype().is_numeric() {
        return Err(WindowError::NonNumeric {
            column: series.name().to_owned(),
            dtype: series.dtype(),
        });
    }
    Ok((0..series.len()).map(|i| series.f64_at(i)).collect())
}

/// Slide `bounds(i)` across the values. Both bounds must be non-decreasing
/// in `i`. Positions below `min_periods` observations come out null.
fn run_window<B>(
    series: &Series,
    values: &[Option<f64>],
    bounds: B,
    min_periods: usize,
    reducer: WindowReducer,
) -> Series
where
    B: Fn(usize) -> (usize, usize),
{
    let mut state = WindowState::default();
    let (mut lo, mut hi) = (0_usize, 0_usize);
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let (next_lo, next_hi) = bounds(i);
        while lo < next_lo {
            if lo < hi {
                if values[lo].is_some() {
                    state.pop(lo);
                }
            }
            lo += 1;
        }
        hi = hi.max(lo);
        while hi < next_hi {
            if let Some(v) = values[hi] {
                state.push(hi, v);
            }
            hi += 1;
        }
        let value = if reducer == WindowReducer::Count || state.count() >= min_periods {
            state.reduce(reducer)
        } else {
            f64::NAN
        };
        out.push(value);
    }
    Series::new(series.name(), ColumnData::Float64(out))
}

// ---------------------------------------------------------------------------
// Window views
// ---------------------------------------------------------------------------

/// Fixed-size window view, from [`WindowExt::rolling`].
#[derive(Debug, Clone, Copy)]
pub struct Rolling<'a> {
    series: &'a Series,
    options: RollingOptions,
    min_periods: usize,
}

impl Rolling<'_> {
    pub fn apply(&self, reducer: WindowReducer) -> Result<Series, WindowError> {
        let values = numeric_values(self.series)?;
        let len = values.len();
        log::debug!(
            "window: rolling {reducer} size={} center={} min_periods={} rows={len}",
            self.options.size,
            self.options.center,
            self.min_periods
        );
        let options = self.options;
        Ok(run_window(
            self.series,
            &values,
            |i| options.bounds(i, len),
            self.min_periods,
            reducer,
        ))
    }

    pub fn mean(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Mean)
    }

    pub fn sum(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Sum)
    }

    pub fn std(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Std)
    }

    pub fn var(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Var)
    }

    pub fn min(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Min)
    }

    pub fn max(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Max)
    }

    pub fn count(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Count)
    }
}

/// Growing window `[0, i]`, from [`WindowExt::expanding`].
#[derive(Debug, Clone, Copy)]
pub struct Expanding<'a> {
    series: &'a Series,
    min_periods: usize,
}

impl Expanding<'_> {
    pub fn apply(&self, reducer: WindowReducer) -> Result<Series, WindowError> {
        let values = numeric_values(self.series)?;
        log::debug!(
            "window: expanding {reducer} min_periods={} rows={}",
            self.min_periods,
            values.len()
        );
        Ok(run_window(
            self.series,
            &values,
            |i| (0, i + 1),
            self.min_periods,
            reducer,
        ))
    }

    pub fn mean(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Mean)
    }

    pub fn sum(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Sum)
    }

    pub fn std(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Std)
    }

    pub fn var(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Var)
    }

    pub fn min(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Min)
    }

    pub fn max(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Max)
    }

    pub fn count(&self) -> Result<Series, WindowError> {
        self.apply(WindowReducer::Count)
    }
}

/// Exponentially weighted view, from [`WindowExt::ewm`].
#[derive(Debug, Clone, Copy)]
pub struct Ewm<'a> {
    series: &'a Series,
    options: EwmOptions,
}

impl Ewm<'_> {
    /// `y_i = α·x_i + (1 − α)·y_{i−1}`, seeded with the first present value.
    /// A null input carries the previous result forward.
    pub fn mean(&self) -> Result<Series, WindowError> {
        let values = numeric_values(self.series)?;
        let alpha = self.options.alpha;
        log::debug!(
            "window: ewm mean alpha={alpha} min_periods={} rows={}",
            self.options.min_periods,
            values.len()
        );
        let mut prev: Option<f64> = None;
        let mut seen = 0_usize;
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            if let Some(x) = value {
                seen += 1;
                prev = Some(match prev {
                    Some(p) => alpha * x + (1.0 - alpha) * p,
                    None => x,
                });
            }
            out.push(match prev {
                Some(p) if seen >= self.options.min_periods => p,
                _ => f64::NAN,
            });
        }
        Ok(Series::new(self.series.name(), ColumnData::Float64(out)))
    }

    pub fn apply(&self, reducer: WindowReducer) -> Result<Series, WindowError> {
        match reducer {
            WindowReducer::Mean => self.mean(),
            other => Err(WindowError::InvalidArgument(format!(
                "exponentially weighted windows support mean only, got {other}"
            ))),
        }
    }
}

/// Window constructors on [`Series`].
pub trait WindowExt {
    fn rolling(&self, options: RollingOptions) -> Result<Rolling<'_>, WindowError>;
    fn expanding(&self, options: ExpandingOptions) -> Expanding<'_>;
    fn ewm(&self, options: EwmOptions) -> Result<Ewm<'_>, WindowError>;
}

impl WindowExt for Series {
    fn rolling(&self, options: RollingOptions) -> Result<Rolling<'_>, WindowError> {
        let min_periods = options.validate()?;
        Ok(Rolling {
            series: self,
            options,
            min_periods,
        })
    }

    fn expanding(&self, options: ExpandingOptions) -> Expanding<'_> {
        Expanding {
            series: self,
            min_periods: options.min_periods,
        }
    }

    fn ewm(&self, options: EwmOptions) -> Result<Ewm<'_>, WindowError> {
        options.validate()?;
        Ok(Ewm {
            series: self,
            options,
        })
    }
}

// ---------------------------------------------------------------------------
// Frame-level helpers
// ---------------------------------------------------------------------------

fn replace_columns<F>(frame: &DataFrame, columns: &[&str], mut f: F) -> Result<DataFrame, WindowError>
where
    F: FnMut(&Series) -> Result<Series, WindowError>,
{
    let mut computed = Vec::with_capacity(columns.len());
    for &name in columns {
        computed.push(f(frame.column(name)?)?);
    }
    let mut out = frame.clone();
    for series in computed {
        out = out.with_column(series)?;
    }
    Ok(out)
}

/// Replace each of `columns` with its rolling `reducer`; other columns are
/// untouched.
pub fn rolling_frame(
    frame: &DataFrame,
    columns: &[&str],
    options: RollingOptions,
    reducer: WindowReducer,
) -> Result<DataFrame, WindowError> {
    options.validate()?;
    replace_columns(frame, columns, |s| s.rolling(options)?.apply(reducer))
}

/// Replace each of `columns` with its expanding `reducer`.
pub fn expanding_frame(
    frame: &DataFrame,
    columns: &[&str],
    options: ExpandingOptions,
    reducer: WindowReducer,
) -> Result<DataFrame, WindowError> {
    replace_columns(frame, columns, |s| s.expanding(options).apply(reducer))
}
