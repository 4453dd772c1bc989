#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    Int64,
    Float64,
    Utf8,
}

impl DType {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Bool | Self::Int64 | Self::Float64)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single dynamically-typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    /// Dtype of a present value; `None` for `Null`.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DType::Bool),
            Self::Int64(_) => Some(DType::Int64),
            Self::Float64(_) => Some(DType::Float64),
            Self::Utf8(_) => Some(DType::Utf8),
        }
    }

    /// `Null` and float NaN both count as missing.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value an invalid slot reports for `dtype`.
    #[must_use]
    pub fn zero_value(dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(false),
            DType::Int64 => Self::Int64(0),
            DType::Float64 => Self::Float64(0.0),
            DType::Utf8 => Self::Utf8(String::new()),
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
        }
    }

    /// Equality that treats two missing values as equal.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self.is_missing(), other.is_missing()) {
            (true, true) => true,
            (false, false) => compare_scalars(self, other) == Ordering::Equal,
            _ => false,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left} to {right} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast value of dtype {from} to {to}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("expected 0/1 for bool cast but found {value}")]
    InvalidBoolValue { value: f64 },
    #[error("value {value:?} has non-numeric dtype {dtype}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing")]
    ValueIsMissing,
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Float64, Int64};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool, Float64) | (Float64, Bool) => Float64,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

/// Infer the narrowest dtype holding every present value; `None` when all
/// values are missing.
pub fn infer_dtype(values: &[Scalar]) -> Result<Option<DType>, TypeError> {
    let mut current: Option<DType> = None;
    for value in values {
        let Some(dtype) = value.dtype() else {
            continue;
        };
        current = Some(match current {
            None => dtype,
            Some(seen) => common_dtype(seen, dtype)?,
        });
    }
    Ok(current)
}

/// Cast a scalar to `target`, taking ownership so identity casts do not clone.
/// Missing values stay `Null`; only lossless conversions succeed.
pub fn cast_scalar_owned(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    if value.is_missing() {
        return Ok(Scalar::Null);
    }
    let Some(from) = value.dtype() else {
        return Ok(Scalar::Null);
    };
    if from == target {
        return Ok(value);
    }

    match target {
        DType::Bool => {
            let v = value.to_f64()?;
            if v == 0.0 {
                Ok(Scalar::Bool(false))
            } else if v == 1.0 {
                Ok(Scalar::Bool(true))
            } else {
                Err(TypeError::InvalidBoolValue { value: v })
            }
        }
        DType::Int64 => match value {
            Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(v))),
            Scalar::Float64(v) => {
                if !v.is_finite()
                    || v != v.trunc()
                    || v < i64::MIN as f64
                    || v > i64::MAX as f64
                {
                    return Err(TypeError::LossyFloatToInt { value: v });
                }
                Ok(Scalar::Int64(v as i64))
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Float64 => match value {
            Scalar::Bool(v) => Ok(Scalar::Float64(if v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(v as f64)),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Utf8 => Ok(Scalar::Utf8(value.to_string())),
    }
}

/// Cast a scalar reference to `target` (clones only when conversion is needed).
pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    cast_scalar_owned(value.clone(), target)
}

/// Total order over present scalars: numerics compare numerically across
/// Bool/Int64/Float64, strings lexicographically, and mixed string/numeric
/// pairs fall back to dtype order. Missing values sort after everything.
#[must_use]
pub fn compare_scalars(left: &Scalar, right: &Scalar) -> Ordering {
    match (left, right) {
        (Scalar::Null, Scalar::Null) => Ordering::Equal,
        (Scalar::Null, _) => Ordering::Greater,
        (_, Scalar::Null) => Ordering::Less,
        (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
        (Scalar::Int64(a), Scalar::Int64(b)) => a.cmp(b),
        (Scalar::Float64(a), Scalar::Float64(b)) => a.total_cmp(b),
        (Scalar::Utf8(a), Scalar::Utf8(b)) => a.cmp(b),
        (Scalar::Utf8(_), _) | (_, Scalar::Utf8(_)) => {
            left.dtype().cmp(&right.dtype())
        }
        _ => {
            let a = left.to_f64().unwrap_or(f64::NAN);
            let b = right.to_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
    }
}

// ── Null-free f64 kernels ──────────────────────────────────────────────
//
// Callers strip null positions first; these functions see only present
// values and report NaN when there are too few of them.

#[must_use]
pub fn sum_f64(values: &[f64]) -> f64 {
    values.iter().sum()
}

#[must_use]
pub fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    sum_f64(values) / values.len() as f64
}

/// Two-pass variance with `ddof` delta degrees of freedom.
#[must_use]
pub fn var_f64(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof || values.is_empty() {
        return f64::NAN;
    }
    let mean = mean_f64(values);
    let sum_sq: f64 = values.iter().map(|x| (x - mean).powi(2)).sum();
    sum_sq / (values.len() - ddof) as f64
}

#[must_use]
pub fn std_f64(values: &[f64], ddof: usize) -> f64 {
    var_f64(values, ddof).sqrt()
}

#[must_use]
pub fn median_f64(values: &[f64]) -> f64 {
    quantile_f64(values, 0.5)
}

/// Quantile with linear interpolation between the two closest ranks.
/// `q` is expected in `[0, 1]`.
#[must_use]
pub fn quantile_f64(values: &[f64], q: f64) -> f64 {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{
        DType, Scalar, cast_scalar, common_dtype, compare_scalars, infer_dtype, mean_f64,
        median_f64, quantile_f64, std_f64, sum_f64, var_f64,
    };

    #[test]
    fn dtype_inference_coerces_numeric_values() {
        let values = vec![Scalar::Bool(true), Scalar::Int64(7), Scalar::Float64(3.5)];
        assert_eq!(
            infer_dtype(&values).expect("dtype should infer"),
            Some(DType::Float64)
        );
    }

    #[test]
    fn dtype_inference_skips_nulls() {
        let values = vec![Scalar::Null, Scalar::Int64(1), Scalar::Null];
        assert_eq!(infer_dtype(&values).expect("infer"), Some(DType::Int64));
        assert_eq!(infer_dtype(&[Scalar::Null]).expect("infer"), None);
    }

    #[test]
    fn missing_values_cast_to_null() {
        let cast = cast_scalar(&Scalar::Float64(f64::NAN), DType::Int64).expect("missing casts");
        assert_eq!(cast, Scalar::Null);
    }

    #[test]
    fn lossy_float_to_int_is_rejected() {
        let err = cast_scalar(&Scalar::Float64(1.5), DType::Int64).expect_err("must fail");
        assert_eq!(err.to_string(), "cannot cast float 1.5 to int64 without loss");
        assert_eq!(
            cast_scalar(&Scalar::Float64(2.0), DType::Int64).expect("lossless"),
            Scalar::Int64(2)
        );
    }

    #[test]
    fn common_dtype_rejects_string_numeric_mix() {
        let err = common_dtype(DType::Utf8, DType::Int64).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "dtype coercion from utf8 to int64 has no compatible common type"
        );
    }

    #[test]
    fn semantic_eq_treats_missing_as_equal() {
        assert!(Scalar::Float64(f64::NAN).semantic_eq(&Scalar::Null));
        assert!(Scalar::Int64(1).semantic_eq(&Scalar::Float64(1.0)));
        assert!(!Scalar::Int64(1).semantic_eq(&Scalar::Null));
    }

    #[test]
    fn compare_orders_numerics_across_dtypes() {
        assert_eq!(
            compare_scalars(&Scalar::Int64(2), &Scalar::Float64(2.5)),
            Ordering::Less
        );
        assert_eq!(
            compare_scalars(&Scalar::from("b"), &Scalar::from("a")),
            Ordering::Greater
        );
        assert_eq!(compare_scalars(&Scalar::Null, &Scalar::Int64(0)), Ordering::Greater);
    }

    #[test]
    fn option_converts_to_scalar() {
        assert_eq!(Scalar::from(Some(3_i64)), Scalar::Int64(3));
        assert_eq!(Scalar::from(None::<f64>), Scalar::Null);
    }

    // ── Kernels ────────────────────────────────────────────────────────

    #[test]
    fn kernels_basic() {
        let vals = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(sum_f64(&vals), 40.0);
        assert_eq!(mean_f64(&vals), 5.0);
        assert!((var_f64(&vals, 0) - 4.0).abs() < 1e-10);
        assert!((var_f64(&vals, 1) - 32.0 / 7.0).abs() < 1e-10);
        assert!((std_f64(&vals, 0) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn kernels_report_nan_on_insufficient_values() {
        assert!(mean_f64(&[]).is_nan());
        assert!(median_f64(&[]).is_nan());
        assert!(var_f64(&[5.0], 1).is_nan());
        assert!(std_f64(&[], 1).is_nan());
        assert_eq!(sum_f64(&[]), 0.0);
    }

    #[test]
    fn median_interpolates_even_counts() {
        assert_eq!(median_f64(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_f64(&[1.0, 3.0, 2.0, 4.0]), 2.5);
    }

    #[test]
    fn quantile_uses_linear_interpolation() {
        let vals = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_f64(&vals, 0.0), 1.0);
        assert_eq!(quantile_f64(&vals, 1.0), 5.0);
        assert_eq!(quantile_f64(&vals, 0.25), 2.0);
        assert!((quantile_f64(&[1.0, 2.0], 0.75) - 1.75).abs() < 1e-12);
        assert!(quantile_f64(&vals, 1.5).is_nan());
    }
}
