#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::sync::Arc;

use cf_types::{DType, Scalar, TypeError, cast_scalar_owned, common_dtype, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Bitset
// ---------------------------------------------------------------------------

/// Fixed-length packed bit vector.
///
/// Bit `i` lives in word `i / 64` at position `i % 64`. Bits past `len` in
/// the last word are always zero so word-level popcounts stay exact.
#[derive(Debug, Clone, Eq)]
pub struct Bitset {
    words: Vec<u64>,
    len: usize,
}

impl Bitset {
    /// `len` zero bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0_u64; len.div_ceil(64)],
            len,
        }
    }

    /// `len` one bits.
    #[must_use]
    pub fn ones(len: usize) -> Self {
        let mut words = vec![u64::MAX; len.div_ceil(64)];
        let remainder = len % 64;
        if remainder > 0 {
            if let Some(last) = words.last_mut() {
                *last = (1_u64 << remainder) - 1;
            }
        }
        Self { words, len }
    }

    #[must_use]
    pub fn from_bools(bits: &[bool]) -> Self {
        bits.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, idx: usize) {
        assert!(
            idx < self.len,
            "bit index {idx} out of range for bitset of length {}",
            self.len
        );
    }

    /// Set bit `idx`. Panics when `idx >= len`.
    pub fn set(&mut self, idx: usize) {
        self.check(idx);
        self.words[idx / 64] |= 1_u64 << (idx % 64);
    }

    /// Clear bit `idx`. Panics when `idx >= len`.
    pub fn clear(&mut self, idx: usize) {
        self.check(idx);
        self.words[idx / 64] &= !(1_u64 << (idx % 64));
    }

    pub fn assign(&mut self, idx: usize, value: bool) {
        if value {
            self.set(idx);
        } else {
            self.clear(idx);
        }
    }

    /// Test bit `idx`. Panics when `idx >= len`.
    #[must_use]
    pub fn test(&self, idx: usize) -> bool {
        self.check(idx);
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    /// Non-panicking form of [`Bitset::test`].
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<bool> {
        (idx < self.len).then(|| (self.words[idx / 64] >> (idx % 64)) & 1 == 1)
    }

    /// Population count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    #[must_use]
    pub fn none(&self) -> bool {
        !self.any()
    }

    #[must_use]
    pub fn all(&self) -> bool {
        self.count() == self.len
    }

    /// Bits `[start, end)` re-indexed from zero. Panics on an invalid range.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        assert!(
            start <= end && end <= self.len,
            "bitset slice {start}..{end} out of range for length {}",
            self.len
        );
        let mut out = Self::new(end - start);
        for (dst, src) in (start..end).enumerate() {
            if self.test(src) {
                out.set(dst);
            }
        }
        out
    }

    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let len = self.len.min(other.len);
        let mut words: Vec<u64> = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .take(len.div_ceil(64))
            .collect();
        mask_tail(&mut words, len);
        Self { words, len }
    }

    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        let len = self.len.min(other.len);
        let mut words: Vec<u64> = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a | b)
            .take(len.div_ceil(64))
            .collect();
        mask_tail(&mut words, len);
        Self { words, len }
    }

    #[must_use]
    pub fn not(&self) -> Self {
        let mut words: Vec<u64> = self.words.iter().map(|w| !w).collect();
        mask_tail(&mut words, self.len);
        Self {
            words,
            len: self.len,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| (self.words[idx / 64] >> (idx % 64)) & 1 == 1)
    }

    /// Positions of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(word_idx * 64 + bit)
            })
        })
    }
}

fn mask_tail(words: &mut [u64], len: usize) {
    let remainder = len % 64;
    if remainder > 0 {
        if let Some(last) = words.last_mut() {
            *last &= (1_u64 << remainder) - 1;
        }
    }
}

impl FromIterator<bool> for Bitset {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let mut words = Vec::new();
        let mut len = 0_usize;
        for bit in iter {
            if len % 64 == 0 {
                words.push(0_u64);
            }
            if bit {
                if let Some(last) = words.last_mut() {
                    *last |= 1_u64 << (len % 64);
                }
            }
            len += 1;
        }
        Self { words, len }
    }
}

impl PartialEq for Bitset {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.words == other.words
    }
}

impl Serialize for Bitset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.iter().collect();
        let mut state = serializer.serialize_struct("Bitset", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Bitset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self::from_bools(&raw.bits))
    }
}

// ---------------------------------------------------------------------------
// Typed storage
// ---------------------------------------------------------------------------

/// Dense typed values of one column. Slots masked as null hold the dtype's
/// zero value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl ColumnData {
    #[must_use]
    pub fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::Bool => Self::Bool(Vec::with_capacity(capacity)),
            DType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            DType::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            DType::Utf8 => Self::Utf8(Vec::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(d) => d.len(),
            Self::Int64(d) => d.len(),
            Self::Float64(d) => d.len(),
            Self::Utf8(d) => d.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw value at `idx`, ignoring validity. Panics when out of range.
    #[must_use]
    pub fn value_at(&self, idx: usize) -> Scalar {
        match self {
            Self::Bool(d) => Scalar::Bool(d[idx]),
            Self::Int64(d) => Scalar::Int64(d[idx]),
            Self::Float64(d) => Scalar::Float64(d[idx]),
            Self::Utf8(d) => Scalar::Utf8(d[idx].clone()),
        }
    }

    /// Push the zero value of this dtype (placeholder for a null slot).
    pub fn push_zero(&mut self) {
        match self {
            Self::Bool(d) => d.push(false),
            Self::Int64(d) => d.push(0),
            Self::Float64(d) => d.push(0.0),
            Self::Utf8(d) => d.push(String::new()),
        }
    }

    /// Push a present value already cast to this dtype.
    fn push_cast(&mut self, value: Scalar) -> Result<(), ColumnError> {
        let dtype = self.dtype();
        match (self, cast_scalar_owned(value, dtype)?) {
            (Self::Bool(d), Scalar::Bool(v)) => d.push(v),
            (Self::Int64(d), Scalar::Int64(v)) => d.push(v),
            (Self::Float64(d), Scalar::Float64(v)) => d.push(v),
            (Self::Utf8(d), Scalar::Utf8(v)) => d.push(v),
            (data, _) => data.push_zero(),
        }
        Ok(())
    }

    /// Copy the value at `src` of `other` (same dtype) onto the end.
    fn push_from(&mut self, other: &Self, src: usize) {
        match (self, other) {
            (Self::Bool(d), Self::Bool(s)) => d.push(s[src]),
            (Self::Int64(d), Self::Int64(s)) => d.push(s[src]),
            (Self::Float64(d), Self::Float64(s)) => d.push(s[src]),
            (Self::Utf8(d), Self::Utf8(s)) => d.push(s[src].clone()),
            (data, _) => data.push_zero(),
        }
    }

    fn nan_positions(&self) -> Option<Vec<usize>> {
        let Self::Float64(values) = self else {
            return None;
        };
        let nans: Vec<usize> = values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.is_nan().then_some(i))
            .collect();
        (!nans.is_empty()).then_some(nans)
    }
}

// ---------------------------------------------------------------------------
// Composite key parts
// ---------------------------------------------------------------------------

/// One component of a structured grouping/join key, borrowed from a column.
///
/// Floats are stored as canonical bits (`-0.0` folds into `0.0`) so equal
/// values hash equally. Nulls are an explicit variant rather than a sentinel
/// string, so no present value can collide with a missing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPart<'a> {
    Null,
    Bool(bool),
    Int64(i64),
    Float(u64),
    Utf8(&'a str),
}

impl KeyPart<'_> {
    #[must_use]
    pub fn float(value: f64) -> Self {
        if value == 0.0 {
            Self::Float(0.0_f64.to_bits())
        } else {
            Self::Float(value.to_bits())
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical form for comparing Int64 and Float64 keys by exact value.
    ///
    /// A float with an integral value inside the i64 range becomes the
    /// matching `Int64`; every other float stays a float. An integer
    /// therefore equals a float only when the float is integral and
    /// `f as i64 == i`, so integers beyond 2^53 never match their rounded
    /// float neighbours.
    #[must_use]
    pub fn promote_numeric(self) -> Self {
        match self {
            Self::Bool(v) => Self::Int64(i64::from(v)),
            Self::Float(bits) => {
                let value = f64::from_bits(bits);
                if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
                    Self::Int64(value as i64)
                } else {
                    self
                }
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("null mask length {mask} does not match value length {values}")]
    MaskLengthMismatch { values: usize, mask: usize },
    #[error("position {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("column '{name}' has non-numeric dtype {dtype}")]
    NonNumeric { name: String, dtype: DType },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// One named, typed, nullable column.
///
/// Values and the null mask sit behind `Arc`s: cloning a `Series` is O(1)
/// and aliases the storage (a view). In-place mutators go through
/// `Arc::make_mut`, so writing to an aliased view first detaches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    name: String,
    data: Arc<ColumnData>,
    nulls: Option<Arc<Bitset>>,
}

impl PartialEq for Series {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.dtype() == other.dtype()
            && self.len() == other.len()
            && (0..self.len()).all(|i| self.value(i) == other.value(i))
    }
}

impl Series {
    /// Wrap typed values with no null mask. Float NaNs are recorded as nulls.
    #[must_use]
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        let nulls = data.nan_positions().map(|positions| {
            let mut mask = Bitset::new(data.len());
            for pos in positions {
                mask.set(pos);
            }
            Arc::new(mask)
        });
        Self {
            name: name.into(),
            data: Arc::new(data),
            nulls,
        }
    }

    /// Wrap typed values with an explicit null mask (set bit = null).
    pub fn with_nulls(
        name: impl Into<String>,
        data: ColumnData,
        nulls: Option<Bitset>,
    ) -> Result<Self, ColumnError> {
        let mut series = Self::new(name, data);
        if let Some(mask) = nulls {
            if mask.len() != series.len() {
                return Err(ColumnError::MaskLengthMismatch {
                    values: series.len(),
                    mask: mask.len(),
                });
            }
            let merged = match series.nulls.take() {
                Some(nan_mask) => mask.or(&nan_mask),
                None => mask,
            };
            series.nulls = merged.any().then(|| Arc::new(merged));
        }
        Ok(series)
    }

    /// Build from dynamically-typed values, inferring the dtype. An all-null
    /// input becomes a Float64 column.
    pub fn from_values(name: impl Into<String>, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?.unwrap_or(DType::Float64);
        Self::from_values_with_dtype(name, dtype, values)
    }

    /// Build from dynamically-typed values, casting each to `dtype`.
    pub fn from_values_with_dtype(
        name: impl Into<String>,
        dtype: DType,
        values: Vec<Scalar>,
    ) -> Result<Self, ColumnError> {
        let len = values.len();
        let mut data = ColumnData::with_capacity(dtype, len);
        let mut nulls: Option<Bitset> = None;
        for (idx, value) in values.into_iter().enumerate() {
            if value.is_missing() {
                data.push_zero();
                nulls.get_or_insert_with(|| Bitset::new(len)).set(idx);
            } else {
                data.push_cast(value)?;
            }
        }
        Self::with_nulls(name, data, nulls)
    }

    #[must_use]
    pub fn from_i64(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(name, ColumnData::Int64(values))
    }

    #[must_use]
    pub fn from_f64(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, ColumnData::Float64(values))
    }

    #[must_use]
    pub fn from_bool(name: impl Into<String>, values: Vec<bool>) -> Self {
        Self::new(name, ColumnData::Bool(values))
    }

    #[must_use]
    pub fn from_strings<S: Into<String>>(name: impl Into<String>, values: Vec<S>) -> Self {
        Self::new(
            name,
            ColumnData::Utf8(values.into_iter().map(Into::into).collect()),
        )
    }

    /// A column of `len` nulls.
    #[must_use]
    pub fn full_null(name: impl Into<String>, dtype: DType, len: usize) -> Self {
        let mut data = ColumnData::with_capacity(dtype, len);
        for _ in 0..len {
            data.push_zero();
        }
        Self {
            name: name.into(),
            data: Arc::new(data),
            nulls: (len > 0).then(|| Arc::new(Bitset::ones(len))),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// The null mask, absent when the column has never held a null.
    #[must_use]
    pub fn null_mask(&self) -> Option<&Bitset> {
        self.nulls.as_deref()
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.nulls.as_ref().map_or(0, |mask| mask.count())
    }

    #[must_use]
    pub fn has_nulls(&self) -> bool {
        self.null_count() > 0
    }

    /// Number of present values.
    #[must_use]
    pub fn count(&self) -> usize {
        self.len() - self.null_count()
    }

    /// True when `idx` is out of range or masked.
    #[must_use]
    pub fn is_null(&self, idx: usize) -> bool {
        if idx >= self.len() {
            return true;
        }
        self.nulls
            .as_ref()
            .is_some_and(|mask| mask.get(idx).unwrap_or(false))
    }

    #[must_use]
    pub fn is_valid(&self, idx: usize) -> bool {
        !self.is_null(idx)
    }

    /// True when both series alias the same value buffer.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// `(value, valid)`. Invalid slots (null or out of range) report the
    /// dtype's zero value with `valid == false`.
    #[must_use]
    pub fn get(&self, idx: usize) -> (Scalar, bool) {
        if self.is_null(idx) {
            return (Scalar::zero_value(self.dtype()), false);
        }
        (self.data.value_at(idx), true)
    }

    /// Value at `idx`, or `Scalar::Null` when invalid.
    #[must_use]
    pub fn value(&self, idx: usize) -> Scalar {
        match self.get(idx) {
            (value, true) => value,
            (_, false) => Scalar::Null,
        }
    }

    /// Stored value at `idx` without consulting the null mask.
    ///
    /// For hot loops that already checked validity; a masked slot yields its
    /// placeholder. Panics when `idx` is out of range.
    #[must_use]
    pub fn get_unchecked(&self, idx: usize) -> Scalar {
        self.data.value_at(idx)
    }

    /// Numeric value at `idx`, `None` when null, out of range, or Utf8.
    #[must_use]
    pub fn f64_at(&self, idx: usize) -> Option<f64> {
        if self.is_null(idx) {
            return None;
        }
        match self.data.as_ref() {
            ColumnData::Bool(d) => Some(if d[idx] { 1.0 } else { 0.0 }),
            ColumnData::Int64(d) => Some(d[idx] as f64),
            ColumnData::Float64(d) => Some(d[idx]),
            ColumnData::Utf8(_) => None,
        }
    }

    /// Structured key component at `idx`.
    #[must_use]
    pub fn key_part(&self, idx: usize) -> KeyPart<'_> {
        if self.is_null(idx) {
            return KeyPart::Null;
        }
        match self.data.as_ref() {
            ColumnData::Bool(d) => KeyPart::Bool(d[idx]),
            ColumnData::Int64(d) => KeyPart::Int64(d[idx]),
            ColumnData::Float64(d) => KeyPart::float(d[idx]),
            ColumnData::Utf8(d) => KeyPart::Utf8(d[idx].as_str()),
        }
    }

    /// Order two present values of this column. Callers handle nulls.
    #[must_use]
    pub fn cmp_positions(&self, left: usize, right: usize) -> Ordering {
        match self.data.as_ref() {
            ColumnData::Bool(d) => d[left].cmp(&d[right]),
            ColumnData::Int64(d) => d[left].cmp(&d[right]),
            ColumnData::Float64(d) => d[left].total_cmp(&d[right]),
            ColumnData::Utf8(d) => d[left].cmp(&d[right]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Scalar> + '_ {
        (0..self.len()).map(|idx| self.value(idx))
    }

    #[must_use]
    pub fn to_values(&self) -> Vec<Scalar> {
        self.iter().collect()
    }

    fn check_position(&self, idx: usize) -> Result<(), ColumnError> {
        if idx >= self.len() {
            return Err(ColumnError::IndexOutOfBounds {
                index: idx,
                len: self.len(),
            });
        }
        Ok(())
    }

    // ── In-place mutators ──────────────────────────────────────────────

    /// Overwrite the value at `idx`. A missing `value` is the same as
    /// [`Series::set_null`].
    pub fn set(&mut self, idx: usize, value: Scalar) -> Result<(), ColumnError> {
        self.check_position(idx)?;
        if value.is_missing() {
            return self.set_null(idx);
        }
        let cast = cast_scalar_owned(value, self.dtype())?;
        match (Arc::make_mut(&mut self.data), cast) {
            (ColumnData::Bool(d), Scalar::Bool(v)) => d[idx] = v,
            (ColumnData::Int64(d), Scalar::Int64(v)) => d[idx] = v,
            (ColumnData::Float64(d), Scalar::Float64(v)) => d[idx] = v,
            (ColumnData::Utf8(d), Scalar::Utf8(v)) => d[idx] = v,
            (data, other) => {
                return Err(ColumnError::InvalidArgument(format!(
                    "cannot store {other:?} in {} column",
                    data.dtype()
                )));
            }
        }
        if let Some(mask) = self.nulls.as_mut() {
            Arc::make_mut(mask).clear(idx);
        }
        Ok(())
    }

    /// Mark `idx` null, allocating the mask on first use.
    pub fn set_null(&mut self, idx: usize) -> Result<(), ColumnError> {
        self.check_position(idx)?;
        let len = self.len();
        let mask = self.nulls.get_or_insert_with(|| Arc::new(Bitset::new(len)));
        Arc::make_mut(mask).set(idx);
        match Arc::make_mut(&mut self.data) {
            ColumnData::Bool(d) => d[idx] = false,
            ColumnData::Int64(d) => d[idx] = 0,
            ColumnData::Float64(d) => d[idx] = 0.0,
            ColumnData::Utf8(d) => d[idx] = String::new(),
        }
        Ok(())
    }

    // ── Copying transforms ─────────────────────────────────────────────

    /// Deep copy: fresh value buffer and mask, sharing nothing.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: Arc::new(self.data.as_ref().clone()),
            nulls: self.nulls.as_ref().map(|mask| Arc::new(mask.as_ref().clone())),
        }
    }

    /// New series with every null replaced by `fill` and no mask.
    pub fn fill_na(&self, fill: &Scalar) -> Result<Self, ColumnError> {
        if fill.is_missing() {
            return Err(ColumnError::InvalidArgument(
                "fill value must not be missing".to_owned(),
            ));
        }
        let mut data = ColumnData::with_capacity(self.dtype(), self.len());
        for idx in 0..self.len() {
            if self.is_null(idx) {
                data.push_cast(fill.clone())?;
            } else {
                data.push_from(&self.data, idx);
            }
        }
        Ok(Self {
            name: self.name.clone(),
            data: Arc::new(data),
            nulls: None,
        })
    }

    /// New, shorter series without nulls, preserving relative order.
    #[must_use]
    pub fn drop_na(&self) -> Self {
        let mut data = ColumnData::with_capacity(self.dtype(), self.count());
        for idx in 0..self.len() {
            if !self.is_null(idx) {
                data.push_from(&self.data, idx);
            }
        }
        Self {
            name: self.name.clone(),
            data: Arc::new(data),
            nulls: None,
        }
    }

    /// Gather rows by position into fresh storage.
    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let mut data = ColumnData::with_capacity(self.dtype(), positions.len());
        let mut nulls: Option<Bitset> = None;
        for (dst, &src) in positions.iter().enumerate() {
            self.check_position(src)?;
            data.push_from(&self.data, src);
            if self.is_null(src) {
                nulls
                    .get_or_insert_with(|| Bitset::new(positions.len()))
                    .set(dst);
            }
        }
        Ok(self.rebuilt(data, nulls))
    }

    /// Gather rows by optional position; `None` produces a null slot.
    pub fn take_optional(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let mut data = ColumnData::with_capacity(self.dtype(), positions.len());
        let mut nulls: Option<Bitset> = None;
        for (dst, slot) in positions.iter().enumerate() {
            match *slot {
                Some(src) => {
                    self.check_position(src)?;
                    data.push_from(&self.data, src);
                    if self.is_null(src) {
                        nulls
                            .get_or_insert_with(|| Bitset::new(positions.len()))
                            .set(dst);
                    }
                }
                None => {
                    data.push_zero();
                    nulls
                        .get_or_insert_with(|| Bitset::new(positions.len()))
                        .set(dst);
                }
            }
        }
        Ok(self.rebuilt(data, nulls))
    }

    /// Keep rows whose bit is set in `keep`.
    pub fn filter_mask(&self, keep: &Bitset) -> Result<Self, ColumnError> {
        if keep.len() != self.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: keep.len(),
            });
        }
        let positions: Vec<usize> = keep.iter_ones().collect();
        self.take(&positions)
    }

    /// Rows `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, ColumnError> {
        if start > end || end > self.len() {
            return Err(ColumnError::IndexOutOfBounds {
                index: end.max(start),
                len: self.len(),
            });
        }
        let positions: Vec<usize> = (start..end).collect();
        self.take(&positions)
    }

    /// Concatenate `other` below `self`, promoting to a common dtype.
    pub fn append(&self, other: &Self) -> Result<Self, ColumnError> {
        let dtype = if self.is_empty() {
            other.dtype()
        } else if other.is_empty() {
            self.dtype()
        } else {
            common_dtype(self.dtype(), other.dtype())?
        };
        let values = self.iter().chain(other.iter()).collect();
        Self::from_values_with_dtype(self.name.clone(), dtype, values)
    }

    /// Lossless cast to `dtype`; nulls stay null.
    pub fn cast(&self, dtype: DType) -> Result<Self, ColumnError> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        Self::from_values_with_dtype(self.name.clone(), dtype, self.to_values())
    }

    fn rebuilt(&self, data: ColumnData, nulls: Option<Bitset>) -> Self {
        Self {
            name: self.name.clone(),
            data: Arc::new(data),
            nulls: nulls.map(Arc::new),
        }
    }

    // ── Reducers (null-skipping) ───────────────────────────────────────

    /// Present values as f64; errors for Utf8 columns.
    pub fn valid_f64(&self) -> Result<Vec<f64>, ColumnError> {
        if !self.dtype().is_numeric() {
            return Err(ColumnError::NonNumeric {
                name: self.name.clone(),
                dtype: self.dtype(),
            });
        }
        Ok((0..self.len()).filter_map(|idx| self.f64_at(idx)).collect())
    }

    pub fn sum(&self) -> Result<f64, ColumnError> {
        Ok(cf_types::sum_f64(&self.valid_f64()?))
    }

    /// NaN when there are no present values.
    pub fn mean(&self) -> Result<f64, ColumnError> {
        Ok(cf_types::mean_f64(&self.valid_f64()?))
    }

    /// Sample variance (n − 1); NaN below two present values.
    pub fn var(&self) -> Result<f64, ColumnError> {
        Ok(cf_types::var_f64(&self.valid_f64()?, 1))
    }

    /// Sample standard deviation (n − 1); NaN below two present values.
    pub fn std(&self) -> Result<f64, ColumnError> {
        Ok(cf_types::std_f64(&self.valid_f64()?, 1))
    }

    pub fn median(&self) -> Result<f64, ColumnError> {
        Ok(cf_types::median_f64(&self.valid_f64()?))
    }

    pub fn quantile(&self, q: f64) -> Result<f64, ColumnError> {
        if !(0.0..=1.0).contains(&q) {
            return Err(ColumnError::InvalidArgument(format!(
                "quantile must be within [0, 1], got {q}"
            )));
        }
        Ok(cf_types::quantile_f64(&self.valid_f64()?, q))
    }

    /// Smallest present value under the column's natural ordering.
    #[must_use]
    pub fn min(&self) -> Option<Scalar> {
        self.extreme(Ordering::Less)
    }

    /// Largest present value under the column's natural ordering.
    #[must_use]
    pub fn max(&self) -> Option<Scalar> {
        self.extreme(Ordering::Greater)
    }

    fn extreme(&self, wanted: Ordering) -> Option<Scalar> {
        let mut best: Option<usize> = None;
        for idx in (0..self.len()).filter(|&idx| !self.is_null(idx)) {
            best = match best {
                Some(current) if self.cmp_positions(idx, current) != wanted => Some(current),
                _ => Some(idx),
            };
        }
        best.map(|idx| self.data.value_at(idx))
    }
}

#[cfg(test)]
mod tests {
    use cf_types::{DType, Scalar};

    use super::{Bitset, ColumnData, ColumnError, KeyPart, Series};

    // ── Bitset ─────────────────────────────────────────────────────────

    #[test]
    fn bitset_set_clear_test_count() {
        let mut bits = Bitset::new(130);
        assert!(bits.none());
        bits.set(0);
        bits.set(64);
        bits.set(129);
        assert!(bits.test(64));
        assert!(!bits.test(65));
        assert_eq!(bits.count(), 3);
        bits.clear(64);
        assert_eq!(bits.count(), 2);
        assert!(bits.any());
        assert!(!bits.all());
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![0, 129]);
    }

    #[test]
    fn bitset_ones_and_not_respect_length() {
        let ones = Bitset::ones(70);
        assert!(ones.all());
        assert_eq!(ones.count(), 70);
        assert_eq!(ones.not().count(), 0);
        assert!(Bitset::new(0).all());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bitset_test_out_of_range_panics() {
        let bits = Bitset::new(3);
        let _ = bits.test(3);
    }

    #[test]
    fn bitset_get_is_non_panicking() {
        let bits = Bitset::from_bools(&[true, false]);
        assert_eq!(bits.get(0), Some(true));
        assert_eq!(bits.get(1), Some(false));
        assert_eq!(bits.get(2), None);
    }

    #[test]
    fn bitset_slice_reindexes_from_zero() {
        let bits = Bitset::from_bools(&[false, true, true, false, true]);
        let sub = bits.slice(1, 4);
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.iter().collect::<Vec<_>>(), vec![true, true, false]);
    }

    #[test]
    fn bitset_clone_is_deep() {
        let mut original = Bitset::new(4);
        let copy = original.clone();
        original.set(2);
        assert!(!copy.test(2));
    }

    #[test]
    fn bitset_and_or() {
        let a = Bitset::from_bools(&[true, true, false]);
        let b = Bitset::from_bools(&[true, false, false]);
        assert_eq!(a.and(&b).count(), 1);
        assert_eq!(a.or(&b).count(), 2);
    }

    #[test]
    fn bitset_serde_round_trip() {
        let bits = Bitset::from_bools(&[true, false, true]);
        let json = serde_json::to_string(&bits).expect("serialize");
        assert_eq!(json, r#"{"bits":[true,false,true]}"#);
        let back: Bitset = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, bits);
    }

    // ── Series ─────────────────────────────────────────────────────────

    #[test]
    fn get_reports_zero_value_for_invalid_slots() {
        let s = Series::from_values(
            "x",
            vec![Scalar::Float64(1.0), Scalar::Null, Scalar::Float64(3.0)],
        )
        .expect("series");
        assert_eq!(s.get(0), (Scalar::Float64(1.0), true));
        assert_eq!(s.get(1), (Scalar::Float64(0.0), false));
        assert_eq!(s.get(9), (Scalar::Float64(0.0), false));
        assert_eq!(s.value(1), Scalar::Null);
    }

    #[test]
    fn nan_is_recorded_as_null() {
        let s = Series::from_f64("x", vec![1.0, f64::NAN]);
        assert_eq!(s.null_count(), 1);
        assert!(s.is_null(1));
    }

    #[test]
    fn mask_length_must_match_values() {
        let err = Series::with_nulls("x", ColumnData::Int64(vec![1, 2]), Some(Bitset::new(3)))
            .expect_err("mismatch");
        assert_eq!(err, ColumnError::MaskLengthMismatch { values: 2, mask: 3 });
    }

    #[test]
    fn fill_na_replaces_nulls_and_drops_mask() {
        let s = Series::from_values(
            "x",
            vec![Scalar::Float64(1.0), Scalar::Null, Scalar::Float64(3.0)],
        )
        .expect("series");
        let filled = s.fill_na(&Scalar::Float64(0.0)).expect("fill");
        assert_eq!(
            filled.to_values(),
            vec![
                Scalar::Float64(1.0),
                Scalar::Float64(0.0),
                Scalar::Float64(3.0)
            ]
        );
        assert_eq!(filled.null_count(), 0);
        assert!(filled.null_mask().is_none());
    }

    #[test]
    fn drop_na_preserves_order() {
        let s = Series::from_values(
            "x",
            vec![Scalar::Float64(1.0), Scalar::Null, Scalar::Float64(3.0)],
        )
        .expect("series");
        let dropped = s.drop_na();
        assert_eq!(dropped.len(), 2);
        assert_eq!(
            dropped.to_values(),
            vec![Scalar::Float64(1.0), Scalar::Float64(3.0)]
        );
    }

    #[test]
    fn set_null_allocates_mask_lazily() {
        let mut s = Series::from_i64("x", vec![1, 2, 3]);
        assert!(s.null_mask().is_none());
        s.set_null(1).expect("set null");
        assert_eq!(s.null_count(), 1);
        assert_eq!(s.value(1), Scalar::Null);
        s.set(1, Scalar::Int64(9)).expect("set");
        assert_eq!(s.value(1), Scalar::Int64(9));
        assert_eq!(s.null_count(), 0);
    }

    #[test]
    fn set_rejects_out_of_range_and_bad_types() {
        let mut s = Series::from_i64("x", vec![1]);
        assert_eq!(
            s.set(5, Scalar::Int64(1)).expect_err("oob"),
            ColumnError::IndexOutOfBounds { index: 5, len: 1 }
        );
        assert!(s.set(0, Scalar::from("text")).is_err());
    }

    #[test]
    fn clone_aliases_and_mutation_detaches() {
        let original = Series::from_i64("x", vec![1, 2, 3]);
        let mut view = original.clone();
        assert!(view.shares_storage(&original));
        view.set(0, Scalar::Int64(100)).expect("set");
        assert!(!view.shares_storage(&original));
        assert_eq!(original.value(0), Scalar::Int64(1));
        assert_eq!(view.value(0), Scalar::Int64(100));
    }

    #[test]
    fn copy_shares_nothing() {
        let original = Series::from_i64("x", vec![1, 2]);
        let copy = original.copy();
        assert!(!copy.shares_storage(&original));
        assert_eq!(copy, original);
    }

    #[test]
    fn take_optional_nulls_missing_slots() {
        let s = Series::from_strings("s", vec!["a", "b"]);
        let out = s.take_optional(&[Some(1), None, Some(0)]).expect("take");
        assert_eq!(
            out.to_values(),
            vec![Scalar::from("b"), Scalar::Null, Scalar::from("a")]
        );
    }

    #[test]
    fn reducers_skip_nulls() {
        let s = Series::from_values(
            "x",
            vec![
                Scalar::Int64(2),
                Scalar::Null,
                Scalar::Int64(4),
                Scalar::Int64(9),
            ],
        )
        .expect("series");
        assert_eq!(s.sum().expect("sum"), 15.0);
        assert_eq!(s.mean().expect("mean"), 5.0);
        assert_eq!(s.median().expect("median"), 4.0);
        assert!((s.var().expect("var") - 13.0).abs() < 1e-12);
        assert_eq!(s.min(), Some(Scalar::Int64(2)));
        assert_eq!(s.max(), Some(Scalar::Int64(9)));
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn std_and_mean_report_nan_on_sparse_input() {
        let single = Series::from_values("x", vec![Scalar::Float64(1.0), Scalar::Null])
            .expect("series");
        assert!(single.std().expect("std").is_nan());
        let empty = Series::full_null("x", DType::Float64, 2);
        assert!(empty.mean().expect("mean").is_nan());
        assert!(empty.median().expect("median").is_nan());
        assert_eq!(empty.min(), None);
    }

    #[test]
    fn min_max_use_generic_ordering_for_strings() {
        let s = Series::from_strings("s", vec!["pear", "apple", "zoo"]);
        assert_eq!(s.min(), Some(Scalar::from("apple")));
        assert_eq!(s.max(), Some(Scalar::from("zoo")));
        assert!(matches!(s.sum(), Err(ColumnError::NonNumeric { .. })));
    }

    #[test]
    fn quantile_validates_range() {
        let s = Series::from_f64("x", vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.quantile(0.5).expect("q"), 2.5);
        assert!(s.quantile(-0.1).is_err());
    }

    #[test]
    fn append_promotes_dtype() {
        let a = Series::from_i64("x", vec![1]);
        let b = Series::from_f64("x", vec![2.5]);
        let out = a.append(&b).expect("append");
        assert_eq!(out.dtype(), DType::Float64);
        assert_eq!(
            out.to_values(),
            vec![Scalar::Float64(1.0), Scalar::Float64(2.5)]
        );
    }

    #[test]
    fn key_parts_fold_negative_zero_and_mark_nulls() {
        let s = Series::from_values(
            "x",
            vec![Scalar::Float64(0.0), Scalar::Float64(-0.0), Scalar::Null],
        )
        .expect("series");
        assert_eq!(s.key_part(0), s.key_part(1));
        assert_eq!(s.key_part(2), KeyPart::Null);
        assert_eq!(KeyPart::Int64(2).promote_numeric(), KeyPart::float(2.0).promote_numeric());
    }

    #[test]
    fn numeric_key_promotion_is_exact() {
        let big = 9_007_199_254_740_993_i64;
        assert_ne!(
            KeyPart::Int64(big).promote_numeric(),
            KeyPart::float(9_007_199_254_740_992.0).promote_numeric()
        );
        assert_eq!(
            KeyPart::Int64(big - 1).promote_numeric(),
            KeyPart::float(9_007_199_254_740_992.0).promote_numeric()
        );
        assert_eq!(KeyPart::float(-0.0).promote_numeric(), KeyPart::Int64(0));
        assert_eq!(KeyPart::Bool(true).promote_numeric(), KeyPart::Int64(1));
        assert_eq!(KeyPart::float(2.5).promote_numeric(), KeyPart::float(2.5));
        assert_eq!(KeyPart::float(1e19).promote_numeric(), KeyPart::float(1e19));
        assert_eq!(
            KeyPart::float(i64::MIN as f64).promote_numeric(),
            KeyPart::Int64(i64::MIN)
        );
    }
}
