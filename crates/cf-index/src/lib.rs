#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IndexLabel {
    Int64(i64),
    Utf8(String),
    /// Nanoseconds since the Unix epoch.
    Timestamp(i64),
}

impl From<i64> for IndexLabel {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for IndexLabel {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for IndexLabel {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl fmt::Display for IndexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "ts:{v}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("label '{label}' not found in index")]
    LabelNotFound { label: String },
    #[error("position {position} out of bounds for index of length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("range index step must be non-zero")]
    InvalidStep,
    #[error("timestamp index must be non-decreasing (violated at position {position})")]
    UnsortedTimestamps { position: usize },
    #[error("time-range lookup requires a timestamp index")]
    NotTimestampIndex,
}

/// Which representation backs an [`Index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Range,
    Labels,
    Timestamps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Repr {
    Range { start: i64, stop: i64, step: i64 },
    Labels { labels: Vec<IndexLabel> },
    Timestamps { values: Vec<i64> },
}

/// Row labels of a frame.
///
/// Range indexes answer lookups arithmetically, timestamp indexes by binary
/// search, and discrete label indexes through a label→positions map built on
/// first lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    repr: Repr,
    #[serde(skip)]
    position_cache: OnceLock<HashMap<IndexLabel, Vec<usize>>>,
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for Index {}

impl Index {
    fn from_repr(repr: Repr) -> Self {
        Self {
            repr,
            position_cache: OnceLock::new(),
        }
    }

    /// `0..len` with step 1.
    #[must_use]
    pub fn default_range(len: usize) -> Self {
        Self::from_repr(Repr::Range {
            start: 0,
            stop: len as i64,
            step: 1,
        })
    }

    pub fn range(start: i64, stop: i64, step: i64) -> Result<Self, IndexError> {
        if step == 0 {
            return Err(IndexError::InvalidStep);
        }
        Ok(Self::from_repr(Repr::Range { start, stop, step }))
    }

    #[must_use]
    pub fn labels(labels: Vec<IndexLabel>) -> Self {
        Self::from_repr(Repr::Labels { labels })
    }

    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self::labels(values.into_iter().map(IndexLabel::Int64).collect())
    }

    #[must_use]
    pub fn from_utf8(values: Vec<String>) -> Self {
        Self::labels(values.into_iter().map(IndexLabel::Utf8).collect())
    }

    /// Ordered timestamps; duplicates are allowed, decreases are not.
    pub fn timestamps(values: Vec<i64>) -> Result<Self, IndexError> {
        if let Some(position) = values.windows(2).position(|w| w[1] < w[0]) {
            return Err(IndexError::UnsortedTimestamps {
                position: position + 1,
            });
        }
        Ok(Self::from_repr(Repr::Timestamps { values }))
    }

    #[must_use]
    pub fn kind(&self) -> IndexKind {
        match self.repr {
            Repr::Range { .. } => IndexKind::Range,
            Repr::Labels { .. } => IndexKind::Labels,
            Repr::Timestamps { .. } => IndexKind::Timestamps,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Range { start, stop, step } => range_len(*start, *stop, *step),
            Repr::Labels { labels } => labels.len(),
            Repr::Timestamps { values } => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for `0..len` step 1.
    #[must_use]
    pub fn is_default_range(&self) -> bool {
        matches!(self.repr, Repr::Range { start: 0, step: 1, .. })
    }

    #[must_use]
    pub fn label_at(&self, position: usize) -> Option<IndexLabel> {
        if position >= self.len() {
            return None;
        }
        Some(match &self.repr {
            Repr::Range { start, step, .. } => IndexLabel::Int64(range_label(*start, *step, position)),
            Repr::Labels { labels } => labels[position].clone(),
            Repr::Timestamps { values } => IndexLabel::Timestamp(values[position]),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexLabel> + '_ {
        (0..self.len()).filter_map(|pos| self.label_at(pos))
    }

    #[must_use]
    pub fn to_labels(&self) -> Vec<IndexLabel> {
        self.iter().collect()
    }

    /// First position holding `label`.
    #[must_use]
    pub fn position(&self, label: &IndexLabel) -> Option<usize> {
        self.positions(label).first().copied()
    }

    /// Every position holding `label`, ascending.
    #[must_use]
    pub fn positions(&self, label: &IndexLabel) -> Vec<usize> {
        match (&self.repr, label) {
            (Repr::Range { start, step, .. }, IndexLabel::Int64(target)) => {
                let offset = i128::from(*target) - i128::from(*start);
                let step = i128::from(*step);
                if offset % step != 0 {
                    return Vec::new();
                }
                match usize::try_from(offset / step) {
                    Ok(pos) if pos < self.len() => vec![pos],
                    _ => Vec::new(),
                }
            }
            (Repr::Timestamps { values }, IndexLabel::Timestamp(target)) => {
                let lo = values.partition_point(|v| v < target);
                let hi = values.partition_point(|v| v <= target);
                (lo..hi).collect()
            }
            (Repr::Labels { labels }, _) => self
                .position_cache
                .get_or_init(|| {
                    let mut map: HashMap<IndexLabel, Vec<usize>> = HashMap::new();
                    for (pos, label) in labels.iter().enumerate() {
                        map.entry(label.clone()).or_default().push(pos);
                    }
                    map
                })
                .get(label)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, label: &IndexLabel) -> bool {
        self.position(label).is_some()
    }

    /// Resolve labels to positions in request order. A duplicated label
    /// expands to every position carrying it.
    pub fn resolve(&self, labels: &[IndexLabel]) -> Result<Vec<usize>, IndexError> {
        let mut out = Vec::with_capacity(labels.len());
        for label in labels {
            let found = self.positions(label);
            if found.is_empty() {
                return Err(IndexError::LabelNotFound {
                    label: label.to_string(),
                });
            }
            out.extend(found);
        }
        Ok(out)
    }

    /// Positions whose timestamp lies in `[lo, hi]`.
    pub fn time_range(&self, lo: i64, hi: i64) -> Result<Range<usize>, IndexError> {
        let Repr::Timestamps { values } = &self.repr else {
            return Err(IndexError::NotTimestampIndex);
        };
        let start = values.partition_point(|v| *v < lo);
        let end = values.partition_point(|v| *v <= hi).max(start);
        Ok(start..end)
    }

    /// Labels at `positions`, in that order.
    pub fn take(&self, positions: &[usize]) -> Result<Self, IndexError> {
        let len = self.len();
        if let Some(&position) = positions.iter().find(|&&p| p >= len) {
            return Err(IndexError::PositionOutOfBounds { position, len });
        }
        if let Repr::Timestamps { values } = &self.repr {
            let picked: Vec<i64> = positions.iter().map(|&p| values[p]).collect();
            if picked.windows(2).all(|w| w[0] <= w[1]) {
                return Ok(Self::from_repr(Repr::Timestamps { values: picked }));
            }
        }
        Ok(Self::labels(
            positions
                .iter()
                .filter_map(|&p| self.label_at(p))
                .collect(),
        ))
    }

    /// Labels at `[start, end)`. Range indexes stay arithmetic.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, IndexError> {
        let len = self.len();
        if start > end || end > len {
            return Err(IndexError::PositionOutOfBounds {
                position: end.max(start),
                len,
            });
        }
        Ok(match &self.repr {
            Repr::Range { start: s, stop, step } => {
                // Positions at `len` have no label; the original stop bounds them.
                let bound = |pos: usize| {
                    if pos >= len {
                        *stop
                    } else {
                        range_label(*s, *step, pos)
                    }
                };
                Self::from_repr(Repr::Range {
                    start: bound(start),
                    stop: bound(end),
                    step: *step,
                })
            }
            Repr::Labels { labels } => Self::labels(labels[start..end].to_vec()),
            Repr::Timestamps { values } => Self::from_repr(Repr::Timestamps {
                values: values[start..end].to_vec(),
            }),
        })
    }
}

/// Label at `position`, which must lie inside the range.
fn range_label(start: i64, step: i64, position: usize) -> i64 {
    let wide = i128::from(start) + i128::from(step) * position as i128;
    i64::try_from(wide).unwrap_or(if step > 0 { i64::MAX } else { i64::MIN })
}

fn range_len(start: i64, stop: i64, step: i64) -> usize {
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let len = if step > 0 && stop > start {
        (stop - start + step - 1) / step
    } else if step < 0 && stop < start {
        (start - stop - step - 1) / -step
    } else {
        0
    };
    usize::try_from(len).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::{Index, IndexError, IndexKind, IndexLabel};

    #[test]
    fn default_range_resolves_arithmetically() {
        let index = Index::default_range(4);
        assert_eq!(index.len(), 4);
        assert!(index.is_default_range());
        assert_eq!(index.position(&IndexLabel::Int64(3)), Some(3));
        assert_eq!(index.position(&IndexLabel::Int64(4)), None);
        assert_eq!(index.position(&"a".into()), None);
    }

    #[test]
    fn stepped_ranges_in_both_directions() {
        let up = Index::range(10, 20, 3).expect("range");
        assert_eq!(up.to_labels(), vec![10.into(), 13.into(), 16.into(), 19.into()]);
        assert_eq!(up.position(&IndexLabel::Int64(16)), Some(2));
        assert_eq!(up.position(&IndexLabel::Int64(17)), None);

        let down = Index::range(5, 0, -2).expect("range");
        assert_eq!(down.to_labels(), vec![5.into(), 3.into(), 1.into()]);
        assert_eq!(down.position(&IndexLabel::Int64(1)), Some(2));

        assert_eq!(Index::range(0, 5, 0).expect_err("zero step"), IndexError::InvalidStep);
    }

    #[test]
    fn label_index_reports_every_duplicate_position() {
        let index = Index::labels(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(index.kind(), IndexKind::Labels);
        assert_eq!(index.positions(&"a".into()), vec![0, 2]);
        assert_eq!(index.position(&"b".into()), Some(1));
        assert_eq!(
            index.resolve(&["b".into(), "a".into()]).expect("resolve"),
            vec![1, 0, 2]
        );
        assert_eq!(
            index.resolve(&["z".into()]).expect_err("missing"),
            IndexError::LabelNotFound {
                label: "z".to_owned()
            }
        );
    }

    #[test]
    fn timestamps_must_be_non_decreasing() {
        assert_eq!(
            Index::timestamps(vec![1, 3, 2]).expect_err("unsorted"),
            IndexError::UnsortedTimestamps { position: 2 }
        );
        let index = Index::timestamps(vec![10, 20, 20, 30]).expect("sorted");
        assert_eq!(index.positions(&IndexLabel::Timestamp(20)), vec![1, 2]);
        assert_eq!(index.time_range(15, 25).expect("range"), 1..3);
        assert_eq!(index.time_range(31, 40).expect("range"), 4..4);
    }

    #[test]
    fn time_range_rejects_other_kinds() {
        assert_eq!(
            Index::default_range(3).time_range(0, 1).expect_err("kind"),
            IndexError::NotTimestampIndex
        );
    }

    #[test]
    fn take_and_slice() {
        let index = Index::range(0, 10, 2).expect("range");
        let sliced = index.slice(1, 3).expect("slice");
        assert_eq!(sliced.kind(), IndexKind::Range);
        assert_eq!(sliced.to_labels(), vec![2.into(), 4.into()]);

        let taken = index.take(&[4, 0]).expect("take");
        assert_eq!(taken.to_labels(), vec![8.into(), 0.into()]);
        assert!(matches!(
            index.take(&[5]),
            Err(IndexError::PositionOutOfBounds { position: 5, len: 5 })
        ));

        let ts = Index::timestamps(vec![1, 2, 3]).expect("ts");
        assert_eq!(ts.take(&[0, 2]).expect("take").kind(), IndexKind::Timestamps);
        assert_eq!(ts.take(&[2, 0]).expect("take").kind(), IndexKind::Labels);
    }

    #[test]
    fn equality_compares_labels_not_representation() {
        assert_eq!(Index::default_range(3), Index::from_i64(vec![0, 1, 2]));
        assert_ne!(Index::default_range(3), Index::from_i64(vec![0, 1]));
    }

    #[test]
    fn range_lookups_at_the_i64_extremes_miss_instead_of_overflowing() {
        let index = Index::range(1, 4, 1).expect("range");
        assert_eq!(index.position(&IndexLabel::Int64(i64::MIN)), None);
        assert_eq!(index.position(&IndexLabel::Int64(i64::MAX)), None);
        assert!(index.resolve(&[IndexLabel::Int64(i64::MIN)]).is_err());

        let wide = Index::range(i64::MIN, i64::MAX, i64::MAX).expect("range");
        assert_eq!(wide.len(), 3);
        assert_eq!(
            wide.to_labels(),
            vec![i64::MIN.into(), (-1).into(), (i64::MAX - 1).into()]
        );
        assert_eq!(wide.position(&IndexLabel::Int64(i64::MAX - 1)), Some(2));
        assert_eq!(wide.position(&IndexLabel::Int64(i64::MAX)), None);

        let tail = wide.slice(1, 3).expect("slice");
        assert_eq!(tail.to_labels(), vec![(-1).into(), (i64::MAX - 1).into()]);
        assert!(wide.slice(3, 3).expect("empty slice").is_empty());
    }
}
