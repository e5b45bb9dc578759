use std::collections::{BTreeMap, BTreeSet};

use ndarray::{Array, ArrayBase, Axis, Data, RemoveAxis, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Half-open frame range `[start, end)` that a recording occupies within its
/// padded batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub start: usize,
    pub end: usize,
}

impl Bounds {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Maps batch rows back to the recordings they were cut from.
///
/// Row `r` of every batched array belongs to `keys()[r]` and carries real
/// data only inside `bounds()[r]`; everything outside is padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    keys: Vec<String>,
    bounds: Vec<Bounds>,
}

impl Metadata {
    /// Validates and pairs recording keys with their frame bounds.
    ///
    /// Keys must be unique, non-empty, and free of `/`, which the artifact
    /// layer reserves as a path separator.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::MetadataMismatch`] when the two lists differ in
    /// length, [`FitError::InvalidBounds`] for an inverted range, and
    /// [`FitError::InvalidRecordingId`] for an unusable key.
    pub fn new(keys: Vec<String>, bounds: Vec<Bounds>) -> Result<Self> {
        if keys.len() != bounds.len() {
            return Err(FitError::MetadataMismatch {
                keys: keys.len(),
                bounds: bounds.len(),
            });
        }

        let mut seen = BTreeSet::new();
        for (key, b) in keys.iter().zip(&bounds) {
            if b.start > b.end {
                return Err(FitError::InvalidBounds {
                    key: key.clone(),
                    start: b.start,
                    end: b.end,
                });
            }
            if key.is_empty() {
                return Err(FitError::InvalidRecordingId {
                    key: key.clone(),
                    reason: "empty",
                });
            }
            if key.contains('/') {
                return Err(FitError::InvalidRecordingId {
                    key: key.clone(),
                    reason: "contains '/'",
                });
            }
            if !seen.insert(key.as_str()) {
                return Err(FitError::InvalidRecordingId {
                    key: key.clone(),
                    reason: "duplicate",
                });
            }
        }

        Ok(Self { keys, bounds })
    }

    /// Number of recordings, which is also the expected batch row count.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn bounds(&self) -> &[Bounds] {
        &self.bounds
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Bounds)> {
        self.keys
            .iter()
            .zip(&self.bounds)
            .map(|(k, b)| (k.as_str(), *b))
    }
}

/// Splits a padded batch back into one array per recording.
///
/// Axis 0 is the batch axis, axis 1 the time axis; any trailing axes pass
/// through unchanged. Each output drops the padding outside the recording's
/// bounds, so its time axis has length `bounds.len()`.
///
/// # Errors
///
/// Returns [`FitError::ShapeMismatch`] when the batch row count disagrees
/// with the metadata and [`FitError::BoundsOutOfRange`] when a recording's
/// bounds reach past the time axis.
pub fn unbatch<A, S, D>(
    batched: &ArrayBase<S, D>,
    metadata: &Metadata,
) -> Result<BTreeMap<String, Array<A, D::Smaller>>>
where
    A: Clone,
    S: Data<Elem = A>,
    D: RemoveAxis,
{
    if batched.ndim() < 2 {
        return Err(FitError::ShapeMismatch {
            what: "batch axes",
            got: batched.ndim(),
            expected: 2,
        });
    }
    if batched.len_of(Axis(0)) != metadata.len() {
        return Err(FitError::ShapeMismatch {
            what: "batch rows",
            got: batched.len_of(Axis(0)),
            expected: metadata.len(),
        });
    }

    let time_len = batched.len_of(Axis(1));
    let mut out = BTreeMap::new();
    for (row, (key, b)) in metadata.iter().enumerate() {
        if b.end > time_len {
            return Err(FitError::BoundsOutOfRange {
                key: key.to_string(),
                start: b.start,
                end: b.end,
                len: time_len,
            });
        }
        let trimmed = batched
            .index_axis(Axis(0), row)
            .slice_axis(Axis(0), Slice::from(b.start..b.end))
            .to_owned();
        out.insert(key.to_string(), trimmed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn metadata() -> Metadata {
        Metadata::new(
            vec!["rec_a".to_string(), "rec_b".to_string()],
            vec![Bounds::new(2, 8), Bounds::new(0, 10)],
        )
        .unwrap()
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let err = Metadata::new(vec!["rec_a".to_string()], vec![]).unwrap_err();
        assert!(matches!(
            err,
            FitError::MetadataMismatch { keys: 1, bounds: 0 }
        ));
    }

    #[test]
    fn inverted_bounds_rejected() {
        let err = Metadata::new(vec!["rec_a".to_string()], vec![Bounds::new(5, 2)]).unwrap_err();
        assert!(matches!(err, FitError::InvalidBounds { start: 5, end: 2, .. }));
    }

    #[test]
    fn separator_in_key_rejected() {
        let err = Metadata::new(
            vec!["session/one".to_string()],
            vec![Bounds::new(0, 1)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FitError::InvalidRecordingId {
                reason: "contains '/'",
                ..
            }
        ));
    }

    #[test]
    fn duplicate_key_rejected() {
        let err = Metadata::new(
            vec!["rec_a".to_string(), "rec_a".to_string()],
            vec![Bounds::new(0, 1), Bounds::new(0, 1)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FitError::InvalidRecordingId {
                reason: "duplicate",
                ..
            }
        ));
    }

    #[test]
    fn unbatch_trims_each_row_to_its_bounds() {
        let metadata = metadata();
        let batched =
            Array2::from_shape_fn((2, 10), |(r, t)| (r * 100 + t) as f64);

        let split = unbatch(&batched, &metadata).unwrap();
        assert_eq!(split.len(), 2);

        let a = &split["rec_a"];
        assert_eq!(a.len(), 6);
        assert_eq!(a[0], 2.0);
        assert_eq!(a[5], 7.0);

        let b = &split["rec_b"];
        assert_eq!(b.len(), 10);
        assert_eq!(b[0], 100.0);
        assert_eq!(b[9], 109.0);
    }

    #[test]
    fn unbatch_keeps_trailing_axes() {
        let metadata = metadata();
        let batched = Array3::from_shape_fn((2, 10, 3), |(r, t, d)| {
            (r * 1000 + t * 10 + d) as f64
        });

        let split = unbatch(&batched, &metadata).unwrap();
        let a = &split["rec_a"];
        assert_eq!(a.dim(), (6, 3));
        assert_eq!(a[[0, 0]], 20.0);
        assert_eq!(a[[5, 2]], 72.0);
    }

    #[test]
    fn bounds_past_time_axis_rejected() {
        let metadata = Metadata::new(
            vec!["rec_a".to_string()],
            vec![Bounds::new(0, 11)],
        )
        .unwrap();
        let batched = Array2::<f64>::zeros((1, 10));
        let err = unbatch(&batched, &metadata).unwrap_err();
        assert!(matches!(
            err,
            FitError::BoundsOutOfRange { end: 11, len: 10, .. }
        ));
    }

    #[test]
    fn row_count_mismatch_rejected() {
        let metadata = metadata();
        let batched = Array2::<f64>::zeros((3, 10));
        let err = unbatch(&batched, &metadata).unwrap_err();
        assert!(matches!(
            err,
            FitError::ShapeMismatch {
                what: "batch rows",
                got: 3,
                expected: 2,
            }
        ));
    }
}
