use std::collections::BTreeMap;

use ndarray::{Array2, Array3, ArrayD};

use crate::error::{FitError, Result};
use crate::hypparams::HypParams;

/// Per-recording latent trajectories, stacked along a shared batch axis.
///
/// The discrete labels are shorter than the continuous trajectories: an
/// autoregressive model only emits a label once it has seen its full lag
/// window, so the label axis is `nlags` frames behind the others. The gap is
/// recovered with [`nlags`](Self::nlags) and re-aligned during results
/// extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentStates {
    syllables: Array2<u32>,
    latents: Array3<f64>,
    centroids: Array3<f64>,
    headings: Array2<f64>,
}

impl LatentStates {
    /// Builds a state bundle, validating that every array agrees on the
    /// batch axis and that the label axis is no longer than the time axis.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::ShapeMismatch`] naming the first axis that
    /// disagrees.
    pub fn new(
        syllables: Array2<u32>,
        latents: Array3<f64>,
        centroids: Array3<f64>,
        headings: Array2<f64>,
    ) -> Result<Self> {
        let (rows, time, _) = latents.dim();

        check_axis("syllable rows", syllables.dim().0, rows)?;
        check_axis("centroid rows", centroids.dim().0, rows)?;
        check_axis("heading rows", headings.dim().0, rows)?;
        check_axis("centroid frames", centroids.dim().1, time)?;
        check_axis("heading frames", headings.dim().1, time)?;
        if syllables.dim().1 > time {
            return Err(FitError::ShapeMismatch {
                what: "syllable frames",
                got: syllables.dim().1,
                expected: time,
            });
        }

        Ok(Self {
            syllables,
            latents,
            centroids,
            headings,
        })
    }

    /// Number of rows in the padded batch.
    pub fn rows(&self) -> usize {
        self.latents.dim().0
    }

    /// Length of the padded time axis.
    pub fn time_len(&self) -> usize {
        self.latents.dim().1
    }

    /// Lag window of the label axis, recovered from the axis lengths.
    pub fn nlags(&self) -> usize {
        self.time_len() - self.syllables.dim().1
    }

    pub fn syllables(&self) -> &Array2<u32> {
        &self.syllables
    }

    pub fn latents(&self) -> &Array3<f64> {
        &self.latents
    }

    pub fn centroids(&self) -> &Array3<f64> {
        &self.centroids
    }

    pub fn headings(&self) -> &Array2<f64> {
        &self.headings
    }
}

fn check_axis(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(FitError::ShapeMismatch {
            what,
            got,
            expected,
        });
    }
    Ok(())
}

/// Named model parameters, each an arbitrary-rank float array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: BTreeMap<String, ArrayD<f64>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f64>) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f64>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Named observation arrays, padded and stacked the same way as the states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchedData {
    arrays: BTreeMap<String, ArrayD<f64>>,
}

impl BatchedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f64>) {
        self.arrays.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.arrays.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f64>)> {
        self.arrays.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

/// Everything the sampler reads and rewrites each iteration.
///
/// The seed is carried alongside the numeric state so that a snapshot restores
/// the pseudo-random stream as well as the values.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub states: LatentStates,
    pub params: Params,
    pub hypparams: HypParams,
    pub seed: u64,
}
