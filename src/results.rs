use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::info;
use ndarray::{Array1, Array2, Axis, Ix1, Ix2, Slice};

use crate::artifact::{into_dim, Artifact, Tensor};
use crate::batch::{unbatch, Metadata};
use crate::error::{FitError, Result};
use crate::state::ModelState;

/// File name of the results artifact inside a run directory.
pub const RESULTS_FILE: &str = "results.safetensors";

/// Per-recording model output with every leaf re-aligned to the recording's
/// own frame axis.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResults {
    /// Discrete label per frame.
    pub syllable: Array1<u32>,
    /// Continuous pose trajectory, frames by dimensions.
    pub latent_state: Array2<f64>,
    /// Planar position per frame.
    pub centroid: Array2<f64>,
    /// Orientation angle per frame.
    pub heading: Array1<f64>,
}

pub type Results = BTreeMap<String, RecordingResults>;

/// Splits the fitted model back into per-recording results.
///
/// The continuous leaves are cut straight from the padded batch using each
/// recording's bounds. The label axis runs `nlags` frames behind them, so its
/// window is shifted by the lag and the first label is duplicated `nlags`
/// times to bring every leaf to the same length. Passing a destination also
/// persists the results, merging over whatever artifact is already there.
///
/// # Errors
///
/// Returns [`FitError::RecordingTooShort`] when a recording has too few
/// frames to leave any labels after lag trimming, plus the usual shape and
/// artifact errors.
pub fn extract_results(
    model: &ModelState,
    metadata: &Metadata,
    destination: Option<&Path>,
) -> Result<Results> {
    let nlags = model.states.nlags();

    let latents = unbatch(model.states.latents(), metadata)?;
    let centroids = unbatch(model.states.centroids(), metadata)?;
    let headings = unbatch(model.states.headings(), metadata)?;

    let mut syllables = BTreeMap::new();
    for (row, (key, b)) in metadata.iter().enumerate() {
        if b.len() <= nlags {
            return Err(FitError::RecordingTooShort {
                key: key.to_string(),
                frames: b.len(),
                nlags,
            });
        }
        let source = model.states.syllables().index_axis(Axis(0), row);
        let core = source.slice_axis(Axis(0), Slice::from(b.start..b.end - nlags));

        let mut labels = Vec::with_capacity(b.len());
        labels.resize(nlags, core[0]);
        labels.extend(core.iter().copied());
        syllables.insert(key.to_string(), Array1::from_vec(labels));
    }

    // The four maps hold exactly the metadata keys, so sorted iteration
    // lines them up.
    let mut results = Results::new();
    let zipped = syllables
        .into_iter()
        .zip(latents)
        .zip(centroids)
        .zip(headings);
    for ((((key, syllable), (_, latent_state)), (_, centroid)), (_, heading)) in zipped {
        results.insert(
            key,
            RecordingResults {
                syllable,
                latent_state,
                centroid,
                heading,
            },
        );
    }

    if let Some(path) = destination {
        save_results(&results, path)?;
        info!("saved results to {}", path.display());
    }
    Ok(results)
}

/// Writes results into the artifact at `path`, merging with any recordings
/// already saved there.
///
/// A recording present in both keeps only the new values; recordings absent
/// from `results` are carried over untouched.
pub fn save_results(results: &Results, path: &Path) -> Result<()> {
    let mut artifact = if path.exists() {
        Artifact::read(path)?
    } else {
        Artifact::new()
    };

    for (key, recording) in results {
        artifact.remove_under(key);
        artifact.insert(
            format!("{key}/syllable"),
            Tensor::from_u32(&recording.syllable),
        );
        artifact.insert(
            format!("{key}/latent_state"),
            Tensor::from_f64(&recording.latent_state),
        );
        artifact.insert(
            format!("{key}/centroid"),
            Tensor::from_f64(&recording.centroid),
        );
        artifact.insert(
            format!("{key}/heading"),
            Tensor::from_f64(&recording.heading),
        );
    }

    artifact.write(path)
}

/// Reads a results artifact back into per-recording form.
pub fn load_results(path: &Path) -> Result<Results> {
    let artifact = Artifact::read(path)?;

    let mut names = BTreeSet::new();
    for key in artifact.keys() {
        let Some((name, _)) = key.split_once('/') else {
            return Err(FitError::BadArtifact {
                key: key.to_string(),
                detail: "entry is not nested under a recording".to_string(),
            });
        };
        names.insert(name.to_string());
    }

    let mut results = Results::new();
    for name in names {
        let key = format!("{name}/syllable");
        let syllable = into_dim::<u32, Ix1>(&key, artifact.require(&key)?.to_u32(&key)?)?;
        let key = format!("{name}/latent_state");
        let latent_state = into_dim::<f64, Ix2>(&key, artifact.require(&key)?.to_f64(&key)?)?;
        let key = format!("{name}/centroid");
        let centroid = into_dim::<f64, Ix2>(&key, artifact.require(&key)?.to_f64(&key)?)?;
        let key = format!("{name}/heading");
        let heading = into_dim::<f64, Ix1>(&key, artifact.require(&key)?.to_f64(&key)?)?;

        results.insert(
            name,
            RecordingResults {
                syllable,
                latent_state,
                centroid,
                heading,
            },
        );
    }
    Ok(results)
}
