use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{Ix2, Ix3};

use crate::artifact::{into_dim, Artifact, Tensor};
use crate::batch::Metadata;
use crate::error::{FitError, Result};
use crate::hypparams::{HypParams, HypValue, Scalar};
use crate::state::{BatchedData, LatentStates, ModelState, Params};

/// File name of the checkpoint inside a run directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.safetensors";

const SNAPSHOT_PREFIX: &str = "model_snapshots";
const DATA_PREFIX: &str = "data";
const METADATA_KEY: &str = "metadata";

/// A single-file history of model snapshots keyed by iteration number.
///
/// The file also carries the batched observations and recording metadata, so
/// a run can resume from it with no other inputs. Snapshots only accumulate
/// forward: recording below the latest saved iteration is rejected, and
/// rolling back is an explicit [`revert`](Self::revert).
///
/// Every mutation is read-merge-rewrite through [`Artifact`], which replaces
/// the file atomically.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Creates a new checkpoint holding the run inputs and an initial
    /// snapshot for `start_iter`.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::CheckpointExists`] when `path` is already
    /// occupied; an existing checkpoint is opened, never clobbered.
    pub fn create(
        path: impl Into<PathBuf>,
        model: &ModelState,
        data: &BatchedData,
        metadata: &Metadata,
        start_iter: u64,
    ) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(FitError::CheckpointExists { path });
        }

        let mut artifact = Artifact::new();
        artifact.annotate(METADATA_KEY, serde_json::to_string(metadata)?);
        for (name, array) in data.iter() {
            artifact.insert(format!("{DATA_PREFIX}/{name}"), Tensor::from_f64(array));
        }
        write_snapshot(&mut artifact, start_iter, model);
        artifact.write(&path)?;

        info!("created checkpoint at {}", path.display());
        Ok(Self { path })
    }

    /// Opens an existing checkpoint, verifying it parses and holds at least
    /// one snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let artifact = Artifact::read(&path)?;
        if artifact.annotation(METADATA_KEY).is_none() {
            return Err(FitError::BadArtifact {
                key: METADATA_KEY.to_string(),
                detail: "missing recording metadata annotation".to_string(),
            });
        }
        snapshot_iterations(&artifact)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a snapshot of `model` under `iteration`.
    ///
    /// Re-recording the latest iteration overwrites it in place; anything
    /// below the latest is rejected with [`FitError::SnapshotOrder`].
    pub fn save_snapshot(&self, iteration: u64, model: &ModelState) -> Result<()> {
        let mut artifact = Artifact::read(&self.path)?;

        let recorded = snapshot_iterations(&artifact)?;
        if let Some(latest) = recorded.last() {
            if iteration < *latest {
                return Err(FitError::SnapshotOrder {
                    iteration,
                    latest: *latest,
                });
            }
            if iteration == *latest {
                artifact.remove_under(&snapshot_prefix(iteration));
            }
        }

        write_snapshot(&mut artifact, iteration, model);
        artifact.write(&self.path)?;
        debug!(iteration = iteration; "snapshot saved");
        Ok(())
    }

    /// Iteration numbers with a recorded snapshot, ascending.
    pub fn iterations(&self) -> Result<Vec<u64>> {
        let artifact = Artifact::read(&self.path)?;
        Ok(snapshot_iterations(&artifact)?.into_iter().collect())
    }

    /// Highest iteration with a recorded snapshot.
    pub fn latest_iteration(&self) -> Result<u64> {
        let artifact = Artifact::read(&self.path)?;
        latest_iteration(&artifact)
    }

    /// Restores the model saved under one specific iteration.
    pub fn load_snapshot(&self, iteration: u64) -> Result<ModelState> {
        let artifact = Artifact::read(&self.path)?;
        if !snapshot_iterations(&artifact)?.contains(&iteration) {
            return Err(FitError::SnapshotMissing { iteration });
        }
        read_snapshot(&artifact, iteration)
    }

    /// Restores everything needed to resume: the latest model, the batched
    /// observations, the recording metadata, and the latest iteration.
    pub fn load(&self) -> Result<(ModelState, BatchedData, Metadata, u64)> {
        let artifact = Artifact::read(&self.path)?;

        let latest = latest_iteration(&artifact)?;
        let model = read_snapshot(&artifact, latest)?;

        let mut data = BatchedData::new();
        let lead = format!("{DATA_PREFIX}/");
        let data_keys: Vec<String> = artifact
            .keys_under(DATA_PREFIX)
            .map(str::to_string)
            .collect();
        for key in data_keys {
            let name = key[lead.len()..].to_string();
            data.insert(name, artifact.require(&key)?.to_f64(&key)?);
        }

        let raw = artifact
            .annotation(METADATA_KEY)
            .ok_or_else(|| FitError::BadArtifact {
                key: METADATA_KEY.to_string(),
                detail: "missing recording metadata annotation".to_string(),
            })?;
        let metadata: Metadata = serde_json::from_str(raw)?;

        Ok((model, data, metadata, latest))
    }

    /// Discards every snapshot above `iteration`, making it the latest.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::SnapshotMissing`] when no snapshot was recorded
    /// for `iteration`; nothing is discarded in that case.
    pub fn revert(&self, iteration: u64) -> Result<()> {
        let mut artifact = Artifact::read(&self.path)?;

        let recorded = snapshot_iterations(&artifact)?;
        if !recorded.contains(&iteration) {
            return Err(FitError::SnapshotMissing { iteration });
        }

        let mut dropped = 0;
        for later in recorded.range((iteration + 1)..) {
            dropped += artifact.remove_under(&snapshot_prefix(*later));
        }
        artifact.write(&self.path)?;

        info!(iteration = iteration, entries_dropped = dropped; "checkpoint reverted");
        Ok(())
    }
}

fn snapshot_prefix(iteration: u64) -> String {
    format!("{SNAPSHOT_PREFIX}/{iteration}")
}

/// Parses the set of recorded iterations out of the tensor names.
fn snapshot_iterations(artifact: &Artifact) -> Result<BTreeSet<u64>> {
    let mut iterations = BTreeSet::new();
    let lead = format!("{SNAPSHOT_PREFIX}/");
    for key in artifact.keys_under(SNAPSHOT_PREFIX) {
        let rest = &key[lead.len()..];
        let digits = rest.split('/').next().unwrap_or(rest);
        let iteration = digits.parse::<u64>().map_err(|_| FitError::BadArtifact {
            key: key.to_string(),
            detail: "snapshot name is not an iteration number".to_string(),
        })?;
        iterations.insert(iteration);
    }
    if iterations.is_empty() {
        return Err(FitError::BadArtifact {
            key: SNAPSHOT_PREFIX.to_string(),
            detail: "no snapshots recorded".to_string(),
        });
    }
    Ok(iterations)
}

fn latest_iteration(artifact: &Artifact) -> Result<u64> {
    let recorded = snapshot_iterations(artifact)?;
    Ok(*recorded.last().unwrap_or(&0))
}

fn write_snapshot(artifact: &mut Artifact, iteration: u64, model: &ModelState) {
    let prefix = snapshot_prefix(iteration);

    artifact.insert(
        format!("{prefix}/states/syllables"),
        Tensor::from_u32(model.states.syllables()),
    );
    artifact.insert(
        format!("{prefix}/states/latents"),
        Tensor::from_f64(model.states.latents()),
    );
    artifact.insert(
        format!("{prefix}/states/centroids"),
        Tensor::from_f64(model.states.centroids()),
    );
    artifact.insert(
        format!("{prefix}/states/headings"),
        Tensor::from_f64(model.states.headings()),
    );

    for (name, array) in model.params.iter() {
        artifact.insert(format!("{prefix}/params/{name}"), Tensor::from_f64(array));
    }

    for (group, entries) in model.hypparams.groups() {
        for (key, value) in entries {
            let tensor = match value {
                HypValue::Scalar(Scalar::Int(v)) => Tensor::scalar_i64(*v),
                HypValue::Scalar(Scalar::Float(v)) => Tensor::scalar_f64(*v),
                HypValue::Array(array) => Tensor::from_f64(array),
            };
            artifact.insert(format!("{prefix}/hypparams/{group}/{key}"), tensor);
        }
    }

    artifact.insert(format!("{prefix}/seed"), Tensor::scalar_u64(model.seed));
}

fn read_snapshot(artifact: &Artifact, iteration: u64) -> Result<ModelState> {
    let prefix = snapshot_prefix(iteration);

    let key = format!("{prefix}/states/syllables");
    let syllables = into_dim::<u32, Ix2>(&key, artifact.require(&key)?.to_u32(&key)?)?;
    let key = format!("{prefix}/states/latents");
    let latents = into_dim::<f64, Ix3>(&key, artifact.require(&key)?.to_f64(&key)?)?;
    let key = format!("{prefix}/states/centroids");
    let centroids = into_dim::<f64, Ix3>(&key, artifact.require(&key)?.to_f64(&key)?)?;
    let key = format!("{prefix}/states/headings");
    let headings = into_dim::<f64, Ix2>(&key, artifact.require(&key)?.to_f64(&key)?)?;
    let states = LatentStates::new(syllables, latents, centroids, headings)?;

    let mut params = Params::new();
    let lead = format!("{prefix}/params/");
    let param_keys: Vec<String> = artifact
        .keys_under(&format!("{prefix}/params"))
        .map(str::to_string)
        .collect();
    for key in param_keys {
        let name = key[lead.len()..].to_string();
        params.insert(name, artifact.require(&key)?.to_f64(&key)?);
    }

    let mut hypparams = HypParams::new();
    let lead = format!("{prefix}/hypparams/");
    let hyp_keys: Vec<String> = artifact
        .keys_under(&format!("{prefix}/hypparams"))
        .map(str::to_string)
        .collect();
    for key in hyp_keys {
        let rest = &key[lead.len()..];
        let (group, name) = rest.split_once('/').ok_or_else(|| FitError::BadArtifact {
            key: key.clone(),
            detail: "hyperparameter name is missing its group".to_string(),
        })?;
        let tensor = artifact.require(&key)?;
        let value = if tensor.shape().is_empty() {
            match tensor.dtype() {
                safetensors::Dtype::I64 => {
                    HypValue::Scalar(Scalar::Int(tensor.as_scalar_i64(&key)?))
                }
                _ => HypValue::Scalar(Scalar::Float(tensor.as_scalar_f64(&key)?)),
            }
        } else {
            HypValue::Array(tensor.to_f64(&key)?)
        };
        hypparams.insert(group, name, value);
    }

    let key = format!("{prefix}/seed");
    let seed = artifact.require(&key)?.as_scalar_u64(&key)?;

    Ok(ModelState {
        states,
        params,
        hypparams,
        seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Bounds;
    use ndarray::{ArrayD, IxDyn};
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    const ROWS: usize = 2;
    const TIME: usize = 12;
    const NLAGS: usize = 3;

    fn model(seed: u64) -> ModelState {
        let mut rng = StdRng::seed_from_u64(seed);
        let states = LatentStates::new(
            ndarray::Array2::from_elem((ROWS, TIME - NLAGS), seed as u32),
            ndarray::Array::random_using((ROWS, TIME, 4), StandardNormal, &mut rng),
            ndarray::Array::random_using((ROWS, TIME, 2), StandardNormal, &mut rng),
            ndarray::Array::random_using((ROWS, TIME), StandardNormal, &mut rng),
        )
        .unwrap();

        let mut params = Params::new();
        params.insert(
            "ar_matrix",
            ndarray::Array::random_using(IxDyn(&[4, 4]), StandardNormal, &mut rng),
        );
        params.insert(
            "sigmasq",
            ndarray::Array::random_using(IxDyn(&[4]), StandardNormal, &mut rng),
        );

        let mut hypparams = HypParams::new();
        hypparams.insert("trans_hypparams", "kappa", HypValue::Scalar(Scalar::Float(1e4)));
        hypparams.insert("trans_hypparams", "num_states", HypValue::Scalar(Scalar::Int(20)));
        hypparams.insert(
            "ar_hypparams",
            "S_0",
            HypValue::Array(ArrayD::zeros(IxDyn(&[4, 4]))),
        );

        ModelState {
            states,
            params,
            hypparams,
            seed,
        }
    }

    fn data() -> BatchedData {
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = BatchedData::new();
        data.insert(
            "keypoints",
            ndarray::Array::random_using(IxDyn(&[ROWS, TIME, 8]), StandardNormal, &mut rng),
        );
        data.insert(
            "confidences",
            ndarray::Array::random_using(IxDyn(&[ROWS, TIME]), StandardNormal, &mut rng),
        );
        data
    }

    fn metadata() -> Metadata {
        Metadata::new(
            vec!["rec_a".to_string(), "rec_b".to_string()],
            vec![Bounds::new(0, 12), Bounds::new(2, 10)],
        )
        .unwrap()
    }

    #[test]
    fn create_then_load_restores_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let saved = model(3);

        let store = CheckpointStore::create(&path, &saved, &data(), &metadata(), 0).unwrap();
        let (restored, restored_data, restored_metadata, latest) = store.load().unwrap();

        assert_eq!(latest, 0);
        assert_eq!(restored, saved);
        assert_eq!(restored_data, data());
        assert_eq!(restored_metadata, metadata());
    }

    #[test]
    fn create_refuses_to_clobber() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        CheckpointStore::create(&path, &model(0), &data(), &metadata(), 0).unwrap();

        let err =
            CheckpointStore::create(&path, &model(1), &data(), &metadata(), 0).unwrap_err();
        assert!(matches!(err, FitError::CheckpointExists { .. }));
    }

    #[test]
    fn snapshots_accumulate_and_load_by_iteration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let store = CheckpointStore::create(&path, &model(0), &data(), &metadata(), 0).unwrap();

        store.save_snapshot(5, &model(5)).unwrap();
        store.save_snapshot(10, &model(10)).unwrap();

        assert_eq!(store.iterations().unwrap(), vec![0, 5, 10]);
        assert_eq!(store.latest_iteration().unwrap(), 10);
        assert_eq!(store.load_snapshot(5).unwrap(), model(5));
        assert_eq!(store.load().unwrap().0, model(10));
    }

    #[test]
    fn saving_below_the_latest_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let store = CheckpointStore::create(&path, &model(0), &data(), &metadata(), 0).unwrap();
        store.save_snapshot(10, &model(10)).unwrap();

        let err = store.save_snapshot(5, &model(5)).unwrap_err();
        assert!(matches!(
            err,
            FitError::SnapshotOrder {
                iteration: 5,
                latest: 10,
            }
        ));
        assert_eq!(store.iterations().unwrap(), vec![0, 10]);
    }

    #[test]
    fn re_saving_the_latest_overwrites_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let store = CheckpointStore::create(&path, &model(0), &data(), &metadata(), 0).unwrap();
        store.save_snapshot(5, &model(5)).unwrap();

        store.save_snapshot(5, &model(55)).unwrap();
        assert_eq!(store.iterations().unwrap(), vec![0, 5]);
        assert_eq!(store.load_snapshot(5).unwrap(), model(55));
    }

    #[test]
    fn revert_discards_later_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let store = CheckpointStore::create(&path, &model(0), &data(), &metadata(), 0).unwrap();
        store.save_snapshot(5, &model(5)).unwrap();
        store.save_snapshot(10, &model(10)).unwrap();
        store.save_snapshot(15, &model(15)).unwrap();

        store.revert(5).unwrap();
        assert_eq!(store.iterations().unwrap(), vec![0, 5]);
        assert_eq!(store.load().unwrap().0, model(5));

        let (_, restored_data, restored_metadata, latest) = store.load().unwrap();
        assert_eq!(latest, 5);
        assert_eq!(restored_data, data());
        assert_eq!(restored_metadata, metadata());
    }

    #[test]
    fn revert_to_unrecorded_iteration_changes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let store = CheckpointStore::create(&path, &model(0), &data(), &metadata(), 0).unwrap();
        store.save_snapshot(5, &model(5)).unwrap();

        let err = store.revert(3).unwrap_err();
        assert!(matches!(err, FitError::SnapshotMissing { iteration: 3 }));
        assert_eq!(store.iterations().unwrap(), vec![0, 5]);
    }

    #[test]
    fn open_rejects_a_file_without_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let mut artifact = Artifact::new();
        artifact.annotate(METADATA_KEY, "{}");
        artifact.insert("data/x", Tensor::scalar_f64(0.0));
        artifact.write(&path).unwrap();

        let err = CheckpointStore::open(&path).unwrap_err();
        assert!(matches!(err, FitError::BadArtifact { .. }));
    }
}
