use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use safetensors::SafeTensorError;

/// Errors surfaced while orchestrating a fitting run or handling its
/// artifacts.
///
/// Divergence and cancellation are not errors; they end a run early with a
/// partial outcome. Everything here is a hard failure the caller must handle.
#[derive(Debug)]
pub enum FitError {
    /// Filesystem access failed while reading or writing an artifact.
    Io(io::Error),
    /// The artifact codec rejected a buffer or a tensor view.
    Artifact(SafeTensorError),
    /// Recording metadata could not be encoded or decoded.
    Json(serde_json::Error),
    /// An artifact parsed but its contents are not usable.
    BadArtifact { key: String, detail: String },
    /// Two arrays that must agree on an axis length do not.
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// Recording keys and frame bounds have different lengths.
    MetadataMismatch { keys: usize, bounds: usize },
    /// A recording's frame bounds are inverted.
    InvalidBounds {
        key: String,
        start: usize,
        end: usize,
    },
    /// A recording key is empty, duplicated, or contains a separator.
    InvalidRecordingId { key: String, reason: &'static str },
    /// A recording's bounds reach past the batched time axis.
    BoundsOutOfRange {
        key: String,
        start: usize,
        end: usize,
        len: usize,
    },
    /// A recording has too few frames to survive lag trimming.
    RecordingTooShort {
        key: String,
        frames: usize,
        nlags: usize,
    },
    /// Checkpointing was requested without a project directory.
    MissingProjectDir,
    /// Saving results was requested without any way to name the file.
    MissingResultsPath,
    /// A hyperparameter update was requested on a model with no
    /// hyperparameters.
    MissingHypparams,
    /// A checkpoint file already exists where a new one would be created.
    CheckpointExists { path: PathBuf },
    /// The requested snapshot is not present in the checkpoint.
    SnapshotMissing { iteration: u64 },
    /// A snapshot may not be recorded below the latest one already saved.
    SnapshotOrder { iteration: u64, latest: u64 },
    /// The sampling backend reported a fatal fault.
    Resample(String),
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitError::Io(e) => write!(f, "artifact io failed: {e}"),
            FitError::Artifact(e) => write!(f, "artifact codec failed: {e}"),
            FitError::Json(e) => write!(f, "metadata serialization failed: {e}"),
            FitError::BadArtifact { key, detail } => {
                write!(f, "unusable artifact entry '{key}': {detail}")
            }
            FitError::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what}: got {got}, expected {expected}"),
            FitError::MetadataMismatch { keys, bounds } => write!(
                f,
                "metadata lists {keys} recording keys but {bounds} frame bounds"
            ),
            FitError::InvalidBounds { key, start, end } => {
                write!(f, "recording '{key}' has inverted bounds ({start}, {end})")
            }
            FitError::InvalidRecordingId { key, reason } => {
                write!(f, "recording key '{key}' is invalid: {reason}")
            }
            FitError::BoundsOutOfRange {
                key,
                start,
                end,
                len,
            } => write!(
                f,
                "recording '{key}' bounds ({start}, {end}) exceed the batched time axis of length {len}"
            ),
            FitError::RecordingTooShort { key, frames, nlags } => write!(
                f,
                "recording '{key}' has {frames} frames, need more than {nlags} lag frames"
            ),
            FitError::MissingProjectDir => {
                write!(f, "checkpointing requires a project directory")
            }
            FitError::MissingResultsPath => write!(
                f,
                "saving results requires a results path or a project directory and run name"
            ),
            FitError::MissingHypparams => {
                write!(f, "the model carries no hyperparameters to update")
            }
            FitError::CheckpointExists { path } => {
                write!(f, "a checkpoint already exists at {}", path.display())
            }
            FitError::SnapshotMissing { iteration } => {
                write!(f, "no snapshot recorded for iteration {iteration}")
            }
            FitError::SnapshotOrder { iteration, latest } => write!(
                f,
                "snapshot for iteration {iteration} would precede the latest recorded iteration {latest}"
            ),
            FitError::Resample(detail) => write!(f, "resampling failed: {detail}"),
        }
    }
}

impl Error for FitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FitError::Io(e) => Some(e),
            FitError::Artifact(e) => Some(e),
            FitError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FitError {
    fn from(e: io::Error) -> Self {
        FitError::Io(e)
    }
}

impl From<SafeTensorError> for FitError {
    fn from(e: SafeTensorError) -> Self {
        FitError::Artifact(e)
    }
}

impl From<serde_json::Error> for FitError {
    fn from(e: serde_json::Error) -> Self {
        FitError::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, FitError>;
