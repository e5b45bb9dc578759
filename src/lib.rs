//! Orchestration for iterative pose-model fitting.
//!
//! The numeric sampler behind a fit is abstracted as a [`Resampler`]; this
//! crate owns everything around it: the iteration schedule, divergence
//! screening, checkpointing and resume, cancellation, batch re-assembly of
//! per-recording results, and scalar hyperparameter editing between runs.
//!
//! A fit is driven by a [`FitLoop`], which snapshots the model into a
//! [`CheckpointStore`] on a fixed cadence so an interrupted or diverged run
//! can be picked up where it stopped. Once fitted, a model is applied to new
//! recordings with [`FitLoop::apply`] and the padded batch is split back into
//! named recordings by [`extract_results`].

pub mod apply;
pub mod artifact;
pub mod batch;
pub mod cancel;
pub mod checkpoint;
pub mod diagnostics;
pub mod divergence;
pub mod error;
pub mod fit;
pub mod hypparams;
pub mod progress;
pub mod resample;
pub mod results;
pub mod state;

pub use apply::{ApplyConfig, ApplyOutcome};
pub use batch::{unbatch, Bounds, Metadata};
pub use cancel::CancelToken;
pub use checkpoint::{CheckpointStore, CHECKPOINT_FILE};
pub use diagnostics::Advisory;
pub use divergence::{DivergenceReport, LeafFinding};
pub use error::{FitError, Result};
pub use fit::{FitConfig, FitLoop, FitOutcome, FitStatus, ParallelismRequest};
pub use hypparams::{update_hypparams, HypParams, HypValue, Scalar};
pub use progress::{ProgressRenderer, RenderError};
pub use resample::{ComputeBackend, Resampler, StateInit, StepError, StepOptions};
pub use results::{
    extract_results, load_results, save_results, RecordingResults, Results, RESULTS_FILE,
};
pub use state::{BatchedData, LatentStates, ModelState, Params};
