use std::error::Error;
use std::fmt;

use crate::hypparams::HypParams;
use crate::state::{BatchedData, ModelState, Params};

/// Where a sampler runs its numeric kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeBackend {
    /// Plain cpu execution.
    Cpu,
    /// A gpu or other accelerator.
    Accelerated,
}

/// Per-iteration switches forwarded to the sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOptions {
    /// Restrict resampling to the autoregressive dynamics.
    pub ar_only: bool,
    /// Resample latent states only, keeping the parameters fixed.
    pub states_only: bool,
    /// Use parallel Kalman message passing.
    pub parallel_message_passing: bool,
    /// Ask the sampler for chatty progress output.
    pub verbose: bool,
}

/// Faults a sampler can raise from inside one step.
#[derive(Debug)]
pub enum StepError {
    /// The step was interrupted; the orchestrator keeps the previous state
    /// and ends the run gracefully.
    Cancelled,
    /// The backend failed; fatal for the whole run.
    Backend(String),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Cancelled => write!(f, "step interrupted"),
            StepError::Backend(detail) => write!(f, "backend fault: {detail}"),
        }
    }
}

impl Error for StepError {}

/// One full-conditional sweep over the model.
///
/// Implementations own whatever numeric machinery actually does the Gibbs
/// update. The orchestrator treats a step as a pure function of the previous
/// state: given the same data, model, and seed it must return the same next
/// state, which is what makes checkpoint resume reproducible.
pub trait Resampler {
    fn backend(&self) -> ComputeBackend;

    /// Produces the next model state from the current one.
    ///
    /// The returned state is inspected for non-finite values before it is
    /// adopted; a diverging implementation does not need to police its own
    /// output.
    fn resample(
        &mut self,
        data: &BatchedData,
        model: &ModelState,
        opts: &StepOptions,
    ) -> std::result::Result<ModelState, StepError>;
}

/// Builds a fresh model state around previously fitted parameters.
///
/// Used by inference-only runs, which start from trained params and
/// hyperparameters but need latent states initialized for new data. Faults
/// here are fatal; there is nothing to fall back to.
pub trait StateInit {
    fn init(
        &self,
        data: &BatchedData,
        params: &Params,
        hypparams: &HypParams,
    ) -> std::result::Result<ModelState, StepError>;
}
