use std::fs;
use std::path::PathBuf;

use log::{debug, info};

use crate::batch::Metadata;
use crate::diagnostics::{Advisories, Advisory};
use crate::error::{FitError, Result};
use crate::fit::{resolve_parallelism, FitLoop, FitStatus, ParallelismRequest, StepVerdict};
use crate::hypparams::HypParams;
use crate::resample::{Resampler, StateInit, StepOptions};
use crate::results::{extract_results, Results, RESULTS_FILE};
use crate::state::{BatchedData, Params};

/// Settings for an inference-only run.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Where to write results when no explicit path is given.
    pub project_dir: Option<PathBuf>,
    /// Run name used with `project_dir` to locate the results artifact.
    pub name: Option<String>,
    /// Explicit results destination, overriding directory and name.
    pub results_path: Option<PathBuf>,
    /// Number of state-resampling iterations; `0..num_iters` are executed.
    pub num_iters: u64,
    /// Restrict resampling to the autoregressive dynamics.
    pub ar_only: bool,
    /// Persist extracted results after the burn-in.
    pub save_results: bool,
    pub parallelism: ParallelismRequest,
    /// Log each finished iteration at info level instead of debug.
    pub verbose: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            project_dir: None,
            name: None,
            results_path: None,
            num_iters: 20,
            ar_only: false,
            save_results: true,
            parallelism: ParallelismRequest::Auto,
            verbose: false,
        }
    }
}

/// What an inference-only run hands back.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub results: Results,
    pub status: FitStatus,
    pub advisories: Vec<Advisory>,
}

impl<R: Resampler + StateInit> FitLoop<R> {
    /// Applies already-fitted parameters to new recordings.
    ///
    /// The sampler initializes fresh latent states around the fixed params,
    /// burns them in for `num_iters` iterations with `states_only` set, and
    /// the extractor turns the final state into per-recording results. The
    /// parameters themselves are never touched, so nothing is checkpointed.
    ///
    /// Divergence and cancellation end the burn-in early; results then come
    /// from the last state that passed the divergence screen.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::MissingResultsPath`] when saving is requested but
    /// neither a results path nor a directory and name are configured. The
    /// destination is resolved before any sampling so a misconfigured run
    /// fails before the expensive part.
    pub fn apply(
        &mut self,
        params: &Params,
        hypparams: &HypParams,
        data: &BatchedData,
        metadata: &Metadata,
        cfg: &ApplyConfig,
    ) -> Result<ApplyOutcome> {
        let mut advisories = Advisories::new();

        let destination = if cfg.save_results {
            Some(resolve_results_path(cfg)?)
        } else {
            None
        };
        let backend = self.resampler_mut().backend();
        let parallel = resolve_parallelism(cfg.parallelism, backend, &mut advisories);

        let mut model = self
            .resampler_mut()
            .init(data, params, hypparams)
            .map_err(|e| FitError::Resample(e.to_string()))?;

        let opts = StepOptions {
            ar_only: cfg.ar_only,
            states_only: true,
            parallel_message_passing: parallel,
            verbose: cfg.verbose,
        };

        info!(num_iters = cfg.num_iters; "applying fitted model");
        let mut status = FitStatus::Completed;
        for iteration in 0..cfg.num_iters {
            match self.guarded_step(data, &model, &opts, iteration, &mut advisories)? {
                StepVerdict::Adopt(next) => model = next,
                StepVerdict::Halt(halted) => {
                    status = halted;
                    break;
                }
            }
            if cfg.verbose {
                info!(iteration = iteration; "iteration finished");
            } else {
                debug!(iteration = iteration; "iteration finished");
            }
        }

        let results = extract_results(&model, metadata, destination.as_deref())?;
        info!("apply run {status}");
        Ok(ApplyOutcome {
            results,
            status,
            advisories: advisories.into_vec(),
        })
    }
}

fn resolve_results_path(cfg: &ApplyConfig) -> Result<PathBuf> {
    if let Some(path) = &cfg.results_path {
        return Ok(path.clone());
    }
    match (&cfg.project_dir, &cfg.name) {
        (Some(dir), Some(name)) => {
            let run_dir = dir.join(name);
            fs::create_dir_all(&run_dir)?;
            Ok(run_dir.join(RESULTS_FILE))
        }
        _ => Err(FitError::MissingResultsPath),
    }
}
