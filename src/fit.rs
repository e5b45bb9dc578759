use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};

use crate::batch::Metadata;
use crate::cancel::CancelToken;
use crate::checkpoint::{CheckpointStore, CHECKPOINT_FILE};
use crate::diagnostics::{Advisories, Advisory};
use crate::divergence;
use crate::error::{FitError, Result};
use crate::progress::ProgressRenderer;
use crate::resample::{ComputeBackend, Resampler, StepError, StepOptions};
use crate::state::{BatchedData, ModelState};

/// How parallel message passing should be decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParallelismRequest {
    /// Follow the backend: on for accelerators, off for plain cpu.
    #[default]
    Auto,
    /// On, with an advisory when the backend is a plain cpu.
    Enabled,
    /// On unconditionally, advisory suppressed.
    Force,
    /// Off.
    Disabled,
}

/// Settings for one fitting run.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Directory that run directories are created under. Required whenever
    /// `checkpoint_interval` is non-zero.
    pub project_dir: Option<PathBuf>,
    /// Run name; a timestamp is generated when absent.
    pub name: Option<String>,
    /// Last iteration of the run. Iterations `start_iter..=num_iters` are
    /// executed.
    pub num_iters: u64,
    /// First iteration of the run.
    pub start_iter: u64,
    /// Snapshot cadence in iterations; zero disables checkpointing.
    pub checkpoint_interval: u64,
    /// Restrict resampling to the autoregressive dynamics.
    pub ar_only: bool,
    pub parallelism: ParallelismRequest,
    /// Invoke the progress renderer after each snapshot.
    pub generate_progress_plots: bool,
    /// Log each finished iteration at info level instead of debug.
    pub verbose: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            project_dir: None,
            name: None,
            num_iters: 50,
            start_iter: 0,
            checkpoint_interval: 10,
            ar_only: false,
            parallelism: ParallelismRequest::Auto,
            generate_progress_plots: true,
            verbose: false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    /// Every requested iteration ran.
    Completed,
    /// Resampling produced non-finite values; the offending state was
    /// discarded.
    Diverged { iteration: u64 },
    /// A cancellation request stopped the run between iterations.
    Cancelled { iteration: u64 },
}

impl FitStatus {
    /// True when the run stopped before its last requested iteration.
    pub fn is_partial(&self) -> bool {
        !matches!(self, FitStatus::Completed)
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitStatus::Completed => write!(f, "completed"),
            FitStatus::Diverged { iteration } => {
                write!(f, "stopped by divergence at iteration {iteration}")
            }
            FitStatus::Cancelled { iteration } => {
                write!(f, "cancelled at iteration {iteration}")
            }
        }
    }
}

/// What a fitting run hands back.
#[derive(Debug)]
pub struct FitOutcome {
    /// The last adopted model state.
    pub model: ModelState,
    /// The run name, generated or caller-provided.
    pub name: String,
    pub status: FitStatus,
    pub advisories: Vec<Advisory>,
}

/// Drives a [`Resampler`] through a fitting run.
///
/// The loop owns the iteration schedule, divergence screening, snapshot
/// cadence, and cancellation; the resampler owns the numbers. One `FitLoop`
/// can run many fits back to back.
pub struct FitLoop<R> {
    resampler: R,
    progress: Option<Box<dyn ProgressRenderer>>,
    cancel: CancelToken,
}

pub(crate) enum StepVerdict {
    Adopt(ModelState),
    Halt(FitStatus),
}

impl<R> FitLoop<R> {
    pub fn new(resampler: R) -> Self {
        Self {
            resampler,
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_progress(mut self, renderer: Box<dyn ProgressRenderer>) -> Self {
        self.progress = Some(renderer);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels runs driven by this loop.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn resampler_mut(&mut self) -> &mut R {
        &mut self.resampler
    }
}

impl<R: Resampler> FitLoop<R> {
    /// Runs iterations `start_iter..=num_iters`, snapshotting on the
    /// configured cadence.
    ///
    /// Divergence and cancellation end the run early with a partial
    /// [`FitStatus`]; the returned model is always the last state that
    /// passed the divergence screen. When checkpointing is on and no file
    /// exists yet, a checkpoint is created up front with an initial snapshot
    /// at `start_iter`; an existing file is appended to instead.
    pub fn run(
        &mut self,
        model: ModelState,
        data: &BatchedData,
        metadata: &Metadata,
        cfg: &FitConfig,
    ) -> Result<FitOutcome> {
        let mut advisories = Advisories::new();

        let plots = if cfg.generate_progress_plots && cfg.checkpoint_interval == 0 {
            advisories.record(Advisory::ProgressPlotsDisabled);
            false
        } else {
            cfg.generate_progress_plots
        };

        let name = cfg.name.clone().unwrap_or_else(default_run_name);
        let parallel =
            resolve_parallelism(cfg.parallelism, self.resampler.backend(), &mut advisories);

        let store = if cfg.checkpoint_interval > 0 {
            let project_dir = cfg.project_dir.as_deref().ok_or(FitError::MissingProjectDir)?;
            let run_dir = project_dir.join(&name);
            fs::create_dir_all(&run_dir)?;
            let path = run_dir.join(CHECKPOINT_FILE);
            info!("outputs will be saved to {}", run_dir.display());
            Some(if path.exists() {
                CheckpointStore::open(path)?
            } else {
                CheckpointStore::create(path, &model, data, metadata, cfg.start_iter)?
            })
        } else {
            None
        };

        let opts = StepOptions {
            ar_only: cfg.ar_only,
            states_only: false,
            parallel_message_passing: parallel,
            verbose: cfg.verbose,
        };

        info!(start_iter = cfg.start_iter, num_iters = cfg.num_iters; "fitting started");
        let mut model = model;
        let mut status = FitStatus::Completed;

        for iteration in cfg.start_iter..=cfg.num_iters {
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

            if let Some(store) = &store {
                if iteration > cfg.start_iter
                    && (iteration % cfg.checkpoint_interval == 0 || iteration == cfg.num_iters)
                {
                    store.save_snapshot(iteration, &model)?;
                    if plots {
                        if let (Some(renderer), Some(project_dir)) =
                            (self.progress.as_deref_mut(), cfg.project_dir.as_deref())
                        {
                            if let Err(e) = renderer.render(
                                &model,
                                data,
                                store.path(),
                                iteration,
                                project_dir,
                                &name,
                            ) {
                                advisories.record(Advisory::ProgressRenderFailed {
                                    iteration,
                                    detail: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        info!("fitting run '{name}' {status}");
        Ok(FitOutcome {
            model,
            name,
            status,
            advisories: advisories.into_vec(),
        })
    }

    /// Picks up a checkpointed run at its latest snapshot plus one.
    ///
    /// Model, data, and metadata all come from the checkpoint; `cfg` supplies
    /// the rest of the schedule, with its directory, name, and start iteration
    /// overridden to match the checkpoint.
    pub fn resume(&mut self, project_dir: &Path, name: &str, cfg: &FitConfig) -> Result<FitOutcome> {
        let path = project_dir.join(name).join(CHECKPOINT_FILE);
        let store = CheckpointStore::open(path)?;
        let (model, data, metadata, latest) = store.load()?;

        let resumed = FitConfig {
            project_dir: Some(project_dir.to_path_buf()),
            name: Some(name.to_string()),
            start_iter: latest + 1,
            ..cfg.clone()
        };
        info!(start_iter = resumed.start_iter; "resuming fitting run");
        self.run(model, &data, &metadata, &resumed)
    }

    /// One cancellation check, one resample, one divergence screen.
    pub(crate) fn guarded_step(
        &mut self,
        data: &BatchedData,
        model: &ModelState,
        opts: &StepOptions,
        iteration: u64,
        advisories: &mut Advisories,
    ) -> Result<StepVerdict> {
        if self.cancel.is_cancelled() {
            info!(iteration = iteration; "cancellation requested, stopping");
            return Ok(StepVerdict::Halt(FitStatus::Cancelled { iteration }));
        }

        let next = match self.resampler.resample(data, model, opts) {
            Ok(next) => next,
            Err(StepError::Cancelled) => {
                info!(iteration = iteration; "step interrupted, stopping");
                return Ok(StepVerdict::Halt(FitStatus::Cancelled { iteration }));
            }
            Err(StepError::Backend(detail)) => return Err(FitError::Resample(detail)),
        };

        let report = divergence::scan(&next);
        if !report.is_clean() {
            advisories.record(Advisory::Divergence {
                iteration,
                leaves: report.leaf_summaries(),
            });
            return Ok(StepVerdict::Halt(FitStatus::Diverged { iteration }));
        }
        Ok(StepVerdict::Adopt(next))
    }
}

/// Resolves the parallel message passing flag against the backend.
pub(crate) fn resolve_parallelism(
    request: ParallelismRequest,
    backend: ComputeBackend,
    advisories: &mut Advisories,
) -> bool {
    match request {
        ParallelismRequest::Auto => backend != ComputeBackend::Cpu,
        ParallelismRequest::Enabled => {
            if backend == ComputeBackend::Cpu {
                advisories.record(Advisory::CpuParallelism);
            }
            true
        }
        ParallelismRequest::Force => true,
        ParallelismRequest::Disabled => false,
    }
}

fn default_run_name() -> String {
    Utc::now().format("%Y_%m_%d-%H_%M_%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_parallelism_follows_the_backend() {
        let mut advisories = Advisories::new();
        assert!(!resolve_parallelism(
            ParallelismRequest::Auto,
            ComputeBackend::Cpu,
            &mut advisories
        ));
        assert!(resolve_parallelism(
            ParallelismRequest::Auto,
            ComputeBackend::Accelerated,
            &mut advisories
        ));
        assert!(advisories.is_empty());
    }

    #[test]
    fn enabled_on_cpu_warns_but_stays_on() {
        let mut advisories = Advisories::new();
        assert!(resolve_parallelism(
            ParallelismRequest::Enabled,
            ComputeBackend::Cpu,
            &mut advisories
        ));
        assert_eq!(advisories.records(), &[Advisory::CpuParallelism]);
    }

    #[test]
    fn force_on_cpu_stays_silent() {
        let mut advisories = Advisories::new();
        assert!(resolve_parallelism(
            ParallelismRequest::Force,
            ComputeBackend::Cpu,
            &mut advisories
        ));
        assert!(advisories.is_empty());
    }

    #[test]
    fn disabled_overrides_an_accelerated_backend() {
        let mut advisories = Advisories::new();
        assert!(!resolve_parallelism(
            ParallelismRequest::Disabled,
            ComputeBackend::Accelerated,
            &mut advisories
        ));
        assert!(advisories.is_empty());
    }

    #[test]
    fn default_run_names_are_timestamps() {
        let name = default_run_name();
        assert_eq!(name.len(), "2000_01_01-00_00_00".len());
        assert!(name.chars().all(|c| c.is_ascii_digit() || c == '_' || c == '-'));
    }

    #[test]
    fn completed_is_not_partial() {
        assert!(!FitStatus::Completed.is_partial());
        assert!(FitStatus::Diverged { iteration: 3 }.is_partial());
        assert!(FitStatus::Cancelled { iteration: 3 }.is_partial());
    }
}
