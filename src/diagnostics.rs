use std::fmt;

use log::warn;

/// A non-fatal condition noticed during a run.
///
/// Advisories never abort anything. Each one is mirrored to the log at warn
/// level when recorded and returned to the caller with the outcome so it can
/// be inspected programmatically.
#[derive(Debug, Clone, PartialEq)]
pub enum Advisory {
    /// Progress plots were requested but checkpointing is off.
    ProgressPlotsDisabled,
    /// Parallel message passing was requested on a plain cpu backend.
    CpuParallelism,
    /// Resampling produced non-finite values and the run stopped early.
    Divergence { iteration: u64, leaves: Vec<String> },
    /// A hyperparameter update named a key whose value is not a scalar.
    NonScalarUpdate { key: String },
    /// A hyperparameter update value was cast to the stored numeric kind.
    ScalarTypeCast {
        key: String,
        from: &'static str,
        to: &'static str,
    },
    /// Some requested hyperparameter keys matched nothing in any group.
    UnmatchedKeys { keys: Vec<String> },
    /// The progress renderer failed; the run itself continued.
    ProgressRenderFailed { iteration: u64, detail: String },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::ProgressPlotsDisabled => write!(
                f,
                "progress plots require a checkpoint interval greater than zero; plotting is disabled for this run"
            ),
            Advisory::CpuParallelism => write!(
                f,
                "parallel message passing on a cpu backend can take a long time to compile without speeding anything up; request Force to silence this warning"
            ),
            Advisory::Divergence { iteration, leaves } => write!(
                f,
                "fitting stopped at iteration {iteration} because resampling produced non-finite values in {}; the last finite model state was kept, so after adjusting hyperparameters the run can resume from the latest checkpoint",
                leaves.join(", ")
            ),
            Advisory::NonScalarUpdate { key } => write!(
                f,
                "'{key}' cannot be updated because it is not a scalar hyperparameter"
            ),
            Advisory::ScalarTypeCast { key, from, to } => write!(
                f,
                "'{key}' update is {from}-valued but the stored value is {to}-valued; the update was cast to {to}"
            ),
            Advisory::UnmatchedKeys { keys } => write!(
                f,
                "no hyperparameter group contains: {}",
                keys.join(", ")
            ),
            Advisory::ProgressRenderFailed { iteration, detail } => write!(
                f,
                "progress rendering failed at iteration {iteration}: {detail}"
            ),
        }
    }
}

/// Accumulates advisories for one run, logging each as it is recorded.
#[derive(Debug, Default)]
pub struct Advisories {
    records: Vec<Advisory>,
}

impl Advisories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, advisory: Advisory) {
        warn!("{advisory}");
        self.records.push(advisory);
    }

    pub fn records(&self) -> &[Advisory] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_vec(self) -> Vec<Advisory> {
        self.records
    }
}
