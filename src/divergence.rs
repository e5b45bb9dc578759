use std::fmt;

use crate::hypparams::{HypValue, Scalar};
use crate::state::ModelState;

/// One float leaf of the model that contains non-finite values.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafFinding {
    /// Artifact-style path of the leaf, e.g. `states/latents`.
    pub path: String,
    /// How many values are NaN or infinite.
    pub non_finite: usize,
    /// Total values in the leaf.
    pub len: usize,
}

impl fmt::Display for LeafFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} of {} values non-finite)",
            self.path, self.non_finite, self.len
        )
    }
}

/// Outcome of sweeping a candidate model state for NaN and infinity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DivergenceReport {
    findings: Vec<LeafFinding>,
}

impl DivergenceReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn findings(&self) -> &[LeafFinding] {
        &self.findings
    }

    /// Human-readable summaries, one per affected leaf, in scan order.
    pub fn leaf_summaries(&self) -> Vec<String> {
        self.findings.iter().map(LeafFinding::to_string).collect()
    }
}

/// Sweeps every float leaf of the model for non-finite values.
///
/// The sweep order is deterministic: latent states first, then params, then
/// hyperparameters, with named entries in alphabetical order. Discrete labels
/// and integer scalars cannot hold NaN and are skipped.
pub fn scan(model: &ModelState) -> DivergenceReport {
    let mut findings = Vec::new();

    tally(
        &mut findings,
        "states/latents",
        model.states.latents().iter(),
    );
    tally(
        &mut findings,
        "states/centroids",
        model.states.centroids().iter(),
    );
    tally(
        &mut findings,
        "states/headings",
        model.states.headings().iter(),
    );

    for (name, array) in model.params.iter() {
        tally(&mut findings, &format!("params/{name}"), array.iter());
    }

    for (group, entries) in model.hypparams.groups() {
        for (key, value) in entries {
            let path = format!("hypparams/{group}/{key}");
            match value {
                HypValue::Scalar(Scalar::Float(v)) if !v.is_finite() => {
                    findings.push(LeafFinding {
                        path,
                        non_finite: 1,
                        len: 1,
                    });
                }
                HypValue::Scalar(_) => {}
                HypValue::Array(array) => tally(&mut findings, &path, array.iter()),
            }
        }
    }

    DivergenceReport { findings }
}

fn tally<'a>(
    findings: &mut Vec<LeafFinding>,
    path: &str,
    values: impl Iterator<Item = &'a f64>,
) {
    let mut non_finite = 0;
    let mut len = 0;
    for v in values {
        len += 1;
        if !v.is_finite() {
            non_finite += 1;
        }
    }
    if non_finite > 0 {
        findings.push(LeafFinding {
            path: path.to_string(),
            non_finite,
            len,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypparams::{HypParams, HypValue, Scalar};
    use crate::state::{LatentStates, ModelState, Params};
    use ndarray::{Array2, Array3, ArrayD, IxDyn};

    fn finite_model() -> ModelState {
        let states = LatentStates::new(
            Array2::zeros((2, 7)),
            Array3::zeros((2, 10, 4)),
            Array3::zeros((2, 10, 2)),
            Array2::zeros((2, 10)),
        )
        .unwrap();

        let mut params = Params::new();
        params.insert("ar_matrix", ArrayD::zeros(IxDyn(&[4, 4])));

        let mut hypparams = HypParams::new();
        hypparams.insert("trans_hypparams", "kappa", HypValue::Scalar(Scalar::Float(1e4)));
        hypparams.insert("trans_hypparams", "num_states", HypValue::Scalar(Scalar::Int(10)));

        ModelState {
            states,
            params,
            hypparams,
            seed: 0,
        }
    }

    #[test]
    fn finite_model_scans_clean() {
        assert!(scan(&finite_model()).is_clean());
    }

    #[test]
    fn nan_in_latents_is_reported_with_counts() {
        let mut model = finite_model();
        let mut latents = model.states.latents().clone();
        latents[[0, 3, 1]] = f64::NAN;
        latents[[1, 0, 0]] = f64::INFINITY;
        model.states = LatentStates::new(
            model.states.syllables().clone(),
            latents,
            model.states.centroids().clone(),
            model.states.headings().clone(),
        )
        .unwrap();

        let report = scan(&model);
        assert_eq!(report.findings().len(), 1);
        let finding = &report.findings()[0];
        assert_eq!(finding.path, "states/latents");
        assert_eq!(finding.non_finite, 2);
        assert_eq!(finding.len, 80);
    }

    #[test]
    fn nan_param_and_hypparam_are_both_reported() {
        let mut model = finite_model();
        let mut bad = ArrayD::zeros(IxDyn(&[2]));
        bad[[0]] = f64::NEG_INFINITY;
        model.params.insert("pi", bad);
        model.hypparams.insert(
            "trans_hypparams",
            "kappa",
            HypValue::Scalar(Scalar::Float(f64::NAN)),
        );

        let report = scan(&model);
        let paths: Vec<&str> = report.findings().iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["params/pi", "hypparams/trans_hypparams/kappa"]);
    }

    #[test]
    fn summaries_name_leaf_and_counts() {
        let mut model = finite_model();
        model.params.insert("pi", {
            let mut a = ArrayD::zeros(IxDyn(&[3]));
            a[[1]] = f64::NAN;
            a
        });
        let summaries = scan(&model).leaf_summaries();
        assert_eq!(summaries, vec!["params/pi (1 of 3 values non-finite)"]);
    }
}
