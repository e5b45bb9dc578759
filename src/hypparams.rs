use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::diagnostics::{Advisories, Advisory};
use crate::error::{FitError, Result};

/// A scalar hyperparameter value with its numeric kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn kind(&self) -> &'static str {
        match self {
            Scalar::Int(_) => "integer",
            Scalar::Float(_) => "float",
        }
    }

    /// Casts this value into the numeric kind of `current`, truncating a
    /// float written into an integer slot.
    fn cast_like(self, current: Scalar) -> Scalar {
        match (current, self) {
            (Scalar::Int(_), Scalar::Int(v)) => Scalar::Int(v),
            (Scalar::Int(_), Scalar::Float(v)) => Scalar::Int(v as i64),
            (Scalar::Float(_), Scalar::Int(v)) => Scalar::Float(v as f64),
            (Scalar::Float(_), Scalar::Float(v)) => Scalar::Float(v),
        }
    }
}

/// One hyperparameter: either a scalar or a float array.
///
/// Only scalar values can be edited between runs; arrays are structural and
/// rewriting them would invalidate the rest of the model.
#[derive(Debug, Clone, PartialEq)]
pub enum HypValue {
    Scalar(Scalar),
    Array(ArrayD<f64>),
}

/// Hyperparameters grouped by the model component they belong to.
///
/// The same key may appear in more than one group; an update addressed to
/// that key applies everywhere it occurs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HypParams {
    groups: BTreeMap<String, BTreeMap<String, HypValue>>,
}

impl HypParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: &str, key: &str, value: HypValue) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&HypValue> {
        self.groups.get(group)?.get(key)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, HypValue>)> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn groups_mut(&mut self) -> impl Iterator<Item = &mut BTreeMap<String, HypValue>> {
        self.groups.values_mut()
    }
}

/// Applies scalar updates by key, searching every group.
///
/// Each update value is cast to the numeric kind already stored under the
/// key, with an advisory when that changes the kind. Keys holding arrays are
/// left untouched with an advisory, and keys found in no group at all are
/// reported together in a single advisory at the end.
///
/// # Errors
///
/// Returns [`FitError::MissingHypparams`] when `hypparams` has no groups,
/// which happens when the model was restored from a params-only artifact.
pub fn update_hypparams(
    hypparams: &mut HypParams,
    updates: &[(&str, Scalar)],
) -> Result<Vec<Advisory>> {
    if hypparams.is_empty() {
        return Err(FitError::MissingHypparams);
    }

    let mut advisories = Advisories::new();
    let mut matched = vec![false; updates.len()];

    for group in hypparams.groups_mut() {
        for (idx, (key, update)) in updates.iter().enumerate() {
            let Some(current) = group.get_mut(*key) else {
                continue;
            };
            match current {
                HypValue::Scalar(stored) => {
                    if stored.kind() != update.kind() {
                        advisories.record(Advisory::ScalarTypeCast {
                            key: key.to_string(),
                            from: update.kind(),
                            to: stored.kind(),
                        });
                    }
                    *stored = update.cast_like(*stored);
                }
                HypValue::Array(_) => {
                    advisories.record(Advisory::NonScalarUpdate {
                        key: key.to_string(),
                    });
                }
            }
            matched[idx] = true;
        }
    }

    let unmatched: Vec<String> = updates
        .iter()
        .zip(&matched)
        .filter(|(_, hit)| !**hit)
        .map(|((key, _), _)| key.to_string())
        .collect();
    if !unmatched.is_empty() {
        advisories.record(Advisory::UnmatchedKeys { keys: unmatched });
    }

    Ok(advisories.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn sample() -> HypParams {
        let mut hp = HypParams::new();
        hp.insert("trans_hypparams", "kappa", HypValue::Scalar(Scalar::Float(1e4)));
        hp.insert("trans_hypparams", "alpha", HypValue::Scalar(Scalar::Float(5.7)));
        hp.insert(
            "trans_hypparams",
            "num_states",
            HypValue::Scalar(Scalar::Int(100)),
        );
        hp.insert(
            "ar_hypparams",
            "S_0",
            HypValue::Array(ArrayD::zeros(ndarray::IxDyn(&[4, 4]))),
        );
        hp
    }

    #[test]
    fn same_kind_update_is_silent() {
        let mut hp = sample();
        let advisories = update_hypparams(&mut hp, &[("kappa", Scalar::Float(1e6))]).unwrap();
        assert!(advisories.is_empty());
        assert_eq!(
            hp.get("trans_hypparams", "kappa"),
            Some(&HypValue::Scalar(Scalar::Float(1e6)))
        );
    }

    #[test]
    fn integer_update_into_float_slot_is_cast_with_one_advisory() {
        let mut hp = sample();
        let advisories = update_hypparams(&mut hp, &[("kappa", Scalar::Int(5))]).unwrap();
        assert_eq!(advisories.len(), 1);
        assert!(matches!(
            &advisories[0],
            Advisory::ScalarTypeCast {
                key,
                from: "integer",
                to: "float",
            } if key == "kappa"
        ));
        assert_eq!(
            hp.get("trans_hypparams", "kappa"),
            Some(&HypValue::Scalar(Scalar::Float(5.0)))
        );
    }

    #[test]
    fn float_update_into_integer_slot_truncates() {
        let mut hp = sample();
        let advisories =
            update_hypparams(&mut hp, &[("num_states", Scalar::Float(25.9))]).unwrap();
        assert_eq!(advisories.len(), 1);
        assert_eq!(
            hp.get("trans_hypparams", "num_states"),
            Some(&HypValue::Scalar(Scalar::Int(25)))
        );
    }

    #[test]
    fn array_value_is_left_untouched() {
        let mut hp = sample();
        let before = hp.get("ar_hypparams", "S_0").cloned();
        let advisories = update_hypparams(&mut hp, &[("S_0", Scalar::Float(1.0))]).unwrap();
        assert_eq!(advisories.len(), 1);
        assert!(matches!(
            &advisories[0],
            Advisory::NonScalarUpdate { key } if key == "S_0"
        ));
        assert_eq!(hp.get("ar_hypparams", "S_0").cloned(), before);
    }

    #[test]
    fn unmatched_keys_produce_a_single_advisory() {
        let mut hp = sample();
        let before = hp.clone();
        let advisories = update_hypparams(
            &mut hp,
            &[("gamma_scale", Scalar::Float(2.0)), ("foobar", Scalar::Int(1))],
        )
        .unwrap();
        assert_eq!(advisories.len(), 1);
        assert!(matches!(
            &advisories[0],
            Advisory::UnmatchedKeys { keys } if keys == &["gamma_scale", "foobar"]
        ));
        assert_eq!(hp, before);
    }

    #[test]
    fn duplicate_key_updates_every_group() {
        let mut hp = sample();
        hp.insert("ar_hypparams", "nu", HypValue::Scalar(Scalar::Int(4)));
        hp.insert("obs_hypparams", "nu", HypValue::Scalar(Scalar::Int(5)));

        let advisories = update_hypparams(&mut hp, &[("nu", Scalar::Int(9))]).unwrap();
        assert!(advisories.is_empty());
        assert_eq!(
            hp.get("ar_hypparams", "nu"),
            Some(&HypValue::Scalar(Scalar::Int(9)))
        );
        assert_eq!(
            hp.get("obs_hypparams", "nu"),
            Some(&HypValue::Scalar(Scalar::Int(9)))
        );
    }

    #[test]
    fn empty_tree_is_an_error() {
        let mut hp = HypParams::new();
        let err = update_hypparams(&mut hp, &[("kappa", Scalar::Int(1))]).unwrap_err();
        assert!(matches!(err, FitError::MissingHypparams));
    }
}
