// ========================================================================================
//
//                        Composite Sensitivities and Their Rankings
//
// ========================================================================================

use crate::jco::JacobianMatrix;
use crate::types::{ObservationTable, ParameterTable};
use ahash::{AHashMap, AHashSet};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensitivityError {
    #[error(
        "no observation keeps a non-zero weight after masking ({total} observations, {zeroed} zeroed by the mask)"
    )]
    DegenerateInput { total: usize, zeroed: usize },
    #[error("the Jacobian has no parameter columns")]
    NoParameters,
    #[error("Jacobian row '{0}' has no entry in the observation table")]
    UnknownObservation(String),
    #[error("Jacobian column '{0}' has no entry in the parameter table")]
    UnknownParameter(String),
    #[error("{weights} weights were given with {groups} group names")]
    ShapeMismatch { weights: usize, groups: usize },
}

/// Which observation weights take part in a parameter-sensitivity calculation.
///
/// The three masks run in field order and only ever zero weights.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensitivityOptions {
    /// Zero every observation whose group name contains `regul`.
    pub drop_regularization: bool,
    /// Zero every observation in one of these groups.
    pub drop_groups: Vec<String>,
    /// When present, zero every observation outside these groups.
    pub keep_groups: Option<Vec<String>>,
}

impl SensitivityOptions {
    fn lowered(groups: &[String]) -> AHashSet<String> {
        groups.iter().map(|g| g.to_lowercase()).collect()
    }
}

/// Applies the masks in `options` to a copy of `weights`. `groups[i]` is the
/// group of the observation carrying `weights[i]`.
pub fn masked_weights(
    weights: ArrayView1<'_, f64>,
    groups: &[String],
    options: &SensitivityOptions,
) -> Result<Array1<f64>, SensitivityError> {
    if weights.len() != groups.len() {
        return Err(SensitivityError::ShapeMismatch {
            weights: weights.len(),
            groups: groups.len(),
        });
    }
    let dropped = SensitivityOptions::lowered(&options.drop_groups);
    let kept = options
        .keep_groups
        .as_deref()
        .map(SensitivityOptions::lowered);

    let mut masked = weights.to_owned();
    for (weight, group) in masked.iter_mut().zip(groups) {
        let group = group.to_lowercase();
        if options.drop_regularization && group.contains("regul") {
            *weight = 0.0;
        }
        if dropped.contains(&group) {
            *weight = 0.0;
        }
        if let Some(kept) = &kept {
            if !kept.contains(&group) {
                *weight = 0.0;
            }
        }
    }
    Ok(masked)
}

/// Weight and group of every Jacobian row, looked up by observation name.
fn row_weights_and_groups(
    jacobian: &JacobianMatrix,
    observations: &ObservationTable,
) -> Result<(Array1<f64>, Vec<String>), SensitivityError> {
    let mut weights = Array1::zeros(jacobian.nobs());
    let mut groups = Vec::with_capacity(jacobian.nobs());
    for (i, name) in jacobian.row_names().iter().enumerate() {
        let record = observations
            .get(name)
            .ok_or_else(|| SensitivityError::UnknownObservation(name.clone()))?;
        weights[i] = record.weight;
        groups.push(record.group.clone());
    }
    Ok((weights, groups))
}

/// Composite sensitivity of every parameter: the norm of its weighted Jacobian
/// column divided by the number of observations that still carry weight.
pub fn compute_parameter_sensitivity(
    jacobian: &JacobianMatrix,
    observations: &ObservationTable,
    parameters: &ParameterTable,
    options: &SensitivityOptions,
) -> Result<SensitivityResult, SensitivityError> {
    let (weights, obs_groups) = row_weights_and_groups(jacobian, observations)?;
    let masked = masked_weights(weights.view(), &obs_groups, options)?;

    let nonzero = masked.iter().filter(|&&w| w != 0.0).count();
    if nonzero == 0 {
        let before = weights.iter().filter(|&&w| w != 0.0).count();
        return Err(SensitivityError::DegenerateInput {
            total: weights.len(),
            zeroed: before,
        });
    }
    log::debug!(
        "Parameter sensitivity over {} of {} weighted observations",
        nonzero,
        masked.len()
    );

    let divisor = nonzero as f64;
    let scores: Vec<f64> = jacobian
        .values()
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| {
            column
                .iter()
                .zip(masked.iter())
                .map(|(d, w)| (d * w) * (d * w))
                .sum::<f64>()
                .sqrt()
                / divisor
        })
        .collect();

    let entries = jacobian
        .col_names()
        .iter()
        .zip(scores)
        .map(|(name, score)| {
            let record = parameters
                .get(name)
                .ok_or_else(|| SensitivityError::UnknownParameter(name.clone()))?;
            Ok(SensitivityEntry {
                name: name.clone(),
                group: record.group.clone(),
                score,
            })
        })
        .collect::<Result<Vec<_>, SensitivityError>>()?;

    Ok(SensitivityResult::new(SensitivityKind::Parameter, entries))
}

/// Composite sensitivity of every observation: the norm of its Jacobian row times
/// its weight, divided by the number of parameters. No masking applies.
pub fn compute_observation_sensitivity(
    jacobian: &JacobianMatrix,
    observations: &ObservationTable,
) -> Result<SensitivityResult, SensitivityError> {
    let npar = jacobian.npar();
    if npar == 0 {
        return Err(SensitivityError::NoParameters);
    }

    let entries = jacobian
        .row_names()
        .iter()
        .zip(jacobian.values().axis_iter(Axis(0)))
        .map(|(name, row)| {
            let record = observations
                .get(name)
                .ok_or_else(|| SensitivityError::UnknownObservation(name.clone()))?;
            let norm = row.iter().map(|d| d * d).sum::<f64>().sqrt();
            Ok(SensitivityEntry {
                name: name.clone(),
                group: record.group.clone(),
                score: norm * record.weight.abs() / npar as f64,
            })
        })
        .collect::<Result<Vec<_>, SensitivityError>>()?;

    Ok(SensitivityResult::new(SensitivityKind::Observation, entries))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitivityKind {
    Parameter,
    Observation,
    /// IDENTPAR identifiability, ranked with the same views.
    Identifiability,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityEntry {
    pub name: String,
    pub group: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSensitivity {
    pub group: String,
    pub score: f64,
}

/// Scores in Jacobian order, with ranking views layered on top.
#[derive(Debug, Clone)]
pub struct SensitivityResult {
    kind: SensitivityKind,
    entries: Vec<SensitivityEntry>,
    index: AHashMap<String, usize>,
}

/// Highest score first; equal scores fall back to natural name order.
fn by_descending_score(a: &SensitivityEntry, b: &SensitivityEntry) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| natord::compare(&a.name, &b.name))
}

impl SensitivityResult {
    pub(crate) fn new(kind: SensitivityKind, entries: Vec<SensitivityEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        Self {
            kind,
            entries,
            index,
        }
    }

    pub fn kind(&self) -> SensitivityKind {
        self.kind
    }

    /// Entries in Jacobian order.
    pub fn entries(&self) -> &[SensitivityEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Score of a single parameter or observation.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entry(name).map(|e| e.score)
    }

    pub fn entry(&self, name: &str) -> Option<&SensitivityEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Every entry, highest score first.
    pub fn ranked(&self) -> Vec<&SensitivityEntry> {
        let mut ranked: Vec<&SensitivityEntry> = self.entries.iter().collect();
        ranked.sort_by(|a, b| by_descending_score(a, b));
        ranked
    }

    /// A slice of the ranking, always sorted highest score first.
    ///
    /// Sign convention:
    ///   `n > 0`  the `n` highest-scoring entries (head of the ranking)
    ///   `n < 0`  the `|n|` lowest-scoring entries (tail of the ranking), still
    ///            listed highest first
    ///   `n == 0` every entry
    ///
    /// `top_n(k)` and `top_n(-(len - k))` together cover the ranking exactly once.
    pub fn top_n(&self, n: i64) -> Vec<&SensitivityEntry> {
        let ranked = self.ranked();
        let wanted = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
        let take = wanted.min(ranked.len());
        match n.cmp(&0) {
            Ordering::Equal => ranked,
            Ordering::Greater => ranked[..take].to_vec(),
            Ordering::Less => ranked[ranked.len() - take..].to_vec(),
        }
    }

    /// A new result holding only the entries of `group` (case-insensitive).
    pub fn filter_by_group(&self, group: &str) -> SensitivityResult {
        let wanted = group.to_lowercase();
        let entries = self
            .entries
            .iter()
            .filter(|e| e.group.to_lowercase() == wanted)
            .cloned()
            .collect();
        SensitivityResult::new(self.kind, entries)
    }

    /// Total score per group, highest first. Groups that differ only in case are
    /// summed together under the first spelling seen.
    pub fn sum_by_group(&self) -> Vec<GroupSensitivity> {
        let mut sums: Vec<GroupSensitivity> = Vec::new();
        let mut slots: AHashMap<String, usize> = AHashMap::new();
        for entry in &self.entries {
            let slot = *slots.entry(entry.group.to_lowercase()).or_insert_with(|| {
                sums.push(GroupSensitivity {
                    group: entry.group.clone(),
                    score: 0.0,
                });
                sums.len() - 1
            });
            sums[slot].score += entry.score;
        }
        sums.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| natord::compare(&a.group, &b.group))
        });
        sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeLimit, ObservationRecord, ParameterRecord, ParameterTransform};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn observations(rows: &[(&str, f64, &str)]) -> ObservationTable {
        ObservationTable::from_records(rows.iter().map(|&(name, weight, group)| {
            ObservationRecord {
                name: name.to_string(),
                value: 0.0,
                weight,
                group: group.to_string(),
            }
        }))
        .unwrap()
    }

    fn parameters(cols: &[(&str, &str)]) -> ParameterTable {
        ParameterTable::from_records(cols.iter().map(|&(name, group)| ParameterRecord {
            name: name.to_string(),
            transform: ParameterTransform::Log,
            change_limit: ChangeLimit::Factor,
            value: 1.0,
            lower_bound: 0.01,
            upper_bound: 100.0,
            group: group.to_string(),
            scale: 1.0,
            offset: 0.0,
            derivative_command: 1,
            tied_to: None,
        }))
        .unwrap()
    }

    fn jacobian(values: Array2<f64>, rows: &[&str], cols: &[&str]) -> JacobianMatrix {
        JacobianMatrix::new(
            values,
            rows.iter().map(|s| s.to_string()).collect(),
            cols.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn observation_score_is_weighted_row_norm_over_parameter_count() {
        let jco = jacobian(array![[3.0, 4.0]], &["o1"], &["p1", "p2"]);
        let obs = observations(&[("o1", 2.0, "head")]);
        let result = compute_observation_sensitivity(&jco, &obs).unwrap();
        assert_eq!(result.kind(), SensitivityKind::Observation);
        assert_abs_diff_eq!(result.get("o1").unwrap(), 5.0, epsilon = 1e-12);
        assert_eq!(result.entry("o1").unwrap().group, "head");
    }

    #[test]
    fn observation_sensitivity_needs_parameters() {
        let jco = jacobian(Array2::zeros((1, 0)), &["o1"], &[]);
        let obs = observations(&[("o1", 1.0, "head")]);
        assert!(matches!(
            compute_observation_sensitivity(&jco, &obs),
            Err(SensitivityError::NoParameters)
        ));
    }

    #[test]
    fn parameter_score_divides_weighted_column_norm_by_nonzero_weights() {
        let jco = jacobian(
            array![[1.0, 0.0], [2.0, 3.0], [2.0, 4.0]],
            &["h1", "h2", "f1"],
            &["k1", "rch"],
        );
        let obs = observations(&[("h1", 1.0, "head"), ("h2", 0.0, "head"), ("f1", 0.5, "flux")]);
        let pars = parameters(&[("k1", "hk"), ("rch", "recharge")]);

        let result =
            compute_parameter_sensitivity(&jco, &obs, &pars, &SensitivityOptions::default())
                .unwrap();
        // k1: sqrt(1^2 + 0 + (2*0.5)^2) / 2, rch: sqrt(0 + 0 + (4*0.5)^2) / 2
        assert_abs_diff_eq!(result.get("k1").unwrap(), 2f64.sqrt() / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.get("rch").unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(result.entry("rch").unwrap().group, "recharge");
    }

    #[test]
    fn masks_compose_case_insensitively() {
        let weights = array![1.0, 2.0, 3.0, 4.0];
        let groups: Vec<String> = ["regul_hk", "HEAD", "flux", "Well"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let regul = SensitivityOptions {
            drop_regularization: true,
            ..Default::default()
        };
        assert_eq!(
            masked_weights(weights.view(), &groups, &regul).unwrap(),
            array![0.0, 2.0, 3.0, 4.0]
        );

        let dropped = SensitivityOptions {
            drop_regularization: true,
            drop_groups: vec!["head".into()],
            keep_groups: Some(vec!["Flux".into(), "head".into()]),
        };
        assert_eq!(
            masked_weights(weights.view(), &groups, &dropped).unwrap(),
            array![0.0, 0.0, 3.0, 0.0]
        );
    }

    #[test]
    fn mask_needs_one_group_per_weight() {
        let weights = array![1.0, 2.0, 3.0];
        let groups = vec!["head".to_string(), "flux".to_string()];
        assert!(matches!(
            masked_weights(weights.view(), &groups, &SensitivityOptions::default()),
            Err(SensitivityError::ShapeMismatch { weights: 3, groups: 2 })
        ));
    }

    #[test]
    fn fully_masked_weights_are_degenerate() {
        let jco = jacobian(array![[1.0], [1.0]], &["r1", "r2"], &["k"]);
        let obs = observations(&[("r1", 1.0, "regul1"), ("r2", 1.0, "regul2")]);
        let pars = parameters(&[("k", "hk")]);
        let options = SensitivityOptions {
            drop_regularization: true,
            ..Default::default()
        };
        assert!(matches!(
            compute_parameter_sensitivity(&jco, &obs, &pars, &options),
            Err(SensitivityError::DegenerateInput { total: 2, zeroed: 2 })
        ));
    }

    #[test]
    fn unknown_names_are_reported() {
        let jco = jacobian(array![[1.0]], &["o1"], &["p1"]);
        let pars = parameters(&[("p1", "g")]);
        let missing_obs = observations(&[("other", 1.0, "g")]);
        assert!(matches!(
            compute_parameter_sensitivity(&jco, &missing_obs, &pars, &SensitivityOptions::default()),
            Err(SensitivityError::UnknownObservation(name)) if name == "o1"
        ));

        let obs = observations(&[("o1", 1.0, "g")]);
        let missing_par = parameters(&[("p2", "g")]);
        assert!(matches!(
            compute_parameter_sensitivity(&jco, &obs, &missing_par, &SensitivityOptions::default()),
            Err(SensitivityError::UnknownParameter(name)) if name == "p1"
        ));
    }

    #[test]
    fn dropping_a_group_only_rescales_parameters_that_ignore_it() {
        let mut rng = StdRng::seed_from_u64(42);
        let nobs = 40;
        let npar = 6;
        let groups = ["head", "flux", "conc"];

        let obs_groups: Vec<&str> = (0..nobs).map(|i| groups[i % groups.len()]).collect();
        let mut values = Array2::<f64>::zeros((nobs, npar));
        for ((row, col), cell) in values.indexed_iter_mut() {
            // Columns 0 and 1 never see the flux rows.
            let blind = col < 2 && obs_groups[row] == "flux";
            if !blind {
                *cell = rng.gen_range(-5.0..5.0);
            }
        }

        let row_names: Vec<String> = (0..nobs).map(|i| format!("o{i}")).collect();
        let col_names: Vec<String> = (0..npar).map(|j| format!("p{j}")).collect();
        let obs = ObservationTable::from_records(row_names.iter().zip(&obs_groups).map(
            |(name, group)| ObservationRecord {
                name: name.clone(),
                value: 0.0,
                weight: rng.gen_range(0.1..3.0),
                group: group.to_string(),
            },
        ))
        .unwrap();
        let col_refs: Vec<(&str, &str)> = col_names.iter().map(|n| (n.as_str(), "k")).collect();
        let pars = parameters(&col_refs);
        let jco = JacobianMatrix::new(values, row_names, col_names.clone()).unwrap();

        let all = SensitivityOptions::default();
        let without_flux = SensitivityOptions {
            drop_groups: vec!["flux".into()],
            ..Default::default()
        };
        let before = compute_parameter_sensitivity(&jco, &obs, &pars, &all).unwrap();
        let after = compute_parameter_sensitivity(&jco, &obs, &pars, &without_flux).unwrap();

        let (weights, row_groups) = row_weights_and_groups(&jco, &obs).unwrap();
        let count = |w: &Array1<f64>| w.iter().filter(|&&x| x != 0.0).count() as f64;
        let n_before = count(&masked_weights(weights.view(), &row_groups, &all).unwrap());
        let n_after = count(&masked_weights(weights.view(), &row_groups, &without_flux).unwrap());
        assert!(n_after <= n_before);

        for name in &col_names[..2] {
            assert_abs_diff_eq!(
                before.get(name).unwrap() * n_before,
                after.get(name).unwrap() * n_after,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn head_and_tail_partition_the_ranking() {
        let mut rng = StdRng::seed_from_u64(7);
        let len = 25;
        let entries: Vec<SensitivityEntry> = (0..len)
            .map(|i| SensitivityEntry {
                name: format!("p{i}"),
                group: if i % 2 == 0 { "even" } else { "odd" }.to_string(),
                // Coarse values so some scores tie.
                score: f64::from(rng.gen_range(0..10u8)),
            })
            .collect();
        let result = SensitivityResult::new(SensitivityKind::Parameter, entries);
        let ranked: Vec<&str> = result.ranked().iter().map(|e| e.name.as_str()).collect();

        // Both ends are skipped: top_n(0) means every entry, not none.
        for k in 1..len {
            let head = result.top_n(k as i64);
            let tail = result.top_n(-((len - k) as i64));
            let mut joined: Vec<&str> = head.iter().map(|e| e.name.as_str()).collect();
            joined.extend(tail.iter().map(|e| e.name.as_str()));
            assert_eq!(joined, ranked);
        }

        assert_eq!(result.top_n(0).len(), len);
        assert_eq!(result.top_n(1000).len(), len);
        assert_eq!(result.top_n(-1000).len(), len);
        let tail = result.top_n(-3);
        assert!(tail.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn group_views_filter_and_sum() {
        let entries = vec![
            SensitivityEntry { name: "k1".into(), group: "hk".into(), score: 1.0 },
            SensitivityEntry { name: "k2".into(), group: "hk".into(), score: 3.0 },
            SensitivityEntry { name: "r1".into(), group: "rch".into(), score: 2.5 },
            SensitivityEntry { name: "s1".into(), group: "ss".into(), score: 0.5 },
        ];
        let result = SensitivityResult::new(SensitivityKind::Parameter, entries);

        let hk = result.filter_by_group("HK");
        assert_eq!(hk.len(), 2);
        assert_eq!(hk.top_n(1)[0].name, "k2");
        assert_eq!(hk.get("r1"), None);

        let sums = result.sum_by_group();
        let flat: Vec<(&str, f64)> = sums.iter().map(|g| (g.group.as_str(), g.score)).collect();
        assert_eq!(flat, vec![("hk", 4.0), ("rch", 2.5), ("ss", 0.5)]);
    }

    #[test]
    fn group_sums_ignore_case() {
        let entries = vec![
            SensitivityEntry { name: "k1".into(), group: "HK".into(), score: 1.0 },
            SensitivityEntry { name: "k2".into(), group: "hk".into(), score: 2.0 },
            SensitivityEntry { name: "r1".into(), group: "rch".into(), score: 2.5 },
        ];
        let result = SensitivityResult::new(SensitivityKind::Parameter, entries);
        let sums = result.sum_by_group();
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0].group, "HK");
        assert_abs_diff_eq!(sums[0].score, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn ties_are_ranked_in_natural_name_order() {
        let entries = ["p10", "p2", "p1"]
            .iter()
            .map(|n| SensitivityEntry {
                name: n.to_string(),
                group: "g".into(),
                score: 1.0,
            })
            .collect();
        let result = SensitivityResult::new(SensitivityKind::Parameter, entries);
        let names: Vec<&str> = result.ranked().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2", "p10"]);
    }
}
