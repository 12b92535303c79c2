// ========================================================================================
//
//                     Parameter Covariance, Correlation and Eigenstructure
//
// ========================================================================================

use crate::jco::JacobianMatrix;
use crate::residuals::ResidualTable;
use crate::types::ObservationTable;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, Inverse, UPLO};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CovarianceError {
    #[error(
        "{nonzero} observations carry non-zero weight but {npar} parameters are estimated; covariance needs more weighted observations than parameters"
    )]
    DegenerateInput { nonzero: usize, npar: usize },
    #[error("the {npar}x{npar} normal matrix J^T Q J is not invertible: {detail}")]
    SingularMatrix { npar: usize, detail: String },
    #[error("Jacobian row '{0}' has no entry in the observation table")]
    UnknownObservation(String),
    #[error("Jacobian row '{0}' has no entry in the residual table")]
    MissingResidual(String),
    #[error("expected {expected} observation weights, got {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("eigendecomposition of the covariance matrix failed: {0}")]
    Eigendecomposition(String),
}

/// Posterior parameter covariance and what derives from it. All matrices are
/// indexed by parameter in Jacobian column order.
#[derive(Debug, Clone)]
pub struct CovarianceResult {
    parameter_names: Vec<String>,
    parameter_index: AHashMap<String, usize>,
    covariance: Array2<f64>,
    correlation: Array2<f64>,
    eigenvalues: Array1<f64>,
    eigenvectors: Array2<f64>,
    phi: f64,
    nonzero_weights: usize,
}

impl CovarianceResult {
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_index.get(name).copied()
    }

    pub fn covariance(&self) -> ArrayView2<'_, f64> {
        self.covariance.view()
    }

    pub fn correlation(&self) -> ArrayView2<'_, f64> {
        self.correlation.view()
    }

    /// Ascending.
    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    /// Column `i` belongs to `eigenvalues()[i]`.
    pub fn eigenvectors(&self) -> ArrayView2<'_, f64> {
        self.eigenvectors.view()
    }

    pub fn phi(&self) -> f64 {
        self.phi
    }

    pub fn nonzero_weights(&self) -> usize {
        self.nonzero_weights
    }

    pub fn degrees_of_freedom(&self) -> usize {
        self.nonzero_weights - self.parameter_names.len()
    }

    /// Square roots of the covariance diagonal.
    pub fn standard_deviations(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }

    pub fn covariance_between(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.covariance[[self.parameter_index(a)?, self.parameter_index(b)?]])
    }

    pub fn correlation_between(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.correlation[[self.parameter_index(a)?, self.parameter_index(b)?]])
    }
}

/// Looks up each Jacobian row's weight and weighted residual by name, then
/// delegates to [`compute_from_parts`].
pub fn compute_covariance(
    jacobian: &JacobianMatrix,
    observations: &ObservationTable,
    residuals: &ResidualTable,
) -> Result<CovarianceResult, CovarianceError> {
    let mut weights = Array1::zeros(jacobian.nobs());
    let mut phi = 0.0;
    for (i, name) in jacobian.row_names().iter().enumerate() {
        weights[i] = observations
            .get(name)
            .ok_or_else(|| CovarianceError::UnknownObservation(name.clone()))?
            .weight;
        let weighted = residuals
            .weighted_residual(name)
            .ok_or_else(|| CovarianceError::MissingResidual(name.clone()))?;
        phi += weighted * weighted;
    }
    compute_from_parts(jacobian, weights.view(), phi)
}

/// `cov = phi / (n_nonzero - npar) * (J^T Q J)^-1` with `Q = diag(w^2)`.
pub fn compute_from_parts(
    jacobian: &JacobianMatrix,
    weights: ArrayView1<'_, f64>,
    phi: f64,
) -> Result<CovarianceResult, CovarianceError> {
    let nobs = jacobian.nobs();
    let npar = jacobian.npar();
    if weights.len() != nobs {
        return Err(CovarianceError::ShapeMismatch {
            expected: nobs,
            found: weights.len(),
        });
    }

    let nonzero = weights.iter().filter(|&&w| w != 0.0).count();
    if nonzero <= npar {
        return Err(CovarianceError::DegenerateInput { nonzero, npar });
    }

    let j = jacobian.values();
    let q = weights.mapv(|w| w * w);
    let qj = &j * &q.insert_axis(Axis(1));
    let normal = j.t().dot(&qj);

    let inverse = normal.inv().map_err(|e| CovarianceError::SingularMatrix {
        npar,
        detail: e.to_string(),
    })?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(CovarianceError::SingularMatrix {
            npar,
            detail: "inverse has non-finite entries".to_string(),
        });
    }

    let scale = phi / (nonzero - npar) as f64;
    let scaled = inverse * scale;
    // Averaging with the transpose makes the result exactly symmetric.
    let covariance = (&scaled + &scaled.t()) * 0.5;

    let mut correlation = Array2::<f64>::zeros((npar, npar));
    for ((row, col), cell) in correlation.indexed_iter_mut() {
        *cell = if row == col {
            1.0
        } else {
            covariance[[row, col]] / (covariance[[row, row]] * covariance[[col, col]]).sqrt()
        };
    }

    let (eigenvalues, eigenvectors) = covariance
        .eigh(UPLO::Lower)
        .map_err(|e| CovarianceError::Eigendecomposition(e.to_string()))?;

    log::debug!(
        "Covariance for {npar} parameters from {nonzero} weighted observations, phi = {phi:.6e}"
    );

    let parameter_names = jacobian.col_names().to_vec();
    let parameter_index = parameter_names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect();

    Ok(CovarianceResult {
        parameter_names,
        parameter_index,
        covariance,
        correlation,
        eigenvalues,
        eigenvectors,
        phi,
        nonzero_weights: nonzero,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservationRecord;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;
    use std::path::Path;

    fn labelled(values: Array2<f64>) -> JacobianMatrix {
        let (nobs, npar) = values.dim();
        JacobianMatrix::new(
            values,
            (0..nobs).map(|i| format!("o{i}")).collect(),
            (0..npar).map(|j| format!("p{j}")).collect(),
        )
        .unwrap()
    }

    fn random_case(seed: u64, nobs: usize, npar: usize) -> (JacobianMatrix, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = Array2::from_shape_fn((nobs, npar), |_| rng.gen_range(-2.0..2.0));
        let weights = Array1::from_shape_fn(nobs, |_| rng.gen_range(0.2..2.0));
        (labelled(values), weights)
    }

    #[test]
    fn single_parameter_matches_hand_computation() {
        let jco = labelled(array![[1.0], [1.0], [1.0]]);
        let result = compute_from_parts(&jco, array![1.0, 1.0, 1.0].view(), 2.0).unwrap();
        // (2 / (3 - 1)) * 1/3
        assert_abs_diff_eq!(result.covariance()[[0, 0]], 1.0 / 3.0, epsilon = 1e-12);
        assert_eq!(result.correlation()[[0, 0]], 1.0);
        assert_eq!(result.degrees_of_freedom(), 2);
        assert_abs_diff_eq!(result.standard_deviations()[0], (1.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn covariance_and_correlation_are_symmetric_with_unit_diagonal() {
        let (jco, weights) = random_case(11, 30, 5);
        let result = compute_from_parts(&jco, weights.view(), 17.5).unwrap();
        let cov = result.covariance();
        let cor = result.correlation();
        for i in 0..5 {
            assert_eq!(cor[[i, i]], 1.0);
            assert!(cov[[i, i]] > 0.0);
            for j in 0..5 {
                assert_eq!(cov[[i, j]], cov[[j, i]]);
                assert_abs_diff_eq!(cor[[i, j]], cor[[j, i]], epsilon = 1e-12);
                assert!(cor[[i, j]].abs() <= 1.0 + 1e-12);
                if i != j {
                    let expected = cov[[i, j]] / (cov[[i, i]] * cov[[j, j]]).sqrt();
                    assert_abs_diff_eq!(cor[[i, j]], expected, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn eigenpairs_reconstruct_the_covariance() {
        let (jco, weights) = random_case(23, 20, 4);
        let result = compute_from_parts(&jco, weights.view(), 3.0).unwrap();
        let values = result.eigenvalues();
        assert!(values.windows(2).into_iter().all(|w| w[0] <= w[1]));

        let vectors = result.eigenvectors();
        let rebuilt = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for (a, b) in rebuilt.iter().zip(result.covariance().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn as_many_parameters_as_weighted_observations_is_degenerate() {
        let jco = labelled(array![[1.0, 0.0], [0.0, 2.0]]);
        assert!(matches!(
            compute_from_parts(&jco, array![1.0, 1.0].view(), 0.0),
            Err(CovarianceError::DegenerateInput { nonzero: 2, npar: 2 })
        ));

        // Zero weights do not count toward the observations.
        let jco = labelled(array![[1.0], [2.0], [3.0]]);
        assert!(matches!(
            compute_from_parts(&jco, array![0.0, 1.0, 0.0].view(), 1.0),
            Err(CovarianceError::DegenerateInput { nonzero: 1, npar: 1 })
        ));
    }

    #[test]
    fn parameter_with_no_sensitivity_is_singular() {
        let jco = labelled(array![[1.0, 0.0], [2.0, 0.0], [3.0, 0.0]]);
        assert!(matches!(
            compute_from_parts(&jco, array![1.0, 1.0, 1.0].view(), 1.0),
            Err(CovarianceError::SingularMatrix { npar: 2, .. })
        ));
    }

    #[test]
    fn weight_count_must_match_rows() {
        let jco = labelled(array![[1.0], [1.0]]);
        assert!(matches!(
            compute_from_parts(&jco, array![1.0].view(), 1.0),
            Err(CovarianceError::ShapeMismatch { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn tables_supply_weights_and_phi() {
        let jco = JacobianMatrix::new(
            array![[1.0, 0.5], [0.0, 1.0], [2.0, 1.0], [1.0, -1.0]],
            vec!["h1".into(), "h2".into(), "h3".into(), "f1".into()],
            vec!["k".into(), "rch".into()],
        )
        .unwrap();
        let observations = ObservationTable::from_records(
            [("h1", 1.0), ("h2", 2.0), ("h3", 1.0), ("f1", 0.5)].map(|(name, weight)| {
                ObservationRecord {
                    name: name.to_string(),
                    value: 0.0,
                    weight,
                    group: "g".to_string(),
                }
            }),
        )
        .unwrap();
        let residuals = ResidualTable::from_reader(
            Cursor::new(
                " Name Group Measured Modelled Residual Weight\n\
                 h1 g 1 0 1.0 1.0\n h2 g 1 0 0.5 2.0\n h3 g 1 0 -2.0 1.0\n f1 g 1 0 2.0 0.5\n",
            ),
            Path::new("case.res"),
        )
        .unwrap();

        let result = compute_covariance(&jco, &observations, &residuals).unwrap();
        assert_abs_diff_eq!(result.phi(), 1.0 + 1.0 + 4.0 + 1.0, epsilon = 1e-12);
        assert_eq!(result.nonzero_weights(), 4);

        let direct = compute_from_parts(&jco, array![1.0, 2.0, 1.0, 0.5].view(), 7.0).unwrap();
        assert_abs_diff_eq!(
            result.covariance_between("k", "rch").unwrap(),
            direct.covariance()[[0, 1]],
            epsilon = 1e-12
        );
        assert_eq!(result.correlation_between("k", "k"), Some(1.0));
        assert_eq!(result.covariance_between("k", "missing"), None);

        let partial = ResidualTable::from_reader(
            Cursor::new(" Name Group Measured Modelled Residual Weight\n h1 g 1 0 1.0 1.0\n"),
            Path::new("partial.res"),
        )
        .unwrap();
        assert!(matches!(
            compute_covariance(&jco, &observations, &partial),
            Err(CovarianceError::MissingResidual(name)) if name == "h2"
        ));

        let empty = ObservationTable::new();
        assert!(matches!(
            compute_covariance(&jco, &empty, &residuals),
            Err(CovarianceError::UnknownObservation(name)) if name == "h1"
        ));
    }
}
