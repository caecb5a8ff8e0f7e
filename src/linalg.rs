//! Decomposition of the symmetric positive semi-definite covariance that the
//! gender subspace estimator builds.
//!
//! For a symmetric PSD matrix the singular value decomposition coincides
//! with the eigendecomposition, so `nalgebra::SymmetricEigen` gives both the
//! singular values and the left singular vectors. Runs in f64.

use std::cmp::Ordering;

use nalgebra::{DMatrix, SymmetricEigen};

use crate::error::{Error, Result};

const MAX_ITERATIONS: usize = 10_000;

/// Singular values in descending order with their left singular vectors.
#[derive(Debug, Clone)]
pub struct SymmetricSvd {
    pub singular_values: Vec<f32>,
    /// `vectors[i]` is the unit left singular vector for `singular_values[i]`.
    pub vectors: Vec<Vec<f32>>,
}

/// Decomposes the `n x n` row-major symmetric matrix `x`.
pub fn symmetric_svd(x: &[f32], n: usize) -> Result<SymmetricSvd> {
    if n == 0 || x.len() != n * n {
        return Err(Error::InvalidConfig(format!(
            "expected a non-empty {n}x{n} matrix, got {} values",
            x.len()
        )));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(Error::Decomposition("covariance has non-finite entries".into()));
    }
    let matrix = DMatrix::from_row_slice(n, n, &x.iter().map(|&v| f64::from(v)).collect::<Vec<_>>());
    let eigen = SymmetricEigen::try_new(matrix, f64::EPSILON, MAX_ITERATIONS).ok_or_else(|| {
        Error::Decomposition(format!("no convergence after {MAX_ITERATIONS} iterations"))
    })?;

    let mut order: Vec<(usize, f64)> = eigen.eigenvalues.iter().copied().enumerate().collect();
    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let singular_values = order.iter().map(|&(_, value)| value.max(0.0) as f32).collect();
    let vectors = order
        .iter()
        .map(|&(idx, _)| eigen.eigenvectors.column(idx).iter().map(|&v| v as f32).collect())
        .collect();

    Ok(SymmetricSvd { singular_values, vectors })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn diagonal_matrix_sorts_descending() {
        let x = [1.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 3.0];
        let svd = symmetric_svd(&x, 3).unwrap();
        assert_eq!(svd.singular_values, vec![5.0, 3.0, 1.0]);
        assert!((svd.vectors[0][1].abs() - 1.0).abs() < 1e-6);
        assert!((svd.vectors[2][0].abs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reconstructs_dense_symmetric_matrix() {
        let x = [4.0, 1.0, 2.0, 1.0, 3.0, 0.5, 2.0, 0.5, 5.0];
        let svd = symmetric_svd(&x, 3).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let rebuilt: f32 = (0..3)
                    .map(|k| svd.singular_values[k] * svd.vectors[k][i] * svd.vectors[k][j])
                    .sum();
                assert!((rebuilt - x[i * 3 + j]).abs() < 1e-4, "({i},{j}) {rebuilt}");
            }
        }
    }

    #[test]
    fn vectors_are_orthonormal() {
        let x = [2.0, -1.0, 0.0, -1.0, 2.0, -1.0, 0.0, -1.0, 2.0];
        let svd = symmetric_svd(&x, 3).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dot(&svd.vectors[i], &svd.vectors[j]) - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn rank_one_outer_product() {
        let u = [0.6f32, 0.8];
        let x: Vec<f32> = (0..4).map(|i| 2.0 * u[i / 2] * u[i % 2]).collect();
        let svd = symmetric_svd(&x, 2).unwrap();
        assert!((svd.singular_values[0] - 2.0).abs() < 1e-5);
        assert!(svd.singular_values[1].abs() < 1e-5);
        assert!((dot(&svd.vectors[0], &u).abs() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_shape_mismatch() {
        assert!(symmetric_svd(&[1.0, 2.0], 2).is_err());
    }

    #[test]
    fn non_finite_input_is_a_decomposition_error() {
        let x = [1.0, f32::NAN, f32::NAN, 1.0];
        assert!(matches!(symmetric_svd(&x, 2), Err(Error::Decomposition(_))));
    }

    #[test]
    fn wide_covariance_decomposes_quickly() {
        // emsize-sized matrix built from 15 rank-one terms
        let n = 200;
        let mut x = vec![0.0f32; n * n];
        for p in 0..15 {
            let u: Vec<f32> = (0..n).map(|i| ((i * (p + 3)) % 17) as f32 / 17.0 - 0.5).collect();
            for i in 0..n {
                for j in 0..n {
                    x[i * n + j] += u[i] * u[j];
                }
            }
        }
        let start = std::time::Instant::now();
        let svd = symmetric_svd(&x, n).unwrap();
        assert!(start.elapsed().as_secs_f64() < 5.0);
        assert_eq!(svd.singular_values.len(), n);
        assert!(svd.singular_values.windows(2).all(|w| w[0] >= w[1]));
        assert!(svd.singular_values[15..].iter().all(|&s| s < 1e-3 * svd.singular_values[0]));
    }
}
