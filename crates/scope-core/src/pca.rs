//! Principal component analysis via symmetric eigendecomposition of the
//! sample covariance matrix.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::Serialize;

use crate::constants::RANK_TOLERANCE;
use crate::error::{Error, Result};

/// One principal axis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Component {
    /// Unit loading vector over the feature columns.
    pub loadings: Vec<f64>,
    /// Eigenvalue of the covariance matrix.
    pub explained_variance: f64,
    /// Fraction of total variance on this axis.
    pub explained_variance_ratio: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PcaFit {
    pub components: Vec<Component>,
    pub mean: Vec<f64>,
    /// Scores: rows of the input projected onto the components.
    pub projection: DMatrix<f64>,
    pub rank: usize,
}

impl PcaFit {
    pub fn total_explained(&self) -> f64 {
        self.components
            .iter()
            .map(|c| c.explained_variance_ratio)
            .sum()
    }
}

/// Fit `n_components` principal components to `data` (rows = observations).
///
/// Components come out in descending variance order; exact ties keep the
/// order the eigensolver produced. Each loading vector is sign-normalised so
/// its largest-magnitude entry is positive.
pub fn fit(data: &DMatrix<f64>, n_components: usize) -> Result<PcaFit> {
    let (rows, cols) = data.shape();
    if n_components == 0 {
        return Err(Error::InvalidParameter(
            "n_components must be at least 1".to_string(),
        ));
    }
    if rows < 2 {
        return Err(Error::InsufficientSamples(format!(
            "PCA needs at least 2 sample rows, got {rows}"
        )));
    }
    if n_components > rows.min(cols) {
        return Err(Error::InsufficientSamples(format!(
            "n_components={n_components} exceeds min(rows={rows}, columns={cols})"
        )));
    }

    let mean: Vec<f64> = (0..cols).map(|j| data.column(j).mean()).collect();
    let mut centered = data.clone();
    for j in 0..cols {
        let m = mean[j];
        centered.column_mut(j).iter_mut().for_each(|v| *v -= m);
    }

    let covariance = (centered.transpose() * &centered) / (rows as f64 - 1.0);
    let eigen = SymmetricEigen::new(covariance);

    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    // Stable sort: equal eigenvalues keep solver order.
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let max_eigenvalue = order
        .first()
        .map(|&i| eigen.eigenvalues[i].max(0.0))
        .unwrap_or(0.0);
    let rank = order
        .iter()
        .filter(|&&i| {
            let v = eigen.eigenvalues[i];
            v > 0.0 && v > RANK_TOLERANCE * max_eigenvalue
        })
        .count();
    if n_components > rank {
        return Err(Error::InsufficientSamples(format!(
            "n_components={n_components} exceeds the data rank {rank}"
        )));
    }

    let total_variance: f64 = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();

    let mut components = Vec::with_capacity(n_components);
    let mut basis = DMatrix::<f64>::zeros(cols, n_components);
    for (k, &i) in order.iter().take(n_components).enumerate() {
        let mut axis: DVector<f64> = eigen.eigenvectors.column(i).into_owned();
        let pivot = axis
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            axis.neg_mut();
        }
        basis.set_column(k, &axis);

        let variance = eigen.eigenvalues[i].max(0.0);
        components.push(Component {
            loadings: axis.iter().copied().collect(),
            explained_variance: variance,
            explained_variance_ratio: variance / total_variance,
        });
    }

    let projection = centered * basis;

    Ok(PcaFit {
        components,
        mean,
        projection,
        rank,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_data() -> DMatrix<f64> {
        // Points along y = 2x with a small orthogonal wobble.
        DMatrix::from_row_slice(
            5,
            2,
            &[
                0.0, 0.0, //
                1.0, 2.1, //
                2.0, 3.9, //
                3.0, 6.1, //
                4.0, 7.9,
            ],
        )
    }

    #[test]
    fn test_first_component_follows_dominant_axis() {
        let fit = fit(&line_data(), 1).unwrap();
        let l = &fit.components[0].loadings;
        assert_relative_eq!(l[1] / l[0], 2.0, epsilon = 0.05);
        assert!(fit.components[0].explained_variance_ratio > 0.99);
        assert_eq!(fit.projection.shape(), (5, 1));
    }

    #[test]
    fn test_ratios_non_increasing_and_bounded() {
        let fit = fit(&line_data(), 2).unwrap();
        let r: Vec<f64> = fit
            .components
            .iter()
            .map(|c| c.explained_variance_ratio)
            .collect();
        assert!(r[0] >= r[1]);
        assert!(fit.total_explained() <= 1.0 + 1e-12);
        assert_relative_eq!(fit.total_explained(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sign_convention_is_deterministic() {
        let a = fit(&line_data(), 2).unwrap();
        let b = fit(&(-line_data()), 2).unwrap();
        for (ca, cb) in a.components.iter().zip(&b.components) {
            let max_a = ca.loadings.iter().cloned().fold(f64::MIN, f64::max);
            assert!(max_a > 0.0);
            assert_relative_eq!(ca.explained_variance, cb.explained_variance, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_projection_is_centered() {
        let fit = fit(&line_data(), 2).unwrap();
        for k in 0..2 {
            assert_relative_eq!(fit.projection.column(k).sum(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_single_row_is_insufficient() {
        let data = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        assert!(matches!(
            fit(&data, 1).unwrap_err(),
            Error::InsufficientSamples(_)
        ));
    }

    #[test]
    fn test_rank_limit() {
        // Three identical rows: zero variance everywhere.
        let data = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        assert!(matches!(
            fit(&data, 1).unwrap_err(),
            Error::InsufficientSamples(_)
        ));
        assert!(matches!(
            fit(&line_data(), 3).unwrap_err(),
            Error::InsufficientSamples(_)
        ));
    }

    #[test]
    fn test_zero_components_rejected() {
        assert!(matches!(
            fit(&line_data(), 0).unwrap_err(),
            Error::InvalidParameter(_)
        ));
    }
}
