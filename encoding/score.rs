//! Per-target scoring functions. Every scorer compares two `(samples, targets)`
//! matrices column by column and returns one value per target.

use crate::error::EncodingError;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

/// Selects the scorer used for held-out predictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    /// Pearson product-moment correlation per target.
    #[default]
    Correlation,
    /// Coefficient of determination per target.
    R2,
    /// Mean squared error per target.
    MeanSquaredError,
}

impl Scoring {
    pub fn score(
        &self,
        truth: ArrayView2<'_, f64>,
        predicted: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, EncodingError> {
        if truth.dim() != predicted.dim() {
            return Err(EncodingError::ShapeMismatch(format!(
                "cannot score predictions of shape {:?} against targets of shape {:?}",
                predicted.dim(),
                truth.dim()
            )));
        }
        Ok(match self {
            Scoring::Correlation => product_moment_correlation(truth, predicted),
            Scoring::R2 => r2_score(truth, predicted),
            Scoring::MeanSquaredError => mean_squared_error(truth, predicted),
        })
    }
}

/// Column-wise Pearson correlation.
///
/// Both inputs are standardised per column (zero mean, unit sample variance)
/// and the score is `sum(x * y) / (n - 1)`. Columns where either side has zero
/// variance, or with fewer than two samples, score `0.0`.
pub fn product_moment_correlation(
    truth: ArrayView2<'_, f64>,
    predicted: ArrayView2<'_, f64>,
) -> Array1<f64> {
    let n = truth.nrows();
    Zip::from(truth.columns())
        .and(predicted.columns())
        .map_collect(|t, p| {
            if n < 2 {
                return 0.0;
            }
            match (standardize(t), standardize(p)) {
                (Some(zt), Some(zp)) => zt.dot(&zp) / (n - 1) as f64,
                _ => 0.0,
            }
        })
}

/// Column-wise coefficient of determination. A constant target scores `1.0`
/// when predicted exactly and `0.0` otherwise.
pub fn r2_score(truth: ArrayView2<'_, f64>, predicted: ArrayView2<'_, f64>) -> Array1<f64> {
    Zip::from(truth.columns())
        .and(predicted.columns())
        .map_collect(|t, p| {
            let mean = t.mean().unwrap_or(0.0);
            let ss_res: f64 = t.iter().zip(p).map(|(a, b)| (a - b).powi(2)).sum();
            let ss_tot: f64 = t.iter().map(|a| (a - mean).powi(2)).sum();
            if ss_tot > 0.0 {
                1.0 - ss_res / ss_tot
            } else if ss_res == 0.0 {
                1.0
            } else {
                0.0
            }
        })
}

pub fn mean_squared_error(
    truth: ArrayView2<'_, f64>,
    predicted: ArrayView2<'_, f64>,
) -> Array1<f64> {
    let n = truth.nrows().max(1) as f64;
    Zip::from(truth.columns())
        .and(predicted.columns())
        .map_collect(|t, p| t.iter().zip(p).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / n)
}

fn standardize(column: ArrayView1<'_, f64>) -> Option<Array1<f64>> {
    let n = column.len() as f64;
    let mean = column.sum() / n;
    let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    (std > 0.0 && std.is_finite()).then(|| column.mapv(|v| (v - mean) / std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    #[test]
    fn correlation_matches_textbook_pearson() {
        let truth = array![[1.0, 2.0], [2.0, 1.0], [3.0, 4.0], [4.0, 3.0]];
        let predicted = array![[2.0, 1.0], [4.0, 2.0], [6.0, 3.0], [8.0, 4.0]];
        let scores = product_moment_correlation(truth.view(), predicted.view());
        assert_eq!(scores.len(), 2);
        assert_relative_eq!(scores[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(scores[1], 0.6, epsilon = 1e-12);
    }

    #[test]
    fn correlation_of_constant_column_is_zero() {
        let truth = array![[1.0], [1.0], [1.0]];
        let predicted = array![[0.5], [1.5], [2.0]];
        let scores = product_moment_correlation(truth.view(), predicted.view());
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn r2_is_one_for_perfect_prediction() {
        let truth = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let scores = r2_score(truth.view(), truth.view());
        assert_eq!(scores, array![1.0, 1.0]);
    }

    #[test]
    fn mse_per_column() {
        let truth = Array2::zeros((2, 2));
        let predicted = array![[1.0, 2.0], [3.0, 0.0]];
        let scores = mean_squared_error(truth.view(), predicted.view());
        assert_eq!(scores, array![5.0, 2.0]);
    }

    #[test]
    fn scoring_rejects_mismatched_shapes() {
        let truth = Array2::<f64>::zeros((3, 2));
        let predicted = Array2::<f64>::zeros((3, 1));
        assert!(matches!(
            Scoring::Correlation.score(truth.view(), predicted.view()),
            Err(EncodingError::ShapeMismatch(_))
        ));
    }
}
