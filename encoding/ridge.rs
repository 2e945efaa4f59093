//! # Ridge Regression With Per-Target Regularisation
//!
//! All targets share one design matrix, so a single eigendecomposition of the
//! (centred) Gram matrix serves every target and every candidate alpha. The
//! decomposition is taken in the primal (`XᵀX`, features × features) when
//! there are at least as many samples as features, and in the dual (`XXᵀ`,
//! samples × samples) otherwise.
//!
//! For eigenpairs `(λ_k, v_k)` of `XᵀX` the ridge solution of target `j` is
//! `β_j = Σ_k v_k (v_kᵀ Xᵀ y_j) / (λ_k + α_j)`, which makes a separate alpha
//! per target a column-wise rescaling of one shared projection.

use crate::cv::KFold;
use crate::error::EncodingError;
use crate::estimator::{Estimator, FittedModel};
use crate::score::mean_squared_error;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{Eigh, UPLO};

pub const DEFAULT_ALPHA: f64 = 1000.0;
pub const DEFAULT_INNER_SPLITS: usize = 7;

/// Smallest admissible `1 - h_ii` in the leave-one-out residual.
const LEVERAGE_FLOOR: f64 = 1e-10;
/// Without a penalty, `λ_min` at or below this fraction of `λ_max` is
/// treated as singular.
const SINGULAR_RTOL: f64 = 1e-12;

/// A fitted multi-target ridge model.
#[derive(Debug, Clone, PartialEq)]
pub struct RidgeModel {
    /// Shape: [n_features, n_targets].
    coef: Array2<f64>,
    intercept: Array1<f64>,
    /// The regularisation strength used for each target.
    alphas: Array1<f64>,
}

impl RidgeModel {
    pub fn coefficients(&self) -> ArrayView2<'_, f64> {
        self.coef.view()
    }

    pub fn intercept(&self) -> ArrayView1<'_, f64> {
        self.intercept.view()
    }

    pub fn alphas(&self) -> ArrayView1<'_, f64> {
        self.alphas.view()
    }
}

impl FittedModel for RidgeModel {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, EncodingError> {
        if x.ncols() != self.coef.nrows() {
            return Err(EncodingError::ShapeMismatch(format!(
                "model was fitted on {} features but got {}",
                self.coef.nrows(),
                x.ncols()
            )));
        }
        let mut predictions = x.dot(&self.coef);
        predictions += &self.intercept;
        Ok(predictions)
    }
}

/// Ridge regression with one alpha shared by all targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Ridge {
    alpha: f64,
    fit_intercept: bool,
}

impl Ridge {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            fit_intercept: true,
        }
    }

    pub fn with_intercept(mut self, fit_intercept: bool) -> Self {
        self.fit_intercept = fit_intercept;
        self
    }
}

impl Estimator for Ridge {
    type Model = RidgeModel;

    fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
    ) -> Result<RidgeModel, EncodingError> {
        let alphas = Array1::from_elem(y.ncols(), self.alpha);
        fit_ridge(x, y, alphas.view(), self.fit_intercept)
    }
}

/// Fits ridge regression with a separate regularisation strength per target.
///
/// Any strictly positive alpha makes the system positive definite, so
/// rank-deficient designs fit at every positive penalty regardless of their
/// scale. An alpha of zero fails with [`EncodingError::NumericalFailure`] when
/// the smallest eigenvalue of the Gram matrix is at or below `1e-12` times the
/// largest.
pub fn fit_ridge(
    x: ArrayView2<'_, f64>,
    y: ArrayView2<'_, f64>,
    alphas: ArrayView1<'_, f64>,
    fit_intercept: bool,
) -> Result<RidgeModel, EncodingError> {
    if alphas.len() != y.ncols() {
        return Err(EncodingError::ShapeMismatch(format!(
            "{} alphas given for {} targets",
            alphas.len(),
            y.ncols()
        )));
    }
    validate_alphas(alphas.iter())?;

    let centred = Centred::new(x, y, fit_intercept)?;
    let spectrum = Spectrum::decompose(centred.x.view())?;
    let projection = spectrum.project(centred.x.view(), centred.y.view());
    let scaled = spectrum.scale(projection.view(), alphas)?;
    let coef = spectrum.coefficients(centred.x.view(), scaled.view());
    if coef.iter().any(|c| !c.is_finite()) {
        return Err(EncodingError::NumericalFailure(
            "ridge coefficients are not finite".to_string(),
        ));
    }
    let intercept = &centred.y_mean - &centred.x_mean.dot(&coef);

    Ok(RidgeModel {
        coef,
        intercept,
        alphas: alphas.to_owned(),
    })
}

/// Strategy for the inner hyperparameter search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerCv {
    /// Contiguous K-fold over the training rows.
    KFold(usize),
    /// Closed-form leave-one-out residuals from the hat-matrix diagonal.
    LeaveOneOut,
}

impl Default for InnerCv {
    fn default() -> Self {
        InnerCv::KFold(DEFAULT_INNER_SPLITS)
    }
}

/// Ridge regression whose alpha is chosen per target by an inner
/// cross-validated search over a candidate grid, followed by one refit on all
/// training rows with the selected alphas.
#[derive(Debug, Clone, PartialEq)]
pub struct RidgeGridSearch {
    alphas: Vec<f64>,
    inner_cv: InnerCv,
    fit_intercept: bool,
}

impl Default for RidgeGridSearch {
    fn default() -> Self {
        Self {
            alphas: vec![DEFAULT_ALPHA],
            inner_cv: InnerCv::default(),
            fit_intercept: true,
        }
    }
}

impl RidgeGridSearch {
    pub fn new(alphas: Vec<f64>) -> Result<Self, EncodingError> {
        if alphas.is_empty() {
            return Err(EncodingError::InvalidConfig(
                "the alpha grid must not be empty".to_string(),
            ));
        }
        validate_alphas(alphas.iter())?;
        Ok(Self {
            alphas,
            ..Self::default()
        })
    }

    pub fn with_inner_cv(mut self, inner_cv: InnerCv) -> Self {
        self.inner_cv = inner_cv;
        self
    }

    pub fn with_intercept(mut self, fit_intercept: bool) -> Self {
        self.fit_intercept = fit_intercept;
        self
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Mean held-out squared error of every candidate alpha.
    ///
    /// Shape: [n_alphas, n_targets].
    pub fn inner_errors(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, EncodingError> {
        if x.nrows() != y.nrows() {
            return Err(EncodingError::ShapeMismatch(format!(
                "X has {} rows but y has {}",
                x.nrows(),
                y.nrows()
            )));
        }
        match self.inner_cv {
            InnerCv::KFold(n_splits) => self.kfold_errors(x, y, n_splits),
            InnerCv::LeaveOneOut => self.leave_one_out_errors(x, y),
        }
    }

    /// Picks, for each target, the alpha with the lowest inner error. Ties go
    /// to the earlier candidate.
    pub fn select_alphas(&self, errors: ArrayView2<'_, f64>) -> Array1<f64> {
        errors
            .columns()
            .into_iter()
            .map(|column| {
                let best = column
                    .iter()
                    .position_min_by(|a, b| a.total_cmp(b))
                    .unwrap_or(0);
                self.alphas[best]
            })
            .collect()
    }

    fn kfold_errors(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
        n_splits: usize,
    ) -> Result<Array2<f64>, EncodingError> {
        let folds = KFold::new(n_splits)?.split(x.nrows())?;
        let weight = 1.0 / folds.len() as f64;
        let mut errors = Array2::zeros((self.alphas.len(), y.ncols()));

        for fold in &folds {
            let x_train = x.select(Axis(0), &fold.train);
            let y_train = y.select(Axis(0), &fold.train);
            let x_test = x.select(Axis(0), &fold.test);
            let y_test = y.select(Axis(0), &fold.test);

            let centred = Centred::new(x_train.view(), y_train.view(), self.fit_intercept)?;
            let spectrum = Spectrum::decompose(centred.x.view())?;
            let projection = spectrum.project(centred.x.view(), centred.y.view());
            let x_test = x_test - &centred.x_mean;
            let transformed = spectrum.transform(centred.x.view(), x_test.view());

            for (row, &alpha) in self.alphas.iter().enumerate() {
                let alphas = Array1::from_elem(y.ncols(), alpha);
                let scaled = spectrum.scale(projection.view(), alphas.view())?;
                let predicted = transformed.dot(&scaled) + &centred.y_mean;
                let mse = mean_squared_error(y_test.view(), predicted.view());
                errors.row_mut(row).scaled_add(weight, &mse);
            }
        }
        Ok(errors)
    }

    fn leave_one_out_errors(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, EncodingError> {
        let n = x.nrows();
        if n < 2 {
            return Err(EncodingError::InvalidConfig(format!(
                "leave-one-out search needs at least 2 samples, got {n}"
            )));
        }
        let centred = Centred::new(x, y, self.fit_intercept)?;
        let spectrum = Spectrum::decompose(centred.x.view())?;
        let projection = spectrum.project(centred.x.view(), centred.y.view());
        let transformed = spectrum.transform(centred.x.view(), centred.x.view());
        let mean_leverage = if self.fit_intercept { 1.0 / n as f64 } else { 0.0 };

        let mut errors = Array2::zeros((self.alphas.len(), y.ncols()));
        for (row, &alpha) in self.alphas.iter().enumerate() {
            let alphas = Array1::from_elem(y.ncols(), alpha);
            let scaled = spectrum.scale(projection.view(), alphas.view())?;
            let fitted = transformed.dot(&scaled);
            let leverage = spectrum.leverage(transformed.view(), alpha) + mean_leverage;
            if let Some(h) = leverage.iter().find(|&&h| 1.0 - h <= LEVERAGE_FLOOR) {
                return Err(EncodingError::NumericalFailure(format!(
                    "leave-one-out leverage {h} leaves no residual degrees of freedom at alpha {alpha}"
                )));
            }
            let mut residuals = &centred.y - &fitted;
            for (mut residual_row, h) in residuals.outer_iter_mut().zip(leverage.iter()) {
                residual_row /= 1.0 - h;
            }
            let mse = residuals.mapv(|r| r * r).mean_axis(Axis(0)).ok_or_else(|| {
                EncodingError::ShapeMismatch("no rows left for leave-one-out".to_string())
            })?;
            errors.row_mut(row).assign(&mse);
        }
        Ok(errors)
    }
}

impl Estimator for RidgeGridSearch {
    type Model = RidgeModel;

    fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
    ) -> Result<RidgeModel, EncodingError> {
        let best = if self.alphas.len() == 1 {
            Array1::from_elem(y.ncols(), self.alphas[0])
        } else {
            let errors = self.inner_errors(x, y)?;
            self.select_alphas(errors.view())
        };
        log::debug!(
            "Selected alphas for {} targets (grid of {})",
            best.len(),
            self.alphas.len()
        );
        fit_ridge(x, y, best.view(), self.fit_intercept)
    }
}

fn validate_alphas<'a>(alphas: impl Iterator<Item = &'a f64>) -> Result<(), EncodingError> {
    for &alpha in alphas {
        if !(alpha.is_finite() && alpha >= 0.0) {
            return Err(EncodingError::InvalidConfig(format!(
                "ridge alpha must be finite and non-negative, got {alpha}"
            )));
        }
    }
    Ok(())
}

/// Design and targets with their column means removed.
struct Centred {
    x: Array2<f64>,
    y: Array2<f64>,
    x_mean: Array1<f64>,
    y_mean: Array1<f64>,
}

impl Centred {
    fn new(
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
        fit_intercept: bool,
    ) -> Result<Self, EncodingError> {
        if x.nrows() != y.nrows() {
            return Err(EncodingError::ShapeMismatch(format!(
                "X has {} rows but y has {}",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() == 0 {
            return Err(EncodingError::ShapeMismatch(
                "cannot fit ridge regression on zero samples".to_string(),
            ));
        }
        if !fit_intercept {
            return Ok(Self {
                x: x.to_owned(),
                y: y.to_owned(),
                x_mean: Array1::zeros(x.ncols()),
                y_mean: Array1::zeros(y.ncols()),
            });
        }
        let x_mean = column_means(x);
        let y_mean = column_means(y);
        Ok(Self {
            x: &x - &x_mean,
            y: &y - &y_mean,
            x_mean,
            y_mean,
        })
    }
}

fn column_means(values: ArrayView2<'_, f64>) -> Array1<f64> {
    values.sum_axis(Axis(0)) / values.nrows() as f64
}

enum Basis {
    /// Eigenvectors of `XᵀX`, shape [n_features, n_features].
    Primal(Array2<f64>),
    /// Eigenvectors of `XXᵀ`, shape [n_samples, n_samples].
    Dual(Array2<f64>),
}

struct Spectrum {
    eigenvalues: Array1<f64>,
    basis: Basis,
}

impl Spectrum {
    fn decompose(xc: ArrayView2<'_, f64>) -> Result<Self, EncodingError> {
        let (n, p) = xc.dim();
        let (mut eigenvalues, basis) = if p <= n {
            let (values, vectors) = xc.t().dot(&xc).eigh(UPLO::Lower)?;
            (values, Basis::Primal(vectors))
        } else {
            let (values, vectors) = xc.dot(&xc.t()).eigh(UPLO::Lower)?;
            (values, Basis::Dual(vectors))
        };
        // Round-off can push eigenvalues of a PSD matrix slightly negative.
        eigenvalues.mapv_inplace(|v| v.max(0.0));
        Ok(Self { eigenvalues, basis })
    }

    fn project(&self, xc: ArrayView2<'_, f64>, yc: ArrayView2<'_, f64>) -> Array2<f64> {
        match &self.basis {
            Basis::Primal(v) => v.t().dot(&xc.t().dot(&yc)),
            Basis::Dual(u) => u.t().dot(&yc),
        }
    }

    /// Maps centred rows into the eigenbasis so that predictions become
    /// `transformed · scaled`.
    fn transform(&self, xc: ArrayView2<'_, f64>, rows: ArrayView2<'_, f64>) -> Array2<f64> {
        match &self.basis {
            Basis::Primal(v) => rows.dot(v),
            Basis::Dual(u) => rows.dot(&xc.t()).dot(u),
        }
    }

    /// Divides row `k` of column `j` by `λ_k + α_j`.
    fn scale(
        &self,
        projection: ArrayView2<'_, f64>,
        alphas: ArrayView1<'_, f64>,
    ) -> Result<Array2<f64>, EncodingError> {
        let largest = self.eigenvalues.iter().copied().fold(0.0, f64::max);
        let tolerance = largest * SINGULAR_RTOL;
        let smallest = self.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        if let Some(&alpha) = alphas.iter().find(|&&a| a == 0.0 && smallest <= tolerance) {
            return Err(EncodingError::NumericalFailure(format!(
                "ridge system is singular at alpha {alpha} (smallest eigenvalue {smallest:e})"
            )));
        }

        let mut scaled = projection.to_owned();
        Zip::from(scaled.rows_mut())
            .and(&self.eigenvalues)
            .for_each(|mut row, &lambda| {
                Zip::from(&mut row)
                    .and(&alphas)
                    .for_each(|value, &alpha| *value /= lambda + alpha);
            });
        Ok(scaled)
    }

    fn coefficients(&self, xc: ArrayView2<'_, f64>, scaled: ArrayView2<'_, f64>) -> Array2<f64> {
        match &self.basis {
            Basis::Primal(v) => v.dot(&scaled),
            Basis::Dual(u) => xc.t().dot(&u.dot(&scaled)),
        }
    }

    /// Diagonal of the hat matrix of the centred problem at `alpha`.
    fn leverage(&self, transformed: ArrayView2<'_, f64>, alpha: f64) -> Array1<f64> {
        match &self.basis {
            Basis::Primal(_) => {
                let weights = self.eigenvalues.mapv(|lambda| 1.0 / (lambda + alpha));
                transformed.mapv(|t| t * t).dot(&weights)
            }
            Basis::Dual(u) => {
                let weights = self.eigenvalues.mapv(|lambda| lambda / (lambda + alpha));
                u.mapv(|t| t * t).dot(&weights)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_linalg::Solve;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| rng.sample(StandardNormal))
    }

    fn closed_form(x: &Array2<f64>, y: &Array1<f64>, alpha: f64) -> Array1<f64> {
        let gram = x.t().dot(x) + Array2::<f64>::eye(x.ncols()) * alpha;
        gram.solve(&x.t().dot(y)).unwrap()
    }

    #[test]
    fn per_target_alphas_match_closed_form_primal() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = random_matrix(&mut rng, 40, 4);
        let y = random_matrix(&mut rng, 40, 3);
        let alphas = array![0.1, 10.0, 1000.0];

        let model = fit_ridge(x.view(), y.view(), alphas.view(), false).unwrap();
        for (j, &alpha) in alphas.iter().enumerate() {
            let expected = closed_form(&x, &y.column(j).to_owned(), alpha);
            assert_abs_diff_eq!(model.coefficients().column(j), expected.view(), epsilon = 1e-9);
        }
        assert_eq!(model.alphas(), alphas.view());
    }

    #[test]
    fn dual_solution_matches_primal() {
        let mut rng = StdRng::seed_from_u64(5);
        let x = random_matrix(&mut rng, 6, 15);
        let y = random_matrix(&mut rng, 6, 2);
        let model = fit_ridge(x.view(), y.view(), array![1.0, 3.0].view(), false).unwrap();
        for (j, &alpha) in [1.0, 3.0].iter().enumerate() {
            let expected = closed_form(&x, &y.column(j).to_owned(), alpha);
            assert_abs_diff_eq!(model.coefficients().column(j), expected.view(), epsilon = 1e-9);
        }
    }

    #[test]
    fn intercept_recovers_offsets() {
        let x = Array2::from_shape_fn((20, 1), |(i, _)| i as f64);
        let y = x.mapv(|v| 3.0 * v + 7.0);
        let model = Ridge::new(0.0).fit(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(model.coefficients()[[0, 0]], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.intercept()[0], 7.0, epsilon = 1e-8);
        let predicted = model.predict(array![[100.0]].view()).unwrap();
        assert_abs_diff_eq!(predicted[[0, 0]], 307.0, epsilon = 1e-7);
    }

    #[test]
    fn singular_system_without_penalty_is_reported() {
        let x = Array2::from_shape_fn((10, 2), |(i, _)| i as f64);
        let y = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let result = Ridge::new(0.0).fit(x.view(), y.view());
        assert!(matches!(result, Err(EncodingError::NumericalFailure(_))));
    }

    #[test]
    fn small_penalty_fits_large_scale_duplicate_columns() {
        let column = Array1::from_shape_fn(40, |i| 1e6 * (i as f64 * 0.7).sin());
        let mut x = Array2::zeros((40, 3));
        x.column_mut(0).assign(&column);
        x.column_mut(1).assign(&column);
        x.column_mut(2).assign(&(&column * 2.0));
        let y = (&column * 3.0 + 5.0).insert_axis(Axis(1));

        let model = fit_ridge(x.view(), y.view(), array![1e-3].view(), true).unwrap();
        assert!(model.coefficients().iter().all(|c| c.is_finite()));
        let predicted = model.predict(x.view()).unwrap();
        let worst = (&predicted - &y).mapv(f64::abs).fold(0.0, |a: f64, &b| a.max(b));
        assert!(worst < 1e-3, "largest residual {worst}");

        assert!(matches!(
            fit_ridge(x.view(), y.view(), array![0.0].view(), true),
            Err(EncodingError::NumericalFailure(_))
        ));
    }

    #[test]
    fn negative_alpha_is_rejected() {
        assert!(matches!(
            RidgeGridSearch::new(vec![1.0, -2.0]),
            Err(EncodingError::InvalidConfig(_))
        ));
        assert!(matches!(
            RidgeGridSearch::new(Vec::new()),
            Err(EncodingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn grid_search_selects_alpha_per_target() {
        let mut rng = StdRng::seed_from_u64(42);
        let x = random_matrix(&mut rng, 60, 20);
        let weights = random_matrix(&mut rng, 20, 1);
        let signal = x.dot(&weights);
        let noise = random_matrix(&mut rng, 60, 1);
        let mut y = Array2::zeros((60, 2));
        y.column_mut(0).assign(&(&signal.column(0) + &(&noise.column(0) * 0.01)));
        y.column_mut(1).assign(&(&noise.column(0) * 5.0));

        let search = RidgeGridSearch::new(vec![1e-3, 1e5]).unwrap();
        let errors = search.inner_errors(x.view(), y.view()).unwrap();
        assert_eq!(errors.dim(), (2, 2));
        let chosen = search.select_alphas(errors.view());
        assert_eq!(chosen, array![1e-3, 1e5]);

        let model = search.fit(x.view(), y.view()).unwrap();
        assert_eq!(model.alphas(), chosen.view());
    }

    #[test]
    fn leave_one_out_matches_explicit_refits() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = random_matrix(&mut rng, 12, 3);
        let y = random_matrix(&mut rng, 12, 2);
        let alpha = 2.5;
        let search = RidgeGridSearch::new(vec![alpha])
            .unwrap()
            .with_inner_cv(InnerCv::LeaveOneOut);
        let errors = search.inner_errors(x.view(), y.view()).unwrap();

        let mut expected = Array1::<f64>::zeros(2);
        for held_out in 0..12 {
            let train: Vec<usize> = (0..12).filter(|&i| i != held_out).collect();
            let model = Ridge::new(alpha)
                .fit(x.select(Axis(0), &train).view(), y.select(Axis(0), &train).view())
                .unwrap();
            let predicted = model
                .predict(x.select(Axis(0), &[held_out]).view())
                .unwrap();
            let residual = &y.row(held_out) - &predicted.row(0);
            expected += &residual.mapv(|r| r * r / 12.0);
        }
        assert_abs_diff_eq!(errors.row(0), expected.view(), epsilon = 1e-9);
    }

    #[test]
    fn predict_rejects_wrong_feature_count() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| (i + j * i) as f64);
        let y = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let model = Ridge::new(1.0).fit(x.view(), y.view()).unwrap();
        assert!(matches!(
            model.predict(Array2::zeros((3, 5)).view()),
            Err(EncodingError::ShapeMismatch(_))
        ));
    }
}
