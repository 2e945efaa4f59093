//! # Cross-Validated Fitting
//!
//! `fit_cv` partitions the aligned rows into contiguous K-fold splits, trains
//! one independent model per fold and scores its held-out predictions target
//! by target. Targets whose variance is zero are removed before fitting and
//! given a score of exactly zero, so score vectors always keep the original
//! number of target columns.

use crate::error::EncodingError;
use crate::estimator::{Estimator, FittedModel};
use crate::score::Scoring;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::ops::Range;

pub const DEFAULT_N_SPLITS: usize = 8;
const MIN_SPLITS: usize = 2;
const ADAPTIVE_MAX_SPLITS: usize = 8;
const ADAPTIVE_MIN_TEST_ROWS: usize = 10;

/// One train/test partition of row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Contiguous, unshuffled K-fold splitting. The first `n % k` test sets hold
/// one extra row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KFold {
    n_splits: usize,
}

impl KFold {
    pub fn new(n_splits: usize) -> Result<Self, EncodingError> {
        if n_splits < MIN_SPLITS {
            return Err(EncodingError::InvalidConfig(format!(
                "cross-validation needs at least {MIN_SPLITS} folds, got {n_splits}"
            )));
        }
        Ok(Self { n_splits })
    }

    /// The largest fold count up to 8 that leaves at least 10 rows in every
    /// test set, and never fewer than 2 folds.
    pub fn adaptive(n_samples: usize) -> Self {
        let n_splits = (n_samples / ADAPTIVE_MIN_TEST_ROWS).clamp(MIN_SPLITS, ADAPTIVE_MAX_SPLITS);
        Self { n_splits }
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    pub fn split(&self, n_samples: usize) -> Result<Vec<Fold>, EncodingError> {
        if self.n_splits > n_samples {
            return Err(EncodingError::InvalidConfig(format!(
                "cannot split {n_samples} samples into {} folds",
                self.n_splits
            )));
        }
        Ok(contiguous_ranges(n_samples, self.n_splits)
            .into_iter()
            .map(|test| Fold {
                train: (0..test.start).chain(test.end..n_samples).collect(),
                test: test.collect(),
            })
            .collect())
    }
}

/// Splits `0..n` into `parts` contiguous ranges whose lengths differ by at
/// most one, longer ranges first.
pub(crate) fn contiguous_ranges(n: usize, parts: usize) -> Vec<Range<usize>> {
    let base = n / parts;
    let extra = n % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// The target columns that take part in fitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelSelection {
    kept: Vec<usize>,
    n_targets: usize,
}

impl VoxelSelection {
    pub fn all(n_targets: usize) -> Self {
        Self {
            kept: (0..n_targets).collect(),
            n_targets,
        }
    }

    /// Keeps the columns of `y` whose variance is strictly positive.
    pub fn from_variance(y: ArrayView2<'_, f64>) -> Self {
        let kept = y
            .columns()
            .into_iter()
            .enumerate()
            .filter(|(_, column)| column.var(0.0) > 0.0)
            .map(|(index, _)| index)
            .collect();
        Self {
            kept,
            n_targets: y.ncols(),
        }
    }

    pub fn kept(&self) -> &[usize] {
        &self.kept
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    pub fn is_complete(&self) -> bool {
        self.kept.len() == self.n_targets
    }

    /// Places scores of the kept columns at their original positions; every
    /// excluded column scores zero.
    pub fn scatter(&self, kept_scores: &Array1<f64>) -> Array1<f64> {
        let mut scores = Array1::zeros(self.n_targets);
        for (&column, &score) in self.kept.iter().zip(kept_scores) {
            scores[column] = score;
        }
        scores
    }
}

/// A fitted model restricted to the selected targets.
///
/// Predictions cover every original target; excluded targets are predicted
/// as their constant training value. When no target was selected there is no
/// inner model and every prediction is the training value.
#[derive(Debug, Clone)]
pub struct MaskedModel<M> {
    model: Option<M>,
    selection: VoxelSelection,
    fill: Array1<f64>,
}

impl<M> MaskedModel<M> {
    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    pub fn selection(&self) -> &VoxelSelection {
        &self.selection
    }
}

impl<M: FittedModel> MaskedModel<M> {
    /// Predictions of the selected targets only, in selection order.
    fn predict_kept(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, EncodingError> {
        match &self.model {
            Some(model) => model.predict(x),
            None => Ok(Array2::zeros((x.nrows(), 0))),
        }
    }
}

impl<M: FittedModel> FittedModel for MaskedModel<M> {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, EncodingError> {
        let kept_predictions = self.predict_kept(x)?;
        if self.selection.is_complete() {
            return Ok(kept_predictions);
        }
        let mut predictions = Array2::from_shape_fn((x.nrows(), self.selection.n_targets), |(_, j)| {
            self.fill[j]
        });
        for (source, &column) in self.selection.kept.iter().enumerate() {
            predictions
                .column_mut(column)
                .assign(&kept_predictions.column(source));
        }
        Ok(predictions)
    }
}

/// Options for [`fit_cv`].
#[derive(Debug, Clone, PartialEq)]
pub struct CvOptions {
    /// Number of outer folds; `None` picks a count from the sample size.
    pub n_splits: Option<usize>,
    pub scoring: Scoring,
    /// Exclude zero-variance targets from fitting.
    pub voxel_selection: bool,
    /// Cross-validate; when false, fit once on all rows and score in-sample.
    pub validate: bool,
    /// Fit folds on the rayon thread pool.
    pub parallel: bool,
}

impl Default for CvOptions {
    fn default() -> Self {
        Self {
            n_splits: Some(DEFAULT_N_SPLITS),
            scoring: Scoring::default(),
            voxel_selection: true,
            validate: true,
            parallel: true,
        }
    }
}

/// Result of a cross-validated fit.
#[derive(Debug, Clone)]
pub struct CvResult<M> {
    /// One model per fold, in fold order.
    pub models: Vec<MaskedModel<M>>,
    pub folds: Vec<Fold>,
    /// Shape: [n_targets, n_folds].
    pub fold_scores: Array2<f64>,
    /// Scores of the out-of-fold predictions of all folds taken together.
    pub pooled_scores: Array1<f64>,
}

impl<M> CvResult<M> {
    /// Per-target mean of the fold scores.
    pub fn mean_scores(&self) -> Array1<f64> {
        self.fold_scores
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(self.fold_scores.nrows()))
    }
}

/// Result of a single fit on all rows.
#[derive(Debug, Clone)]
pub struct FullFit<M> {
    pub model: MaskedModel<M>,
    /// In-sample score per target.
    pub scores: Array1<f64>,
}

#[derive(Debug, Clone)]
pub enum FitOutcome<M> {
    CrossValidated(CvResult<M>),
    Full(FullFit<M>),
}

impl<M> FitOutcome<M> {
    pub fn cross_validated(self) -> Option<CvResult<M>> {
        match self {
            FitOutcome::CrossValidated(result) => Some(result),
            FitOutcome::Full(_) => None,
        }
    }

    pub fn full(self) -> Option<FullFit<M>> {
        match self {
            FitOutcome::Full(result) => Some(result),
            FitOutcome::CrossValidated(_) => None,
        }
    }
}

/// Trains `estimator` on aligned data and scores it per target.
///
/// With `validate` set, one model is trained per fold on the training rows
/// and scored on the held-out rows. Otherwise a single model is trained on
/// every row and scored in-sample.
pub fn fit_cv<E: Estimator>(
    x: ArrayView2<'_, f64>,
    y: ArrayView2<'_, f64>,
    estimator: &E,
    options: &CvOptions,
) -> Result<FitOutcome<E::Model>, EncodingError> {
    if x.nrows() != y.nrows() {
        return Err(EncodingError::ShapeMismatch(format!(
            "X has {} rows but y has {}",
            x.nrows(),
            y.nrows()
        )));
    }
    let folds = if options.validate {
        let kfold = match options.n_splits {
            Some(n_splits) => KFold::new(n_splits)?,
            None => KFold::adaptive(x.nrows()),
        };
        kfold.split(x.nrows())?
    } else {
        Vec::new()
    };

    let selection = if options.voxel_selection {
        VoxelSelection::from_variance(y)
    } else {
        VoxelSelection::all(y.ncols())
    };
    if selection.kept().is_empty() && y.ncols() > 0 {
        log::warn!("No target column varies; every target scores zero");
    }
    log::info!(
        "Fitting {} of {} targets on {} samples x {} features",
        selection.kept().len(),
        selection.n_targets(),
        x.nrows(),
        x.ncols()
    );
    let y_kept = y.select(Axis(1), selection.kept());

    if !options.validate {
        let model = fit_masked(estimator, x, y, y_kept.view(), &selection)?;
        let predictions = model.predict_kept(x)?;
        let scores = selection.scatter(&options.scoring.score(y_kept.view(), predictions.view())?);
        return Ok(FitOutcome::Full(FullFit { model, scores }));
    }

    let run_fold = |(index, fold): (usize, &Fold)| -> Result<FoldFit<E::Model>, EncodingError> {
        let x_train = x.select(Axis(0), &fold.train);
        let y_train = y.select(Axis(0), &fold.train);
        let y_train_kept = y_kept.select(Axis(0), &fold.train);
        let model = fit_masked(
            estimator,
            x_train.view(),
            y_train.view(),
            y_train_kept.view(),
            &selection,
        )?;
        let x_test = x.select(Axis(0), &fold.test);
        let predictions = model.predict_kept(x_test.view())?;
        let truth = y_kept.select(Axis(0), &fold.test);
        let scores = options.scoring.score(truth.view(), predictions.view())?;
        log::debug!(
            "fold {index}: trained on {} rows, tested on {}",
            fold.train.len(),
            fold.test.len()
        );
        Ok(FoldFit {
            model,
            predictions,
            scores,
        })
    };
    let fitted: Vec<FoldFit<E::Model>> = if options.parallel {
        folds
            .par_iter()
            .enumerate()
            .map(run_fold)
            .collect::<Result<_, _>>()?
    } else {
        folds
            .iter()
            .enumerate()
            .map(run_fold)
            .collect::<Result<_, _>>()?
    };

    let mut fold_scores = Array2::zeros((selection.n_targets(), folds.len()));
    let mut pooled = Array2::zeros(y_kept.dim());
    for (column, (fold, fit)) in folds.iter().zip(&fitted).enumerate() {
        fold_scores
            .column_mut(column)
            .assign(&selection.scatter(&fit.scores));
        for (&row, prediction) in fold.test.iter().zip(fit.predictions.outer_iter()) {
            pooled.row_mut(row).assign(&prediction);
        }
    }
    let pooled_scores = selection.scatter(&options.scoring.score(y_kept.view(), pooled.view())?);
    log::info!(
        "Cross-validated {} folds; mean pooled score {:.4}",
        folds.len(),
        pooled_scores.mean().unwrap_or(0.0)
    );

    Ok(FitOutcome::CrossValidated(CvResult {
        models: fitted.into_iter().map(|fit| fit.model).collect(),
        folds,
        fold_scores,
        pooled_scores,
    }))
}

struct FoldFit<M> {
    model: MaskedModel<M>,
    /// Held-out predictions of the kept targets.
    predictions: Array2<f64>,
    scores: Array1<f64>,
}

fn fit_masked<E: Estimator>(
    estimator: &E,
    x: ArrayView2<'_, f64>,
    y: ArrayView2<'_, f64>,
    y_kept: ArrayView2<'_, f64>,
    selection: &VoxelSelection,
) -> Result<MaskedModel<E::Model>, EncodingError> {
    let model = if selection.kept().is_empty() {
        None
    } else {
        Some(estimator.fit(x, y_kept)?)
    };
    let fill = y
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(y.ncols()));
    Ok(MaskedModel {
        model,
        selection: selection.clone(),
        fill,
    })
}
