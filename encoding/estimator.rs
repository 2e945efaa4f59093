use crate::cv::contiguous_ranges;
use crate::error::EncodingError;
use ndarray::{Array2, ArrayView2, s};
use rayon::prelude::*;
use std::ops::Range;

/// Anything that can be trained on `(X, y)` and produce a predictor.
///
/// `fit` takes `&self`, so one configuration value can be shared by every
/// fold without any state leaking between them.
pub trait Estimator: Sync {
    type Model: FittedModel + Send;

    fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
    ) -> Result<Self::Model, EncodingError>;
}

pub trait FittedModel {
    /// Predicts one column per target for every row of `x`.
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, EncodingError>;
}

/// Fits an independent inner estimator on each contiguous block of target
/// columns and stitches the predictions back together in column order.
#[derive(Debug, Clone)]
pub struct Blockwise<E> {
    inner: E,
    n_blocks: usize,
    parallel: bool,
}

impl<E: Estimator> Blockwise<E> {
    pub fn new(inner: E, n_blocks: usize) -> Result<Self, EncodingError> {
        if n_blocks == 0 {
            return Err(EncodingError::InvalidConfig(
                "the number of target blocks must be positive".to_string(),
            ));
        }
        Ok(Self {
            inner,
            n_blocks,
            parallel: true,
        })
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[derive(Debug, Clone)]
pub struct BlockwiseModel<M> {
    blocks: Vec<(Range<usize>, M)>,
    n_targets: usize,
}

impl<M> BlockwiseModel<M> {
    /// The fitted models together with the target columns each one covers.
    pub fn blocks(&self) -> &[(Range<usize>, M)] {
        &self.blocks
    }
}

impl<E: Estimator> Estimator for Blockwise<E> {
    type Model = BlockwiseModel<E::Model>;

    fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
    ) -> Result<Self::Model, EncodingError> {
        let n_targets = y.ncols();
        let ranges = contiguous_ranges(n_targets, self.n_blocks.min(n_targets.max(1)));
        let fit_block = |range: &Range<usize>| {
            self.inner
                .fit(x, y.slice(s![.., range.clone()]))
                .map(|model| (range.clone(), model))
        };
        let blocks = if self.parallel {
            ranges
                .par_iter()
                .map(fit_block)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            ranges.iter().map(fit_block).collect::<Result<Vec<_>, _>>()?
        };
        log::debug!("Fitted {} target blocks over {n_targets} targets", blocks.len());
        Ok(BlockwiseModel { blocks, n_targets })
    }
}

impl<M: FittedModel> FittedModel for BlockwiseModel<M> {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, EncodingError> {
        let mut predictions = Array2::zeros((x.nrows(), self.n_targets));
        for (range, model) in &self.blocks {
            let block = model.predict(x)?;
            if block.ncols() != range.len() {
                return Err(EncodingError::ShapeMismatch(format!(
                    "block model for targets {range:?} predicted {} columns",
                    block.ncols()
                )));
            }
            predictions.slice_mut(s![.., range.clone()]).assign(&block);
        }
        Ok(predictions)
    }
}
