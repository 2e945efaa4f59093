//! # Temporal Alignment and Lagged Feature Construction
//!
//! Converts per-run stimulus matrices (sampled every `stim_TR` seconds) and
//! response matrices (sampled every `TR` seconds) into one feature matrix `X`
//! whose rows line up one-to-one with the rows of the response matrix `y`.
//!
//! Each feature row holds `lag_TR` consecutive response periods of raw
//! stimulus history, oldest first. Within a period block the raw samples are
//! laid out sample-major: all features of the first sample, then all features
//! of the second, and so on. The same layout is used for every run.
//!
//! The per-run steps run in a fixed order (onset shift, length fix-up, block
//! reshape, lagging, missing-value removal, offset trim, response truncation);
//! row correspondence between `X` and `y` depends on that order.

use crate::error::{AlignmentWarning, EncodingError};
use ndarray::{Array2, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LAG_TIME: f64 = 6.0;
pub const DEFAULT_OFFSET_STIM: f64 = 2.0;

/// Relative tolerance used when checking that a time ratio is integral.
const RATIO_TOLERANCE: f64 = 1e-6;

/// How rows containing missing values are treated after lagging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NanPolicyRepr", into = "NanPolicyRepr")]
pub enum NanPolicy {
    /// Keep every row, missing values included.
    Keep,
    /// Drop every row that contains at least one missing value.
    #[default]
    DropAny,
    /// Drop rows whose fraction of missing values exceeds the threshold and
    /// zero-fill the missing values of the rows that survive.
    MaxFraction(f64),
}

impl NanPolicy {
    pub fn validate(&self) -> Result<(), EncodingError> {
        match *self {
            NanPolicy::MaxFraction(p) if !(0.0..=1.0).contains(&p) => {
                Err(EncodingError::InvalidConfig(format!(
                    "remove_nans fraction must lie in [0, 1], got {p}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Indices of rows that survive this policy.
    fn kept_rows(&self, lagged: ArrayView2<'_, f64>) -> Vec<usize> {
        let width = lagged.ncols().max(1) as f64;
        lagged
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| {
                let missing = row.iter().filter(|v| v.is_nan()).count();
                match *self {
                    NanPolicy::Keep => true,
                    NanPolicy::DropAny => missing == 0,
                    NanPolicy::MaxFraction(p) => missing as f64 / width <= p,
                }
            })
            .map(|(index, _)| index)
            .collect()
    }
}

/// Configuration-file form of [`NanPolicy`]: `true`, `false`, or a fraction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum NanPolicyRepr {
    Flag(bool),
    Fraction(f64),
}

impl TryFrom<NanPolicyRepr> for NanPolicy {
    type Error = String;

    fn try_from(repr: NanPolicyRepr) -> Result<Self, Self::Error> {
        let policy = match repr {
            NanPolicyRepr::Flag(true) => NanPolicy::DropAny,
            NanPolicyRepr::Flag(false) => NanPolicy::Keep,
            NanPolicyRepr::Fraction(p) => NanPolicy::MaxFraction(p),
        };
        policy.validate().map_err(|e| e.to_string())?;
        Ok(policy)
    }
}

impl From<NanPolicy> for NanPolicyRepr {
    fn from(policy: NanPolicy) -> Self {
        match policy {
            NanPolicy::Keep => NanPolicyRepr::Flag(false),
            NanPolicy::DropAny => NanPolicyRepr::Flag(true),
            NanPolicy::MaxFraction(p) => NanPolicyRepr::Fraction(p),
        }
    }
}

/// Parameters of one alignment pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignOptions {
    /// Response sampling period in seconds.
    pub tr: f64,
    /// Stimulus sampling period in seconds.
    pub stim_tr: f64,
    /// Seconds of stimulus history per feature row; must be a multiple of `tr`.
    pub lag_time: f64,
    /// Seconds of the most recent stimulus history removed from each row.
    pub offset_stim: f64,
    /// Per-run stimulus onset relative to the response recording, in seconds.
    pub start_times: Option<Vec<f64>>,
    /// Placeholder written into padding rows.
    pub filler_value: f64,
    pub remove_nans: NanPolicy,
}

impl AlignOptions {
    pub fn new(tr: f64, stim_tr: f64) -> Self {
        Self {
            tr,
            stim_tr,
            lag_time: DEFAULT_LAG_TIME,
            offset_stim: DEFAULT_OFFSET_STIM,
            start_times: None,
            filler_value: f64::NAN,
            remove_nans: NanPolicy::default(),
        }
    }
}

/// The integer geometry derived from an [`AlignOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagWindow {
    /// Response periods of history per row (`round(lag_time / TR)`).
    pub lag_trs: usize,
    /// Raw stimulus samples per response period (`round(TR / stim_TR)`).
    pub samples_per_tr: usize,
    /// Trailing columns removed from every lagged row.
    pub offset_columns: usize,
}

impl LagWindow {
    /// Resolves the window geometry, reporting a rounded sampling ratio as a
    /// warning rather than an error.
    pub fn resolve(
        options: &AlignOptions,
    ) -> Result<(Self, Option<AlignmentWarning>), EncodingError> {
        for (name, value) in [("TR", options.tr), ("stim_TR", options.stim_tr)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(EncodingError::InvalidConfig(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }
        if !(options.lag_time.is_finite() && options.lag_time > 0.0) {
            return Err(EncodingError::InvalidConfig(format!(
                "lag_time must be positive, got {}",
                options.lag_time
            )));
        }
        if !(options.offset_stim.is_finite() && options.offset_stim >= 0.0) {
            return Err(EncodingError::InvalidConfig(format!(
                "offset_stim must be non-negative, got {}",
                options.offset_stim
            )));
        }

        let lag_ratio = options.lag_time / options.tr;
        if !is_integral(lag_ratio) {
            return Err(EncodingError::InvalidConfig(format!(
                "lag_time ({}) must be a multiple of TR ({})",
                options.lag_time, options.tr
            )));
        }
        let lag_trs = lag_ratio.round() as usize;
        if lag_trs == 0 {
            return Err(EncodingError::InvalidConfig(format!(
                "lag_time ({}) is shorter than one TR ({})",
                options.lag_time, options.tr
            )));
        }

        let ratio = options.tr / options.stim_tr;
        let samples_per_tr = ratio.round() as usize;
        if samples_per_tr == 0 {
            return Err(EncodingError::InvalidConfig(format!(
                "stim_TR ({}) is longer than TR ({})",
                options.stim_tr, options.tr
            )));
        }
        let warning = (!is_integral(ratio)).then_some(AlignmentWarning::RoundedSamplingRatio {
            ratio,
            used: samples_per_tr,
        });

        let offset_columns = (options.offset_stim / options.stim_tr).round() as usize;

        Ok((
            Self {
                lag_trs,
                samples_per_tr,
                offset_columns,
            },
            warning,
        ))
    }

    /// Width of a lagged row before the offset trim.
    pub fn lagged_width(&self, n_features: usize) -> usize {
        self.lag_trs * self.samples_per_tr * n_features
    }
}

/// Output of [`align`].
#[derive(Debug, Clone)]
pub struct AlignedData {
    /// Lagged stimulus features, one row per retained response sample.
    pub x: Array2<f64>,
    /// Response rows matching `x` row for row.
    pub y: Array2<f64>,
    /// Rows contributed by each run, in run order.
    pub run_lengths: Vec<usize>,
    pub warnings: Vec<AlignmentWarning>,
}

impl AlignedData {
    pub fn into_parts(self) -> (Array2<f64>, Array2<f64>) {
        (self.x, self.y)
    }
}

/// Builds the lagged feature matrix and the matching response matrix for a
/// set of runs.
///
/// Runs are consumed; the result is the concatenation of the per-run
/// contributions in run order.
pub fn align(
    stimuli: Vec<Array2<f64>>,
    responses: Vec<Array2<f64>>,
    options: &AlignOptions,
) -> Result<AlignedData, EncodingError> {
    if stimuli.len() != responses.len() {
        return Err(EncodingError::ShapeMismatch(format!(
            "{} stimulus runs but {} response runs",
            stimuli.len(),
            responses.len()
        )));
    }
    let Some(first) = stimuli.first() else {
        return Err(EncodingError::InvalidConfig(
            "at least one run is required".to_string(),
        ));
    };
    let n_features = first.ncols();
    if let Some((run, stim)) = stimuli
        .iter()
        .enumerate()
        .find(|(_, stim)| stim.ncols() != n_features)
    {
        return Err(EncodingError::ShapeMismatch(format!(
            "stimulus run {run} has {} feature columns, expected {n_features}",
            stim.ncols()
        )));
    }
    if let Some((run, resp)) = responses
        .iter()
        .enumerate()
        .find(|(_, resp)| resp.ncols() != responses[0].ncols())
    {
        return Err(EncodingError::ShapeMismatch(format!(
            "response run {run} has {} target columns, expected {}",
            resp.ncols(),
            responses[0].ncols()
        )));
    }
    if let Some(starts) = &options.start_times {
        if starts.len() != stimuli.len() {
            return Err(EncodingError::ShapeMismatch(format!(
                "{} start times given for {} runs",
                starts.len(),
                stimuli.len()
            )));
        }
    }
    options.remove_nans.validate()?;

    let (window, ratio_warning) = LagWindow::resolve(options)?;
    if window.offset_columns >= window.lagged_width(n_features) {
        return Err(EncodingError::InvalidConfig(format!(
            "offset_stim removes {} columns but a lagged row only has {}",
            window.offset_columns,
            window.lagged_width(n_features)
        )));
    }

    let mut warnings = Vec::new();
    if let Some(warning) = ratio_warning {
        log::warn!("{warning}");
        warnings.push(warning);
    }

    let n_targets = responses[0].ncols();
    let mut xs = Vec::with_capacity(stimuli.len());
    let mut ys = Vec::with_capacity(stimuli.len());
    for (run, (stimulus, response)) in stimuli.into_iter().zip(responses).enumerate() {
        let start_time = options.start_times.as_ref().map(|starts| starts[run]);
        let (x, y) = align_run(
            run,
            stimulus,
            response,
            start_time,
            &window,
            options,
            &mut warnings,
        )?;
        log::debug!(
            "run {run}: {} aligned rows x {} lagged features",
            x.nrows(),
            x.ncols()
        );
        xs.push(x);
        ys.push(y);
    }

    let run_lengths: Vec<usize> = xs.iter().map(|x| x.nrows()).collect();
    let width = window.lagged_width(n_features) - window.offset_columns;
    let x = stack_rows(&xs, width)?;
    let y = stack_rows(&ys, n_targets)?;
    log::info!(
        "Aligned {} runs into {} rows ({} lagged features, {} targets)",
        run_lengths.len(),
        x.nrows(),
        x.ncols(),
        y.ncols()
    );

    Ok(AlignedData {
        x,
        y,
        run_lengths,
        warnings,
    })
}

fn align_run(
    run: usize,
    stimulus: Array2<f64>,
    response: Array2<f64>,
    start_time: Option<f64>,
    window: &LagWindow,
    options: &AlignOptions,
    warnings: &mut Vec<AlignmentWarning>,
) -> Result<(Array2<f64>, Array2<f64>), EncodingError> {
    let filler = options.filler_value;

    let stimulus = match start_time {
        Some(start) => {
            let (shifted, warning) = shift_onset(run, stimulus, start, options.stim_tr, filler);
            if let Some(warning) = warning {
                log::warn!("{warning}");
                warnings.push(warning);
            }
            shifted
        }
        None => stimulus,
    };

    let stimulus = fit_to_periods(
        stimulus,
        response.nrows() * window.samples_per_tr,
        window.samples_per_tr,
        filler,
    );
    let blocks = reshape_into_periods(stimulus, window.samples_per_tr)?;
    let lagged = lag_blocks(blocks.view(), window.lag_trs, filler);

    if response.nrows() < lagged.nrows() {
        return Err(EncodingError::ShapeMismatch(format!(
            "run {run}: stimulus spans {} TRs but the response only has {} rows",
            lagged.nrows(),
            response.nrows()
        )));
    }

    let kept = options.remove_nans.kept_rows(lagged.view());
    let mut x = lagged.select(Axis(0), &kept);
    if let NanPolicy::MaxFraction(_) = options.remove_nans {
        x.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
    }

    if window.offset_columns > 0 {
        let keep_width = x.ncols() - window.offset_columns;
        x = x.slice(s![.., ..keep_width]).to_owned();
    }

    let excess = response.nrows() - lagged.nrows();
    if excess > 0 {
        let warning = AlignmentWarning::TruncatedResponse {
            run,
            dropped: excess,
        };
        log::warn!("{warning}");
        warnings.push(warning);
    }
    let y = response.select(Axis(0), &kept);

    Ok((x, y))
}

/// Moves the stimulus onset to the start of the response recording: a
/// positive start time prepends filler samples, a negative one drops the
/// leading samples recorded before the response began.
fn shift_onset(
    run: usize,
    stimulus: Array2<f64>,
    start_time: f64,
    stim_tr: f64,
    filler: f64,
) -> (Array2<f64>, Option<AlignmentWarning>) {
    let exact = start_time / stim_tr;
    let samples = exact.round() as i64;
    let warning = (!is_integral(exact)).then_some(AlignmentWarning::RoundedStartTime {
        run,
        start_time,
        samples,
    });

    let shifted = if samples > 0 {
        let padding = Array2::from_elem((samples as usize, stimulus.ncols()), filler);
        stack_pair(padding.view(), stimulus.view())
    } else if samples < 0 {
        let skip = (samples.unsigned_abs() as usize).min(stimulus.nrows());
        stimulus.slice(s![skip.., ..]).to_owned()
    } else {
        stimulus
    };
    (shifted, warning)
}

/// Truncates the stimulus to `target_rows` when it runs long, otherwise pads
/// it with filler up to the next multiple of `samples_per_tr`.
fn fit_to_periods(
    stimulus: Array2<f64>,
    target_rows: usize,
    samples_per_tr: usize,
    filler: f64,
) -> Array2<f64> {
    if stimulus.nrows() > target_rows {
        return stimulus.slice(s![..target_rows, ..]).to_owned();
    }
    let remainder = stimulus.nrows() % samples_per_tr;
    if remainder == 0 {
        return stimulus;
    }
    let padding = Array2::from_elem((samples_per_tr - remainder, stimulus.ncols()), filler);
    stack_pair(stimulus.view(), padding.view())
}

/// Reshapes `(periods * samples_per_tr, features)` into
/// `(periods, samples_per_tr * features)`, sample-major within each row.
fn reshape_into_periods(
    stimulus: Array2<f64>,
    samples_per_tr: usize,
) -> Result<Array2<f64>, EncodingError> {
    let periods = stimulus.nrows() / samples_per_tr;
    let width = samples_per_tr * stimulus.ncols();
    let values: Vec<f64> = stimulus.iter().copied().collect();
    Array2::from_shape_vec((periods, width), values).map_err(|e| {
        EncodingError::ShapeMismatch(format!("stimulus cannot be split into TR blocks: {e}"))
    })
}

/// Concatenates `lag_trs` consecutive period blocks (oldest first) into each
/// output row. `lag_trs - 1` filler blocks precede the first period so the
/// output keeps one row per period.
fn lag_blocks(blocks: ArrayView2<'_, f64>, lag_trs: usize, filler: f64) -> Array2<f64> {
    let (periods, block_width) = blocks.dim();
    let leading = Array2::from_elem((lag_trs - 1, block_width), filler);
    let padded = stack_pair(leading.view(), blocks);

    let mut lagged = Array2::from_elem((periods, lag_trs * block_width), filler);
    for (t, mut row) in lagged.outer_iter_mut().enumerate() {
        let history = padded.slice(s![t..t + lag_trs, ..]);
        row.iter_mut()
            .zip(history.iter())
            .for_each(|(dst, &src)| *dst = src);
    }
    lagged
}

fn stack_pair(top: ArrayView2<'_, f64>, bottom: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut stacked = Array2::zeros((top.nrows() + bottom.nrows(), top.ncols()));
    stacked.slice_mut(s![..top.nrows(), ..]).assign(&top);
    stacked.slice_mut(s![top.nrows().., ..]).assign(&bottom);
    stacked
}

fn stack_rows(parts: &[Array2<f64>], width: usize) -> Result<Array2<f64>, EncodingError> {
    let views: Vec<ArrayView2<'_, f64>> = parts.iter().map(|p| p.view()).collect();
    if views.iter().all(|v| v.nrows() == 0) {
        return Ok(Array2::zeros((0, width)));
    }
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| EncodingError::ShapeMismatch(format!("cannot concatenate runs: {e}")))
}

fn is_integral(value: f64) -> bool {
    (value - value.round()).abs() <= RATIO_TOLERANCE * value.abs().max(1.0)
}
