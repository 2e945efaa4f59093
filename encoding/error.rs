use ndarray_linalg::error::LinalgError;
use std::fmt;
use thiserror::Error;

/// Fatal failures raised by the alignment and fitting stages.
///
/// Shape and configuration problems are detected before any partial work is
/// done. Numerical failures come from the linear solve and are never masked.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),
}

impl From<LinalgError> for EncodingError {
    fn from(err: LinalgError) -> Self {
        EncodingError::NumericalFailure(format!("LAPACK routine failed: {err}"))
    }
}

/// Recoverable inconsistencies found while aligning runs.
///
/// These are returned next to the aligned matrices and logged once per
/// offending run; they never stop processing.
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentWarning {
    /// `TR / stim_TR` was not an integer and was rounded.
    RoundedSamplingRatio { ratio: f64, used: usize },
    /// A run's start time was not a whole number of stimulus samples.
    RoundedStartTime {
        run: usize,
        start_time: f64,
        samples: i64,
    },
    /// The response run outlasted the stimulus and lost trailing rows.
    TruncatedResponse { run: usize, dropped: usize },
}

impl fmt::Display for AlignmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentWarning::RoundedSamplingRatio { ratio, used } => write!(
                f,
                "TR / stim_TR = {ratio} is not an integer; using {used} stimulus samples per TR"
            ),
            AlignmentWarning::RoundedStartTime {
                run,
                start_time,
                samples,
            } => write!(
                f,
                "run {run}: start time {start_time}s is not a whole number of stimulus samples; shifting by {samples}"
            ),
            AlignmentWarning::TruncatedResponse { run, dropped } => write!(
                f,
                "run {run}: response has {dropped} more rows than the stimulus covers; trailing rows were dropped"
            ),
        }
    }
}
