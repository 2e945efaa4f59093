#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod align;
pub mod clean;
pub mod config;
pub mod cv;
pub mod error;
pub mod estimator;
pub mod io;
pub mod ridge;
pub mod score;

pub use align::{AlignOptions, AlignedData, NanPolicy, align};
pub use cv::{CvOptions, CvResult, FitOutcome, KFold, fit_cv};
pub use error::{AlignmentWarning, EncodingError};
pub use estimator::{Blockwise, Estimator, FittedModel};
pub use ridge::{InnerCv, Ridge, RidgeGridSearch, fit_ridge};
pub use score::Scoring;
