//! TOML configuration for an encoding run. Every field has a default equal to
//! the default of the operation it feeds, so an empty file is a valid config.
//!
//! ```toml
//! [alignment]
//! lag_time = 6.0
//! offset_stim = 2.0
//! remove_nans = true      # or false, or a fraction such as 0.5
//!
//! [fitting]
//! n_splits = 8
//! alphas = [1.0, 100.0, 10000.0]
//! inner_cv = "kfold"
//! inner_splits = 7
//! scoring = "correlation"
//! ```

use crate::align::{AlignOptions, DEFAULT_LAG_TIME, DEFAULT_OFFSET_STIM, NanPolicy};
use crate::cv::{CvOptions, DEFAULT_N_SPLITS};
use crate::error::EncodingError;
use crate::ridge::{DEFAULT_ALPHA, DEFAULT_INNER_SPLITS, InnerCv, RidgeGridSearch};
use crate::score::Scoring;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodingConfig {
    pub alignment: AlignmentConfig,
    pub fitting: FitConfig,
}

impl EncodingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignmentConfig {
    pub lag_time: f64,
    pub offset_stim: f64,
    pub filler_value: f64,
    pub remove_nans: NanPolicy,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            lag_time: DEFAULT_LAG_TIME,
            offset_stim: DEFAULT_OFFSET_STIM,
            filler_value: f64::NAN,
            remove_nans: NanPolicy::default(),
        }
    }
}

impl AlignmentConfig {
    /// Combines the configured window with per-dataset timing metadata.
    pub fn to_options(&self, tr: f64, stim_tr: f64, start_times: Option<Vec<f64>>) -> AlignOptions {
        AlignOptions {
            tr,
            stim_tr,
            lag_time: self.lag_time,
            offset_stim: self.offset_stim,
            start_times,
            filler_value: self.filler_value,
            remove_nans: self.remove_nans,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerStrategy {
    #[default]
    Kfold,
    LeaveOneOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    /// Outer fold count; ignored when `adaptive_splits` is set.
    pub n_splits: usize,
    pub adaptive_splits: bool,
    pub alphas: Vec<f64>,
    pub inner_cv: InnerStrategy,
    pub inner_splits: usize,
    pub fit_intercept: bool,
    pub scoring: Scoring,
    pub voxel_selection: bool,
    pub validate: bool,
    /// Split targets into this many contiguous blocks, each with its own model.
    pub target_blocks: Option<usize>,
    pub parallel: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            n_splits: DEFAULT_N_SPLITS,
            adaptive_splits: false,
            alphas: vec![DEFAULT_ALPHA],
            inner_cv: InnerStrategy::default(),
            inner_splits: DEFAULT_INNER_SPLITS,
            fit_intercept: true,
            scoring: Scoring::default(),
            voxel_selection: true,
            validate: true,
            target_blocks: None,
            parallel: true,
        }
    }
}

impl FitConfig {
    pub fn cv_options(&self) -> CvOptions {
        CvOptions {
            n_splits: (!self.adaptive_splits).then_some(self.n_splits),
            scoring: self.scoring,
            voxel_selection: self.voxel_selection,
            validate: self.validate,
            parallel: self.parallel,
        }
    }

    pub fn estimator(&self) -> Result<RidgeGridSearch, EncodingError> {
        let inner_cv = match self.inner_cv {
            InnerStrategy::Kfold => InnerCv::KFold(self.inner_splits),
            InnerStrategy::LeaveOneOut => InnerCv::LeaveOneOut,
        };
        Ok(RidgeGridSearch::new(self.alphas.clone())?
            .with_inner_cv(inner_cv)
            .with_intercept(self.fit_intercept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_config_uses_operation_defaults() {
        let config: EncodingConfig = toml::from_str("").unwrap();
        assert_eq!(config.alignment.lag_time, DEFAULT_LAG_TIME);
        assert!(config.alignment.filler_value.is_nan());
        assert_eq!(config.alignment.remove_nans, NanPolicy::DropAny);
        assert_eq!(config.fitting.cv_options(), CvOptions::default());
        assert_eq!(config.fitting.estimator().unwrap(), RidgeGridSearch::default());
    }

    #[test]
    fn loads_overrides_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[alignment]
lag_time = 4.0
offset_stim = 0.0
remove_nans = 0.25

[fitting]
adaptive_splits = true
alphas = [1.0, 10.0]
inner_cv = "leave_one_out"
scoring = "r2"
target_blocks = 4
"#
        )
        .unwrap();

        let config = EncodingConfig::load(file.path()).unwrap();
        assert_eq!(config.alignment.lag_time, 4.0);
        assert_eq!(config.alignment.remove_nans, NanPolicy::MaxFraction(0.25));
        let cv = config.fitting.cv_options();
        assert_eq!(cv.n_splits, None);
        assert_eq!(cv.scoring, Scoring::R2);
        assert_eq!(config.fitting.target_blocks, Some(4));
        let estimator = config.fitting.estimator().unwrap();
        assert_eq!(estimator.alphas(), &[1.0, 10.0]);

        let options = config.alignment.to_options(2.0, 0.1, Some(vec![0.0]));
        assert_eq!(options.lag_time, 4.0);
        assert_eq!(options.start_times, Some(vec![0.0]));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<EncodingConfig>("[fitting]\nfolds = 3").is_err());
    }
}
