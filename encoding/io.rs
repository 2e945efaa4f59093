//! Loading of tab-separated matrices and BIDS-style JSON sidecars, and writing
//! of per-target score tables.
//!
//! Matrix files carry no header row. Files ending in `.gz` are decompressed
//! on the fly. The BIDS missing-value marker `n/a` is read as NaN.

use crate::error::EncodingError;
use flate2::read::GzDecoder;
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Malformed TSV in '{path}': {source}")]
    Csv { path: String, source: csv::Error },
    #[error("Malformed JSON sidecar '{path}': {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("Non-numeric value '{value}' at row {row}, column {column} of '{path}'")]
    NotNumeric {
        path: String,
        row: usize,
        column: usize,
        value: String,
    },
    #[error("'{path}' contains no data rows")]
    Empty { path: String },
    #[error("Invalid metadata in '{path}': {message}")]
    InvalidMetadata { path: String, message: String },
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// JSON sidecar of a BIDS `_stim.tsv.gz` file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StimulusSidecar {
    pub sampling_frequency: f64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl StimulusSidecar {
    /// Sampling period in seconds.
    pub fn stim_tr(&self) -> f64 {
        1.0 / self.sampling_frequency
    }
}

/// The task-level BOLD metadata needed for alignment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskMetadata {
    pub repetition_time: f64,
}

fn open(path: &Path) -> Result<Box<dyn Read>, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Reads a headerless, tab-separated numeric matrix.
pub fn read_matrix(path: impl AsRef<Path>) -> Result<Array2<f64>, LoadError> {
    let path = path.as_ref();
    let display = || path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_reader(open(path)?);

    let mut values = Vec::new();
    let mut n_cols = 0;
    let mut n_rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|source| LoadError::Csv {
            path: display(),
            source,
        })?;
        n_cols = record.len();
        for (column, field) in record.iter().enumerate() {
            values.push(parse_value(field).ok_or_else(|| LoadError::NotNumeric {
                path: display(),
                row,
                column,
                value: field.to_string(),
            })?);
        }
        n_rows += 1;
    }
    if n_rows == 0 {
        return Err(LoadError::Empty { path: display() });
    }
    Array2::from_shape_vec((n_rows, n_cols), values).map_err(|e| {
        LoadError::Encoding(EncodingError::ShapeMismatch(format!(
            "'{}' has ragged rows: {e}",
            display()
        )))
    })
}

fn parse_value(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.eq_ignore_ascii_case("n/a") || field.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    field.parse().ok()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LoadError> {
    serde_json::from_reader(open(path)?).map_err(|source| LoadError::Json {
        path: path.display().to_string(),
        source,
    })
}

pub fn read_sidecar(path: impl AsRef<Path>) -> Result<StimulusSidecar, LoadError> {
    let path = path.as_ref();
    let sidecar: StimulusSidecar = read_json(path)?;
    if !(sidecar.sampling_frequency.is_finite() && sidecar.sampling_frequency > 0.0) {
        return Err(LoadError::InvalidMetadata {
            path: path.display().to_string(),
            message: format!(
                "SamplingFrequency must be positive, got {}",
                sidecar.sampling_frequency
            ),
        });
    }
    Ok(sidecar)
}

pub fn read_task_metadata(path: impl AsRef<Path>) -> Result<TaskMetadata, LoadError> {
    let path = path.as_ref();
    let metadata: TaskMetadata = read_json(path)?;
    if !(metadata.repetition_time.is_finite() && metadata.repetition_time > 0.0) {
        return Err(LoadError::InvalidMetadata {
            path: path.display().to_string(),
            message: format!(
                "RepetitionTime must be positive, got {}",
                metadata.repetition_time
            ),
        });
    }
    Ok(metadata)
}

/// Writes one row per target: the target index, one column per fold (when
/// fold scores are given) and the pooled score.
pub fn write_scores(
    path: impl AsRef<Path>,
    fold_scores: Option<ArrayView2<'_, f64>>,
    pooled: ArrayView1<'_, f64>,
) -> Result<(), LoadError> {
    let path = path.as_ref();
    let display = || path.display().to_string();
    let csv_err = |source| LoadError::Csv {
        path: display(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(csv_err)?;

    let n_folds = fold_scores.map_or(0, |scores| scores.ncols());
    let mut header = vec!["target".to_string()];
    header.extend((1..=n_folds).map(|fold| format!("fold_{fold}")));
    header.push("pooled".to_string());
    writer.write_record(&header).map_err(csv_err)?;

    for (target, &score) in pooled.iter().enumerate() {
        let mut record = vec![target.to_string()];
        if let Some(scores) = fold_scores {
            record.extend(scores.row(target).iter().map(|v| format!("{v:.6}")));
        }
        record.push(format!("{score:.6}"));
        writer.write_record(&record).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| LoadError::Io {
        path: display(),
        source,
    })
}
