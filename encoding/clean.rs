//! Column-wise signal cleaning applied to responses before alignment.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Removes a least-squares linear trend from each column and, optionally,
/// rescales each column to zero mean and unit variance (population variance).
///
/// A column with zero variance after detrending is left at zero.
pub fn clean_signal(data: ArrayView2<'_, f64>, detrend: bool, standardize: bool) -> Array2<f64> {
    let mut cleaned = data.to_owned();
    let n = cleaned.nrows();
    if n == 0 {
        return cleaned;
    }

    if detrend {
        let time = Array1::from_shape_fn(n, |i| i as f64);
        let time_mean = time.mean().unwrap_or(0.0);
        let centred_time = time.mapv(|t| t - time_mean);
        let time_ss = centred_time.dot(&centred_time);
        for mut column in cleaned.axis_iter_mut(Axis(1)) {
            let mean = column.mean().unwrap_or(0.0);
            let slope = if time_ss > 0.0 {
                column
                    .iter()
                    .zip(&centred_time)
                    .map(|(v, t)| (v - mean) * t)
                    .sum::<f64>()
                    / time_ss
            } else {
                0.0
            };
            Zip::from(&mut column)
                .and(&centred_time)
                .for_each(|v, &t| *v -= mean + slope * t);
        }
    }

    if standardize {
        for mut column in cleaned.axis_iter_mut(Axis(1)) {
            let mean = column.mean().unwrap_or(0.0);
            let std = column.std(0.0);
            if std > 0.0 && std.is_finite() {
                column.mapv_inplace(|v| (v - mean) / std);
            } else {
                column.fill(0.0);
            }
        }
    }
    cleaned
}
