use ndarray::Array2;
use voxelwise::align::{AlignOptions, NanPolicy, align};
use voxelwise::{AlignmentWarning, EncodingError};

fn ramp(rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, _)| i as f64)
}

fn max_of_row(x: &Array2<f64>, row: usize) -> f64 {
    x.row(row).iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn options(lag_time: f64) -> AlignOptions {
    AlignOptions {
        lag_time,
        ..AlignOptions::new(2.0, 0.1)
    }
}

#[test]
fn six_second_lag_starts_at_third_response() {
    let aligned = align(vec![ramp(4000, 30)], vec![ramp(205, 10)], &options(6.0)).unwrap();
    assert_eq!(max_of_row(&aligned.x, 0), 59.0);
    assert!(aligned.y.row(0).iter().all(|&v| v == 2.0));
    assert_eq!(aligned.x.nrows(), aligned.y.nrows());
    assert!(aligned.x.iter().all(|v| v.is_finite()));
    assert!(
        aligned
            .warnings
            .contains(&AlignmentWarning::TruncatedResponse { run: 0, dropped: 5 })
    );
}

#[test]
fn four_second_lag_starts_at_second_response() {
    let aligned = align(vec![ramp(4000, 30)], vec![ramp(205, 10)], &options(4.0)).unwrap();
    assert_eq!(max_of_row(&aligned.x, 0), 39.0);
    assert!(aligned.y.row(0).iter().all(|&v| v == 1.0));
}

#[test]
fn start_time_delays_the_stimulus() {
    let options = AlignOptions {
        start_times: Some(vec![2.0]),
        ..options(2.0)
    };
    let aligned = align(vec![ramp(4000, 30)], vec![ramp(205, 10)], &options).unwrap();
    assert_eq!(max_of_row(&aligned.x, 0), 19.0);
    assert!(aligned.y.row(0).iter().all(|&v| v == 1.0));
}

#[test]
fn identical_runs_stack_identically() {
    let options = AlignOptions {
        offset_stim: 0.0,
        ..options(4.0)
    };
    let aligned = align(
        vec![ramp(80, 1), ramp(80, 1)],
        vec![ramp(4, 1), ramp(4, 1)],
        &options,
    )
    .unwrap();
    assert_eq!(aligned.x.dim(), (6, 40));
    assert_eq!(aligned.y.dim(), (6, 1));
    assert_eq!(aligned.x.row(0), aligned.x.row(3));
    assert_eq!(aligned.y[[0, 0]], aligned.y[[3, 0]]);
    assert_eq!(aligned.run_lengths, vec![3, 3]);
}

#[test]
fn keep_policy_retains_padding_rows() {
    let options = AlignOptions {
        offset_stim: 0.0,
        remove_nans: NanPolicy::Keep,
        ..options(4.0)
    };
    let aligned = align(vec![ramp(80, 1)], vec![ramp(4, 1)], &options).unwrap();
    assert_eq!(aligned.x.dim(), (4, 40));
    assert_eq!(aligned.x.row(0).iter().filter(|v| v.is_nan()).count(), 20);
    assert_eq!(aligned.y[[0, 0]], 0.0);
}

#[test]
fn fraction_policy_replaces_surviving_filler_with_zeros() {
    let options = AlignOptions {
        offset_stim: 0.0,
        remove_nans: NanPolicy::MaxFraction(0.5),
        ..options(4.0)
    };
    let aligned = align(vec![ramp(80, 1)], vec![ramp(4, 1)], &options).unwrap();
    assert_eq!(aligned.x.nrows(), 4);
    assert!(aligned.x.iter().all(|v| v.is_finite()));
    assert!(aligned.x.row(0).iter().take(20).all(|&v| v == 0.0));
}

#[test]
fn rejects_inconsistent_inputs() {
    let runs = align(vec![ramp(80, 1)], vec![], &options(4.0));
    assert!(matches!(runs, Err(EncodingError::ShapeMismatch(_))));

    let features = align(
        vec![ramp(80, 1), ramp(80, 2)],
        vec![ramp(4, 1), ramp(4, 1)],
        &options(4.0),
    );
    assert!(matches!(features, Err(EncodingError::ShapeMismatch(_))));

    let lag = align(vec![ramp(80, 1)], vec![ramp(4, 1)], &options(3.0));
    assert!(matches!(lag, Err(EncodingError::InvalidConfig(_))));
}

#[test]
fn long_response_is_truncated_with_warning() {
    let options = AlignOptions {
        offset_stim: 0.0,
        ..options(4.0)
    };
    let aligned = align(vec![ramp(40, 1)], vec![ramp(4, 1)], &options).unwrap();
    assert_eq!(aligned.x.nrows(), 1);
    assert_eq!(aligned.y[[0, 0]], 1.0);
    assert_eq!(
        aligned.warnings,
        vec![AlignmentWarning::TruncatedResponse { run: 0, dropped: 2 }]
    );
}

#[test]
fn aligning_twice_gives_identical_output() {
    let options = AlignOptions {
        start_times: Some(vec![0.5, -0.3]),
        ..options(4.0)
    };
    let run = || {
        align(
            vec![ramp(400, 3), ramp(380, 3)],
            vec![ramp(21, 2), ramp(19, 2)],
            &options,
        )
        .unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first.x, second.x);
    assert_eq!(first.y, second.y);
    assert_eq!(first.run_lengths, second.run_lengths);
    assert_eq!(first.warnings, second.warnings);
}

#[test]
fn rounded_sampling_ratio_is_reported_once_per_call() {
    let options = AlignOptions {
        lag_time: 4.0,
        ..AlignOptions::new(2.0, 0.3)
    };
    let aligned = align(
        vec![ramp(40, 1), ramp(40, 1)],
        vec![ramp(6, 1), ramp(6, 1)],
        &options,
    )
    .unwrap();
    let rounded = aligned
        .warnings
        .iter()
        .filter(|w| matches!(w, AlignmentWarning::RoundedSamplingRatio { used: 7, .. }))
        .count();
    assert_eq!(rounded, 1);
    assert!(aligned.x.nrows() > 0);
    assert_eq!(aligned.x.nrows(), aligned.y.nrows());
    assert_eq!(aligned.run_lengths.iter().sum::<usize>(), aligned.x.nrows());
}

#[test]
fn mixed_start_times_keep_rows_aligned() {
    let options = AlignOptions {
        offset_stim: 0.0,
        start_times: Some(vec![2.0, -1.0, 0.0]),
        ..options(4.0)
    };
    let aligned = align(
        vec![ramp(80, 1), ramp(80, 1), ramp(80, 1)],
        vec![ramp(4, 1), ramp(4, 1), ramp(4, 1)],
        &options,
    )
    .unwrap();
    assert_eq!(aligned.run_lengths, vec![2, 2, 3]);
    assert_eq!(aligned.x.dim(), (7, 40));
    assert_eq!(aligned.y.nrows(), 7);

    // first kept row of each run
    assert_eq!(max_of_row(&aligned.x, 0), 39.0);
    assert_eq!(aligned.y[[0, 0]], 2.0);
    assert_eq!(max_of_row(&aligned.x, 2), 49.0);
    assert_eq!(aligned.y[[2, 0]], 1.0);
    assert_eq!(max_of_row(&aligned.x, 4), 39.0);
    assert_eq!(aligned.y[[4, 0]], 1.0);
}
