use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use voxelwise::ridge::{InnerCv, RidgeGridSearch, fit_ridge};
use voxelwise::{Estimator, Ridge};

const N_TARGETS: usize = 64;

fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.sample(StandardNormal))
}

fn benchmark_ridge(c: &mut Criterion) {
    // Primal (more rows than features) and dual (more features than rows) shapes.
    let shapes = [(400_usize, 60_usize), (120, 480)];

    let mut group = c.benchmark_group("ridge_fit");
    for &(rows, cols) in &shapes {
        let x = random_matrix(rows, cols, 0x5EED + rows as u64);
        let y = random_matrix(rows, N_TARGETS, 0xF00D + cols as u64);
        let label = format!("{rows}x{cols}");
        group.throughput(Throughput::Elements((rows * cols) as u64));

        group.bench_with_input(BenchmarkId::new("single_alpha", &label), &(&x, &y), |b, (x, y)| {
            let alphas = ndarray::Array1::from_elem(N_TARGETS, 10.0);
            b.iter(|| {
                let model = fit_ridge(black_box(x.view()), black_box(y.view()), alphas.view(), true);
                black_box(model.is_ok());
            });
        });

        let grid = [1.0, 10.0, 100.0, 1000.0, 10_000.0];
        for (name, inner_cv) in [("kfold_search", InnerCv::KFold(5)), ("loo_search", InnerCv::LeaveOneOut)] {
            let search = match RidgeGridSearch::new(grid.to_vec()) {
                Ok(search) => search.with_inner_cv(inner_cv),
                Err(e) => panic!("invalid alpha grid: {e}"),
            };
            group.bench_with_input(BenchmarkId::new(name, &label), &(&x, &y), |b, (x, y)| {
                b.iter(|| black_box(search.fit(x.view(), y.view()).is_ok()));
            });
        }

        group.bench_with_input(BenchmarkId::new("fixed_ridge", &label), &(&x, &y), |b, (x, y)| {
            let ridge = Ridge::new(100.0);
            b.iter(|| black_box(ridge.fit(x.view(), y.view()).is_ok()));
        });
    }
    group.finish();
}

criterion_group!(ridge_fit, benchmark_ridge);
criterion_main!(ridge_fit);
