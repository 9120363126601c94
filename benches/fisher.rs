use criterion::{criterion_group, criterion_main, Criterion};

use szar::core::grids::CountGrid;
use szar::fisher::*;

use ndarray::Array3;
use rand::Rng;
use rand_pcg::Pcg64;
use std::collections::HashMap;

/// Derivatives of a survey with many bins, kept in memory.
struct MyDerivatives {
    grids: HashMap<String, Array3<f64>>,
}

impl DerivativeSource for MyDerivatives {
    fn derivative(&self, param: &str) -> szar::Result<Array3<f64>> {
        Ok(self.grids[param].clone())
    }
}

const PARAMS: [&str; 10] = [
    "H0", "om", "ob", "s8", "ns", "tau", "mnu", "alpha_ym", "b_ym", "b_wl",
];

fn setup() -> (CountGrid, MyDerivatives) {
    // Initialize the random number generator.
    let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96);
    // 17 mass bins, 30 redshift bins and 20 bins in q
    let shape = (17, 30, 20);

    let fiducial =
        CountGrid::new(Array3::from_shape_simple_fn(shape, || rng.gen_range(0.0, 50.0))).unwrap();
    let grids = PARAMS
        .iter()
        .map(|p| {
            (
                p.to_string(),
                Array3::from_shape_simple_fn(shape, || rng.gen_range(-5.0, 5.0)),
            )
        })
        .collect();

    (fiducial, MyDerivatives { grids })
}

fn criterion_fisher_benchmark(c: &mut Criterion) {
    let (fiducial, derivatives) = setup();
    let params: Vec<String> = PARAMS.iter().map(|p| p.to_string()).collect();
    let priors = PriorSet::from_lists(&["tau".to_string()], &[0.01]).unwrap();

    let d = &derivatives.grids["H0"];
    c.bench_function("fisher element", |b| {
        b.iter(|| fisher_element(fiducial.counts(), d, d))
    });
    c.bench_function("fisher matrix", |b| {
        b.iter(|| get_fisher(&fiducial, &params, &priors, &derivatives).unwrap())
    });
}

criterion_group!(benches, criterion_fisher_benchmark);
criterion_main!(benches);
