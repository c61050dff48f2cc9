use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::DVector;
use surplusinv::integration::{IntegrationRule, ShockSample};
use surplusinv::surplus::{InnerExpectation, MonteCarloSurplus, QuadratureSurplus, SurplusEstimator};

fn bench_monte_carlo(c: &mut Criterion) {
    let utilities = DVector::from_vec(vec![0.4, -0.1, 0.2, -0.6, 0.0]);

    for draws in [10_000, 1_000_000] {
        let sample = ShockSample::gumbel(5, draws, 7).unwrap();
        let estimator = MonteCarloSurplus::new(sample, true);
        c.bench_function(&format!("monte_carlo_surplus_{draws}"), |b| {
            b.iter(|| estimator.evaluate(black_box(&utilities)).unwrap())
        });
    }
}

fn bench_quadrature(c: &mut Criterion) {
    let utilities = DVector::from_vec(vec![0.4, -0.1, 0.2, -0.6, 0.0]);
    let loadings = nalgebra::DMatrix::from_row_slice(
        5,
        2,
        &[1.0, 0.0, 0.3, 0.95, -0.8, 0.6, -0.8, -0.6, 0.3, -0.95],
    );
    let rule = IntegrationRule::gauss_hermite(50, 2).unwrap();
    let estimator = QuadratureSurplus::new(&rule, &loadings, InnerExpectation::Logit, true).unwrap();

    c.bench_function("quadrature_logit_surplus_order_50", |b| {
        b.iter(|| estimator.evaluate(black_box(&utilities)).unwrap())
    });
}

criterion_group!(benches, bench_monte_carlo, bench_quadrature);
criterion_main!(benches);
