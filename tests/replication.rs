use approx::assert_relative_eq;
use nalgebra::DVector;
use surplusinv::data::{OutsideGood, TargetShares};
use surplusinv::experiments::{
    ccp_inversion, ring_characteristics, round_trip, simulate_characteristics, Design,
    ExperimentOptions, ExperimentPlan,
};
use surplusinv::options::{EstimatorConfig, Heterogeneity, ShockDistribution};
use surplusinv::surplus::{SurplusEstimator, EULER_GAMMA};
use surplusinv::{Criterion, SolverOptions};

fn newton() -> ExperimentOptions {
    ExperimentOptions::default().with_solver(SolverOptions::newton())
}

fn mixed_logit(order: usize, sigma: &[f64]) -> EstimatorConfig {
    EstimatorConfig::quadrature(order)
        .with_heterogeneity(Heterogeneity::MixedLogit {
            sigma: sigma.to_vec(),
        })
        .with_outside_good(true)
}

/// Closed-form logit surplus and Newton recover `log p - gamma` to solver precision.
#[test]
fn ccp_closed_form_recovers_log_probabilities() {
    let probabilities = [0.30, 0.25, 0.20, 0.15, 0.10];
    let target = TargetShares::from_slice(&probabilities, OutsideGood::Excluded).unwrap();
    let estimator = EstimatorConfig::closed_form().build(5, None).unwrap();

    let report = ccp_inversion(&target, &estimator, &newton()).unwrap();
    assert!(report.summary.converged, "{report}");

    let expected = DVector::from_iterator(5, probabilities.iter().map(|p| p.ln() - EULER_GAMMA));
    let recovered = DVector::from_iterator(5, report.rows.iter().map(|row| row.recovered));
    assert_relative_eq!(recovered, expected, epsilon = 1e-6);
}

/// Simulated Gumbel shocks land within simulation error of the logit inversion.
#[test]
fn ccp_monte_carlo_matches_logit_within_simulation_error() {
    let target = TargetShares::from_slice(&[0.5, 0.3, 0.2], OutsideGood::Excluded).unwrap();
    let estimator = EstimatorConfig::monte_carlo(ShockDistribution::Gumbel, 40_000, 17)
        .build(3, None)
        .unwrap();

    let report = ccp_inversion(&target, &estimator, &ExperimentOptions::default()).unwrap();
    assert!(report.max_residual < 0.1, "{report}");
}

/// Inverting with the estimator that produced the shares is exact.
#[test]
fn mixed_logit_round_trip_through_same_quadrature_is_exact() {
    let sigma = [0.0, 0.5, 0.5, 0.0];
    let characteristics = simulate_characteristics(5, 4, &sigma, 2).unwrap();
    let estimator = mixed_logit(10, &sigma)
        .build(5, Some(&characteristics))
        .unwrap();

    let report = round_trip(
        &characteristics,
        &estimator,
        &estimator,
        Criterion::Linear,
        &newton(),
    )
    .unwrap();
    assert!(report.summary.converged, "{report}");
    assert!(report.max_residual < 1e-6, "{report}");
}

/// Higher quadrature orders approximate the reference surplus better.
#[test]
fn mixed_logit_residual_shrinks_with_quadrature_order() {
    let sigma = [0.0, 1.0, 0.0];
    let characteristics = simulate_characteristics(4, 3, &sigma, 5).unwrap();
    let reference = mixed_logit(40, &sigma)
        .build(4, Some(&characteristics))
        .unwrap();

    let residual = |order: usize| {
        let approximation = mixed_logit(order, &sigma)
            .build(4, Some(&characteristics))
            .unwrap();
        round_trip(
            &characteristics,
            &reference,
            &approximation,
            Criterion::Linear,
            &newton(),
        )
        .unwrap()
        .l2_residual
    };

    let coarse = residual(2);
    let fine = residual(12);
    assert!(fine < coarse, "order 12 residual {fine} vs order 2 residual {coarse}");
    assert!(fine < 1e-3);
}

/// Quadrature surpluses are bit-identical across evaluations.
#[test]
fn quadrature_evaluation_is_reproducible() {
    let sigma = [0.0, 0.5, 0.5, 0.0];
    let characteristics = simulate_characteristics(5, 4, &sigma, 2).unwrap();
    let estimator = mixed_logit(20, &sigma)
        .build(5, Some(&characteristics))
        .unwrap();
    let utilities = characteristics.mean_utilities();

    let first = estimator.evaluate(&utilities).unwrap();
    let second = estimator.evaluate(&utilities).unwrap();
    assert_eq!(first.surplus.to_bits(), second.surplus.to_bits());
    assert_eq!(first.probabilities, second.probabilities);
}

/// One million simulated Gumbel shocks land within 1e-2 of `log p - gamma`.
#[test]
fn ccp_preset_recovers_log_probabilities_with_a_million_draws() {
    let mut plan = ExperimentPlan::ccp_logit();
    let probabilities: Vec<f64> = (1..=5).map(|k| f64::from(k) / 15.0).collect();
    match &mut plan.design {
        Design::Ccp {
            probabilities: target,
            ..
        } => *target = probabilities.clone(),
        other => panic!("unexpected design {other:?}"),
    }

    let report = plan.run().unwrap();
    assert_eq!(report.rows.len(), 5);
    for (row, p) in report.rows.iter().zip(&probabilities) {
        assert_relative_eq!(row.truth, p.ln() - EULER_GAMMA, epsilon = 1e-12);
    }
    assert!(report.max_residual < 1e-2, "{report}");
}

/// More simulated consumers approximate the max-kernel reference surplus better.
#[test]
fn pure_characteristics_residual_shrinks_with_draws() {
    let sigma = vec![0.0, 0.0, 1.0, 1.0];
    let heterogeneity = Heterogeneity::PureCharacteristics {
        sigma: sigma.clone(),
    };
    let characteristics = ring_characteristics(5, 4).unwrap();
    let reference = EstimatorConfig::quadrature(50)
        .with_heterogeneity(heterogeneity.clone())
        .with_outside_good(true)
        .build(5, Some(&characteristics))
        .unwrap();
    let options = ExperimentOptions::default()
        .with_solver(SolverOptions {
            simplex_step: 0.25,
            ..SolverOptions::nelder_mead()
        })
        .with_restarts(2);

    let residual = |draws: usize| {
        let approximation = EstimatorConfig::monte_carlo(ShockDistribution::Normal, draws, 5)
            .with_heterogeneity(heterogeneity.clone())
            .with_outside_good(true)
            .build(5, Some(&characteristics))
            .unwrap();
        round_trip(
            &characteristics,
            &reference,
            &approximation,
            Criterion::Linear,
            &options,
        )
        .unwrap()
        .l2_residual
    };

    let coarse = residual(100);
    let fine = residual(50_000);
    assert!(fine < coarse, "50,000 draws residual {fine} vs 100 draws residual {coarse}");
    assert!(fine < 0.25);
}

#[test]
fn mixed_logit_preset_recovers_mean_utilities() {
    let report = ExperimentPlan::mixed_logit().run().unwrap();
    assert_eq!(report.rows.len(), 5);
    assert!(report.summary.converged, "{report}");
    assert!(report.max_residual < 0.2, "{report}");
}

#[test]
fn pure_characteristics_preset_recovers_mean_utilities() {
    let report = ExperimentPlan::pure_characteristics().run().unwrap();
    assert_eq!(report.rows.len(), 5);
    assert!(report.max_residual < 0.25, "{report}");
    assert!(report.residuals().iter().all(|value| value.is_finite()));
}

#[test]
fn plans_and_configurations_read_from_json() {
    let json = r#"{
        "mode": "quadrature",
        "order": 15,
        "heterogeneity": { "model": "pure_characteristics", "sigma": [0.0, 0.0, 1.0, 1.0] },
        "outside_good": true
    }"#;
    let config: EstimatorConfig = serde_json::from_str(json).unwrap();
    let characteristics = ring_characteristics(5, 4).unwrap();
    let estimator = config.build(5, Some(&characteristics)).unwrap();
    assert!(!estimator.is_smooth());
    assert!(estimator.outside_good());

    let plan = ExperimentPlan::pure_characteristics();
    let text = serde_json::to_string(&plan).unwrap();
    let parsed: ExperimentPlan = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, plan);
}
