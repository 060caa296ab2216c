mod common;

use approx::assert_abs_diff_eq;
use common::{COUNTY_OFFSETS, bounce_times, county_label};
use hierarchical_models::utils::{mean, sample_variance};
use hierarchical_models::{
    ModelSpec, ParameterClass, PredictionData, PredictiveOptions, Prior, SamplerConfig,
    SamplingControl, fit_model,
};

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Noise is residualized here, so least squares returns the generating values
/// exactly and the remaining error is shrinkage plus Monte Carlo error.
/// `random_intercept_fit_recovers_offsets_under_raw_noise` covers raw noise.
#[test]
fn random_intercept_fit_recovers_generating_values() {
    let data = bounce_times(20, 5.0, true, 11);
    assert_eq!(data.n_obs(), 160);
    let spec = ModelSpec::varying_intercept("county_intercept", "county", &["age"])
        .with_default_priors(&data)
        .with_prior(
            ParameterClass::Intercept,
            Prior::Normal {
                mean: 20.0,
                sd: 10.0,
            },
        )
        .with_prior(ParameterClass::Slope, Prior::Normal { mean: 4.0, sd: 5.0 });
    let config = SamplerConfig {
        warmup_iterations: 1_000,
        sampling_iterations: 2_000,
        num_chains: 2,
        seed: 2_024,
        ..SamplerConfig::default()
    };

    let model = fit_model(&data, &spec, config, &SamplingControl::new()).expect("fit should run");
    assert_eq!(model.posterior().len(), 4_000);

    let slope = model.posterior().column("b_age").expect("slope is stored");
    assert!((median(&slope) - 4.0).abs() < 1.0);

    for (county, truth) in COUNTY_OFFSETS.iter().enumerate() {
        let name = format!("r_county[{},Intercept]", county_label(county));
        let offset = model.posterior().column(&name).expect("group effect is stored");
        assert!(
            (median(&offset) - truth).abs() < 2.0,
            "{name}: median {} vs {truth}",
            median(&offset)
        );
    }

    let convergence = model
        .report()
        .convergence
        .as_ref()
        .expect("diagnostics should be available");
    for parameter in &convergence.parameters {
        assert!(
            parameter.rhat < 1.05,
            "{}: R-hat {}",
            parameter.name,
            parameter.rhat
        );
    }
}

/// With raw noise each county mean carries sampling error of sd `5 / sqrt(20)`,
/// so offsets are only expected within about three of those.
#[test]
fn random_intercept_fit_recovers_offsets_under_raw_noise() {
    let data = bounce_times(20, 5.0, false, 17);
    let spec = ModelSpec::varying_intercept("county_intercept", "county", &["age"])
        .with_default_priors(&data);
    let config = SamplerConfig {
        warmup_iterations: 1_000,
        sampling_iterations: 1_000,
        num_chains: 2,
        seed: 31,
        ..SamplerConfig::default()
    };
    let model = fit_model(&data, &spec, config, &SamplingControl::new()).expect("fit should run");

    let slope = model.posterior().column("b_age").expect("slope is stored");
    assert!((median(&slope) - 4.0).abs() < 1.2);
    for (county, truth) in COUNTY_OFFSETS.iter().enumerate() {
        let name = format!("r_county[{},Intercept]", county_label(county));
        let offset = model.posterior().column(&name).expect("group effect is stored");
        assert!(
            (median(&offset) - truth).abs() < 3.5,
            "{name}: median {} vs {truth}",
            median(&offset)
        );
    }
    let max_rhat = model
        .report()
        .convergence
        .as_ref()
        .and_then(|summary| summary.max_rhat)
        .expect("diagnostics should be available");
    assert!(max_rhat < 1.05, "max R-hat {max_rhat}");
}

#[test]
fn posterior_predictive_workflow_reflects_group_structure() {
    let data = bounce_times(12, 3.0, false, 5);
    let spec = ModelSpec::varying_intercept("county_intercept", "county", &["age"])
        .with_default_priors(&data);
    let config = SamplerConfig {
        warmup_iterations: 400,
        sampling_iterations: 400,
        num_chains: 2,
        ..SamplerConfig::default()
    };
    let model = fit_model(&data, &spec, config, &SamplingControl::new()).expect("fit should run");

    let check = model
        .posterior_predictive_check(&PredictiveOptions::default(), mean)
        .expect("predictive check should run");
    assert_eq!(check.replicated.len(), 800);
    assert!(check.p_value > 0.05 && check.p_value < 0.95);

    let new_rows = PredictionData::new(
        vec![("age".to_string(), vec![0.0, 0.0])],
        &[county_label(7), "county_new".to_string()],
    )
    .expect("prediction rows should validate");
    let options = PredictiveOptions {
        draws: Some(500),
        ..PredictiveOptions::default()
    };
    let predictive = model
        .posterior_predictive(&new_rows, &options)
        .expect("prediction should run");
    assert_eq!(predictive.len(), 500);

    let known = predictive.row(0);
    let unseen = predictive.row(1);
    assert_abs_diff_eq!(mean(&known), 29.0, epsilon = 2.0);
    assert!(sample_variance(&unseen, mean(&unseen)) > sample_variance(&known, mean(&known)));

    let table = model.posterior().rows();
    assert_eq!(table.len(), 800);
    assert!(table.iter().all(|row| row.chain < 2));
}
