use hierarchical_models::utils::{mean, sample_standard_normal};
use hierarchical_models::{
    Dataset, LooOptions, ModelSpec, PredictiveOptions, SamplerConfig, SamplingControl,
    compare_models, fit_model, render_comparison_table, render_posterior_summary,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

const COUNTY_OFFSETS: [f64; 8] = [-9.0, -6.0, -3.5, -1.0, 1.0, 3.5, 6.0, 9.0];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dataset = build_bounce_times(20, 2_026)?;
    let config = SamplerConfig {
        warmup_iterations: 500,
        sampling_iterations: 500,
        num_chains: 2,
        seed: 2_026,
        ..SamplerConfig::default()
    };
    let control = SamplingControl::new();

    let specs = [
        ModelSpec::pooled("pooled", "county", &["age"]),
        ModelSpec::varying_intercept("county_intercept", "county", &["age"]),
        ModelSpec::varying_intercept_and_slope("county_intercept_slope", "county", &[], "age"),
    ];

    let mut fits = Vec::new();
    for spec in specs {
        let spec = spec.with_default_priors(&dataset);
        let model = fit_model(&dataset, &spec, config, &control)?;
        let report = model.report();
        println!(
            "\n{}: {} draws, {} divergences, converged={}",
            report.model_name,
            model.posterior().len(),
            report.divergences,
            report.is_converged()
        );
        println!("{}", render_posterior_summary(&model.summary()));

        let check = model.posterior_predictive_check(&PredictiveOptions::default(), mean)?;
        println!(
            "Posterior predictive mean: observed={:.2}, p-value={:.2}",
            check.observed, check.p_value
        );

        let loo = model.loo(&LooOptions::default())?;
        println!(
            "elpd_loo={:.2} (se {:.2}), p_loo={:.2}, Pareto k > 0.7: {}",
            loo.elpd_loo, loo.se_elpd_loo, loo.p_loo, loo.k_counts.bad
        );
        fits.push((spec.name().to_string(), loo));
    }

    let entries = fits
        .iter()
        .map(|(name, loo)| (name.as_str(), loo))
        .collect::<Vec<_>>();
    let table = compare_models(&entries)?;
    println!(
        "\nModel comparison (higher elpd is better)\n\n{}",
        render_comparison_table(&table)
    );
    Ok(())
}

/// Bounce times for `per_county` visitors in each county:
/// `20 + offset[county] + 4 * age + N(0, 5)`, with `age` standardized.
fn build_bounce_times(per_county: usize, seed: u64) -> Result<Dataset, Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut response = Vec::new();
    let mut age = Vec::new();
    let mut counties = Vec::new();
    for (county, offset) in COUNTY_OFFSETS.iter().enumerate() {
        for _ in 0..per_county {
            let x = sample_standard_normal(&mut rng);
            response.push(20.0 + offset + 4.0 * x + 5.0 * sample_standard_normal(&mut rng));
            age.push(x);
            counties.push(format!("county_{county}"));
        }
    }
    Ok(Dataset::new(
        response,
        vec![("age".to_string(), age)],
        "county",
        &counties,
    )?)
}
