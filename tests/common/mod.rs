#![allow(dead_code)]

use hierarchical_models::Dataset;
use hierarchical_models::utils::sample_standard_normal;
use rand::SeedableRng;
use rand::rngs::StdRng;

pub const COUNTY_OFFSETS: [f64; 8] = [-9.0, -6.0, -3.5, -1.0, 1.0, 3.5, 6.0, 9.0];

pub fn county_label(index: usize) -> String {
    format!("county_{index}")
}

/// `20 + offset[g] + 4 * age + noise` with `noise` of standard deviation `noise_sd`.
///
/// With `residualize`, noise is made orthogonal to the county indicators and to
/// `age` within each county, so the least-squares estimates equal the generating
/// values exactly. Recovery checks on such data test the sampler and priors, not
/// sampling variability of the data.
pub fn bounce_times(per_county: usize, noise_sd: f64, residualize: bool, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut response = Vec::new();
    let mut age = Vec::new();
    let mut labels = Vec::new();
    for (county, offset) in COUNTY_OFFSETS.iter().enumerate() {
        let x = (0..per_county)
            .map(|_| sample_standard_normal(&mut rng))
            .collect::<Vec<_>>();
        let mut noise = (0..per_county)
            .map(|_| noise_sd * sample_standard_normal(&mut rng))
            .collect::<Vec<_>>();
        if residualize {
            noise = within_group_residuals(&x, &noise);
        }
        for (xi, ei) in x.iter().zip(&noise) {
            response.push(20.0 + offset + 4.0 * xi + ei);
            age.push(*xi);
            labels.push(county_label(county));
        }
    }
    Dataset::new(response, vec![("age".to_string(), age)], "county", &labels)
        .expect("synthetic dataset should validate")
}

fn within_group_residuals(x: &[f64], e: &[f64]) -> Vec<f64> {
    let n = f64::from(u32::try_from(x.len()).expect("group size fits in u32"));
    let x_mean = x.iter().sum::<f64>() / n;
    let e_mean = e.iter().sum::<f64>() / n;
    let sxx = x.iter().map(|xi| (xi - x_mean).powi(2)).sum::<f64>();
    let sxe = x
        .iter()
        .zip(e)
        .map(|(xi, ei)| (xi - x_mean) * (ei - e_mean))
        .sum::<f64>();
    let slope = sxe / sxx;
    x.iter()
        .zip(e)
        .map(|(xi, ei)| ei - e_mean - slope * (xi - x_mean))
        .collect()
}
