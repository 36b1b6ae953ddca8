//! Log-space intensity models.

/// Log-space mean and variance of a class whose raw intensities follow a
/// normal distribution with mean `mu` and standard deviation `sigma`.
///
/// The expectation of `log(i + 1)` is taken over the grey values
/// `i = 0..sequence_max`, each weighted by its normal density. Returns
/// `None` when the weights vanish (for instance `sigma <= 0`).
pub fn log_gaussian_from_intensity(mu: f64, sigma: f64, sequence_max: usize) -> Option<(f64, f64)> {
    if !(sigma > 0.0) || sequence_max == 0 {
        return None;
    }
    let inv_sigma = 1.0 / sigma;
    let norm = inv_sigma / (2.0 * std::f64::consts::PI).sqrt();
    let samples: Vec<(f64, f64)> = (0..sequence_max)
        .map(|i| {
            let t = (i as f64 - mu) * inv_sigma;
            (norm * (-0.5 * t * t).exp(), ((i + 1) as f64).ln())
        })
        .collect();
    let mass: f64 = samples.iter().map(|(p, _)| p).sum();
    if !(mass > 0.0) {
        return None;
    }
    let log_mean = samples.iter().map(|(p, l)| p * l).sum::<f64>() / mass;
    let log_variance = samples
        .iter()
        .map(|(p, l)| p * (l - log_mean) * (l - log_mean))
        .sum::<f64>()
        / mass;
    Some((log_mean, log_variance))
}
