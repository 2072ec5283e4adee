//! Weighted moments of a particle ensemble.
//!
//! Every estimator here goes through [`normalize_log_weights`] so the mean,
//! covariance and kurtosis of one ensemble are always computed against the same
//! set of linear weights. The normalization subtracts the largest log-weight
//! before exponentiating, which keeps ensembles with log-weights around `-1e4`
//! (or `+1e4`) from under/overflowing.

use log::warn;
use nalgebra::{Matrix3, Point3, Vector3};

use crate::particle::Particle;

/// Variances below this are treated as zero when forming kurtosis ratios.
const VARIANCE_EPSILON: f64 = 1e-15;

/// Convert log-weights into linear weights that sum to one.
///
/// Empty input returns an empty vector. If the weights cannot be normalized
/// (non-finite maximum, or a non-finite/zero sum after exponentiation) the
/// result falls back to uniform weights.
pub fn normalize_log_weights(log_weights: &[f64]) -> Vec<f64> {
    let n = log_weights.len();
    if n == 0 {
        return Vec::new();
    }
    let max_log_weight = log_weights
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_log_weight.is_finite() {
        warn!("non-finite maximum log-weight ({max_log_weight}), using uniform weights");
        return vec![1.0 / n as f64; n];
    }
    let mut weights: Vec<f64> = log_weights
        .iter()
        .map(|lw| (lw - max_log_weight).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for w in &mut weights {
            *w /= sum;
        }
        weights
    } else {
        warn!("degenerate weight sum ({sum}), using uniform weights");
        vec![1.0 / n as f64; n]
    }
}

/// Normalized linear weights of a particle slice.
pub fn particle_weights(particles: &[Particle]) -> Vec<f64> {
    let log_weights: Vec<f64> = particles.iter().map(|p| p.log_weight).collect();
    normalize_log_weights(&log_weights)
}

fn weighted_mean(particles: &[Particle], weights: &[f64]) -> Point3<f64> {
    let mut mean = Vector3::<f64>::zeros();
    for (particle, &w) in particles.iter().zip(weights) {
        mean += w * particle.position();
    }
    Point3::from(mean)
}

/// Weighted mean of the ensemble. An empty ensemble yields the origin.
pub fn mean(particles: &[Particle]) -> Point3<f64> {
    let weights = particle_weights(particles);
    weighted_mean(particles, &weights)
}

/// Weighted covariance and mean, both from a single normalization pass.
///
/// Only the upper triangle is accumulated; the lower one is mirrored so the
/// result is exactly symmetric.
pub fn covariance_and_mean(particles: &[Particle]) -> (Matrix3<f64>, Point3<f64>) {
    let weights = particle_weights(particles);
    let mean = weighted_mean(particles, &weights);
    let mut cov = Matrix3::<f64>::zeros();
    for (particle, &w) in particles.iter().zip(&weights) {
        let d = particle.position() - mean.coords;
        for r in 0..3 {
            for c in r..3 {
                cov[(r, c)] += w * d[r] * d[c];
            }
        }
    }
    for r in 1..3 {
        for c in 0..r {
            cov[(r, c)] = cov[(c, r)];
        }
    }
    (cov, mean)
}

/// Per-axis Pearson kurtosis `m4 / m2²` (3 for a Gaussian, not the excess form).
///
/// Axes without spread report 0.
pub fn kurtosis_per_axis(particles: &[Particle]) -> Vector3<f64> {
    let weights = particle_weights(particles);
    let mean = weighted_mean(particles, &weights);
    let mut m2 = Vector3::<f64>::zeros();
    let mut m4 = Vector3::<f64>::zeros();
    for (particle, &w) in particles.iter().zip(&weights) {
        let d = particle.position() - mean.coords;
        let d2 = d.component_mul(&d);
        m2 += w * d2;
        m4 += w * d2.component_mul(&d2);
    }
    Vector3::from_fn(|i, _| {
        if m2[i] > VARIANCE_EPSILON {
            m4[i] / (m2[i] * m2[i])
        } else {
            0.0
        }
    })
}

/// Kurtosis of the sharpest axis, i.e. the largest per-axis value.
pub fn kurtosis(particles: &[Particle]) -> f64 {
    if particles.is_empty() {
        return 0.0;
    }
    kurtosis_per_axis(particles).max()
}

/// Effective sample size `1 / Σ wᵢ²` over the normalized weights.
pub fn effective_sample_size(particles: &[Particle]) -> f64 {
    let sum_of_squares: f64 = particle_weights(particles).iter().map(|w| w * w).sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}
