//! Sum-of-Gaussians (mixture) distribution of a 3D point.
//!
//! Mode weights are stored as log-weights and normalized the same way particle
//! weights are, so a mixture and a particle ensemble built from the same
//! weights report identical moments.

use log::debug;
use nalgebra::{Isometry3, Matrix3, Point3, Vector3};
use rand::Rng;

use crate::gaussian::PointGaussian;
use crate::linalg::{mahalanobis_distance, symmetrize};
use crate::particle::{cumulative_weights, select_index};
use crate::pdf::{PdfError, PointDistribution, PointPdf};
use crate::stats::normalize_log_weights;

/// One weighted component of a mixture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SogMode {
    pub log_weight: f64,
    pub gaussian: PointGaussian,
}
impl SogMode {
    pub fn new(log_weight: f64, gaussian: PointGaussian) -> Self {
        SogMode {
            log_weight,
            gaussian,
        }
    }
}

/// A mixture of Gaussian point distributions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointSog {
    pub modes: Vec<SogMode>,
}

impl PointSog {
    pub fn new(modes: Vec<SogMode>) -> Self {
        PointSog { modes }
    }
    pub fn len(&self) -> usize {
        self.modes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
    pub fn push(&mut self, log_weight: f64, gaussian: PointGaussian) {
        self.modes.push(SogMode::new(log_weight, gaussian));
    }
    /// Linear mode weights that sum to one.
    pub fn normalized_weights(&self) -> Vec<f64> {
        let log_weights: Vec<f64> = self.modes.iter().map(|m| m.log_weight).collect();
        normalize_log_weights(&log_weights)
    }
    /// Shift log-weights so the largest is zero; returns the previous maximum.
    pub fn normalize_weights(&mut self) -> f64 {
        let max_log_weight = self
            .modes
            .iter()
            .map(|m| m.log_weight)
            .fold(f64::NEG_INFINITY, f64::max);
        if max_log_weight.is_finite() {
            for mode in &mut self.modes {
                mode.log_weight -= max_log_weight;
            }
        }
        max_log_weight
    }
    /// Natural log of the mixture density at `point` (log-sum-exp over modes).
    pub fn log_pdf(&self, point: &Point3<f64>) -> Result<f64, PdfError> {
        if self.modes.is_empty() {
            return Err(PdfError::EmptyDistribution);
        }
        let weights = self.normalized_weights();
        let terms = self
            .modes
            .iter()
            .zip(&weights)
            .map(|(mode, w)| Ok(w.ln() + mode.gaussian.log_pdf(point)?))
            .collect::<Result<Vec<f64>, PdfError>>()?;
        Ok(log_sum_exp(&terms))
    }

    /// Product of two mixtures: every pair of modes yields one product mode
    /// weighted by `wa · wb · N(μa; μb, Σa + Σb)`.
    ///
    /// With a nonzero `min_mahalanobis_dist_to_drop`, pairs whose means are
    /// further apart than that (under `Σa + Σb`) are dropped, except the
    /// closest pair which is always kept. Dropping biases the result slightly
    /// towards the dominant modes in exchange for fewer output modes.
    pub fn fuse_mixtures(
        a: &PointSog,
        b: &PointSog,
        min_mahalanobis_dist_to_drop: f64,
    ) -> Result<PointSog, PdfError> {
        if a.is_empty() || b.is_empty() {
            return Err(PdfError::IncompatibleFusion(
                "cannot fuse an empty mixture".to_string(),
            ));
        }
        let mut candidates = Vec::with_capacity(a.len() * b.len());
        for ma in &a.modes {
            for mb in &b.modes {
                let combined = ma.gaussian.cov + mb.gaussian.cov;
                let delta = ma.gaussian.mean - mb.gaussian.mean;
                let distance = mahalanobis_distance(&delta, &combined).ok_or_else(|| {
                    PdfError::IncompatibleFusion("mode pair has a singular covariance".to_string())
                })?;
                candidates.push((distance, ma, mb));
            }
        }
        let closest = candidates
            .iter()
            .map(|(d, _, _)| *d)
            .fold(f64::INFINITY, f64::min);
        let mut fused = PointSog::default();
        let mut dropped = 0usize;
        for (distance, ma, mb) in candidates {
            if min_mahalanobis_dist_to_drop > 0.0
                && distance > min_mahalanobis_dist_to_drop
                && distance > closest
            {
                dropped += 1;
                continue;
            }
            let singular = |_| {
                PdfError::IncompatibleFusion("mode pair has a singular covariance".to_string())
            };
            let gaussian = PointGaussian::product(&ma.gaussian, &mb.gaussian).map_err(singular)?;
            let log_scale =
                PointGaussian::product_log_scale(&ma.gaussian, &mb.gaussian).map_err(singular)?;
            fused.push(ma.log_weight + mb.log_weight + log_scale, gaussian);
        }
        debug!(
            "fused {}x{} mixture modes into {} ({} dropped)",
            a.len(),
            b.len(),
            fused.len(),
            dropped
        );
        fused.normalize_weights();
        Ok(fused)
    }

    /// Mixture view of any representation: a mixture stays as is, anything
    /// else becomes a single moment-matched mode.
    pub fn from_pdf(pdf: &PointPdf) -> PointSog {
        match pdf {
            PointPdf::Sog(sog) => sog.clone(),
            PointPdf::Gaussian(gaussian) => PointSog::new(vec![SogMode::new(0.0, *gaussian)]),
            PointPdf::Particles(particles) if particles.is_empty() => PointSog::default(),
            PointPdf::Particles(_) => PointSog::new(vec![SogMode::new(0.0, pdf.to_gaussian())]),
        }
    }
}

/// `ln Σ exp(xᵢ)` without overflow.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

impl PointDistribution for PointSog {
    fn mean(&self) -> Point3<f64> {
        let weights = self.normalized_weights();
        let mut mean = Vector3::<f64>::zeros();
        for (mode, w) in self.modes.iter().zip(&weights) {
            mean += *w * mode.gaussian.mean.coords;
        }
        Point3::from(mean)
    }
    /// Law of total covariance: `Σ wᵢ (Σᵢ + (μᵢ - μ)(μᵢ - μ)ᵀ)`.
    fn covariance_and_mean(&self) -> (Matrix3<f64>, Point3<f64>) {
        let weights = self.normalized_weights();
        let mean = self.mean();
        let mut cov = Matrix3::<f64>::zeros();
        for (mode, w) in self.modes.iter().zip(&weights) {
            let d = mode.gaussian.mean - mean;
            cov += *w * (mode.gaussian.cov + d * d.transpose());
        }
        (symmetrize(&cov), mean)
    }
    fn draw_single_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Point3<f64>, PdfError> {
        if self.modes.is_empty() {
            return Err(PdfError::EmptyDistribution);
        }
        let cumulative = cumulative_weights(&self.normalized_weights());
        let index = select_index(&cumulative, rng.random::<f64>());
        self.modes[index].gaussian.draw_single_sample(rng)
    }
    fn change_coordinates_reference(&mut self, new_reference_base: &Isometry3<f64>) {
        for mode in &mut self.modes {
            mode.gaussian.change_coordinates_reference(new_reference_base);
        }
    }
    fn copy_from<R: Rng + ?Sized>(&mut self, other: &PointPdf, _rng: &mut R) -> Result<(), PdfError> {
        if other.is_empty() {
            return Err(PdfError::EmptyDistribution);
        }
        *self = PointSog::from_pdf(other);
        Ok(())
    }
    fn bayesian_fusion<R: Rng + ?Sized>(
        &mut self,
        p1: &PointPdf,
        p2: &PointPdf,
        min_mahalanobis_dist_to_drop: f64,
        _rng: &mut R,
    ) -> Result<(), PdfError> {
        *self = PointSog::fuse_mixtures(
            &PointSog::from_pdf(p1),
            &PointSog::from_pdf(p2),
            min_mahalanobis_dist_to_drop,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn mode(log_weight: f64, x: f64, var: f64) -> SogMode {
        SogMode::new(
            log_weight,
            PointGaussian::new(Point3::new(x, 0.0, 0.0), Matrix3::identity() * var),
        )
    }

    #[test]
    fn mixture_moments() {
        let sog = PointSog::new(vec![mode(0.0, -1.0, 1.0), mode(0.0, 1.0, 1.0)]);
        let (cov, mean) = sog.covariance_and_mean();
        assert_approx_eq!(mean.x, 0.0, 1e-12);
        // 1 (within) + 1 (between)
        assert_approx_eq!(cov[(0, 0)], 2.0, 1e-12);
        assert_approx_eq!(cov[(1, 1)], 1.0, 1e-12);
    }

    #[test]
    fn log_pdf_of_single_mode_matches_gaussian() {
        let m = mode(-3.0, 0.5, 2.0);
        let sog = PointSog::new(vec![m]);
        let p = Point3::new(1.0, 1.0, -1.0);
        assert_approx_eq!(
            sog.log_pdf(&p).unwrap(),
            m.gaussian.log_pdf(&p).unwrap(),
            1e-12
        );
        assert!(PointSog::default().log_pdf(&p).is_err());
    }

    #[test]
    fn log_sum_exp_is_stable() {
        assert_approx_eq!(log_sum_exp(&[1000.0, 1000.0]), 1000.0 + 2.0_f64.ln(), 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn fusing_single_modes_is_gaussian_product() {
        let a = PointSog::new(vec![mode(0.0, 0.0, 2.0)]);
        let b = PointSog::new(vec![mode(0.0, 2.0, 2.0)]);
        let fused = PointSog::fuse_mixtures(&a, &b, 0.0).unwrap();
        assert_eq!(fused.len(), 1);
        assert_approx_eq!(fused.modes[0].gaussian.mean.x, 1.0, 1e-12);
        assert_eq!(fused.modes[0].log_weight, 0.0);
    }

    #[test]
    fn distant_mode_pairs_are_dropped() {
        let a = PointSog::new(vec![mode(0.0, 0.0, 1.0), mode(0.0, 100.0, 1.0)]);
        let b = PointSog::new(vec![mode(0.0, 0.5, 1.0)]);
        let kept = PointSog::fuse_mixtures(&a, &b, 0.0).unwrap();
        assert_eq!(kept.len(), 2);
        let pruned = PointSog::fuse_mixtures(&a, &b, 3.0).unwrap();
        assert_eq!(pruned.len(), 1);
        assert_approx_eq!(pruned.modes[0].gaussian.mean.x, 0.25, 1e-12);
    }

    #[test]
    fn closest_pair_survives_aggressive_threshold() {
        let a = PointSog::new(vec![mode(0.0, 0.0, 1.0)]);
        let b = PointSog::new(vec![mode(0.0, 50.0, 1.0)]);
        let fused = PointSog::fuse_mixtures(&a, &b, 1.0).unwrap();
        assert_eq!(fused.len(), 1);
    }

    #[test]
    fn sampling_picks_modes_by_weight() {
        let sog = PointSog::new(vec![mode(0.0, -10.0, 0.01), mode(-40.0, 10.0, 0.01)]);
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..100 {
            assert!(sog.draw_single_sample(&mut rng).unwrap().x < 0.0);
        }
        assert!(PointSog::default().draw_single_sample(&mut rng).is_err());
    }

    #[test]
    fn from_pdf_moment_matches_particles() {
        let mut particles = crate::particle::PointParticles::new(2);
        particles.set_point(0, Point3::new(-2.0, 0.0, 0.0));
        particles.set_point(1, Point3::new(2.0, 0.0, 0.0));
        let sog = PointSog::from_pdf(&PointPdf::Particles(particles));
        assert_eq!(sog.len(), 1);
        assert_approx_eq!(sog.modes[0].gaussian.cov[(0, 0)], 4.0, 1e-12);
    }
}
