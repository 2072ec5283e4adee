//! Bayesian fusion of two point distributions into a particle ensemble.
//!
//! The fused ensemble approximates the normalized product `p1 · p2` of the
//! two input densities. How that product is approximated is a
//! [`FusionStrategy`]:
//!
//! - [`FusionStrategy::ImportanceReweight`] keeps (or draws) samples from one
//!   input and multiplies each sample's weight by the other input's density at
//!   that point. Particle ensembles on the density side are turned into a
//!   Gaussian kernel density estimate first.
//! - [`FusionStrategy::MomentMatched`] replaces both inputs by Gaussians with
//!   the same first two moments and samples their exact product. Fast and
//!   smooth, but it throws away any multi-modality.
//!
//! Both strategies may prune hypotheses far from the dominant one when a
//! nonzero Mahalanobis threshold is given. Pruning is lossy: the result is
//! biased towards the dominant mode but stays compact.

use log::{debug, warn};
use nalgebra::linalg::Cholesky;
use nalgebra::{Matrix3, Point3, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::gaussian::{PointGaussian, gaussian_log_density};
use crate::linalg::{is_positive_definite, robust_inverse, symmetrize};
use crate::particle::{Particle, PointParticles};
use crate::pdf::{PdfError, PointDistribution, PointPdf};
use crate::sog::{PointSog, log_sum_exp};

/// Kernel covariance floor, relative to the largest ensemble variance. Keeps
/// planar (or otherwise flat) ensembles usable as densities.
const KERNEL_COVARIANCE_FLOOR: f64 = 1e-9;

/// How the product of the two input densities is approximated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    #[default]
    ImportanceReweight,
    MomentMatched,
}

impl FusionStrategy {
    /// Fuse `p1` and `p2` into a new ensemble. Log-weights of the result are
    /// shifted so the largest one is zero.
    pub fn fuse<R: Rng + ?Sized>(
        &self,
        p1: &PointPdf,
        p2: &PointPdf,
        config: &FusionConfig,
        rng: &mut R,
    ) -> Result<PointParticles, PdfError> {
        if p1.is_empty() || p2.is_empty() {
            return Err(PdfError::IncompatibleFusion(
                "cannot fuse an empty distribution".to_string(),
            ));
        }
        let particles = match self {
            FusionStrategy::ImportanceReweight => Self::importance_reweight(p1, p2, config, rng)?,
            FusionStrategy::MomentMatched => Self::moment_matched(p1, p2, config, rng)?,
        };
        let mut fused = PointParticles::from(particles);
        fused.normalize_weights();
        Ok(fused)
    }

    fn importance_reweight<R: Rng + ?Sized>(
        p1: &PointPdf,
        p2: &PointPdf,
        config: &FusionConfig,
        rng: &mut R,
    ) -> Result<Vec<Particle>, PdfError> {
        // Prefer an existing ensemble as the proposal so no sampling noise is added.
        let (proposal, other) = match (p1, p2) {
            (PointPdf::Particles(_), _) => (p1, p2),
            (_, PointPdf::Particles(_)) => (p2, p1),
            _ => (p1, p2),
        };
        // A side without a usable density (e.g. a point mass) can still be
        // sampled, so it becomes the proposal instead.
        let (proposal, other, likelihood) = match Likelihood::new(other) {
            Ok(likelihood) => (proposal, other, likelihood),
            Err(err) => match Likelihood::new(proposal) {
                Ok(likelihood) => {
                    debug!(
                        "{} input has no density, sampling it against the {} input instead",
                        other.kind(),
                        proposal.kind()
                    );
                    (other, proposal, likelihood)
                }
                Err(_) => return Err(err),
            },
        };
        let mut particles = match proposal {
            PointPdf::Particles(ensemble) => ensemble.particles().to_vec(),
            _ => sample_particles(proposal, config.num_samples, rng)?,
        };
        for particle in &mut particles {
            particle.log_weight += likelihood.log_density(&particle.position());
        }
        if particles.iter().any(|p| !p.log_weight.is_finite()) {
            return Err(PdfError::IncompatibleFusion(
                "fused weights are not finite".to_string(),
            ));
        }
        debug!(
            "importance reweight: {} proposal ({} particles) against {} density",
            proposal.kind(),
            particles.len(),
            other.kind()
        );
        if config.min_mahalanobis_dist_to_drop > 0.0 {
            let dominant = particles
                .iter()
                .max_by(|a, b| a.log_weight.total_cmp(&b.log_weight))
                .map(Particle::position)
                .unwrap_or_else(Vector3::zeros);
            let combined = p1.covariance() + p2.covariance();
            particles = prune(
                particles,
                &dominant,
                &combined,
                config.min_mahalanobis_dist_to_drop,
            );
        }
        Ok(particles)
    }

    fn moment_matched<R: Rng + ?Sized>(
        p1: &PointPdf,
        p2: &PointPdf,
        config: &FusionConfig,
        rng: &mut R,
    ) -> Result<Vec<Particle>, PdfError> {
        let a = p1.to_gaussian();
        let b = p2.to_gaussian();
        let product = PointGaussian::product(&a, &b).map_err(|_| {
            PdfError::IncompatibleFusion(
                "combined covariance of the inputs is singular".to_string(),
            )
        })?;
        let mut particles = sample_particles(&PointPdf::Gaussian(product), config.num_samples, rng)?;
        if config.min_mahalanobis_dist_to_drop > 0.0 {
            particles = prune(
                particles,
                &product.mean.coords,
                &(a.cov + b.cov),
                config.min_mahalanobis_dist_to_drop,
            );
        }
        Ok(particles)
    }
}

impl PointParticles {
    /// Replace this ensemble by the fusion of `p1` and `p2` as configured.
    /// Nothing changes when the fusion fails.
    pub fn bayesian_fusion_with<R: Rng + ?Sized>(
        &mut self,
        p1: &PointPdf,
        p2: &PointPdf,
        config: &FusionConfig,
        rng: &mut R,
    ) -> Result<(), PdfError> {
        let fused = config.strategy.fuse(p1, p2, config, rng)?;
        debug!(
            "{:?} fusion of {} and {} produced {} particles (ESS {:.1})",
            config.strategy,
            p1.kind(),
            p2.kind(),
            fused.len(),
            fused.effective_sample_size()
        );
        *self = fused;
        Ok(())
    }
}

/// Draw `count` uniformly weighted particles from any representation.
fn sample_particles<R: Rng + ?Sized>(
    pdf: &PointPdf,
    count: usize,
    rng: &mut R,
) -> Result<Vec<Particle>, PdfError> {
    if count == 0 {
        return Err(PdfError::IncompatibleFusion(
            "fusion needs a positive sample budget".to_string(),
        ));
    }
    (0..count)
        .map(|_| {
            pdf.draw_single_sample(rng)
                .map(|p| Particle::new(p.cast::<f32>(), 0.0))
        })
        .collect()
}

/// Keep the hypotheses within `threshold` Mahalanobis distance of `center`
/// under `combined`. The closest hypothesis always survives.
fn prune(
    particles: Vec<Particle>,
    center: &Vector3<f64>,
    combined: &Matrix3<f64>,
    threshold: f64,
) -> Vec<Particle> {
    let Some(precision) = robust_inverse(combined) else {
        warn!("combined covariance is singular, skipping Mahalanobis pruning");
        return particles;
    };
    let distances: Vec<f64> = particles
        .iter()
        .map(|p| {
            let d = p.position() - center;
            d.dot(&(precision * d)).max(0.0).sqrt()
        })
        .collect();
    let closest = distances.iter().cloned().fold(f64::INFINITY, f64::min);
    let before = particles.len();
    let kept: Vec<Particle> = particles
        .into_iter()
        .zip(&distances)
        .filter(|(_, d)| **d <= threshold || **d <= closest)
        .map(|(p, _)| p)
        .collect();
    debug!(
        "pruned {} of {} hypotheses beyond Mahalanobis distance {}",
        before - kept.len(),
        before,
        threshold
    );
    kept
}

/// Silverman's rule of thumb for a 3D Gaussian kernel: `(4 / (5n))^(1/7)`.
fn silverman_bandwidth(effective_count: f64) -> f64 {
    (4.0 / (5.0 * effective_count)).powf(1.0 / 7.0)
}

/// Gaussian kernel density estimate of a weighted particle ensemble.
struct KernelDensity {
    centers: Vec<Vector3<f64>>,
    log_weights: Vec<f64>,
    precision: Matrix3<f64>,
    log_normalizer: f64,
}

impl KernelDensity {
    fn new(ensemble: &PointParticles) -> Result<Self, PdfError> {
        if ensemble.len() < 2 {
            return Err(PdfError::IncompatibleFusion(
                "a particle density needs at least two particles".to_string(),
            ));
        }
        let (cov, _) = ensemble.covariance_and_mean();
        let scale = cov.diagonal().max();
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(PdfError::IncompatibleFusion(
                "particle ensemble has no spread to build a density from".to_string(),
            ));
        }
        let bandwidth = silverman_bandwidth(ensemble.effective_sample_size().max(1.0));
        let kernel = symmetrize(
            &(cov * (bandwidth * bandwidth)
                + Matrix3::identity() * (KERNEL_COVARIANCE_FLOOR * scale)),
        );
        let incompatible =
            || PdfError::IncompatibleFusion("kernel covariance is singular".to_string());
        let precision = Cholesky::new(kernel).ok_or_else(incompatible)?.inverse();
        let log_normalizer =
            gaussian_log_density(&Vector3::zeros(), &kernel).map_err(|_| incompatible())?;
        Ok(KernelDensity {
            centers: ensemble.iter().map(Particle::position).collect(),
            log_weights: ensemble.normalized_weights().iter().map(|w| w.ln()).collect(),
            precision,
            log_normalizer,
        })
    }

    fn log_density(&self, x: &Vector3<f64>) -> f64 {
        let terms: Vec<f64> = self
            .centers
            .iter()
            .zip(&self.log_weights)
            .map(|(center, lw)| {
                let d = x - center;
                lw - 0.5 * d.dot(&(self.precision * d))
            })
            .collect();
        log_sum_exp(&terms) + self.log_normalizer
    }
}

/// The density side of an importance reweighting.
enum Likelihood<'a> {
    Gaussian(&'a PointGaussian),
    Mixture(&'a PointSog),
    Kernel(KernelDensity),
}

impl<'a> Likelihood<'a> {
    fn new(pdf: &'a PointPdf) -> Result<Self, PdfError> {
        match pdf {
            PointPdf::Gaussian(gaussian) => {
                if !is_positive_definite(&gaussian.cov) {
                    return Err(PdfError::IncompatibleFusion(
                        "gaussian covariance is not positive definite".to_string(),
                    ));
                }
                Ok(Likelihood::Gaussian(gaussian))
            }
            PointPdf::Sog(sog) => {
                if !sog.modes.iter().all(|m| is_positive_definite(&m.gaussian.cov)) {
                    return Err(PdfError::IncompatibleFusion(
                        "mixture has a mode without a positive definite covariance".to_string(),
                    ));
                }
                Ok(Likelihood::Mixture(sog))
            }
            PointPdf::Particles(ensemble) => Ok(Likelihood::Kernel(KernelDensity::new(ensemble)?)),
        }
    }

    fn log_density(&self, x: &Vector3<f64>) -> f64 {
        let point = Point3::from(*x);
        match self {
            Likelihood::Gaussian(gaussian) => gaussian.log_pdf(&point).unwrap_or(f64::NEG_INFINITY),
            Likelihood::Mixture(sog) => sog.log_pdf(&point).unwrap_or(f64::NEG_INFINITY),
            Likelihood::Kernel(kde) => kde.log_density(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn gaussian(x: f64, var: f64) -> PointPdf {
        PointPdf::Gaussian(PointGaussian::new(
            Point3::new(x, 0.0, 0.0),
            Matrix3::identity() * var,
        ))
    }

    fn line_of_particles() -> PointParticles {
        (-2..=2)
            .map(|x| Particle::new(Point3::new(x as f32, 0.0, 0.0), 0.0))
            .collect()
    }

    fn config(strategy: FusionStrategy, num_samples: usize, min_dist: f64) -> FusionConfig {
        FusionConfig {
            strategy,
            num_samples,
            min_mahalanobis_dist_to_drop: min_dist,
            ..FusionConfig::default()
        }
    }

    #[test]
    fn silverman_bandwidth_shrinks_with_count() {
        assert!(silverman_bandwidth(10.0) > silverman_bandwidth(1000.0));
        assert_approx_eq!(silverman_bandwidth(0.8), 1.0, 1e-12);
    }

    #[test]
    fn importance_reweight_of_two_gaussians() {
        let mut rng = StdRng::seed_from_u64(21);
        let cfg = config(FusionStrategy::ImportanceReweight, 20_000, 0.0);
        let fused = FusionStrategy::ImportanceReweight
            .fuse(&gaussian(0.0, 1.0), &gaussian(2.0, 1.0), &cfg, &mut rng)
            .unwrap();
        assert_eq!(fused.len(), 20_000);
        let (cov, mean) = fused.covariance_and_mean();
        assert_approx_eq!(mean.x, 1.0, 0.05);
        assert_approx_eq!(mean.y, 0.0, 0.05);
        assert_approx_eq!(cov[(0, 0)], 0.5, 0.05);
        let max = fused.iter().map(|p| p.log_weight).fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(max, 0.0);
    }

    #[test]
    fn moment_matched_of_two_gaussians() {
        let mut rng = StdRng::seed_from_u64(22);
        let cfg = config(FusionStrategy::MomentMatched, 20_000, 0.0);
        let fused = FusionStrategy::MomentMatched
            .fuse(&gaussian(0.0, 1.0), &gaussian(2.0, 1.0), &cfg, &mut rng)
            .unwrap();
        let (cov, mean) = fused.covariance_and_mean();
        assert_approx_eq!(mean.x, 1.0, 0.03);
        assert_approx_eq!(cov[(1, 1)], 0.5, 0.03);
        assert!(fused.iter().all(|p| p.log_weight == 0.0));
    }

    #[test]
    fn particles_reweighted_by_gaussian() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = config(FusionStrategy::ImportanceReweight, 100, 0.0);
        let fused = FusionStrategy::ImportanceReweight
            .fuse(
                &PointPdf::Particles(line_of_particles()),
                &gaussian(1.0, 0.1),
                &cfg,
                &mut rng,
            )
            .unwrap();
        // The ensemble is reused as the proposal, not resampled.
        assert_eq!(fused.len(), 5);
        assert_eq!(fused.get_point(3), Some(Point3::new(1.0, 0.0, 0.0)));
        assert_eq!(fused.log_weight(3), Some(0.0));
        assert_approx_eq!(fused.mean().x, 1.0, 1e-2);
    }

    #[test]
    fn particle_proposal_is_found_in_either_slot() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = config(FusionStrategy::ImportanceReweight, 100, 0.0);
        let fused = FusionStrategy::ImportanceReweight
            .fuse(
                &gaussian(1.0, 0.1),
                &PointPdf::Particles(line_of_particles()),
                &cfg,
                &mut rng,
            )
            .unwrap();
        assert_eq!(fused.len(), 5);
    }

    #[test]
    fn pruning_drops_distant_particles() {
        let mut rng = StdRng::seed_from_u64(1);
        // combined variance along x: 2 (ensemble) + 0.1 (gaussian)
        let cfg = config(FusionStrategy::ImportanceReweight, 100, 1.0);
        let fused = FusionStrategy::ImportanceReweight
            .fuse(
                &PointPdf::Particles(line_of_particles()),
                &gaussian(1.0, 0.1),
                &cfg,
                &mut rng,
            )
            .unwrap();
        let xs: Vec<f32> = fused.iter().map(|p| p.point.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn moment_matched_pruning_keeps_something() {
        let mut rng = StdRng::seed_from_u64(8);
        let cfg = config(FusionStrategy::MomentMatched, 500, 1e-6);
        let fused = FusionStrategy::MomentMatched
            .fuse(&gaussian(0.0, 1.0), &gaussian(0.0, 1.0), &cfg, &mut rng)
            .unwrap();
        assert!(!fused.is_empty());
        assert!(fused.len() < 500);
    }

    #[test]
    fn particles_fused_with_particles() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut left = PointParticles::new(2000);
        left.copy_from(&gaussian(0.0, 1.0), &mut rng).unwrap();
        let mut right = PointParticles::new(2000);
        right.copy_from(&gaussian(2.0, 1.0), &mut rng).unwrap();
        let cfg = config(FusionStrategy::ImportanceReweight, 100, 0.0);
        let fused = FusionStrategy::ImportanceReweight
            .fuse(
                &PointPdf::Particles(left),
                &PointPdf::Particles(right),
                &cfg,
                &mut rng,
            )
            .unwrap();
        assert_eq!(fused.len(), 2000);
        let mean = fused.mean();
        assert!(mean.x > 0.7 && mean.x < 1.2, "fused mean {mean}");
    }

    #[test]
    fn empty_inputs_are_incompatible() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = FusionConfig::default();
        for strategy in [FusionStrategy::ImportanceReweight, FusionStrategy::MomentMatched] {
            let result = strategy.fuse(
                &PointPdf::Particles(PointParticles::new(0)),
                &gaussian(0.0, 1.0),
                &cfg,
                &mut rng,
            );
            assert!(matches!(result, Err(PdfError::IncompatibleFusion(_))));
        }
    }

    #[test]
    fn point_mass_fuses_in_either_order() {
        let cfg = config(FusionStrategy::ImportanceReweight, 200, 0.0);
        let point_mass = PointPdf::Gaussian(PointGaussian::new(
            Point3::new(1.0, 2.0, 3.0),
            Matrix3::zeros(),
        ));
        let broad = gaussian(0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(31);
        let forward = FusionStrategy::ImportanceReweight
            .fuse(&point_mass, &broad, &cfg, &mut rng)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(31);
        let backward = FusionStrategy::ImportanceReweight
            .fuse(&broad, &point_mass, &cfg, &mut rng)
            .unwrap();
        for fused in [&forward, &backward] {
            let mean = fused.mean();
            assert_approx_eq!(mean.x, 1.0, 1e-6);
            assert_approx_eq!(mean.y, 2.0, 1e-6);
            assert_approx_eq!(mean.z, 3.0, 1e-6);
        }
        assert!((forward.mean() - backward.mean()).norm() < 1e-9);
    }

    #[test]
    fn particles_fused_with_point_mass_in_either_order() {
        let mut rng = StdRng::seed_from_u64(32);
        let cfg = config(FusionStrategy::ImportanceReweight, 50, 0.0);
        let point_mass = PointPdf::Gaussian(PointGaussian::new(
            Point3::new(0.5, 0.0, 0.0),
            Matrix3::zeros(),
        ));
        let ensemble = PointPdf::Particles(line_of_particles());
        for (p1, p2) in [(&ensemble, &point_mass), (&point_mass, &ensemble)] {
            let fused = FusionStrategy::ImportanceReweight
                .fuse(p1, p2, &cfg, &mut rng)
                .unwrap();
            assert_eq!(fused.len(), 50);
            assert!(fused.iter().all(|p| p.point == Point3::new(0.5, 0.0, 0.0)));
        }
    }

    #[test]
    fn collapsed_ensemble_acts_as_a_point_mass() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = FusionConfig::default();
        let mut collapsed = PointParticles::new(0);
        collapsed.set_size(3, Point3::new(1.0, 0.0, 0.0));
        let fused = FusionStrategy::ImportanceReweight
            .fuse(
                &PointPdf::Particles(line_of_particles()),
                &PointPdf::Particles(collapsed),
                &cfg,
                &mut rng,
            )
            .unwrap();
        assert_eq!(fused.len(), 3);
        assert!(fused.iter().all(|p| p.point == Point3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn degenerate_densities_are_incompatible() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = FusionConfig::default();
        let strategy = FusionStrategy::ImportanceReweight;
        // neither side can be evaluated as a density
        let point_mass = PointPdf::Gaussian(PointGaussian::default());
        let mut collapsed = PointParticles::new(0);
        collapsed.set_size(3, Point3::new(1.0, 1.0, 1.0));
        let collapsed = PointPdf::Particles(collapsed);
        for (p1, p2) in [
            (&point_mass, &point_mass),
            (&collapsed, &point_mass),
            (&point_mass, &collapsed),
            (&collapsed, &collapsed),
        ] {
            let result = strategy.fuse(p1, p2, &cfg, &mut rng);
            assert!(matches!(result, Err(PdfError::IncompatibleFusion(_))));
        }
    }

    #[test]
    fn zero_sample_budget_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = config(FusionStrategy::MomentMatched, 0, 0.0);
        let result = FusionStrategy::MomentMatched.fuse(
            &gaussian(0.0, 1.0),
            &gaussian(1.0, 1.0),
            &cfg,
            &mut rng,
        );
        assert!(matches!(result, Err(PdfError::IncompatibleFusion(_))));
    }

    #[test]
    fn failed_fusion_leaves_target_untouched() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut target = line_of_particles();
        let before = target.clone();
        let result = target.bayesian_fusion(
            &PointPdf::Particles(PointParticles::new(0)),
            &gaussian(0.0, 1.0),
            0.0,
            &mut rng,
        );
        assert!(result.is_err());
        assert_eq!(target, before);
    }

    #[test]
    fn fusion_is_deterministic_for_a_seed() {
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut target = PointParticles::default();
            target
                .bayesian_fusion(&gaussian(0.0, 1.0), &gaussian(1.0, 2.0), 0.0, &mut rng)
                .unwrap();
            target
        };
        assert_eq!(run(3), run(3));
    }
}
