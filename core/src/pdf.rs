//! Point distribution capability shared by every representation.
//!
//! The closed set of representations is [`PointPdf`]: a single Gaussian, a
//! sum of Gaussians, or a particle ensemble. Code that only needs moments or
//! samples works against [`PointDistribution`]; code that needs to know the
//! representation (copying, fusion, serialization) matches on the enum.

use nalgebra::{Isometry3, Matrix3, Point3};
use rand::Rng;
use thiserror::Error;

use crate::gaussian::PointGaussian;
use crate::particle::PointParticles;
use crate::sog::PointSog;

/// Precondition failures of distribution operations. None of them leave the
/// target distribution modified.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PdfError {
    #[error("the distribution is empty")]
    EmptyDistribution,
    #[error("cannot fuse these distributions: {0}")]
    IncompatibleFusion(String),
    #[error("covariance matrix is not positive definite")]
    SingularCovariance,
}

/// Operations every point distribution representation supports.
pub trait PointDistribution {
    /// Mathematical expectation of the point.
    fn mean(&self) -> Point3<f64>;
    /// 3×3 covariance together with the mean, computed in one pass.
    fn covariance_and_mean(&self) -> (Matrix3<f64>, Point3<f64>);
    fn covariance(&self) -> Matrix3<f64> {
        self.covariance_and_mean().0
    }
    /// Draw one point using the caller's random source.
    fn draw_single_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Point3<f64>, PdfError>;
    /// `this = new_reference_base ⊕ this`: re-express the distribution in the
    /// frame in which `new_reference_base` is given.
    fn change_coordinates_reference(&mut self, new_reference_base: &Isometry3<f64>);
    /// Replace this distribution with an equivalent one derived from `other`,
    /// converting representations when needed.
    fn copy_from<R: Rng + ?Sized>(&mut self, other: &PointPdf, rng: &mut R) -> Result<(), PdfError>;
    /// Store the (approximate) normalized product of `p1` and `p2` in `self`.
    ///
    /// A nonzero `min_mahalanobis_dist_to_drop` discards hypotheses that are
    /// further than that from the dominant one. This is lossy.
    fn bayesian_fusion<R: Rng + ?Sized>(
        &mut self,
        p1: &PointPdf,
        p2: &PointPdf,
        min_mahalanobis_dist_to_drop: f64,
        rng: &mut R,
    ) -> Result<(), PdfError>;
}

/// Any point distribution representation.
#[derive(Clone, Debug, PartialEq)]
pub enum PointPdf {
    Gaussian(PointGaussian),
    Sog(PointSog),
    Particles(PointParticles),
}
impl From<PointGaussian> for PointPdf {
    fn from(value: PointGaussian) -> Self {
        PointPdf::Gaussian(value)
    }
}
impl From<PointSog> for PointPdf {
    fn from(value: PointSog) -> Self {
        PointPdf::Sog(value)
    }
}
impl From<PointParticles> for PointPdf {
    fn from(value: PointParticles) -> Self {
        PointPdf::Particles(value)
    }
}

impl PointPdf {
    /// Short representation name, used in log messages and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            PointPdf::Gaussian(_) => "gaussian",
            PointPdf::Sog(_) => "sum-of-gaussians",
            PointPdf::Particles(_) => "particles",
        }
    }
    /// True when the distribution has no mass to sample from.
    pub fn is_empty(&self) -> bool {
        match self {
            PointPdf::Gaussian(_) => false,
            PointPdf::Sog(sog) => sog.is_empty(),
            PointPdf::Particles(particles) => particles.is_empty(),
        }
    }
    pub fn as_particles(&self) -> Option<&PointParticles> {
        match self {
            PointPdf::Particles(particles) => Some(particles),
            _ => None,
        }
    }
    /// Moment-matched Gaussian of any representation.
    pub fn to_gaussian(&self) -> PointGaussian {
        let (cov, mean) = self.covariance_and_mean();
        PointGaussian::new(mean, cov)
    }
}

impl PointDistribution for PointPdf {
    fn mean(&self) -> Point3<f64> {
        match self {
            PointPdf::Gaussian(pdf) => pdf.mean(),
            PointPdf::Sog(pdf) => pdf.mean(),
            PointPdf::Particles(pdf) => pdf.mean(),
        }
    }
    fn covariance_and_mean(&self) -> (Matrix3<f64>, Point3<f64>) {
        match self {
            PointPdf::Gaussian(pdf) => pdf.covariance_and_mean(),
            PointPdf::Sog(pdf) => pdf.covariance_and_mean(),
            PointPdf::Particles(pdf) => pdf.covariance_and_mean(),
        }
    }
    fn draw_single_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Point3<f64>, PdfError> {
        match self {
            PointPdf::Gaussian(pdf) => pdf.draw_single_sample(rng),
            PointPdf::Sog(pdf) => pdf.draw_single_sample(rng),
            PointPdf::Particles(pdf) => pdf.draw_single_sample(rng),
        }
    }
    fn change_coordinates_reference(&mut self, new_reference_base: &Isometry3<f64>) {
        match self {
            PointPdf::Gaussian(pdf) => pdf.change_coordinates_reference(new_reference_base),
            PointPdf::Sog(pdf) => pdf.change_coordinates_reference(new_reference_base),
            PointPdf::Particles(pdf) => pdf.change_coordinates_reference(new_reference_base),
        }
    }
    fn copy_from<R: Rng + ?Sized>(&mut self, other: &PointPdf, rng: &mut R) -> Result<(), PdfError> {
        match self {
            PointPdf::Gaussian(pdf) => pdf.copy_from(other, rng),
            PointPdf::Sog(pdf) => pdf.copy_from(other, rng),
            PointPdf::Particles(pdf) => pdf.copy_from(other, rng),
        }
    }
    fn bayesian_fusion<R: Rng + ?Sized>(
        &mut self,
        p1: &PointPdf,
        p2: &PointPdf,
        min_mahalanobis_dist_to_drop: f64,
        rng: &mut R,
    ) -> Result<(), PdfError> {
        match self {
            PointPdf::Gaussian(pdf) => pdf.bayesian_fusion(p1, p2, min_mahalanobis_dist_to_drop, rng),
            PointPdf::Sog(pdf) => pdf.bayesian_fusion(p1, p2, min_mahalanobis_dist_to_drop, rng),
            PointPdf::Particles(pdf) => {
                pdf.bayesian_fusion(p1, p2, min_mahalanobis_dist_to_drop, rng)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sog::SogMode;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{Translation3, Vector3};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample_variants() -> Vec<PointPdf> {
        let gaussian = PointGaussian::new(Point3::new(1.0, 2.0, 3.0), Matrix3::identity());
        let sog = PointSog::new(vec![SogMode::new(0.0, gaussian)]);
        let mut particles = PointParticles::new(0);
        particles.set_size(4, nalgebra::Point3::new(1.0, 2.0, 3.0));
        vec![gaussian.into(), sog.into(), particles.into()]
    }

    #[test]
    fn dispatch_reaches_every_variant() {
        let mut rng = StdRng::seed_from_u64(5);
        for mut pdf in sample_variants() {
            let mean = pdf.mean();
            assert_approx_eq!(mean.x, 1.0, 1e-6);
            assert_approx_eq!(mean.z, 3.0, 1e-6);
            assert!(pdf.draw_single_sample(&mut rng).is_ok());
            pdf.change_coordinates_reference(&Isometry3::from_parts(
                Translation3::new(1.0, 0.0, 0.0),
                nalgebra::UnitQuaternion::identity(),
            ));
            assert_approx_eq!(pdf.mean().x, 2.0, 1e-6);
        }
    }

    #[test]
    fn kind_names() {
        let kinds: Vec<&str> = sample_variants().iter().map(PointPdf::kind).collect();
        assert_eq!(kinds, vec!["gaussian", "sum-of-gaussians", "particles"]);
    }

    #[test]
    fn to_gaussian_matches_moments() {
        let mut particles = PointParticles::new(2);
        particles.set_point(0, nalgebra::Point3::new(-1.0, 0.0, 0.0));
        particles.set_point(1, nalgebra::Point3::new(1.0, 0.0, 0.0));
        let gaussian = PointPdf::from(particles).to_gaussian();
        assert_eq!(gaussian.mean, Point3::origin());
        assert_approx_eq!(gaussian.cov[(0, 0)], 1.0, 1e-12);
        assert_eq!(gaussian.cov.diagonal(), Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn empty_particles_report_empty() {
        assert!(PointPdf::from(PointParticles::new(0)).is_empty());
        assert!(PointPdf::from(PointSog::default()).is_empty());
        assert!(!PointPdf::from(PointGaussian::default()).is_empty());
    }
}
