//! Single Gaussian distribution of a 3D point.
//!
//! Besides being a representation in its own right, the Gaussian is the
//! workhorse of the fusion code: moment matching, exact products and the
//! density evaluations used to reweight particles all go through here.

use nalgebra::linalg::Cholesky;
use nalgebra::{Isometry3, Matrix3, Point3, Vector3};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::linalg::{mahalanobis_distance, matrix_square_root, symmetrize};
use crate::pdf::{PdfError, PointDistribution, PointPdf};

/// ln((2π)³)
const LOG_TWO_PI_CUBED: f64 = 3.0 * 1.837_877_066_409_345_5;

/// A Gaussian point distribution `N(mean, cov)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointGaussian {
    pub mean: Point3<f64>,
    pub cov: Matrix3<f64>,
}
impl Default for PointGaussian {
    /// A point mass at the origin.
    fn default() -> Self {
        PointGaussian {
            mean: Point3::origin(),
            cov: Matrix3::zeros(),
        }
    }
}

impl PointGaussian {
    pub fn new(mean: Point3<f64>, cov: Matrix3<f64>) -> Self {
        PointGaussian { mean, cov }
    }
    /// Natural log of the density at `point`.
    pub fn log_pdf(&self, point: &Point3<f64>) -> Result<f64, PdfError> {
        gaussian_log_density(&(point - self.mean), &self.cov)
    }
    pub fn pdf(&self, point: &Point3<f64>) -> Result<f64, PdfError> {
        self.log_pdf(point).map(f64::exp)
    }
    /// Mahalanobis distance from the mean to `point`.
    pub fn mahalanobis_distance(&self, point: &Point3<f64>) -> Result<f64, PdfError> {
        mahalanobis_distance(&(point - self.mean), &self.cov).ok_or(PdfError::SingularCovariance)
    }
    /// Exact normalized product of two Gaussians.
    ///
    /// Written in Kalman form (`K = Σa (Σa + Σb)⁻¹`), so only the sum of the
    /// covariances has to be invertible: a point mass on one side simply wins.
    pub fn product(a: &PointGaussian, b: &PointGaussian) -> Result<PointGaussian, PdfError> {
        let sum = symmetrize(&(a.cov + b.cov));
        let sum_inv = Cholesky::new(sum)
            .ok_or(PdfError::SingularCovariance)?
            .inverse();
        let gain = a.cov * sum_inv;
        let mean = a.mean + gain * (b.mean - a.mean);
        let cov = symmetrize(&((Matrix3::identity() - gain) * a.cov));
        Ok(PointGaussian::new(mean, cov))
    }
    /// Log of the normalization constant of the product `N(a)·N(b)`, which is
    /// `log N(μa; μb, Σa + Σb)`. Used to weight products of mixture modes.
    pub fn product_log_scale(a: &PointGaussian, b: &PointGaussian) -> Result<f64, PdfError> {
        gaussian_log_density(&(a.mean - b.mean), &(a.cov + b.cov))
    }
}

/// `log N(δ; 0, Σ)`. Requires a positive definite covariance.
pub(crate) fn gaussian_log_density(delta: &Vector3<f64>, cov: &Matrix3<f64>) -> Result<f64, PdfError> {
    let ch = Cholesky::new(symmetrize(cov)).ok_or(PdfError::SingularCovariance)?;
    let log_det = 2.0 * ch.l().diagonal().map(f64::ln).sum();
    let maha_sq = delta.dot(&ch.solve(delta));
    Ok(-0.5 * (maha_sq + log_det + LOG_TWO_PI_CUBED))
}

/// Draw `mean + S z` with `S Sᵀ = cov` and `z` standard normal.
pub(crate) fn sample_gaussian<R: Rng + ?Sized>(
    mean: &Point3<f64>,
    cov: &Matrix3<f64>,
    rng: &mut R,
) -> Point3<f64> {
    let sqrt = matrix_square_root(cov);
    let z: Vector3<f64> = Vector3::from_fn(|_, _| StandardNormal.sample(&mut *rng));
    mean + sqrt * z
}

impl PointDistribution for PointGaussian {
    fn mean(&self) -> Point3<f64> {
        self.mean
    }
    fn covariance_and_mean(&self) -> (Matrix3<f64>, Point3<f64>) {
        (self.cov, self.mean)
    }
    fn draw_single_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Point3<f64>, PdfError> {
        Ok(sample_gaussian(&self.mean, &self.cov, rng))
    }
    fn change_coordinates_reference(&mut self, new_reference_base: &Isometry3<f64>) {
        let rotation = new_reference_base.rotation.to_rotation_matrix().into_inner();
        self.mean = new_reference_base.transform_point(&self.mean);
        self.cov = symmetrize(&(rotation * self.cov * rotation.transpose()));
    }
    /// Moment matching; no randomness involved.
    fn copy_from<R: Rng + ?Sized>(&mut self, other: &PointPdf, _rng: &mut R) -> Result<(), PdfError> {
        if other.is_empty() {
            return Err(PdfError::EmptyDistribution);
        }
        let (cov, mean) = other.covariance_and_mean();
        self.mean = mean;
        self.cov = cov;
        Ok(())
    }
    /// Product of the moment-matched Gaussians of both inputs. Pruning does not
    /// apply to a single mode.
    fn bayesian_fusion<R: Rng + ?Sized>(
        &mut self,
        p1: &PointPdf,
        p2: &PointPdf,
        _min_mahalanobis_dist_to_drop: f64,
        _rng: &mut R,
    ) -> Result<(), PdfError> {
        if p1.is_empty() || p2.is_empty() {
            return Err(PdfError::IncompatibleFusion(
                "cannot fuse an empty distribution".to_string(),
            ));
        }
        *self = PointGaussian::product(&p1.to_gaussian(), &p2.to_gaussian()).map_err(|_| {
            PdfError::IncompatibleFusion("combined covariance is singular".to_string())
        })?;
        Ok(())
    }
}
