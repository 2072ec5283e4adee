//! Particle-based probability distribution of a 3D point.
//!
//! [`PointParticles`] owns a weighted sample set (the ensemble). Weights are
//! stored as natural logarithms of unnormalized importance weights; every
//! read-only operation (moments, sampling, effective sample size) normalizes
//! them through [`crate::stats::normalize_log_weights`] first.
//!
//! The container does not resample or predict: that is the job of whatever
//! filter owns it. It only knows how to describe, move, sample, fuse and
//! persist its particles.
use crate::config::FusionConfig;
use crate::pdf::{PdfError, PointDistribution, PointPdf};
use crate::stats;

use nalgebra::{Isometry3, Matrix3, Point3, Vector3};
use rand::Rng;
use std::fmt::{self, Debug, Display};
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Number of samples synthesized when an empty ensemble copies a parametric
/// distribution.
pub const DEFAULT_CONVERSION_SAMPLES: usize = 1000;

/// A single weighted point hypothesis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    pub point: Point3<f32>,
    pub log_weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.point.x)
            .field("y", &self.point.y)
            .field("z", &self.point.z)
            .field("log_weight", &self.log_weight)
            .finish()
    }
}
impl Particle {
    pub fn new(point: Point3<f32>, log_weight: f64) -> Particle {
        Particle { point, log_weight }
    }
    /// Point coordinates widened to double precision.
    pub fn position(&self) -> Vector3<f64> {
        self.point.coords.cast::<f64>()
    }
}
impl From<(Point3<f32>, f64)> for Particle {
    fn from(tuple: (Point3<f32>, f64)) -> Self {
        let (point, log_weight) = tuple;
        Particle::new(point, log_weight)
    }
}

/// A probability distribution of a 3D point represented by weighted particles.
#[derive(Clone, PartialEq)]
pub struct PointParticles {
    pub(crate) particles: Vec<Particle>,
}
impl Default for PointParticles {
    fn default() -> Self {
        PointParticles::new(1)
    }
}
impl Debug for PointParticles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.mean();
        let min_log_weight = self
            .particles
            .iter()
            .map(|p| p.log_weight)
            .fold(f64::INFINITY, f64::min);
        let max_log_weight = self
            .particles
            .iter()
            .map(|p| p.log_weight)
            .fold(f64::NEG_INFINITY, f64::max);
        f.debug_struct("PointParticles")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "log_weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_log_weight, max_log_weight),
            )
            .field(
                "mean",
                &format_args!("({:.4}, {:.4}, {:.4})", mean.x, mean.y, mean.z),
            )
            .finish()
    }
}
impl From<Vec<Particle>> for PointParticles {
    fn from(particles: Vec<Particle>) -> Self {
        PointParticles { particles }
    }
}
impl FromIterator<Particle> for PointParticles {
    fn from_iter<I: IntoIterator<Item = Particle>>(iter: I) -> Self {
        PointParticles {
            particles: iter.into_iter().collect(),
        }
    }
}

impl PointParticles {
    /// Create `num_particles` particles at the origin with uniform weights.
    pub fn new(num_particles: usize) -> Self {
        let mut pdf = PointParticles {
            particles: Vec::new(),
        };
        pdf.set_size(num_particles, Point3::origin());
        pdf
    }
    /// Remove every particle and release the backing storage.
    pub fn clear(&mut self) {
        self.particles = Vec::new();
    }
    /// Discard the current content and hold exactly `num_particles` copies of
    /// `default_value`, all with `log_weight == 0`.
    pub fn set_size(&mut self, num_particles: usize, default_value: Point3<f32>) {
        self.particles = vec![Particle::new(default_value, 0.0); num_particles];
    }
    pub fn size(&self) -> usize {
        self.particles.len()
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn get_point(&self, index: usize) -> Option<Point3<f32>> {
        self.particles.get(index).map(|p| p.point)
    }
    /// Overwrite the point of particle `index`; its log-weight is kept.
    ///
    /// # Panics
    /// Panics if `index >= self.size()`.
    pub fn set_point(&mut self, index: usize, point: Point3<f32>) {
        self.particles[index].point = point;
    }
    pub fn log_weight(&self, index: usize) -> Option<f64> {
        self.particles.get(index).map(|p| p.log_weight)
    }
    /// Overwrite the log-weight of particle `index`. Weights must be finite;
    /// use a very negative value rather than `-inf` for a negligible particle.
    ///
    /// # Panics
    /// Panics if `index >= self.size()`, and in debug builds if `log_weight`
    /// is not finite.
    pub fn set_log_weight(&mut self, index: usize, log_weight: f64) {
        debug_assert!(log_weight.is_finite(), "log-weight must be finite, got {log_weight}");
        self.particles[index].log_weight = log_weight;
    }
    /// Shift all log-weights so the largest one is zero.
    ///
    /// Returns the maximum log-weight before the shift. If that maximum is not
    /// finite the weights are reset to uniform.
    pub fn normalize_weights(&mut self) -> f64 {
        let max_log_weight = self
            .particles
            .iter()
            .map(|p| p.log_weight)
            .fold(f64::NEG_INFINITY, f64::max);
        if max_log_weight.is_finite() {
            for particle in &mut self.particles {
                particle.log_weight -= max_log_weight;
            }
        } else {
            for particle in &mut self.particles {
                particle.log_weight = 0.0;
            }
        }
        max_log_weight
    }
    /// Linear weights that sum to one, in ensemble order.
    pub fn normalized_weights(&self) -> Vec<f64> {
        stats::particle_weights(&self.particles)
    }
    pub fn effective_sample_size(&self) -> f64 {
        stats::effective_sample_size(&self.particles)
    }
    /// Kurtosis of the sharpest axis; see [`stats::kurtosis`].
    pub fn compute_kurtosis(&self) -> f64 {
        stats::kurtosis(&self.particles)
    }
    pub fn kurtosis_per_axis(&self) -> Vector3<f64> {
        stats::kurtosis_per_axis(&self.particles)
    }
    /// Draw `count` points, all from one normalization of the weights.
    pub fn draw_samples<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
    ) -> Result<Vec<Point3<f64>>, PdfError> {
        if self.particles.is_empty() {
            return Err(PdfError::EmptyDistribution);
        }
        let cumulative = cumulative_weights(&self.normalized_weights());
        Ok((0..count)
            .map(|_| {
                let index = select_index(&cumulative, rng.random::<f64>());
                self.particles[index].point.cast::<f64>()
            })
            .collect())
    }

    /// Write one `X Y Z LOG_W` line per particle, in ensemble order, no header.
    pub fn save_to_text_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_path(path)?;
        for particle in &self.particles {
            writer.write_record(&[
                particle.point.x.to_string(),
                particle.point.y.to_string(),
                particle.point.z.to_string(),
                particle.log_weight.to_string(),
            ])?;
        }
        writer.flush()
    }
    /// Replace the ensemble with the content of a file written by
    /// [`PointParticles::save_to_text_file`]. The ensemble is untouched on error.
    pub fn load_from_text_file<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut particles = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
            if fields.len() != 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line {}: expected 4 fields, found {}", line + 1, fields.len()),
                ));
            }
            let point = Point3::new(
                parse_field::<f32>(fields[0], line)?,
                parse_field::<f32>(fields[1], line)?,
                parse_field::<f32>(fields[2], line)?,
            );
            particles.push(Particle::new(point, parse_field::<f64>(fields[3], line)?));
        }
        self.particles = particles;
        Ok(())
    }
}

fn parse_field<T>(field: &str, line: usize) -> io::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    field.parse::<T>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line {}: '{field}': {e}", line + 1),
        )
    })
}

/// Running sum of normalized weights; the last entry is ~1.
pub(crate) fn cumulative_weights(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// Inverse-CDF lookup of a uniform draw `u ∈ [0, 1)`.
///
/// Zero-weight entries are never selected; round-off past the final
/// cumulative value maps to the last index.
pub(crate) fn select_index(cumulative: &[f64], u: f64) -> usize {
    cumulative
        .partition_point(|&c| c <= u)
        .min(cumulative.len().saturating_sub(1))
}

impl PointDistribution for PointParticles {
    fn mean(&self) -> Point3<f64> {
        stats::mean(&self.particles)
    }
    fn covariance_and_mean(&self) -> (Matrix3<f64>, Point3<f64>) {
        stats::covariance_and_mean(&self.particles)
    }
    fn draw_single_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Point3<f64>, PdfError> {
        if self.particles.is_empty() {
            return Err(PdfError::EmptyDistribution);
        }
        let cumulative = cumulative_weights(&self.normalized_weights());
        let index = select_index(&cumulative, rng.random::<f64>());
        Ok(self.particles[index].point.cast::<f64>())
    }
    /// `this = new_reference_base ⊕ this`, applied to every particle.
    fn change_coordinates_reference(&mut self, new_reference_base: &Isometry3<f64>) {
        for particle in &mut self.particles {
            let moved = new_reference_base.transform_point(&particle.point.cast::<f64>());
            particle.point = moved.cast::<f32>();
        }
    }
    /// Particle input is deep-copied. Parametric input is sampled into
    /// `size()` uniformly weighted particles ([`DEFAULT_CONVERSION_SAMPLES`]
    /// when this ensemble is empty).
    fn copy_from<R: Rng + ?Sized>(&mut self, other: &PointPdf, rng: &mut R) -> Result<(), PdfError> {
        match other {
            PointPdf::Particles(source) => {
                self.particles = source.particles.clone();
            }
            _ => {
                let count = if self.particles.is_empty() {
                    DEFAULT_CONVERSION_SAMPLES
                } else {
                    self.particles.len()
                };
                let particles = (0..count)
                    .map(|_| {
                        other
                            .draw_single_sample(rng)
                            .map(|p| Particle::new(p.cast::<f32>(), 0.0))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.particles = particles;
            }
        }
        Ok(())
    }
    fn bayesian_fusion<R: Rng + ?Sized>(
        &mut self,
        p1: &PointPdf,
        p2: &PointPdf,
        min_mahalanobis_dist_to_drop: f64,
        rng: &mut R,
    ) -> Result<(), PdfError> {
        let config = FusionConfig {
            min_mahalanobis_dist_to_drop,
            ..FusionConfig::default()
        };
        self.bayesian_fusion_with(p1, p2, &config, rng)
    }
}
