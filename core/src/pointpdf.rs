//! Particle-based probability distributions over a 3D point
//!
//! This crate provides a weighted-sample (particle) representation of a belief about an unknown 3D position,
//! together with the two parametric representations it is usually converted to and from: a single Gaussian and
//! a sum of Gaussians. The particle ensemble is the primary type. It is meant to be owned by a particle filter
//! that handles prediction and resampling; this crate only keeps the ensemble consistent and derives what can be
//! derived from it.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the point, matrix and rigid pose types.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for sampling and fusion.
//! - [`serde`](https://crates.io/crates/serde) and [`serde_json`](https://crates.io/crates/serde_json): Provides the structured schema the distributions are stored in.
//!
//! ## Crate overview
//!
//! - [particle]: The particle ensemble store, rigid re-referencing, sampling and the plain text dump.
//! - [stats]: Weighted mean, covariance and kurtosis of an ensemble.
//! - [gaussian]: Single Gaussian point distribution.
//! - [sog]: Sum-of-Gaussians point distribution.
//! - [pdf]: The [`pdf::PointDistribution`] capability and the closed set of representations [`pdf::PointPdf`].
//! - [fusion]: Bayesian fusion of two distributions into a particle ensemble.
//! - [codec]: The versioned structured schema and JSON files.
//! - [config]: Fusion settings, loadable from JSON/YAML/TOML.
//! - [linalg]: Small 3×3 linear algebra helpers.
//!
//! ## Weights
//!
//! Each particle $i$ carries a point $x_i$ and a log-weight $\ell_i$. Weights are never exponentiated directly.
//! The largest log-weight is subtracted first:
//!
//! $$
//! w_i = \frac{e^{\ell_i - \ell_{max}}}{\sum_j e^{\ell_j - \ell_{max}}}
//! $$
//!
//! so at least one term is exactly one and the sum cannot underflow. Mean and covariance are then the usual
//! weighted moments
//!
//! $$
//! \mu = \sum_i w_i x_i, \qquad \Sigma = \sum_i w_i (x_i - \mu)(x_i - \mu)^T
//! $$
//!
//! Points are stored in single precision and log-weights in double precision; all statistics are accumulated in
//! double precision.
//!
//! ## Re-referencing
//!
//! [`pdf::PointDistribution::change_coordinates_reference`] applies the composition $p' = T \oplus p$ with a
//! rigid pose $T$ (an [`nalgebra::Isometry3`]): rotate, then translate. Weights are untouched.
pub mod codec;
pub mod config;
pub mod fusion;
pub mod gaussian;
pub mod linalg;
pub mod particle;
pub mod pdf;
pub mod sog;
pub mod stats;

pub use codec::DecodeError;
pub use config::FusionConfig;
pub use fusion::FusionStrategy;
pub use gaussian::PointGaussian;
pub use particle::{Particle, PointParticles};
pub use pdf::{PdfError, PointDistribution, PointPdf};
pub use sog::{PointSog, SogMode};
