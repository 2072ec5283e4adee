//! POINTPDF: a command line tool for point distributions stored as JSON schemas.
//!
//! Distributions are read from and written to the versioned structured schema
//! (see `pointpdf::codec`). Particle ensembles can also be exported to, or
//! imported from, the plain `X Y Z LOG_W` text dump.

mod common;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use common::{init_logger, prepare_output_path, validate_input_path};
use log::{debug, info};
use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use pointpdf::{FusionConfig, FusionStrategy, PointDistribution, PointParticles, PointPdf};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};

const LONG_ABOUT: &str = "POINTPDF: inspect, convert, re-reference, sample and fuse probability distributions over a 3D point.

Distributions are stored as JSON using the versioned structured schema. Particle ensembles,
Gaussians and sums of Gaussians are all accepted wherever an input distribution is expected.";

#[derive(Parser)]
#[command(author, version, about = "Inspect, convert and fuse 3D point distributions.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print mean, covariance and, for particles, kurtosis and effective sample size")]
    Stats(InputArgs),
    #[command(about = "Write a particle ensemble as an `X Y Z LOG_W` text dump")]
    Export(ConvertArgs),
    #[command(about = "Read an `X Y Z LOG_W` text dump into a particle schema")]
    Import(ConvertArgs),
    #[command(about = "Re-express a distribution in the frame a rigid pose is given in")]
    Transform(TransformArgs),
    #[command(about = "Draw points from a distribution")]
    Sample(SampleArgs),
    #[command(
        about = "Fuse two distributions into a particle ensemble",
        long_about = "Fuse two independent distributions into a particle ensemble approximating their normalized product. Settings come from an optional configuration file (JSON/YAML/TOML) and can be overridden by flags."
    )]
    Fuse(FuseArgs),
}

#[derive(Args, Clone, Debug)]
struct InputArgs {
    /// Input distribution (JSON schema)
    input: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct ConvertArgs {
    input: PathBuf,
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct TransformArgs {
    input: PathBuf,
    output: PathBuf,
    /// Translation of the pose (meters)
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true, default_values_t = [0.0, 0.0, 0.0])]
    translation: Vec<f64>,
    /// Roll, pitch and yaw of the pose (radians)
    #[arg(long, num_args = 3, value_names = ["ROLL", "PITCH", "YAW"], allow_negative_numbers = true, default_values_t = [0.0, 0.0, 0.0])]
    rpy: Vec<f64>,
}

#[derive(Args, Clone, Debug)]
struct SampleArgs {
    input: PathBuf,
    /// Number of points to draw
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,
    /// Random number generator seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct FuseArgs {
    first: PathBuf,
    second: PathBuf,
    output: PathBuf,
    /// Fusion configuration file (JSON/YAML/TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    strategy: Option<FusionStrategy>,
    /// Drop hypotheses further than this Mahalanobis distance from the dominant one (0 disables)
    #[arg(long)]
    min_mahalanobis: Option<f64>,
    /// Number of particles drawn when an input has to be sampled
    #[arg(long)]
    num_samples: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

fn read_pdf(path: &Path) -> Result<PointPdf> {
    validate_input_path(path)?;
    PointPdf::from_json_file(path).with_context(|| format!("reading {}", path.display()))
}

fn write_pdf(pdf: &PointPdf, path: &Path) -> Result<()> {
    prepare_output_path(path)?;
    pdf.to_json_file(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote {} distribution to {}", pdf.kind(), path.display());
    Ok(())
}

fn stats(args: &InputArgs) -> Result<()> {
    let pdf = read_pdf(&args.input)?;
    let (cov, mean) = pdf.covariance_and_mean();
    println!("kind: {}", pdf.kind());
    println!("mean: [{:.6}, {:.6}, {:.6}]", mean.x, mean.y, mean.z);
    println!("covariance:");
    for row in cov.row_iter() {
        println!("  [{:.6}, {:.6}, {:.6}]", row[0], row[1], row[2]);
    }
    if let Some(particles) = pdf.as_particles() {
        println!("particles: {}", particles.len());
        println!("effective sample size: {:.3}", particles.effective_sample_size());
        println!("kurtosis: {:.6}", particles.compute_kurtosis());
    }
    Ok(())
}

fn export(args: &ConvertArgs) -> Result<()> {
    let pdf = read_pdf(&args.input)?;
    let Some(particles) = pdf.as_particles() else {
        bail!(
            "{} holds a {} distribution, only particle ensembles have a text dump",
            args.input.display(),
            pdf.kind()
        );
    };
    prepare_output_path(&args.output)?;
    particles
        .save_to_text_file(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!("Exported {} particles to {}", particles.len(), args.output.display());
    Ok(())
}

fn import(args: &ConvertArgs) -> Result<()> {
    validate_input_path(&args.input)?;
    let mut particles = PointParticles::new(0);
    particles
        .load_from_text_file(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    info!("Imported {} particles from {}", particles.len(), args.input.display());
    write_pdf(&PointPdf::Particles(particles), &args.output)
}

fn transform(args: &TransformArgs) -> Result<()> {
    let mut pdf = read_pdf(&args.input)?;
    let pose = Isometry3::from_parts(
        Translation3::new(args.translation[0], args.translation[1], args.translation[2]),
        UnitQuaternion::from_euler_angles(args.rpy[0], args.rpy[1], args.rpy[2]),
    );
    debug!("Re-referencing with pose {}", pose);
    pdf.change_coordinates_reference(&pose);
    write_pdf(&pdf, &args.output)
}

fn sample(args: &SampleArgs) -> Result<()> {
    let pdf = read_pdf(&args.input)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    for _ in 0..args.count {
        let p = pdf.draw_single_sample(&mut rng)?;
        println!("{} {} {}", p.x, p.y, p.z);
    }
    Ok(())
}

fn fuse(args: &FuseArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            validate_input_path(path)?;
            FusionConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => FusionConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(distance) = args.min_mahalanobis {
        config.min_mahalanobis_dist_to_drop = distance;
    }
    if let Some(num_samples) = args.num_samples {
        config.num_samples = num_samples;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    let first = read_pdf(&args.first)?;
    let second = read_pdf(&args.second)?;
    info!(
        "Fusing {} and {} with {:?} (seed {})",
        first.kind(),
        second.kind(),
        config.strategy,
        config.seed
    );
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut fused = PointParticles::default();
    fused.bayesian_fusion_with(&first, &second, &config, &mut rng)?;
    info!(
        "Fused ensemble: {} particles, effective sample size {:.1}",
        fused.len(),
        fused.effective_sample_size()
    );
    write_pdf(&PointPdf::Particles(fused), &args.output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    match &cli.command {
        Command::Stats(args) => stats(args),
        Command::Export(args) => export(args),
        Command::Import(args) => import(args),
        Command::Transform(args) => transform(args),
        Command::Sample(args) => sample(args),
        Command::Fuse(args) => fuse(args),
    }
}
