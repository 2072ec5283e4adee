//! Fusion settings that can be kept in JSON, YAML or TOML files.
//!
//! ```
//! use pointpdf::config::FusionConfig;
//! use pointpdf::fusion::FusionStrategy;
//!
//! let cfg = FusionConfig {
//!     strategy: FusionStrategy::MomentMatched,
//!     num_samples: 500,
//!     ..FusionConfig::default()
//! };
//! assert_eq!(cfg.seed, 42);
//! ```
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fusion::FusionStrategy;
use crate::particle::DEFAULT_CONVERSION_SAMPLES;

fn default_num_samples() -> usize {
    DEFAULT_CONVERSION_SAMPLES
}
fn default_seed() -> u64 {
    42
}

/// Knobs for [`crate::particle::PointParticles::bayesian_fusion_with`] and the
/// `pointpdf fuse` subcommand. Every field is optional in a file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// How the product of the two input densities is approximated.
    #[serde(default)]
    pub strategy: FusionStrategy,

    /// Number of particles drawn when an input has to be sampled.
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,

    /// Hypotheses further than this Mahalanobis distance from the dominant one
    /// are dropped. Zero disables pruning.
    #[serde(default)]
    pub min_mahalanobis_dist_to_drop: f64,

    /// Seed for the command line tool's generator (42 unless set). Library
    /// calls ignore it and use the generator they are handed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            strategy: FusionStrategy::default(),
            num_samples: default_num_samples(),
            min_mahalanobis_dist_to_drop: 0.0,
            seed: default_seed(),
        }
    }
}

/// On-disk formats, picked by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> io::Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported config file extension: {}", path.display()),
            )),
        }
    }
}

impl FusionConfig {
    /// Pretty-printed JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Save next to other settings files: `.json`, `.yaml`/`.yml` or `.toml`,
    /// case-insensitive. Anything else is `InvalidInput` and nothing is written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match ConfigFormat::from_path(p)? {
            ConfigFormat::Json => self.to_json(p),
            ConfigFormat::Yaml => self.to_yaml(p),
            ConfigFormat::Toml => self.to_toml(p),
        }
    }
    /// Counterpart of [`FusionConfig::to_file`]. Missing fields fall back to
    /// their defaults; an unknown strategy name is an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match ConfigFormat::from_path(p)? {
            ConfigFormat::Json => Self::from_json(p),
            ConfigFormat::Yaml => Self::from_yaml(p),
            ConfigFormat::Toml => Self::from_toml(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_cfg() -> FusionConfig {
        FusionConfig {
            strategy: FusionStrategy::MomentMatched,
            num_samples: 250,
            min_mahalanobis_dist_to_drop: 3.0,
            seed: 7,
        }
    }

    #[test]
    fn defaults() {
        let cfg = FusionConfig::default();
        assert_eq!(cfg.strategy, FusionStrategy::ImportanceReweight);
        assert_eq!(cfg.num_samples, 1000);
        assert_eq!(cfg.min_mahalanobis_dist_to_drop, 0.0);
        assert_eq!(cfg.seed, 42);
    }

    #[test]
    fn roundtrip_every_format() {
        let dir = tempdir().unwrap();
        let cfg = sample_cfg();
        for name in ["fusion.json", "fusion.yaml", "fusion.yml", "fusion.TOML"] {
            let path = dir.path().join(name);
            cfg.to_file(&path).unwrap();
            let loaded = FusionConfig::from_file(&path).unwrap();
            assert_eq!(loaded, cfg, "{name}");
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"strategy": "moment_matched"}"#).unwrap();
        let loaded = FusionConfig::from_file(&path).unwrap();
        assert_eq!(loaded.strategy, FusionStrategy::MomentMatched);
        assert_eq!(loaded.num_samples, 1000);
        assert_eq!(loaded.seed, 42);
    }

    #[test]
    fn unsupported_extension_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fusion.txt");
        let result = sample_cfg().to_file(&path);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
        let result = FusionConfig::from_file(&path);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
        assert!(!path.exists());
    }

    #[test]
    fn format_follows_extension() {
        let format = |name: &str| ConfigFormat::from_path(Path::new(name)).ok();
        assert_eq!(format("a/b.Json"), Some(ConfigFormat::Json));
        assert_eq!(format("b.YML"), Some(ConfigFormat::Yaml));
        assert_eq!(format("b.toml"), Some(ConfigFormat::Toml));
        assert_eq!(format("no_extension"), None);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "strategy: bogus\n").unwrap();
        assert!(FusionConfig::from_file(&path).is_err());
    }
}
