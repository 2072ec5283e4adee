//! Versioned structured schema for point distributions.
//!
//! Every representation is encoded as a `serde_json::Value` tree stamped with
//! a `datatype` tag and a `version`. Only version 1 exists. The particle
//! layout is
//!
//! ```text
//! {"datatype": "CPointPDFParticles", "version": 1, "N": 2,
//!  "particles": [{"log_w": 0.0, "x": 1.0, "y": 0.0, "z": 0.0}, ...]}
//! ```
//!
//! Decoders return `Ok(None)` for a schema carrying another `datatype`, so a
//! container holding mixed entries can offer each entry to every decoder and
//! let the foreign ones pass. A matching tag with an unknown version is an
//! error: no layout is guessed.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use log::debug;
use nalgebra::{Matrix3, Point3};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::gaussian::PointGaussian;
use crate::particle::{Particle, PointParticles};
use crate::pdf::PointPdf;
use crate::sog::{PointSog, SogMode};

pub const PARTICLES_DATATYPE: &str = "CPointPDFParticles";
pub const GAUSSIAN_DATATYPE: &str = "CPointPDFGaussian";
pub const SOG_DATATYPE: &str = "CPointPDFSOG";
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown schema version {version} for datatype {datatype}")]
    UnknownVersion { datatype: String, version: i64 },
    #[error("unknown datatype {0:?}")]
    UnknownDatatype(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("schema declares {declared} entries but holds {actual}")]
    CountMismatch { declared: usize, actual: usize },
    #[error("malformed schema: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct ParticleRecord {
    log_w: f64,
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Deserialize)]
struct ParticlesBody {
    #[serde(rename = "N")]
    n: Option<usize>,
    #[serde(default)]
    particles: Vec<ParticleRecord>,
}

#[derive(Serialize, Deserialize)]
struct MeanRecord {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Serialize, Deserialize)]
struct GaussianRecord {
    mean: MeanRecord,
    /// Row-major.
    cov: [f64; 9],
}

#[derive(Serialize, Deserialize)]
struct ModeRecord {
    log_w: f64,
    #[serde(flatten)]
    gaussian: GaussianRecord,
}

#[derive(Deserialize)]
struct SogBody {
    #[serde(rename = "N")]
    n: Option<usize>,
    #[serde(default)]
    modes: Vec<ModeRecord>,
}

impl From<&PointGaussian> for GaussianRecord {
    fn from(g: &PointGaussian) -> Self {
        let mut cov = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                cov[3 * row + col] = g.cov[(row, col)];
            }
        }
        GaussianRecord {
            mean: MeanRecord {
                x: g.mean.x,
                y: g.mean.y,
                z: g.mean.z,
            },
            cov,
        }
    }
}
impl From<GaussianRecord> for PointGaussian {
    fn from(r: GaussianRecord) -> Self {
        PointGaussian::new(
            Point3::new(r.mean.x, r.mean.y, r.mean.z),
            Matrix3::from_row_slice(&r.cov),
        )
    }
}

/// `Ok(true)` when `value` carries `datatype` at the supported version,
/// `Ok(false)` for any other tag.
fn check_header(value: &Value, datatype: &'static str) -> Result<bool, DecodeError> {
    let tag = value.get("datatype").and_then(Value::as_str);
    if tag != Some(datatype) {
        debug!("skipping schema with datatype {:?}, expected {}", tag, datatype);
        return Ok(false);
    }
    let version = value.get("version").and_then(Value::as_i64).unwrap_or(0);
    if version != SCHEMA_VERSION {
        return Err(DecodeError::UnknownVersion {
            datatype: datatype.to_string(),
            version,
        });
    }
    Ok(true)
}

fn check_count(declared: Option<usize>, actual: usize) -> Result<(), DecodeError> {
    let declared = declared.ok_or(DecodeError::MissingField("N"))?;
    if declared != actual {
        return Err(DecodeError::CountMismatch { declared, actual });
    }
    Ok(())
}

pub fn encode_particles(pdf: &PointParticles) -> Value {
    let records: Vec<ParticleRecord> = pdf
        .iter()
        .map(|p| ParticleRecord {
            log_w: p.log_weight,
            x: p.point.x,
            y: p.point.y,
            z: p.point.z,
        })
        .collect();
    json!({
        "datatype": PARTICLES_DATATYPE,
        "version": SCHEMA_VERSION,
        "N": records.len(),
        "particles": records,
    })
}

pub fn decode_particles(value: &Value) -> Result<Option<Vec<Particle>>, DecodeError> {
    if !check_header(value, PARTICLES_DATATYPE)? {
        return Ok(None);
    }
    let body = ParticlesBody::deserialize(value)?;
    check_count(body.n, body.particles.len())?;
    Ok(Some(
        body.particles
            .into_iter()
            .map(|r| Particle::new(Point3::new(r.x, r.y, r.z), r.log_w))
            .collect(),
    ))
}

pub fn encode_gaussian(pdf: &PointGaussian) -> Value {
    let record = GaussianRecord::from(pdf);
    json!({
        "datatype": GAUSSIAN_DATATYPE,
        "version": SCHEMA_VERSION,
        "mean": record.mean,
        "cov": record.cov,
    })
}

pub fn decode_gaussian(value: &Value) -> Result<Option<PointGaussian>, DecodeError> {
    if !check_header(value, GAUSSIAN_DATATYPE)? {
        return Ok(None);
    }
    Ok(Some(GaussianRecord::deserialize(value)?.into()))
}

pub fn encode_sog(pdf: &PointSog) -> Value {
    let modes: Vec<ModeRecord> = pdf
        .modes
        .iter()
        .map(|m| ModeRecord {
            log_w: m.log_weight,
            gaussian: GaussianRecord::from(&m.gaussian),
        })
        .collect();
    json!({
        "datatype": SOG_DATATYPE,
        "version": SCHEMA_VERSION,
        "N": modes.len(),
        "modes": modes,
    })
}

pub fn decode_sog(value: &Value) -> Result<Option<PointSog>, DecodeError> {
    if !check_header(value, SOG_DATATYPE)? {
        return Ok(None);
    }
    let body = SogBody::deserialize(value)?;
    check_count(body.n, body.modes.len())?;
    Ok(Some(PointSog::new(
        body.modes
            .into_iter()
            .map(|m| SogMode::new(m.log_w, m.gaussian.into()))
            .collect(),
    )))
}

impl PointParticles {
    pub fn serialize_to(&self) -> Value {
        encode_particles(self)
    }
    /// Load particles from `value`. Returns `Ok(false)` and leaves the
    /// ensemble untouched when the schema holds another datatype.
    pub fn serialize_from(&mut self, value: &Value) -> Result<bool, DecodeError> {
        match decode_particles(value)? {
            Some(particles) => {
                self.particles = particles;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl PointPdf {
    pub fn to_schema(&self) -> Value {
        match self {
            PointPdf::Gaussian(pdf) => encode_gaussian(pdf),
            PointPdf::Sog(pdf) => encode_sog(pdf),
            PointPdf::Particles(pdf) => encode_particles(pdf),
        }
    }
    /// Decode whichever representation the `datatype` tag names.
    pub fn from_schema(value: &Value) -> Result<PointPdf, DecodeError> {
        let tag = value
            .get("datatype")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingField("datatype"))?;
        let unknown = || DecodeError::UnknownDatatype(tag.to_string());
        match tag {
            PARTICLES_DATATYPE => decode_particles(value)?
                .map(|p| PointPdf::Particles(PointParticles::from(p)))
                .ok_or_else(unknown),
            GAUSSIAN_DATATYPE => decode_gaussian(value)?.map(PointPdf::Gaussian).ok_or_else(unknown),
            SOG_DATATYPE => decode_sog(value)?.map(PointPdf::Sog).ok_or_else(unknown),
            _ => Err(unknown()),
        }
    }
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_json_file(&self.to_schema(), path)
    }
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> io::Result<PointPdf> {
        let value = read_json_file(path)?;
        PointPdf::from_schema(&value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Write a schema value as pretty-printed JSON.
pub fn write_json_file<P: AsRef<Path>>(value: &Value, path: P) -> io::Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value).map_err(io::Error::other)
}

pub fn read_json_file<P: AsRef<Path>>(path: P) -> io::Result<Value> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(io::Error::other)
}
