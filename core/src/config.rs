//! Serializable simulation configuration.
//!
//! Every section has defaults so that a configuration file only needs to name what it changes:
//!
//! ```toml
//! seed = 42
//!
//! [particle_filter]
//! num_particles = 250
//! measurement_sigma = 2.0
//! ```
//!
//! Files are read and written by extension with [`SimulationConfig::from_file`] and
//! [`SimulationConfig::to_file`] (`.json`, `.yaml`/`.yml`, `.toml`).
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LocalizationError, Result};
use crate::kinematics::OdometryNoise;
use crate::particle::ParticleAveragingStrategy;

/// Range sensor settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Variance of the Gaussian noise added to each range (m²)
    pub range_noise_variance: f64,
    /// Finite distance reported for beams that hit nothing, used for the filter's scans
    pub no_hit_range: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            range_noise_variance: 0.001,
            no_hit_range: 1e12,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleFilterConfig {
    pub num_particles: usize,
    /// Ticks per update cycle; the particle set is replaced on the last tick of each cycle
    pub update_frequency: usize,
    /// Standard deviation of the per-beam likelihood (m)
    pub measurement_sigma: f64,
    /// Diagonal variance pushed through the motion Jacobians to diffuse each particle
    pub spread_variance: f64,
    pub averaging_strategy: ParticleAveragingStrategy,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        ParticleFilterConfig {
            num_particles: 100,
            update_frequency: 1,
            measurement_sigma: 4.0,
            spread_variance: 0.001,
            averaging_strategy: ParticleAveragingStrategy::WeightedAverage,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Compass noise standard deviation $\sigma_k$ (rad)
    pub compass_sigma: f64,
    /// Bearing noise standard deviation $\sigma_p$ (rad)
    pub bearing_sigma: f64,
    /// Mahalanobis gate $g$
    pub gate: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        KalmanConfig {
            compass_sigma: 0.01,
            bearing_sigma: 0.01,
            gate: 9.0,
        }
    }
}

/// Top level configuration of a simulation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed for every random number generator of the run; random when absent
    pub seed: Option<u64>,
    pub odometry: OdometryNoise,
    pub sensor: SensorConfig,
    pub particle_filter: ParticleFilterConfig,
    pub kalman: KalmanConfig,
}

impl SimulationConfig {
    /// Reject values that would make the filters meaningless.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(LocalizationError::InvalidConfig(msg.to_string()));
        let o = &self.odometry;
        if ![o.k_left, o.k_right, o.k_distance, o.k_steering]
            .into_iter()
            .all(non_negative)
        {
            return invalid("odometry gains must be finite and non-negative");
        }
        if !non_negative(self.sensor.range_noise_variance) {
            return invalid("range noise variance must be non-negative");
        }
        if !positive(self.sensor.no_hit_range) {
            return invalid("no-hit range must be finite and positive");
        }
        let pf = &self.particle_filter;
        if pf.num_particles == 0 {
            return invalid("the particle filter needs at least one particle");
        }
        if pf.update_frequency == 0 {
            return invalid("update frequency must be at least one tick");
        }
        if !positive(pf.measurement_sigma) {
            return invalid("measurement sigma must be positive");
        }
        if !non_negative(pf.spread_variance) {
            return invalid("particle spread variance must be non-negative");
        }
        let k = &self.kalman;
        if !positive(k.compass_sigma) || !positive(k.bearing_sigma) {
            return invalid("observation noise must be positive");
        }
        if !positive(k.gate) {
            return invalid("association gate must be positive");
        }
        Ok(())
    }

    /// Write as pretty JSON
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read from JSON
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write as YAML
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read from YAML
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        serde_yaml::from_str(&s).map_err(io::Error::other)
    }
    /// Write as TOML
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string_pretty(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read from TOML
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

fn non_negative(x: f64) -> bool {
    x.is_finite() && x >= 0.0
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
