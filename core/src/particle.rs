//! Particle filter (Monte Carlo localization) over the robot pose
//!
//! The filter carries a set of weighted pose hypotheses. An update cycle spans
//! `update_frequency` ticks; on the last tick of a cycle the set is replaced wholesale:
//!
//! 1. **Resample** with replacement, using the current weights as probabilities.
//! 2. **Propagate** each resampled pose through every drive step of the cycle, drawing one
//!    Gaussian perturbation per step. The perturbation covariance is a small diagonal seed pushed
//!    through the motion Jacobians, so particles spread along the directions the motion is
//!    uncertain in.
//! 3. **Reweight** each particle by ray casting the beam fan from it and comparing the simulated
//!    ranges against the observed ones with [`perception_model`].
//! 4. **Commit** the new poses and normalized weights with [`ParticleFilter::update`].
//!
//! On the other ticks the set is left unchanged and the drive step is remembered for the next
//! commit.
use log::{debug, info, warn};
use nalgebra::{Matrix3, Point2, Vector3};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use std::f64::consts::PI;
use std::fmt::{self, Debug};

use crate::config::ParticleFilterConfig;
use crate::error::{LocalizationError, Result};
use crate::geometry::World;
use crate::kinematics::{DriveCommand, DriveKind};
use crate::linalg::{propagate_covariance, sample_gaussian};
use crate::measurements::LaserScanner;
use crate::{Pose, PoseEstimator, wrap_to_pi};

/// A single pose hypothesis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub pose: Pose,
    pub weight: f64,
}

/// How the particle cloud collapses into a single pose estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

/// Normal density $\mathcal{N}(x; \mu, \sigma)$.
fn gaussian_pdf(x: f64, mean: f64, sigma: f64) -> f64 {
    let z = (x - mean) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
}

/// Likelihood of a particle's simulated scan given the observed one.
///
/// $$
/// w = \prod_i \mathcal{N}(d_i^{sim}; d_i^{obs}, \sigma)
/// $$
///
/// The product is sharp: a single beam that disagrees strongly drives the weight towards zero.
/// Infinite or NaN ranges on either side are rejected.
pub fn perception_model(observed: &[f64], simulated: &[f64], sigma: f64) -> Result<f64> {
    if observed.len() != simulated.len() {
        return Err(LocalizationError::BeamCountMismatch {
            observed: observed.len(),
            simulated: simulated.len(),
        });
    }
    let mut weight = 1.0;
    for (beam, (obs, sim)) in observed.iter().zip(simulated).enumerate() {
        if !sim.is_finite() {
            return Err(LocalizationError::NonFiniteRange { beam, value: *sim });
        }
        if !obs.is_finite() {
            return Err(LocalizationError::NonFiniteRange { beam, value: *obs });
        }
        weight *= gaussian_pdf(*sim, *obs, sigma);
    }
    Ok(weight)
}

pub struct ParticleFilter {
    particles: Vec<Particle>,
    update_frequency: usize,
    updates_count: usize,
    pending: Vec<(DriveCommand, f64)>,
    measurement_sigma: f64,
    spread_variance: f64,
    averaging_strategy: ParticleAveragingStrategy,
    rng: StdRng,
}

impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleFilter")
            .field("num_particles", &self.particles.len())
            .field("mean", &self.get_estimate())
            .field("effective_particles", &self.effective_sample_size())
            .field("update_frequency", &self.update_frequency)
            .field("updates_count", &self.updates_count)
            .finish()
    }
}

impl ParticleFilter {
    /// Build a filter from poses with uniform weights and a random seed.
    pub fn new(poses: Vec<Pose>, config: &ParticleFilterConfig) -> Result<Self> {
        Self::new_with_seed(poses, config, rand::random())
    }
    /// Build a filter from poses with uniform weights and a fixed seed.
    pub fn new_with_seed(
        poses: Vec<Pose>,
        config: &ParticleFilterConfig,
        seed: u64,
    ) -> Result<Self> {
        if poses.is_empty() {
            return Err(LocalizationError::EmptyParticleSet);
        }
        if config.update_frequency == 0 {
            return Err(LocalizationError::InvalidConfig(
                "update frequency must be at least one tick".to_string(),
            ));
        }
        if !(config.measurement_sigma.is_finite() && config.measurement_sigma > 0.0) {
            return Err(LocalizationError::InvalidConfig(format!(
                "measurement sigma must be finite and positive, got {}",
                config.measurement_sigma
            )));
        }
        let weight = 1.0 / poses.len() as f64;
        Ok(ParticleFilter {
            particles: poses
                .into_iter()
                .map(|pose| Particle { pose, weight })
                .collect(),
            update_frequency: config.update_frequency,
            updates_count: 0,
            pending: Vec::new(),
            measurement_sigma: config.measurement_sigma,
            spread_variance: config.spread_variance,
            averaging_strategy: config.averaging_strategy,
            rng: StdRng::seed_from_u64(seed),
        })
    }
    /// Global localization: positions uniform in the box `[min, max]`, headings uniform.
    pub fn uniform_in_bounds(
        min: Point2<f64>,
        max: Point2<f64>,
        config: &ParticleFilterConfig,
        seed: u64,
    ) -> Result<Self> {
        if !(min.x <= max.x && min.y <= max.y) {
            return Err(LocalizationError::InvalidConfig(format!(
                "empty sampling box {min} .. {max}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let poses = (0..config.num_particles)
            .map(|_| {
                Pose::new(
                    min.x + (max.x - min.x) * rng.random::<f64>(),
                    min.y + (max.y - min.y) * rng.random::<f64>(),
                    -PI + 2.0 * PI * rng.random::<f64>(),
                )
            })
            .collect();
        Self::new_with_seed(poses, config, rng.random())
    }
    /// Tracking: poses drawn from $\mathcal{N}(pose, covariance)$.
    pub fn around_pose(
        pose: &Pose,
        covariance: &Matrix3<f64>,
        config: &ParticleFilterConfig,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mean: Vector3<f64> = pose.into();
        let poses = (0..config.num_particles)
            .map(|_| Pose::from(sample_gaussian(&mean, covariance, &mut rng)))
            .collect();
        Self::new_with_seed(poses, config, rng.random())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    pub fn poses(&self) -> Vec<Pose> {
        self.particles.iter().map(|p| p.pose).collect()
    }
    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }
    pub fn update_frequency(&self) -> usize {
        self.update_frequency
    }
    /// Ticks elapsed in the current update cycle.
    pub fn updates_count(&self) -> usize {
        self.updates_count
    }
    pub fn set_averaging_strategy(&mut self, strategy: ParticleAveragingStrategy) {
        self.averaging_strategy = strategy;
    }

    /// Draw `n` poses with replacement, each with probability equal to its weight.
    pub fn sample_particles(&mut self, n: usize) -> Result<Vec<Pose>> {
        let index = WeightedIndex::new(self.particles.iter().map(|p| p.weight))?;
        Ok((0..n)
            .map(|_| self.particles[index.sample(&mut self.rng)].pose)
            .collect())
    }

    /// Advance one pose through a drive step and perturb it.
    ///
    /// The mean is the deterministic motion; the perturbation covariance is
    /// $F_p\,\mathrm{diag}(s)\,F_p^T + F_\delta C_\delta F_\delta^T$ with $s$ the spread variance.
    pub fn propagate_particle(
        &mut self,
        pose: &Pose,
        drive: &DriveKind,
        command: &DriveCommand,
        dt: f64,
    ) -> Result<Pose> {
        let mean: Vector3<f64> = drive.integrate(pose, command, dt)?.into();
        let (fp, fd, cd) = drive.linearize(pose, command, dt)?;
        let seed = Matrix3::from_diagonal_element(self.spread_variance);
        let covariance = propagate_covariance(&seed, &fp, &fd, &cd);
        let sample = sample_gaussian(&mean, &covariance, &mut self.rng);
        Ok(Pose::from(sample))
    }

    /// Unnormalized weight of every pose against the observed ranges.
    ///
    /// Runs the ray casts in parallel; each job only reads the world and the observation.
    pub fn reweight(
        &self,
        poses: &[Pose],
        observed: &[f64],
        world: &World,
        scanner: &LaserScanner,
    ) -> Result<Vec<f64>> {
        let sigma = self.measurement_sigma;
        poses
            .par_iter()
            .map(|pose| {
                let simulated = scanner.scan(pose, world);
                perception_model(observed, &simulated.distances, sigma)
            })
            .collect()
    }

    /// Replace the particle set with `poses` and the normalized `weights`.
    ///
    /// NaN or negative weights are rejected and leave the current set untouched. When every weight
    /// is zero the new set gets uniform weights.
    pub fn update(&mut self, poses: Vec<Pose>, weights: Vec<f64>) -> Result<()> {
        if poses.len() != weights.len() {
            return Err(LocalizationError::ParticleCountMismatch {
                poses: poses.len(),
                weights: weights.len(),
            });
        }
        if poses.is_empty() {
            return Err(LocalizationError::EmptyParticleSet);
        }
        let nan_count = weights.iter().filter(|w| w.is_nan()).count();
        if nan_count > 0 {
            return Err(LocalizationError::NanWeights {
                count: nan_count,
                total: weights.len(),
            });
        }
        if let Some((index, value)) = weights.iter().enumerate().find(|(_, w)| **w < 0.0) {
            return Err(LocalizationError::NegativeWeight {
                index,
                value: *value,
            });
        }
        let sum: f64 = weights.iter().sum();
        let normalized: Vec<f64> = if sum > 0.0 && sum.is_finite() {
            weights.iter().map(|w| w / sum).collect()
        } else {
            warn!(
                "particle weights sum to {sum}, resetting {} particles to uniform weights",
                weights.len()
            );
            vec![1.0 / weights.len() as f64; weights.len()]
        };
        self.particles = poses
            .into_iter()
            .zip(normalized)
            .map(|(pose, weight)| Particle { pose, weight })
            .collect();
        Ok(())
    }

    /// Feed one tick to the filter.
    ///
    /// Returns `true` when the tick closed an update cycle and the particle set was replaced.
    /// `observed` must be the range scan taken at the robot's pose after the drive step.
    pub fn step(
        &mut self,
        drive: &DriveKind,
        command: &DriveCommand,
        dt: f64,
        observed: &[f64],
        world: &World,
        scanner: &LaserScanner,
    ) -> Result<bool> {
        // reject mismatches now so a bad command never sits in the pending list
        drive.integrate(&Pose::default(), command, dt)?;
        self.pending.push((*command, dt));
        if self.updates_count + 1 < self.update_frequency {
            self.updates_count += 1;
            debug!(
                "particle filter tick {}/{} deferred",
                self.updates_count, self.update_frequency
            );
            return Ok(false);
        }
        let pending = self.pending.clone();
        let mut poses = self.sample_particles(self.particles.len())?;
        for pose in poses.iter_mut() {
            for (command, dt) in &pending {
                *pose = self.propagate_particle(pose, drive, command, *dt)?;
            }
        }
        let weights = self.reweight(&poses, observed, world, scanner)?;
        self.update(poses, weights)?;
        self.pending.clear();
        self.updates_count = 0;
        info!(
            "particle filter committed {} drive steps, effective sample size {:.1}",
            pending.len(),
            self.effective_sample_size()
        );
        Ok(true)
    }

    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    /// Weighted mean with a circular mean for the heading.
    fn mean_with(&self, weight: impl Fn(&Particle) -> f64) -> Pose {
        let (mut x, mut y, mut s, mut c, mut total) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for p in &self.particles {
            let w = weight(p);
            x += w * p.pose.x;
            y += w * p.pose.y;
            s += w * p.pose.theta.sin();
            c += w * p.pose.theta.cos();
            total += w;
        }
        if total <= 0.0 {
            return Pose::default();
        }
        Pose::new(x / total, y / total, s.atan2(c))
    }
}

impl PoseEstimator for ParticleFilter {
    fn get_estimate(&self) -> Pose {
        match self.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => self.mean_with(|p| p.weight),
            ParticleAveragingStrategy::UnweightedAverage => self.mean_with(|_| 1.0),
            ParticleAveragingStrategy::HighestWeight => self
                .particles
                .iter()
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
                .map(|p| p.pose)
                .unwrap_or_default(),
        }
    }
    /// Weighted sample covariance around the estimate, headings differenced on the circle.
    fn get_certainty(&self) -> Matrix3<f64> {
        let mean = self.get_estimate();
        self.particles.iter().fold(Matrix3::zeros(), |acc, p| {
            let d = Vector3::new(
                p.pose.x - mean.x,
                p.pose.y - mean.y,
                wrap_to_pi(p.pose.theta - mean.theta),
            );
            acc + p.weight * d * d.transpose()
        })
    }
}
