//! Sensor simulation and observation sources.
//!
//! Two kinds of measurement are produced by the simulator:
//!
//! - **Range scans** from a fan of laser beams mounted on the robot ([`LaserScanner`]). These are
//!   consumed by the particle filter. [`add_range_noise`] turns a ground-truth scan into the noisy
//!   measurement the filter sees.
//! - **Landmark observations** assembled from an ordered list of [`ObservationSource`]s. The EKF
//!   stacks one scalar per source into its measurement vector and one row per source into $H_k$,
//!   without knowing the concrete source types.
use nalgebra::{Point2, RowVector3, Vector2, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::Pose;
use crate::error::Result;
use crate::geometry::{RayCast, World, ray_cast};
use crate::linearize::{compass_jacobian, landmark_bearing_jacobian};

/// A fan of range beams fixed to the robot body.
#[derive(Clone, Debug, PartialEq)]
pub struct LaserScanner {
    /// Beam angles relative to the heading (rad)
    pub beam_angles: Vec<f64>,
    /// Distance reported by a beam that hits nothing
    pub no_hit_range: f64,
}

impl LaserScanner {
    pub fn new(beam_angles: Vec<f64>, no_hit_range: f64) -> LaserScanner {
        LaserScanner {
            beam_angles,
            no_hit_range,
        }
    }
    /// `count` beams evenly spaced from `first` to `last` inclusive.
    pub fn fan(count: usize, first: f64, last: f64, no_hit_range: f64) -> LaserScanner {
        let beam_angles = match count {
            0 => Vec::new(),
            1 => vec![first],
            n => {
                let step = (last - first) / (n - 1) as f64;
                (0..n).map(|i| first + step * i as f64).collect()
            }
        };
        LaserScanner::new(beam_angles, no_hit_range)
    }
    pub fn beam_count(&self) -> usize {
        self.beam_angles.len()
    }
    pub fn scan(&self, pose: &Pose, world: &World) -> RayCast {
        ray_cast(
            &pose.position(),
            pose.theta,
            &self.beam_angles,
            world,
            self.no_hit_range,
        )
    }
}

/// Add i.i.d. $\mathcal{N}(0, \sigma^2)$ noise to every finite range of `scan`.
///
/// Hit points are moved along their beam by the same amount as the range. Non-finite ranges and
/// missing hit points are carried over unchanged.
pub fn add_range_noise<R: Rng + ?Sized>(
    scan: &RayCast,
    variance: f64,
    rng: &mut R,
) -> Result<RayCast> {
    let normal = Normal::new(0.0, variance.sqrt())?;
    let mut noisy = scan.clone();
    for i in 0..noisy.len() {
        if !noisy.distances[i].is_finite() {
            continue;
        }
        let dn = normal.sample(rng);
        noisy.distances[i] += dn;
        if let Some(hit) = noisy.hitpoints[i].as_mut() {
            let a = noisy.angles[i];
            *hit += Vector2::new(a.cos(), a.sin()) * dn;
        }
    }
    Ok(noisy)
}

/// One scalar channel of a landmark observation.
///
/// A source maps the state and the observed landmark to an expected measurement $h$, its row of
/// the measurement Jacobian $H_k$, and its noise model: standard deviation $\sigma$ of the noise
/// term $v$ and the gain with which $v$ enters $h$ (the matching diagonal entry of $V_k$).
pub trait ObservationSource: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, state: &Vector3<f64>, landmark: &Point2<f64>) -> f64;
    fn jacobian(&self, state: &Vector3<f64>, landmark: &Point2<f64>) -> RowVector3<f64>;
    fn noise_std(&self) -> f64;
    fn noise_gain(&self) -> f64 {
        1.0
    }
    /// Whether innovations of this channel are angles to be wrapped.
    fn is_angular(&self) -> bool {
        true
    }
}

/// Absolute heading sensor, $h = \theta + v$.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Compass {
    pub noise_std: f64,
}

impl ObservationSource for Compass {
    fn name(&self) -> &str {
        "compass"
    }
    fn predict(&self, state: &Vector3<f64>, _landmark: &Point2<f64>) -> f64 {
        state[2]
    }
    fn jacobian(&self, _state: &Vector3<f64>, _landmark: &Point2<f64>) -> RowVector3<f64> {
        compass_jacobian()
    }
    fn noise_std(&self) -> f64 {
        self.noise_std
    }
}

/// Bearing to the observed landmark in the body frame, $\alpha = \operatorname{atan2}(y_L - y,
/// x_L - x) - \theta - v$.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LandmarkBearing {
    pub noise_std: f64,
}

impl ObservationSource for LandmarkBearing {
    fn name(&self) -> &str {
        "bearing"
    }
    fn predict(&self, state: &Vector3<f64>, landmark: &Point2<f64>) -> f64 {
        (landmark.y - state[1]).atan2(landmark.x - state[0]) - state[2]
    }
    fn jacobian(&self, state: &Vector3<f64>, landmark: &Point2<f64>) -> RowVector3<f64> {
        landmark_bearing_jacobian(state, landmark)
    }
    fn noise_std(&self) -> f64 {
        self.noise_std
    }
    fn noise_gain(&self) -> f64 {
        -1.0
    }
}
