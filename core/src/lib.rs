//! Localization and physical simulation core for a 2D mobile robot
//!
//! This crate advances a robot's pose under noisy wheeled-vehicle kinematics, propagates the
//! uncertainty of that pose, simulates a fan of range beams against a world made of straight wall
//! segments, detects collisions between the robot's body and the walls, and fuses the simulated
//! measurements into a pose estimate using two competing estimators: a weighted particle filter
//! (Monte Carlo localization) and an Extended Kalman Filter that associates bearing observations
//! with a known set of landmarks.
//!
//! Rendering, input handling, and world file loading are left to the caller. The core consumes a
//! drive command, the wall geometry and the elapsed time for each tick, and produces the
//! ground-truth pose, its covariance, the particle cloud, the EKF estimate and the beam hit points.
//!
//! This crate is primarily built off of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): fixed and dynamic matrices for poses, Jacobians and covariances.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): noise injection and particle sampling.
//! - [`rayon`](https://crates.io/crates/rayon): parallel particle reweighting.
//!
//! ## Crate overview
//!
//! - [geometry]: ray casting, rigid transforms and segment intersection on the wall set.
//! - [kinematics]: differential and tricycle drive motion models.
//! - [linearize]: analytic Jacobians of both motion models.
//! - [linalg]: covariance propagation and symmetric positive definite helpers.
//! - [measurements]: range sensor simulation and the EKF observation sources.
//! - [particle]: the particle filter.
//! - [kalman]: the landmark EKF with gated data association.
//! - [robot]: the robot aggregate the simulation moves around.
//! - [config]: serializable configuration.
//! - [sim]: the per-tick driver tying everything together.
//!
//! ## Pose convention
//!
//! A pose is the planar rigid transform of the robot body in the world frame:
//!
//! $$
//! p = [x, y, \theta]
//! $$
//!
//! with $\theta$ the heading in radians, counter-clockwise from the world $x$ axis. Headings are
//! accumulated without wrapping; use [`wrap_to_pi`] where a normalized angle is needed.
pub mod config;
pub mod error;
pub mod geometry;
pub mod kalman;
pub mod kinematics;
pub mod linalg;
pub mod linearize;
pub mod measurements;
pub mod particle;
pub mod robot;
pub mod sim;

use nalgebra::{Isometry2, Matrix3, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use std::convert::{From, TryFrom};
use std::f64::consts::PI;
use std::fmt::{self, Display};

pub use error::{LocalizationError, Result};

/// Common read-out interface of the pose estimators.
///
/// The particle filter and the EKF are driven with different inputs (range scans versus landmark
/// observations) but both expose a mean pose and a 3×3 covariance that the caller can render or
/// compare against ground truth.
pub trait PoseEstimator {
    fn get_estimate(&self) -> Pose;
    fn get_certainty(&self) -> Matrix3<f64>;
}

/// Planar robot pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// x position in the world frame (m)
    pub x: f64,
    /// y position in the world frame (m)
    pub y: f64,
    /// heading (rad)
    pub theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Pose {
        Pose { x, y, theta }
    }
    /// Position component of the pose.
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Unit vector along the heading.
    pub fn heading(&self) -> Vector2<f64> {
        Vector2::new(self.theta.cos(), self.theta.sin())
    }
    /// Body-to-world rigid transform.
    pub fn isometry(&self) -> Isometry2<f64> {
        Isometry2::new(Vector2::new(self.x, self.y), self.theta)
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
}

impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose {{ x: {:.4}, y: {:.4}, theta: {:.4} }}",
            self.x, self.y, self.theta
        )
    }
}

impl From<Vector3<f64>> for Pose {
    fn from(v: Vector3<f64>) -> Self {
        Pose::new(v[0], v[1], v[2])
    }
}

impl From<Pose> for Vector3<f64> {
    fn from(p: Pose) -> Self {
        Vector3::new(p.x, p.y, p.theta)
    }
}

impl From<&Pose> for Vector3<f64> {
    fn from(p: &Pose) -> Self {
        Vector3::new(p.x, p.y, p.theta)
    }
}

impl From<[f64; 3]> for Pose {
    fn from(a: [f64; 3]) -> Self {
        Pose::new(a[0], a[1], a[2])
    }
}

impl TryFrom<&[f64]> for Pose {
    type Error = LocalizationError;

    fn try_from(slice: &[f64]) -> Result<Self> {
        match slice {
            [x, y, theta] => Ok(Pose::new(*x, *y, *theta)),
            _ => Err(LocalizationError::InvalidDimension {
                expected: 3,
                actual: slice.len(),
            }),
        }
    }
}

/// Wrap an angle to the range $(-\pi, \pi]$ radians.
///
/// # Example
/// ```rust
/// use robosim::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI { PI } else { wrapped }
}

/// Wrap an angle to the range $[0, 2\pi)$ radians.
pub fn wrap_to_2pi(angle: f64) -> f64 {
    angle.rem_euclid(2.0 * PI)
}

/// Unsigned angular distance between two angles in $[0, \pi]$.
///
/// Used as the magnitude of a steering change: `acos(cos(a - b))`.
pub fn angular_distance(a: f64, b: f64) -> f64 {
    (a - b).cos().clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_wrap_to_pi() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(0.25), 0.25, 1e-12);
        assert_approx_eq!(wrap_to_pi(0.25 + 8.0 * PI), 0.25, 1e-9);
    }

    #[test]
    fn test_wrap_to_2pi() {
        assert_approx_eq!(wrap_to_2pi(-PI / 2.0), 3.0 * PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_2pi(5.0 * PI), PI, 1e-9);
    }

    #[test]
    fn angular_distance_is_symmetric_and_bounded() {
        assert_approx_eq!(angular_distance(0.1, -0.1), 0.2, 1e-12);
        assert_approx_eq!(angular_distance(-0.1, 0.1), 0.2, 1e-12);
        assert_approx_eq!(angular_distance(PI - 0.1, -PI + 0.1), 0.2, 1e-9);
        assert_approx_eq!(angular_distance(0.0, PI), PI, 1e-12);
    }

    #[test]
    fn pose_vector_conversions() {
        let pose = Pose::new(1.0, -2.0, 0.5);
        let v: Vector3<f64> = pose.into();
        assert_eq!(v, Vector3::new(1.0, -2.0, 0.5));
        assert_eq!(Pose::from(v), pose);
        let slice = [1.0, -2.0, 0.5];
        assert_eq!(Pose::try_from(&slice[..]).unwrap(), pose);
    }

    #[test]
    fn pose_from_short_slice_is_rejected() {
        let slice = [1.0, 2.0];
        match Pose::try_from(&slice[..]) {
            Err(LocalizationError::InvalidDimension { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn isometry_maps_local_points() {
        let pose = Pose::new(1.0, 2.0, PI / 2.0);
        let p = pose.isometry() * Point2::new(1.0, 0.0);
        assert_approx_eq!(p.x, 1.0, 1e-12);
        assert_approx_eq!(p.y, 3.0, 1e-12);
    }
}
