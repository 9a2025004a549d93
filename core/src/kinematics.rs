//! Wheeled-vehicle motion models.
//!
//! Two drive configurations are supported, both integrated with a midpoint-heading (arc)
//! approximation over one tick:
//!
//! **Differential drive.** Two fixed motor wheels at half-track $l$. For wheel travel
//! $s_l = v_l\,dt$, $s_r = v_r\,dt$ and track $b = 2l$:
//!
//! $$
//! \Delta s = \frac{s_l + s_r}{2}, \quad \Delta\theta = \frac{s_r - s_l}{b}, \quad
//! p' = p + \begin{bmatrix} \Delta s \cos(\theta + \Delta\theta/2) \\\\
//! \Delta s \sin(\theta + \Delta\theta/2) \\\\ \Delta\theta \end{bmatrix}
//! $$
//!
//! **Tricycle drive.** One steerable motor wheel at distance $l$ from the rear axle, steered to
//! $\beta$. With $s = v\,dt$ and $\varphi = \theta - \frac{s}{2l}\cos\beta$:
//!
//! $$
//! p' = p + \begin{bmatrix} s \sin\beta \cos\varphi \\\\ s \sin\beta \sin\varphi \\\\
//! -s\cos\beta / l \end{bmatrix}
//! $$
//!
//! The steering angle is measured from the robot's lateral axis: $\beta = \pi/2$ drives straight
//! ahead and $\beta = 0$ pivots in place.
//!
//! Each model also provides its Jacobians (see [`crate::linearize`]) and the covariance of the two
//! noisy inputs, so that [`MotionModel::predict`] can carry a pose covariance along with the mean.
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use nalgebra::{Matrix2, Matrix3, Matrix3x2};
use serde::{Deserialize, Serialize};

use crate::error::{LocalizationError, Result};
use crate::linalg::propagate_covariance;
use crate::linearize::{
    differential_motion_jacobian, differential_pose_jacobian, tricycle_motion_jacobian,
    tricycle_pose_jacobian,
};
use crate::{Pose, angular_distance};

/// Whether a wheel can be steered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WheelKind {
    Fixed,
    Steerable,
}

/// Geometry of a single wheel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wheel {
    /// Angle of the wheel joint around the robot centre (rad)
    pub alpha: f64,
    /// Distance from the robot centre to the wheel joint (m)
    pub l: f64,
    /// Steering angle (rad), mutable for steerable wheels only
    pub beta: f64,
    /// Offset from the joint to the wheel contact point (m)
    pub d: f64,
    pub kind: WheelKind,
    /// Whether the wheel is driven
    pub motor: bool,
}

impl Wheel {
    pub fn fixed(alpha: f64, l: f64, beta: f64, d: f64, motor: bool) -> Wheel {
        Wheel {
            alpha,
            l,
            beta,
            d,
            kind: WheelKind::Fixed,
            motor,
        }
    }
    pub fn steerable(alpha: f64, l: f64, beta: f64, d: f64, motor: bool) -> Wheel {
        Wheel {
            alpha,
            l,
            beta,
            d,
            kind: WheelKind::Steerable,
            motor,
        }
    }
    pub fn is_steerable(&self) -> bool {
        self.kind == WheelKind::Steerable
    }
    /// Set the steering angle, returning the unsigned change. Fixed wheels are left untouched.
    pub fn steer(&mut self, beta: f64) -> Option<f64> {
        if !self.is_steerable() {
            return None;
        }
        let change = angular_distance(beta, self.beta);
        self.beta = beta;
        Some(change)
    }
}

/// Proportional odometry noise gains.
///
/// The variance of each noisy input grows linearly with the magnitude of that input over the tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryNoise {
    /// left wheel gain $k_l$ of the differential drive
    pub k_left: f64,
    /// right wheel gain $k_r$ of the differential drive
    pub k_right: f64,
    /// travel gain $k_s$ of the tricycle drive
    pub k_distance: f64,
    /// steering gain $k_\beta$ of the tricycle drive
    pub k_steering: f64,
}

impl Default for OdometryNoise {
    fn default() -> Self {
        OdometryNoise {
            k_left: 0.001,
            k_right: 0.001,
            k_distance: 0.001,
            k_steering: 0.001,
        }
    }
}

/// Wheel surface speeds of a differential drive (m/s).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelSpeeds {
    pub left: f64,
    pub right: f64,
}

/// Speed and steering of a tricycle drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SteeringControl {
    /// Surface speed of the steered wheel (m/s)
    pub speed: f64,
    /// Steering angle held over the tick (rad)
    pub steering_angle: f64,
    /// Unsigned steering change since the previous tick (rad), drives the steering noise
    pub steering_change: f64,
}

impl SteeringControl {
    pub fn new(speed: f64, steering_angle: f64, previous_angle: f64) -> SteeringControl {
        SteeringControl {
            speed,
            steering_angle,
            steering_change: angular_distance(steering_angle, previous_angle),
        }
    }
}

/// A motion model advancing a pose under a control input with analytic linearization.
pub trait MotionModel {
    type Control;

    /// Deterministic pose after applying `control` for `dt` seconds.
    fn integrate(&self, pose: &Pose, control: &Self::Control, dt: f64) -> Pose;
    /// $F_p$, the Jacobian of [`MotionModel::integrate`] w.r.t. the pose.
    fn pose_jacobian(&self, pose: &Pose, control: &Self::Control, dt: f64) -> Matrix3<f64>;
    /// $F_\delta$, the Jacobian w.r.t. the two noisy inputs.
    fn motion_jacobian(&self, pose: &Pose, control: &Self::Control, dt: f64) -> Matrix3x2<f64>;
    /// $C_\delta$, the covariance of the two noisy inputs.
    fn motion_covariance(&self, control: &Self::Control, dt: f64) -> Matrix2<f64>;

    /// Advance a pose and its covariance together.
    ///
    /// The Jacobians are taken at the pre-motion pose.
    fn predict(
        &self,
        pose: &Pose,
        covariance: &Matrix3<f64>,
        control: &Self::Control,
        dt: f64,
    ) -> (Pose, Matrix3<f64>) {
        let fp = self.pose_jacobian(pose, control, dt);
        let fd = self.motion_jacobian(pose, control, dt);
        let cd = self.motion_covariance(control, dt);
        (
            self.integrate(pose, control, dt),
            propagate_covariance(covariance, &fp, &fd, &cd),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DifferentialDrive {
    /// Distance from the robot centre to each wheel (m)
    pub half_track: f64,
    pub k_left: f64,
    pub k_right: f64,
}

impl DifferentialDrive {
    pub fn new(half_track: f64, k_left: f64, k_right: f64) -> DifferentialDrive {
        DifferentialDrive {
            half_track,
            k_left,
            k_right,
        }
    }
}

impl MotionModel for DifferentialDrive {
    type Control = WheelSpeeds;

    fn integrate(&self, pose: &Pose, control: &WheelSpeeds, dt: f64) -> Pose {
        let s_left = control.left * dt;
        let s_right = control.right * dt;
        let ds = 0.5 * (s_left + s_right);
        let dtheta = (s_right - s_left) / (2.0 * self.half_track);
        let mid = pose.theta + 0.5 * dtheta;
        Pose::new(
            pose.x + ds * mid.cos(),
            pose.y + ds * mid.sin(),
            pose.theta + dtheta,
        )
    }
    fn pose_jacobian(&self, pose: &Pose, control: &WheelSpeeds, dt: f64) -> Matrix3<f64> {
        differential_pose_jacobian(self.half_track, pose, control.left * dt, control.right * dt)
    }
    fn motion_jacobian(&self, pose: &Pose, control: &WheelSpeeds, dt: f64) -> Matrix3x2<f64> {
        differential_motion_jacobian(self.half_track, pose, control.left * dt, control.right * dt)
    }
    fn motion_covariance(&self, control: &WheelSpeeds, dt: f64) -> Matrix2<f64> {
        // ordered (s_r, s_l) like the motion Jacobian columns
        Matrix2::new(
            self.k_right * (control.right * dt).abs(),
            0.0,
            0.0,
            self.k_left * (control.left * dt).abs(),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TricycleDrive {
    /// Distance from the rear axle centre to the steered wheel (m)
    pub steering_length: f64,
    pub k_distance: f64,
    pub k_steering: f64,
}

impl TricycleDrive {
    pub fn new(steering_length: f64, k_distance: f64, k_steering: f64) -> TricycleDrive {
        TricycleDrive {
            steering_length,
            k_distance,
            k_steering,
        }
    }
}

impl MotionModel for TricycleDrive {
    type Control = SteeringControl;

    fn integrate(&self, pose: &Pose, control: &SteeringControl, dt: f64) -> Pose {
        let s = control.speed * dt;
        let (sin_b, cos_b) = control.steering_angle.sin_cos();
        let phi = pose.theta - s / (2.0 * self.steering_length) * cos_b;
        Pose::new(
            pose.x + s * sin_b * phi.cos(),
            pose.y + s * sin_b * phi.sin(),
            pose.theta - s * cos_b / self.steering_length,
        )
    }
    fn pose_jacobian(&self, pose: &Pose, control: &SteeringControl, dt: f64) -> Matrix3<f64> {
        tricycle_pose_jacobian(
            self.steering_length,
            pose,
            control.speed * dt,
            control.steering_angle,
        )
    }
    fn motion_jacobian(&self, pose: &Pose, control: &SteeringControl, dt: f64) -> Matrix3x2<f64> {
        tricycle_motion_jacobian(
            self.steering_length,
            pose,
            control.speed * dt,
            control.steering_angle,
        )
    }
    fn motion_covariance(&self, control: &SteeringControl, dt: f64) -> Matrix2<f64> {
        Matrix2::new(
            self.k_distance * (control.speed * dt).abs(),
            0.0,
            0.0,
            self.k_steering * control.steering_change.abs(),
        )
    }
}

/// Drive configuration of a robot, selected from its wheel set.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DriveKind {
    Differential(DifferentialDrive),
    Tricycle(TricycleDrive),
}

impl Debug for DriveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveKind::Differential(d) => f
                .debug_struct("Differential")
                .field("half_track", &d.half_track)
                .finish(),
            DriveKind::Tricycle(t) => f
                .debug_struct("Tricycle")
                .field("steering_length", &t.steering_length)
                .finish(),
        }
    }
}

/// Per-tick command matching one of the [`DriveKind`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum DriveCommand {
    Differential(WheelSpeeds),
    Steered(SteeringControl),
}

impl DriveCommand {
    pub fn wheel_speeds(left: f64, right: f64) -> DriveCommand {
        DriveCommand::Differential(WheelSpeeds { left, right })
    }
    pub fn name(&self) -> &'static str {
        match self {
            DriveCommand::Differential(_) => "differential",
            DriveCommand::Steered(_) => "steered",
        }
    }
}

impl DriveKind {
    /// Select the motion model from a named wheel set.
    ///
    /// A single steerable motor wheel makes a tricycle; two fixed motor wheels make a
    /// differential drive whose half-track is the mean joint distance of the two.
    pub fn from_wheels(wheels: &BTreeMap<String, Wheel>, noise: &OdometryNoise) -> Result<Self> {
        let motors: Vec<&Wheel> = wheels.values().filter(|w| w.motor).collect();
        let steered: Vec<&&Wheel> = motors.iter().filter(|w| w.is_steerable()).collect();
        match (motors.len(), steered.len()) {
            (1, 1) => Ok(DriveKind::Tricycle(TricycleDrive::new(
                joint_length(steered[0].l, "steering length")?,
                noise.k_distance,
                noise.k_steering,
            ))),
            (2, 0) => Ok(DriveKind::Differential(DifferentialDrive::new(
                joint_length(0.5 * (motors[0].l + motors[1].l), "half track")?,
                noise.k_left,
                noise.k_right,
            ))),
            (m, s) => Err(LocalizationError::InvalidConfig(format!(
                "unsupported wheel set: {m} motor wheels, {s} of them steerable"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriveKind::Differential(_) => "differential",
            DriveKind::Tricycle(_) => "tricycle",
        }
    }

    fn mismatch(&self, command: &DriveCommand) -> LocalizationError {
        LocalizationError::CommandMismatch {
            command: command.name(),
            drive: self.name(),
        }
    }

    pub fn integrate(&self, pose: &Pose, command: &DriveCommand, dt: f64) -> Result<Pose> {
        match (self, command) {
            (DriveKind::Differential(m), DriveCommand::Differential(c)) => {
                Ok(m.integrate(pose, c, dt))
            }
            (DriveKind::Tricycle(m), DriveCommand::Steered(c)) => Ok(m.integrate(pose, c, dt)),
            _ => Err(self.mismatch(command)),
        }
    }

    /// $(F_p, F_\delta, C_\delta)$ at `pose` for `command`.
    pub fn linearize(
        &self,
        pose: &Pose,
        command: &DriveCommand,
        dt: f64,
    ) -> Result<(Matrix3<f64>, Matrix3x2<f64>, Matrix2<f64>)> {
        match (self, command) {
            (DriveKind::Differential(m), DriveCommand::Differential(c)) => Ok((
                m.pose_jacobian(pose, c, dt),
                m.motion_jacobian(pose, c, dt),
                m.motion_covariance(c, dt),
            )),
            (DriveKind::Tricycle(m), DriveCommand::Steered(c)) => Ok((
                m.pose_jacobian(pose, c, dt),
                m.motion_jacobian(pose, c, dt),
                m.motion_covariance(c, dt),
            )),
            _ => Err(self.mismatch(command)),
        }
    }

    pub fn predict(
        &self,
        pose: &Pose,
        covariance: &Matrix3<f64>,
        command: &DriveCommand,
        dt: f64,
    ) -> Result<(Pose, Matrix3<f64>)> {
        match (self, command) {
            (DriveKind::Differential(m), DriveCommand::Differential(c)) => {
                Ok(m.predict(pose, covariance, c, dt))
            }
            (DriveKind::Tricycle(m), DriveCommand::Steered(c)) => {
                Ok(m.predict(pose, covariance, c, dt))
            }
            _ => Err(self.mismatch(command)),
        }
    }
}

/// Both drive models divide by the joint length, so it must be a positive number.
fn joint_length(l: f64, what: &str) -> Result<f64> {
    if l.is_finite() && l > 0.0 {
        Ok(l)
    } else {
        Err(LocalizationError::InvalidConfig(format!(
            "{what} must be finite and positive, got {l}"
        )))
    }
}
