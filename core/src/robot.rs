//! The simulated robot: ground-truth pose, its covariance, wheels, body hull and beam fan.
use std::collections::BTreeMap;
use std::f64::consts::PI;

use nalgebra::Matrix3;

use crate::Pose;
use crate::error::Result;
use crate::geometry::{RayCast, Segment, World, collides};
use crate::kinematics::{DriveCommand, DriveKind, OdometryNoise, SteeringControl, Wheel};
use crate::measurements::LaserScanner;

/// The mutable part of a [`Robot`], captured before a tick so a collision can undo it.
#[derive(Clone, Debug, PartialEq)]
pub struct RobotState {
    pub pose: Pose,
    pub covariance: Matrix3<f64>,
    pub wheels: BTreeMap<String, Wheel>,
}

#[derive(Clone, Debug)]
pub struct Robot {
    pose: Pose,
    covariance: Matrix3<f64>,
    wheels: BTreeMap<String, Wheel>,
    hull: Vec<Segment>,
    beam_angles: Vec<f64>,
    drive: DriveKind,
}

/// Robot-local rectangle centred on the origin, `length` along the heading.
pub fn rectangular_hull(length: f64, width: f64) -> Vec<Segment> {
    let (hx, hy) = (0.5 * length, 0.5 * width);
    vec![
        Segment::new(-hx, -hy, hx, -hy),
        Segment::new(hx, -hy, hx, hy),
        Segment::new(hx, hy, -hx, hy),
        Segment::new(-hx, hy, -hx, -hy),
    ]
}

impl Robot {
    /// Robot with a drive model chosen from its wheel set and a zero initial covariance.
    pub fn new(
        pose: Pose,
        wheels: BTreeMap<String, Wheel>,
        hull: Vec<Segment>,
        beam_angles: Vec<f64>,
        noise: &OdometryNoise,
    ) -> Result<Robot> {
        let drive = DriveKind::from_wheels(&wheels, noise)?;
        Ok(Robot {
            pose,
            covariance: Matrix3::zeros(),
            wheels,
            hull,
            beam_angles,
            drive,
        })
    }

    /// Two fixed motor wheels `half_track` either side of the centre.
    pub fn differential(
        pose: Pose,
        half_track: f64,
        hull: Vec<Segment>,
        beam_angles: Vec<f64>,
        noise: &OdometryNoise,
    ) -> Result<Robot> {
        let mut wheels = BTreeMap::new();
        wheels.insert(
            "left".to_string(),
            Wheel::fixed(PI / 2.0, half_track, 0.0, 0.0, true),
        );
        wheels.insert(
            "right".to_string(),
            Wheel::fixed(-PI / 2.0, half_track, PI, 0.0, true),
        );
        Robot::new(pose, wheels, hull, beam_angles, noise)
    }

    /// A steered front motor wheel `steering_length` ahead of two idle rear wheels.
    pub fn tricycle(
        pose: Pose,
        steering_length: f64,
        rear_half_track: f64,
        hull: Vec<Segment>,
        beam_angles: Vec<f64>,
        noise: &OdometryNoise,
    ) -> Result<Robot> {
        let mut wheels = BTreeMap::new();
        wheels.insert(
            "front".to_string(),
            Wheel::steerable(0.0, steering_length, PI / 2.0, 0.0, true),
        );
        wheels.insert(
            "rear_left".to_string(),
            Wheel::fixed(PI / 2.0, rear_half_track, 0.0, 0.0, false),
        );
        wheels.insert(
            "rear_right".to_string(),
            Wheel::fixed(-PI / 2.0, rear_half_track, PI, 0.0, false),
        );
        Robot::new(pose, wheels, hull, beam_angles, noise)
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }
    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }
    /// Accumulated odometry covariance $C_p$.
    pub fn covariance(&self) -> Matrix3<f64> {
        self.covariance
    }
    pub fn set_covariance(&mut self, covariance: Matrix3<f64>) {
        self.covariance = covariance;
    }
    pub fn drive(&self) -> &DriveKind {
        &self.drive
    }
    pub fn wheels(&self) -> &BTreeMap<String, Wheel> {
        &self.wheels
    }
    pub fn hull(&self) -> &[Segment] {
        &self.hull
    }
    pub fn beam_angles(&self) -> &[f64] {
        &self.beam_angles
    }

    /// Steering angle of the steered motor wheel, if the robot has one.
    pub fn steering_angle(&self) -> Option<f64> {
        self.wheels
            .values()
            .find(|w| w.motor && w.is_steerable())
            .map(|w| w.beta)
    }

    /// Tricycle command steering from the current wheel angle to `steering_angle`.
    pub fn steer_command(&self, speed: f64, steering_angle: f64) -> DriveCommand {
        let previous = self.steering_angle().unwrap_or(steering_angle);
        DriveCommand::Steered(SteeringControl::new(speed, steering_angle, previous))
    }

    /// Advance the pose and $C_p$ by one drive step; steered wheels take the commanded angle.
    pub fn apply(&mut self, command: &DriveCommand, dt: f64) -> Result<()> {
        let (pose, covariance) = self.drive.predict(&self.pose, &self.covariance, command, dt)?;
        self.pose = pose;
        self.covariance = covariance;
        if let DriveCommand::Steered(control) = command {
            for wheel in self.wheels.values_mut().filter(|w| w.motor) {
                wheel.steer(control.steering_angle);
            }
        }
        Ok(())
    }

    pub fn scanner(&self, no_hit_range: f64) -> LaserScanner {
        LaserScanner::new(self.beam_angles.clone(), no_hit_range)
    }
    pub fn scan(&self, world: &World, no_hit_range: f64) -> RayCast {
        self.scanner(no_hit_range).scan(&self.pose, world)
    }
    pub fn collides(&self, world: &World) -> bool {
        collides(world, &self.hull, &self.pose)
    }

    pub fn snapshot(&self) -> RobotState {
        RobotState {
            pose: self.pose,
            covariance: self.covariance,
            wheels: self.wheels.clone(),
        }
    }
    pub fn restore(&mut self, state: RobotState) {
        self.pose = state.pose;
        self.covariance = state.covariance;
        self.wheels = state.wheels;
    }
}
