//! Tick driver and run records.
//!
//! A [`Simulation`] owns the robot, the world and the optional estimators. Each call to
//! [`Simulation::tick`] moves the robot under one drive command, senses from the new pose, feeds the
//! estimators and finally tests the robot's hull against the walls. A collision rolls the robot's
//! pose and covariance back to where they were before the tick; the estimators keep their update.
//! A tick that fails also rolls the robot back.
//!
//! Runs can be stored as flat [`TickRecord`] rows with [`write_records_csv`].
use std::fs::File;
use std::io;
use std::path::Path;

use log::{debug, warn};
use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::{LocalizationError, Result};
use crate::geometry::{RayCast, World};
use crate::kalman::{Association, ExtendedKalmanFilter, LandmarkMap};
use crate::kinematics::DriveCommand;
use crate::measurements::add_range_noise;
use crate::particle::{Particle, ParticleFilter};
use crate::robot::Robot;
use crate::{Pose, PoseEstimator};

/// Landmarks of the stock demo room.
pub const DEFAULT_LANDMARKS: [[f64; 2]; 3] = [[3.0, 3.0], [7.0, 10.0], [5.0, 3.0]];

/// Everything a renderer needs after one tick.
#[derive(Clone, Debug)]
pub struct TickOutput {
    pub tick: u64,
    /// Simulated time at the end of the tick (s)
    pub time: f64,
    /// Ground-truth pose after the tick, rolled back on collision
    pub pose: Pose,
    /// Odometry covariance $C_p$
    pub covariance: Matrix3<f64>,
    /// Noise-free scan from `pose`, infinite where a beam hits nothing
    pub scan: RayCast,
    /// Current particle cloud, empty without a particle filter
    pub particles: Vec<Particle>,
    pub particle_estimate: Option<Pose>,
    /// Effective sample size of the particle weights
    pub effective_particles: Option<f64>,
    /// Whether this tick closed a particle update cycle
    pub particles_updated: bool,
    pub ekf_estimate: Option<Pose>,
    pub ekf_covariance: Option<Matrix3<f64>>,
    /// Data association of this tick's landmark observation
    pub association: Option<Association>,
    pub collided: bool,
}

/// Flat, serializable summary of a [`TickOutput`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick: u64,
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub var_x: f64,
    pub var_y: f64,
    pub var_theta: f64,
    pub pf_x: Option<f64>,
    pub pf_y: Option<f64>,
    pub pf_theta: Option<f64>,
    pub pf_effective_particles: Option<f64>,
    pub ekf_x: Option<f64>,
    pub ekf_y: Option<f64>,
    pub ekf_theta: Option<f64>,
    pub ekf_var_x: Option<f64>,
    pub ekf_var_y: Option<f64>,
    pub ekf_var_theta: Option<f64>,
    /// `matched`, `ambiguous`, `none` or empty without an EKF observation
    pub association: String,
    pub landmark: Option<usize>,
    pub beam_hits: usize,
    pub collided: bool,
}

impl TickOutput {
    pub fn record(&self) -> TickRecord {
        let (association, landmark) = match &self.association {
            Some(Association::Matched { index, .. }) => ("matched".to_string(), Some(*index)),
            Some(Association::Ambiguous { .. }) => ("ambiguous".to_string(), None),
            Some(Association::NoCandidate) => ("none".to_string(), None),
            None => (String::new(), None),
        };
        TickRecord {
            tick: self.tick,
            time: self.time,
            x: self.pose.x,
            y: self.pose.y,
            theta: self.pose.theta,
            var_x: self.covariance[(0, 0)],
            var_y: self.covariance[(1, 1)],
            var_theta: self.covariance[(2, 2)],
            pf_x: self.particle_estimate.map(|p| p.x),
            pf_y: self.particle_estimate.map(|p| p.y),
            pf_theta: self.particle_estimate.map(|p| p.theta),
            pf_effective_particles: self.effective_particles,
            ekf_x: self.ekf_estimate.map(|p| p.x),
            ekf_y: self.ekf_estimate.map(|p| p.y),
            ekf_theta: self.ekf_estimate.map(|p| p.theta),
            ekf_var_x: self.ekf_covariance.map(|c| c[(0, 0)]),
            ekf_var_y: self.ekf_covariance.map(|c| c[(1, 1)]),
            ekf_var_theta: self.ekf_covariance.map(|c| c[(2, 2)]),
            association,
            landmark,
            beam_hits: self.scan.hit_count(),
            collided: self.collided,
        }
    }
}

/// Write run records as CSV with a header row.
pub fn write_records_csv<P: AsRef<Path>>(path: P, records: &[TickRecord]) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read records written by [`write_records_csv`].
pub fn read_records_csv<P: AsRef<Path>>(path: P) -> io::Result<Vec<TickRecord>> {
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let mut records = Vec::new();
    for result in reader.deserialize() {
        records.push(result?);
    }
    Ok(records)
}

pub struct Simulation {
    robot: Robot,
    world: World,
    particle_filter: Option<ParticleFilter>,
    ekf: Option<ExtendedKalmanFilter>,
    config: SimulationConfig,
    rng: StdRng,
    tick: u64,
    time: f64,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.tick)
            .field("pose", &self.robot.pose())
            .field("walls", &self.world.len())
            .field("particle_filter", &self.particle_filter.is_some())
            .field("ekf", &self.ekf.is_some())
            .finish()
    }
}

impl Simulation {
    /// Simulation without estimators. The configuration is validated first.
    pub fn new(robot: Robot, world: World, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        debug!("simulation seed {seed}");
        Ok(Simulation {
            robot,
            world,
            particle_filter: None,
            ekf: None,
            config,
            rng: StdRng::seed_from_u64(seed),
            tick: 0,
            time: 0.0,
        })
    }

    pub fn set_particle_filter(&mut self, filter: ParticleFilter) {
        self.particle_filter = Some(filter);
    }
    pub fn set_ekf(&mut self, ekf: ExtendedKalmanFilter) {
        self.ekf = Some(ekf);
    }

    /// Track the robot with particles drawn around its current pose.
    pub fn attach_particle_filter(&mut self, covariance: &Matrix3<f64>) -> Result<()> {
        let seed = self.rng.random();
        let filter = ParticleFilter::around_pose(
            &self.robot.pose(),
            covariance,
            &self.config.particle_filter,
            seed,
        )?;
        self.particle_filter = Some(filter);
        Ok(())
    }

    /// Global localization: particles spread over the bounding box of the walls.
    pub fn attach_global_particle_filter(&mut self) -> Result<()> {
        let (min, max) = self.world.bounds().ok_or_else(|| {
            LocalizationError::InvalidConfig("cannot spread particles over an empty world".into())
        })?;
        let seed = self.rng.random();
        let filter =
            ParticleFilter::uniform_in_bounds(min, max, &self.config.particle_filter, seed)?;
        self.particle_filter = Some(filter);
        Ok(())
    }

    /// Landmark EKF starting at the robot's current pose.
    pub fn attach_ekf(&mut self, covariance: Matrix3<f64>, landmarks: LandmarkMap) {
        self.ekf = Some(ExtendedKalmanFilter::with_compass_and_bearing(
            self.robot.pose(),
            covariance,
            landmarks,
            &self.config.kalman,
        ));
    }

    pub fn robot(&self) -> &Robot {
        &self.robot
    }
    pub fn robot_mut(&mut self) -> &mut Robot {
        &mut self.robot
    }
    pub fn world(&self) -> &World {
        &self.world
    }
    /// Walls may be edited between ticks.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
    pub fn particle_filter(&self) -> Option<&ParticleFilter> {
        self.particle_filter.as_ref()
    }
    pub fn ekf(&self) -> Option<&ExtendedKalmanFilter> {
        self.ekf.as_ref()
    }
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Advance the world by one tick of `dt` seconds.
    ///
    /// A failed tick leaves the robot where it was before the tick.
    pub fn tick(&mut self, command: &DriveCommand, dt: f64) -> Result<TickOutput> {
        let before = self.robot.snapshot();
        self.robot.apply(command, dt)?;
        let (particles_updated, association) = match self.update_estimators(command, dt) {
            Ok(updates) => updates,
            Err(e) => {
                self.robot.restore(before);
                return Err(e);
            }
        };

        let collided = self.robot.collides(&self.world);
        if collided {
            warn!(
                "collision at {}, rolling back to {}",
                self.robot.pose(),
                before.pose
            );
            self.robot.restore(before);
        }

        self.tick += 1;
        self.time += dt;
        let particle_filter = self.particle_filter.as_ref();
        Ok(TickOutput {
            tick: self.tick,
            time: self.time,
            pose: self.robot.pose(),
            covariance: self.robot.covariance(),
            scan: self.robot.scan(&self.world, f64::INFINITY),
            particles: particle_filter
                .map(|pf| pf.particles().to_vec())
                .unwrap_or_default(),
            particle_estimate: particle_filter.map(|pf| pf.get_estimate()),
            effective_particles: particle_filter.map(|pf| pf.effective_sample_size()),
            particles_updated,
            ekf_estimate: self.ekf.as_ref().map(|ekf| ekf.get_estimate()),
            ekf_covariance: self.ekf.as_ref().map(|ekf| ekf.get_certainty()),
            association,
            collided,
        })
    }

    /// Sense from the robot's moved pose and feed both estimators.
    fn update_estimators(
        &mut self,
        command: &DriveCommand,
        dt: f64,
    ) -> Result<(bool, Option<Association>)> {
        let drive = *self.robot.drive();
        let pose = self.robot.pose();

        let mut particles_updated = false;
        if let Some(filter) = self.particle_filter.as_mut() {
            let scanner = self.robot.scanner(self.config.sensor.no_hit_range);
            let observed = add_range_noise(
                &scanner.scan(&pose, &self.world),
                self.config.sensor.range_noise_variance,
                &mut self.rng,
            )?;
            particles_updated = filter.step(
                &drive,
                command,
                dt,
                &observed.distances,
                &self.world,
                &scanner,
            )?;
        }

        let mut association = None;
        if let Some(ekf) = self.ekf.as_mut() {
            match ekf.landmarks().sample(&mut self.rng) {
                Some((index, landmark)) => {
                    debug!("observing landmark {index} at {landmark}");
                    let z = ekf.simulate_observation(&pose, &landmark, &mut self.rng)?;
                    association = Some(ekf.step(&drive, command, dt, &z)?);
                }
                None => ekf.predict(&drive, command, dt)?,
            }
        }
        Ok((particles_updated, association))
    }

    /// Run every command for one tick each.
    pub fn run<'a, I>(&mut self, commands: I, dt: f64) -> Result<Vec<TickOutput>>
    where
        I: IntoIterator<Item = &'a DriveCommand>,
    {
        commands
            .into_iter()
            .map(|command| self.tick(command, dt))
            .collect()
    }
}
