//! End-to-end scenarios for the simulation core
//!
//! These tests drive complete [`Simulation`]s through a walled room and check the observable
//! behaviour a renderer relies on:
//! 1. Range beams and collisions against known geometry
//! 2. Collision rollback keeps the robot out of the walls over many ticks
//! 3. Both estimators stay close to the ground truth while the robot moves
//! 4. Seeded runs are reproducible, including runs configured from a file
//!
//! The error bounds are loose regression limits, not accuracy targets.
use std::f64::consts::{FRAC_PI_2, PI};

use assert_approx_eq::assert_approx_eq;
use nalgebra::{Matrix3, Point2};
use tempfile::tempdir;

use robosim::config::SimulationConfig;
use robosim::geometry::{Segment, World, collides, ray_cast};
use robosim::kalman::{Association, LandmarkMap};
use robosim::kinematics::{DriveCommand, OdometryNoise};
use robosim::measurements::LaserScanner;
use robosim::robot::{Robot, rectangular_hull};
use robosim::sim::{DEFAULT_LANDMARKS, Simulation, TickOutput, TickRecord};
use robosim::{Pose, PoseEstimator, angular_distance};

fn room() -> World {
    World::rectangle(Point2::new(0.0, 0.0), 10.0, 10.0)
}

fn beams() -> Vec<f64> {
    LaserScanner::fan(9, -FRAC_PI_2, FRAC_PI_2, f64::INFINITY).beam_angles
}

fn differential(pose: Pose) -> Robot {
    Robot::differential(
        pose,
        0.2,
        rectangular_hull(0.5, 0.4),
        beams(),
        &OdometryNoise::default(),
    )
    .unwrap()
}

fn config(seed: u64) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.seed = Some(seed);
    config
}

fn position_error(a: &Pose, b: &Pose) -> f64 {
    (a.position() - b.position()).norm()
}

/// Straight legs joined by gentle left turns, staying inside the room from (2, 2).
fn lap(ticks: usize) -> Vec<DriveCommand> {
    (0..ticks)
        .map(|i| match i % 30 {
            0..20 => DriveCommand::wheel_speeds(0.5, 0.5),
            _ => DriveCommand::wheel_speeds(0.1, 0.5),
        })
        .collect()
}

#[test]
fn single_wall_range_and_hitpoint() {
    let world = World::from_arrays(&[[5.0, 0.0, 5.0, 4.0]]);
    let scan = ray_cast(&Point2::new(2.0, 2.0), 0.0, &[0.0, PI], &world, f64::INFINITY);
    assert_approx_eq!(scan.distances[0], 3.0, 1e-12);
    let hit = scan.hitpoints[0].unwrap();
    assert_approx_eq!(hit.x, 5.0, 1e-12);
    assert_approx_eq!(hit.y, 2.0, 1e-12);
    assert!(scan.distances[1].is_infinite());
    assert!(scan.hitpoints[1].is_none());
}

#[test]
fn unit_square_hull_collides_with_crossing_wall() {
    let hull = rectangular_hull(1.0, 1.0);
    let crossing = World::new(vec![Segment::new(-1.0, 0.2, 1.0, 0.2)]);
    assert!(collides(&crossing, &hull, &Pose::default()));
    let far = World::new(vec![Segment::new(-1.0, 3.0, 1.0, 3.0)]);
    assert!(!collides(&far, &hull, &Pose::default()));
}

#[test]
fn robot_never_passes_through_a_wall() {
    let robot = differential(Pose::new(8.0, 5.0, 0.0));
    let mut sim = Simulation::new(robot, room(), config(3)).unwrap();
    let forward = vec![DriveCommand::wheel_speeds(0.5, 0.5); 60];
    let outputs = sim.run(&forward, 0.1).unwrap();
    let first = outputs.iter().position(|o| o.collided).unwrap();
    assert!(outputs[first..].iter().all(|o| o.collided));
    let stopped = outputs[first].pose;
    for out in &outputs[first..] {
        assert_eq!(out.pose, stopped);
    }
    assert!(stopped.x + 0.25 <= 10.0);
    assert!(!sim.robot().collides(sim.world()));
}

#[test]
fn removing_a_wall_clears_the_way() {
    let mut world = room();
    world.add_segment(Segment::new(6.0, 0.0, 6.0, 4.0));
    let robot = differential(Pose::new(5.5, 2.0, 0.0));
    let mut sim = Simulation::new(robot, world, config(5)).unwrap();
    let forward = DriveCommand::wheel_speeds(0.5, 0.5);
    assert!(sim.tick(&forward, 1.0).unwrap().collided);

    let removed = sim.world_mut().remove_at(&Point2::new(6.0, 2.0), 1e-6);
    assert_eq!(removed, Some(Segment::new(6.0, 0.0, 6.0, 4.0)));
    let out = sim.tick(&forward, 1.0).unwrap();
    assert!(!out.collided);
    assert_approx_eq!(out.pose.x, 6.0, 1e-12);
}

#[test]
fn estimators_track_a_differential_robot() {
    let mut cfg = config(17);
    cfg.particle_filter.num_particles = 200;
    cfg.particle_filter.measurement_sigma = 0.3;
    let mut sim = Simulation::new(differential(Pose::new(2.0, 2.0, 0.0)), room(), cfg).unwrap();
    sim.attach_particle_filter(&Matrix3::from_diagonal_element(0.01))
        .unwrap();
    sim.attach_ekf(
        Matrix3::from_diagonal_element(0.01),
        LandmarkMap::from_arrays(&DEFAULT_LANDMARKS),
    );
    let outputs = sim.run(&lap(90), 0.1).unwrap();
    assert!(outputs.iter().all(|o| !o.collided));

    let last = outputs.last().unwrap();
    let pf = last.particle_estimate.unwrap();
    let ekf = last.ekf_estimate.unwrap();
    assert!(position_error(&pf, &last.pose) < 0.5, "pf at {pf}, truth {}", last.pose);
    assert!(position_error(&ekf, &last.pose) < 0.3, "ekf at {ekf}, truth {}", last.pose);
    assert!(angular_distance(ekf.theta, last.pose.theta) < 0.1);

    let matched = outputs
        .iter()
        .filter(|o| matches!(o.association, Some(Association::Matched { .. })))
        .count();
    assert!(matched > 0);
    let c = last.ekf_covariance.unwrap();
    assert!(c[(2, 2)] < 0.01);
}

#[test]
fn ekf_tracks_a_tricycle() {
    let robot = Robot::tricycle(
        Pose::new(2.0, 5.0, 0.0),
        0.46,
        0.2,
        rectangular_hull(0.7, 0.4),
        beams(),
        &OdometryNoise::default(),
    )
    .unwrap();
    let mut sim = Simulation::new(robot, room(), config(23)).unwrap();
    sim.attach_ekf(
        Matrix3::from_diagonal_element(0.01),
        LandmarkMap::from_arrays(&DEFAULT_LANDMARKS),
    );
    let mut last = None;
    for tick in 0..60 {
        let steering = if tick < 30 { FRAC_PI_2 } else { 1.3 };
        let command = sim.robot().steer_command(0.4, steering);
        last = Some(sim.tick(&command, 0.1).unwrap());
    }
    let last = last.unwrap();
    assert!(!last.collided);
    assert!(last.pose.theta < 0.0, "steering below a quarter turn turns right");
    let ekf = sim.ekf().unwrap().get_estimate();
    assert!(position_error(&ekf, &last.pose) < 0.3);
    assert!(sim.robot().covariance()[(0, 0)] > 0.0);
}

#[test]
fn deferred_particle_updates_replay_every_step() {
    let mut cfg = config(29);
    cfg.particle_filter.update_frequency = 3;
    let mut sim = Simulation::new(differential(Pose::new(3.0, 5.0, 0.0)), room(), cfg).unwrap();
    sim.attach_particle_filter(&Matrix3::from_diagonal_element(1e-4))
        .unwrap();
    let forward = DriveCommand::wheel_speeds(0.5, 0.5);
    let first = sim.tick(&forward, 0.2).unwrap();
    let second = sim.tick(&forward, 0.2).unwrap();
    let third = sim.tick(&forward, 0.2).unwrap();
    assert!(!first.particles_updated && !second.particles_updated);
    assert!(third.particles_updated);
    assert_approx_eq!(second.particle_estimate.unwrap().x, 3.0, 0.05);
    assert_approx_eq!(third.particle_estimate.unwrap().x, 3.3, 0.1);
}

#[test]
fn seeded_runs_from_a_config_file_are_reproducible() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.toml");
    let mut cfg = config(99);
    cfg.particle_filter.num_particles = 40;
    cfg.to_file(&path).unwrap();

    let run = || -> Vec<TickRecord> {
        let cfg = SimulationConfig::from_file(&path).unwrap();
        let mut sim = Simulation::new(differential(Pose::new(2.0, 2.0, 0.0)), room(), cfg).unwrap();
        sim.attach_particle_filter(&Matrix3::from_diagonal_element(0.01))
            .unwrap();
        sim.attach_ekf(
            Matrix3::from_diagonal_element(0.01),
            LandmarkMap::from_arrays(&DEFAULT_LANDMARKS),
        );
        sim.run(&lap(20), 0.1)
            .unwrap()
            .iter()
            .map(TickOutput::record)
            .collect()
    };
    assert_eq!(run(), run());
}
