//! Extended Kalman Filter with gated landmark association
//!
//! The filter tracks the pose mean $x$ and covariance $C$. Prediction runs the drive model with
//! its analytic Jacobians. A correction takes one measurement vector $z$ stacked from the filter's
//! [`ObservationSource`]s (by default a compass and the bearing to one landmark). Which landmark
//! produced $z$ is not known, so every landmark of the map is tried:
//!
//! $$
//! \hat z_j = h(x, L_j), \quad S_j = H_j C H_j^T + V N V^T, \quad
//! d_j = \nu_j^T S_j^{-1} \nu_j, \quad \nu_j = z - \hat z_j
//! $$
//!
//! Landmarks with $d_j < g$ are candidates. Exactly one candidate is a match and triggers the
//! update
//!
//! $$
//! K = C H^T S^{-1}, \quad x \leftarrow x + K \nu, \quad C \leftarrow C - K S K^T
//! $$
//!
//! Zero candidates or several candidates leave the prediction as the committed estimate. Angular
//! innovations are wrapped to $(-\pi, \pi]$ before gating.
use log::{debug, info};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use std::fmt::{self, Debug};

use crate::config::KalmanConfig;
use crate::error::{LocalizationError, Result};
use crate::kinematics::{DriveCommand, DriveKind};
use crate::linalg::{mahalanobis_squared, robust_spd_solve, symmetrize3};
use crate::measurements::{Compass, LandmarkBearing, ObservationSource};
use crate::{Pose, PoseEstimator, wrap_to_pi};

/// Known landmark positions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LandmarkMap {
    landmarks: Vec<Point2<f64>>,
}

impl LandmarkMap {
    pub fn new(landmarks: Vec<Point2<f64>>) -> LandmarkMap {
        LandmarkMap { landmarks }
    }
    pub fn from_arrays(points: &[[f64; 2]]) -> LandmarkMap {
        LandmarkMap::new(points.iter().map(|p| Point2::new(p[0], p[1])).collect())
    }
    pub fn landmarks(&self) -> &[Point2<f64>] {
        &self.landmarks
    }
    pub fn get(&self, index: usize) -> Option<&Point2<f64>> {
        self.landmarks.get(index)
    }
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
    /// Pick one landmark uniformly at random.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(usize, Point2<f64>)> {
        if self.landmarks.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.landmarks.len());
        Some((index, self.landmarks[index]))
    }
}

/// Outcome of matching one observation against the landmark map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Association {
    /// Exactly one landmark inside the gate.
    Matched { index: usize, distance: f64 },
    /// Several landmarks inside the gate; rejected.
    Ambiguous { candidates: usize },
    /// No landmark inside the gate.
    NoCandidate,
}

impl Association {
    pub fn is_match(&self) -> bool {
        matches!(self, Association::Matched { .. })
    }
}

/// Linearized measurement quantities of one landmark hypothesis.
struct Hypothesis {
    innovation: DVector<f64>,
    jacobian: DMatrix<f64>,
    innovation_covariance: DMatrix<f64>,
}

pub struct ExtendedKalmanFilter {
    mean: Vector3<f64>,
    covariance: Matrix3<f64>,
    sources: Vec<Box<dyn ObservationSource>>,
    landmarks: LandmarkMap,
    gate: f64,
}

impl Debug for ExtendedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("ExtendedKalmanFilter")
            .field("mean", &Pose::from(self.mean))
            .field("covariance_diag", &self.covariance.diagonal().as_slice())
            .field("sources", &names)
            .field("landmarks", &self.landmarks.len())
            .field("gate", &self.gate)
            .finish()
    }
}

impl ExtendedKalmanFilter {
    /// Filter without observation sources; add them with [`ExtendedKalmanFilter::add_source`].
    pub fn new(
        initial: Pose,
        covariance: Matrix3<f64>,
        landmarks: LandmarkMap,
        gate: f64,
    ) -> ExtendedKalmanFilter {
        ExtendedKalmanFilter {
            mean: initial.into(),
            covariance,
            sources: Vec::new(),
            landmarks,
            gate,
        }
    }
    /// Filter observing compass heading and landmark bearing, in that order.
    pub fn with_compass_and_bearing(
        initial: Pose,
        covariance: Matrix3<f64>,
        landmarks: LandmarkMap,
        config: &KalmanConfig,
    ) -> ExtendedKalmanFilter {
        let mut ekf = ExtendedKalmanFilter::new(initial, covariance, landmarks, config.gate);
        ekf.add_source(Box::new(Compass {
            noise_std: config.compass_sigma,
        }));
        ekf.add_source(Box::new(LandmarkBearing {
            noise_std: config.bearing_sigma,
        }));
        ekf
    }
    pub fn add_source(&mut self, source: Box<dyn ObservationSource>) {
        self.sources.push(source);
    }
    pub fn sources(&self) -> &[Box<dyn ObservationSource>] {
        &self.sources
    }
    pub fn landmarks(&self) -> &LandmarkMap {
        &self.landmarks
    }
    pub fn gate(&self) -> f64 {
        self.gate
    }
    /// Length of the measurement vector.
    pub fn measurement_dim(&self) -> usize {
        self.sources.len()
    }

    /// Run the drive model on the mean and propagate the covariance.
    pub fn predict(&mut self, drive: &DriveKind, command: &DriveCommand, dt: f64) -> Result<()> {
        let (pose, covariance) =
            drive.predict(&Pose::from(self.mean), &self.covariance, command, dt)?;
        self.mean = pose.into();
        self.covariance = covariance;
        Ok(())
    }

    /// $\hat z$ for `state` and `landmark`.
    pub fn expected_measurement(
        &self,
        state: &Vector3<f64>,
        landmark: &Point2<f64>,
    ) -> DVector<f64> {
        DVector::from_iterator(
            self.sources.len(),
            self.sources.iter().map(|s| s.predict(state, landmark)),
        )
    }
    /// $H_k$, one row per source.
    pub fn measurement_jacobian(
        &self,
        state: &Vector3<f64>,
        landmark: &Point2<f64>,
    ) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(self.sources.len(), 3);
        for (i, source) in self.sources.iter().enumerate() {
            h.set_row(i, &source.jacobian(state, landmark));
        }
        h
    }
    /// $N_k = \mathrm{diag}(\sigma_i^2)$
    pub fn noise_covariance(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_iterator(
            self.sources.len(),
            self.sources.iter().map(|s| s.noise_std().powi(2)),
        ))
    }
    /// $V_k$, the gain of each noise term
    pub fn noise_jacobian(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_iterator(
            self.sources.len(),
            self.sources.iter().map(|s| s.noise_gain()),
        ))
    }
    /// $z - \hat z$ with angular channels wrapped.
    pub fn innovation(&self, z: &DVector<f64>, expected: &DVector<f64>) -> DVector<f64> {
        let mut nu = z - expected;
        for (i, source) in self.sources.iter().enumerate() {
            if source.is_angular() {
                nu[i] = wrap_to_pi(nu[i]);
            }
        }
        nu
    }

    /// $S = H C H^T + V N V^T$
    pub fn innovation_covariance(
        h: &DMatrix<f64>,
        c: &DMatrix<f64>,
        v: &DMatrix<f64>,
        n: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        h * c * h.transpose() + v * n * v.transpose()
    }
    /// $K = C H^T S^{-1}$, computed as $(S^{-1} H C)^T$ for symmetric $C$ and $S$.
    pub fn kalman_gain(
        c: &DMatrix<f64>,
        h: &DMatrix<f64>,
        s: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>> {
        let hc = h * c;
        Ok(robust_spd_solve(s, &hc)?.transpose())
    }

    fn covariance_dyn(&self) -> DMatrix<f64> {
        DMatrix::from_column_slice(3, 3, self.covariance.as_slice())
    }

    fn hypothesis(&self, z: &DVector<f64>, landmark: &Point2<f64>) -> Hypothesis {
        let jacobian = self.measurement_jacobian(&self.mean, landmark);
        let innovation_covariance = Self::innovation_covariance(
            &jacobian,
            &self.covariance_dyn(),
            &self.noise_jacobian(),
            &self.noise_covariance(),
        );
        let expected = self.expected_measurement(&self.mean, landmark);
        Hypothesis {
            innovation: self.innovation(z, &expected),
            jacobian,
            innovation_covariance,
        }
    }

    fn check_dimension(&self, z: &DVector<f64>) -> Result<()> {
        if z.len() != self.sources.len() {
            return Err(LocalizationError::InvalidDimension {
                expected: self.sources.len(),
                actual: z.len(),
            });
        }
        Ok(())
    }

    /// Gate `z` against every landmark at the current (predicted) state.
    pub fn associate(&self, z: &DVector<f64>) -> Result<Association> {
        self.check_dimension(z)?;
        let mut best: Option<(usize, f64)> = None;
        let mut candidates = 0;
        for (index, landmark) in self.landmarks.landmarks().iter().enumerate() {
            let hyp = self.hypothesis(z, landmark);
            let distance = mahalanobis_squared(&hyp.innovation, &hyp.innovation_covariance)?;
            debug!("landmark {index} at {landmark}: mahalanobis distance {distance:.4}");
            if distance < self.gate {
                candidates += 1;
                best = Some((index, distance));
            }
        }
        Ok(match (candidates, best) {
            (1, Some((index, distance))) => Association::Matched { index, distance },
            (0, _) | (_, None) => Association::NoCandidate,
            (candidates, _) => Association::Ambiguous { candidates },
        })
    }

    /// Correct the prediction with `z` if it matches exactly one landmark.
    pub fn correct(&mut self, z: &DVector<f64>) -> Result<Association> {
        let association = self.associate(z)?;
        let Association::Matched { index, distance } = association else {
            info!("no unique landmark match ({association:?}), keeping the prediction");
            return Ok(association);
        };
        let landmark = self.landmarks.landmarks()[index];
        let hyp = self.hypothesis(z, &landmark);
        let c = self.covariance_dyn();
        let k = Self::kalman_gain(&c, &hyp.jacobian, &hyp.innovation_covariance)?;
        let dx = &k * &hyp.innovation;
        self.mean += Vector3::new(dx[0], dx[1], dx[2]);
        let reduction = &k * &hyp.innovation_covariance * k.transpose();
        let reduction = Matrix3::from_column_slice(reduction.as_slice());
        self.covariance = symmetrize3(&(self.covariance - reduction));
        debug!("matched landmark {index} (distance {distance:.4}), correction {dx:?}");
        Ok(association)
    }

    /// Predict with the drive step, then correct with `z`.
    pub fn step(
        &mut self,
        drive: &DriveKind,
        command: &DriveCommand,
        dt: f64,
        z: &DVector<f64>,
    ) -> Result<Association> {
        self.predict(drive, command, dt)?;
        self.correct(z)
    }

    /// Noisy measurement of `landmark` as seen from `pose`.
    pub fn simulate_observation<R: Rng + ?Sized>(
        &self,
        pose: &Pose,
        landmark: &Point2<f64>,
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        let state: Vector3<f64> = pose.into();
        let mut z = DVector::zeros(self.sources.len());
        for (i, source) in self.sources.iter().enumerate() {
            let noise = Normal::new(0.0, source.noise_std())?.sample(rng);
            z[i] = source.predict(&state, landmark) + source.noise_gain() * noise;
        }
        Ok(z)
    }
}

impl PoseEstimator for ExtendedKalmanFilter {
    fn get_estimate(&self) -> Pose {
        Pose::from(self.mean)
    }
    fn get_certainty(&self) -> Matrix3<f64> {
        self.covariance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::DifferentialDrive;
    use crate::linalg::is_positive_semidefinite;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::PI;

    fn config() -> KalmanConfig {
        KalmanConfig::default()
    }

    fn noiseless(pose: &Pose, landmark: &Point2<f64>) -> DVector<f64> {
        let state: Vector3<f64> = pose.into();
        DVector::from_vec(vec![
            state[2],
            (landmark.y - state[1]).atan2(landmark.x - state[0]) - state[2],
        ])
    }

    fn pose_error(estimate: &Pose, truth: &Pose, c: &Matrix3<f64>) -> f64 {
        let e = Vector3::new(
            estimate.x - truth.x,
            estimate.y - truth.y,
            wrap_to_pi(estimate.theta - truth.theta),
        );
        (e.transpose() * c.try_inverse().unwrap() * e)[(0, 0)]
    }

    #[test]
    fn unique_match_moves_the_estimate_towards_the_truth() {
        let truth = Pose::new(2.0, 2.0, 0.0);
        let predicted = Pose::new(2.1, 1.9, 0.05);
        let c = Matrix3::from_diagonal(&Vector3::new(0.05, 0.05, 0.01));
        let map = LandmarkMap::from_arrays(&[[5.0, 3.0], [-20.0, -20.0], [2.0, 30.0]]);
        let mut ekf = ExtendedKalmanFilter::with_compass_and_bearing(predicted, c, map, &config());

        let z = noiseless(&truth, &Point2::new(5.0, 3.0));
        let association = ekf.correct(&z).unwrap();
        match association {
            Association::Matched { index, distance } => {
                assert_eq!(index, 0);
                assert!(distance < 9.0);
            }
            other => panic!("expected a match, got {other:?}"),
        }
        let before = pose_error(&predicted, &truth, &c);
        let after = pose_error(&ekf.get_estimate(), &truth, &c);
        assert!(after < before, "{after} !< {before}");
        assert!(ekf.get_certainty().trace() < c.trace());
        assert!(is_positive_semidefinite(&ekf.get_certainty(), 1e-12));
    }

    #[test]
    fn equidistant_landmarks_are_ambiguous() {
        let start = Pose::new(0.0, 0.0, 0.0);
        let c = Matrix3::from_diagonal_element(0.1);
        let map = LandmarkMap::from_arrays(&[[1.0, 0.01], [1.0, -0.01]]);
        let mut ekf = ExtendedKalmanFilter::with_compass_and_bearing(start, c, map, &config());
        let z = DVector::from_vec(vec![0.0, 0.0]);
        assert_eq!(
            ekf.correct(&z).unwrap(),
            Association::Ambiguous { candidates: 2 }
        );
        assert_eq!(ekf.get_estimate(), start);
        assert_eq!(ekf.get_certainty(), c);
    }

    #[test]
    fn no_candidate_keeps_the_prediction() {
        let start = Pose::new(1.0, 1.0, 0.0);
        let c = Matrix3::from_diagonal_element(1e-4);
        let map = LandmarkMap::from_arrays(&[[5.0, 1.0]]);
        let mut ekf = ExtendedKalmanFilter::with_compass_and_bearing(start, c, map, &config());
        // the only landmark is dead ahead but the bearing says it is to the left
        let z = DVector::from_vec(vec![0.0, PI / 2.0]);
        assert_eq!(ekf.correct(&z).unwrap(), Association::NoCandidate);
        assert_eq!(ekf.get_estimate(), start);
    }

    #[test]
    fn association_is_reevaluated_every_tick() {
        let start = Pose::new(0.0, 0.0, 0.0);
        let c = Matrix3::from_diagonal_element(1e-3);
        let map = LandmarkMap::from_arrays(&[[5.0, 0.0], [0.0, 5.0]]);
        let mut ekf = ExtendedKalmanFilter::with_compass_and_bearing(start, c, map, &config());
        let first = ekf.correct(&noiseless(&start, &Point2::new(5.0, 0.0))).unwrap();
        let second = ekf.correct(&noiseless(&start, &Point2::new(0.0, 5.0))).unwrap();
        assert!(matches!(first, Association::Matched { index: 0, .. }));
        assert!(matches!(second, Association::Matched { index: 1, .. }));
    }

    #[test]
    fn bearing_innovation_is_wrapped() {
        // landmark almost straight behind: the bearing crosses the +pi/-pi seam
        let start = Pose::new(0.0, 0.0, 0.0);
        let c = Matrix3::from_diagonal_element(1e-3);
        let landmark = Point2::new(-4.0, -0.01);
        let map = LandmarkMap::new(vec![landmark]);
        let ekf = ExtendedKalmanFilter::with_compass_and_bearing(start, c, map, &config());
        let mut z = noiseless(&start, &landmark);
        z[1] += 2.0 * PI;
        let association = ekf.associate(&z).unwrap();
        assert!(association.is_match());
    }

    #[test]
    fn measurement_dimension_is_checked() {
        let ekf = ExtendedKalmanFilter::with_compass_and_bearing(
            Pose::default(),
            Matrix3::identity(),
            LandmarkMap::from_arrays(&[[1.0, 1.0]]),
            &config(),
        );
        assert!(matches!(
            ekf.associate(&DVector::from_vec(vec![0.0])),
            Err(LocalizationError::InvalidDimension {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn gain_and_innovation_covariance_shapes() {
        let ekf = ExtendedKalmanFilter::with_compass_and_bearing(
            Pose::new(1.0, 1.0, 0.2),
            Matrix3::identity() * 0.1,
            LandmarkMap::from_arrays(&[[4.0, 5.0]]),
            &config(),
        );
        let state = Vector3::new(1.0, 1.0, 0.2);
        let landmark = Point2::new(4.0, 5.0);
        let h = ekf.measurement_jacobian(&state, &landmark);
        assert_eq!(h.shape(), (2, 3));
        let c = DMatrix::identity(3, 3) * 0.1;
        let s = ExtendedKalmanFilter::innovation_covariance(
            &h,
            &c,
            &ekf.noise_jacobian(),
            &ekf.noise_covariance(),
        );
        assert_eq!(s.shape(), (2, 2));
        assert_approx_eq!(s[(0, 0)], 0.1 + 1e-4, 1e-12);
        assert_approx_eq!(s[(0, 1)], s[(1, 0)], 1e-15);
        let k = ExtendedKalmanFilter::kalman_gain(&c, &h, &s).unwrap();
        assert_eq!(k.shape(), (3, 2));
        let direct = &c * h.transpose() * s.clone().try_inverse().unwrap();
        for (a, b) in k.iter().zip(direct.iter()) {
            assert_approx_eq!(*a, *b, 1e-10);
        }
    }

    #[test]
    fn predict_follows_the_drive_model() {
        let drive = DriveKind::Differential(DifferentialDrive::new(0.2, 0.001, 0.001));
        let mut ekf = ExtendedKalmanFilter::with_compass_and_bearing(
            Pose::new(0.0, 0.0, 0.0),
            Matrix3::zeros(),
            LandmarkMap::default(),
            &config(),
        );
        ekf.predict(&drive, &DriveCommand::wheel_speeds(1.0, 1.0), 0.5)
            .unwrap();
        assert_approx_eq!(ekf.get_estimate().x, 0.5, 1e-12);
        assert!(ekf.get_certainty()[(0, 0)] > 0.0);
        // an empty map never matches
        let z = DVector::from_vec(vec![0.0, 0.0]);
        assert_eq!(ekf.correct(&z).unwrap(), Association::NoCandidate);
    }

    #[test]
    fn simulated_observations_scatter_around_the_truth() {
        let ekf = ExtendedKalmanFilter::with_compass_and_bearing(
            Pose::default(),
            Matrix3::identity(),
            LandmarkMap::default(),
            &config(),
        );
        let mut rng = StdRng::seed_from_u64(3);
        let pose = Pose::new(1.0, 1.0, 0.3);
        let landmark = Point2::new(3.0, 3.0);
        let n = 2000;
        let mut mean = DVector::zeros(2);
        for _ in 0..n {
            mean += ekf.simulate_observation(&pose, &landmark, &mut rng).unwrap();
        }
        mean /= n as f64;
        assert_approx_eq!(mean[0], 0.3, 2e-3);
        assert_approx_eq!(mean[1], PI / 4.0 - 0.3, 2e-3);
    }

    #[test]
    fn landmark_sampling_is_uniform_over_the_map() {
        let map = LandmarkMap::from_arrays(&[[3.0, 3.0], [7.0, 10.0], [5.0, 3.0]]);
        let mut rng = StdRng::seed_from_u64(8);
        let mut counts = [0usize; 3];
        for _ in 0..3000 {
            let (i, p) = map.sample(&mut rng).unwrap();
            assert_eq!(map.get(i), Some(&p));
            counts[i] += 1;
        }
        assert!(counts.iter().all(|c| *c > 850));
        assert!(LandmarkMap::default().sample(&mut rng).is_none());
    }
}
