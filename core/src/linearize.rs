//! Analytic Jacobians of the motion and observation models.
//!
//! The functions here are free, pure and allocation free so that they can be unit tested against
//! finite differences and reused by the particle filter, the EKF and the covariance propagation of
//! the ground-truth robot alike. All of them are evaluated at the *pre-motion* pose.
//!
//! Motion Jacobians:
//!  - [`differential_pose_jacobian`] / [`differential_motion_jacobian`]: $F_p$ and $F_\delta$ of
//!    the differential drive, with the noise inputs ordered as $(s_r, s_l)$.
//!  - [`tricycle_pose_jacobian`] / [`tricycle_motion_jacobian`]: $F_p$ and $F_\delta$ of the
//!    tricycle drive, with the noise inputs ordered as $(s, \beta)$.
//!
//! Observation Jacobians (rows of $H_k$):
//!  - [`compass_jacobian`]
//!  - [`landmark_bearing_jacobian`]
use nalgebra::{Matrix3, Matrix3x2, Point2, RowVector3, Vector3};

use crate::Pose;

/// $F_p$ of the differential drive for wheel travel distances `s_left`, `s_right`.
///
/// $$
/// F_p = \begin{bmatrix} 1 & 0 & -\Delta s \sin(\theta + \Delta\theta/2) \\\\
/// 0 & 1 & \Delta s \cos(\theta + \Delta\theta/2) \\\\ 0 & 0 & 1 \end{bmatrix}
/// $$
#[rustfmt::skip]
pub fn differential_pose_jacobian(
    half_track: f64,
    pose: &Pose,
    s_left: f64,
    s_right: f64,
) -> Matrix3<f64> {
    let b = 2.0 * half_track;
    let ds = 0.5 * (s_left + s_right);
    let mid = pose.theta + 0.5 * (s_right - s_left) / b;
    Matrix3::new(
        1.0, 0.0, -ds * mid.sin(),
        0.0, 1.0, ds * mid.cos(),
        0.0, 0.0, 1.0,
    )
}

/// $F_\delta$ of the differential drive; column 0 is $\partial/\partial s_r$, column 1 is
/// $\partial/\partial s_l$.
#[rustfmt::skip]
pub fn differential_motion_jacobian(
    half_track: f64,
    pose: &Pose,
    s_left: f64,
    s_right: f64,
) -> Matrix3x2<f64> {
    let b = 2.0 * half_track;
    let ds = 0.5 * (s_left + s_right);
    let mid = pose.theta + 0.5 * (s_right - s_left) / b;
    let (sin, cos) = mid.sin_cos();
    let k = ds / (2.0 * b);
    Matrix3x2::new(
        0.5 * cos - k * sin, 0.5 * cos + k * sin,
        0.5 * sin + k * cos, 0.5 * sin - k * cos,
        1.0 / b, -1.0 / b,
    )
}

/// $F_p$ of the tricycle drive for travel `distance` of the steered wheel at `steering_angle`.
#[rustfmt::skip]
pub fn tricycle_pose_jacobian(
    steering_length: f64,
    pose: &Pose,
    distance: f64,
    steering_angle: f64,
) -> Matrix3<f64> {
    let (sin_b, cos_b) = steering_angle.sin_cos();
    let phi = pose.theta - distance / (2.0 * steering_length) * cos_b;
    let (sin_phi, cos_phi) = phi.sin_cos();
    Matrix3::new(
        1.0, 0.0, -distance * sin_b * sin_phi,
        0.0, 1.0, distance * sin_b * cos_phi,
        0.0, 0.0, 1.0,
    )
}

/// $F_\delta$ of the tricycle drive; column 0 is $\partial/\partial s$, column 1 is
/// $\partial/\partial \beta$.
pub fn tricycle_motion_jacobian(
    steering_length: f64,
    pose: &Pose,
    distance: f64,
    steering_angle: f64,
) -> Matrix3x2<f64> {
    let l = steering_length;
    let s = distance;
    let s2l = s / (2.0 * l);
    let (sin_b, cos_b) = steering_angle.sin_cos();
    let phi = pose.theta - s2l * cos_b;
    let (sin_phi, cos_phi) = phi.sin_cos();
    Matrix3x2::new(
        sin_b * (cos_phi + s2l * cos_b * sin_phi),
        s * (cos_b * cos_phi - sin_b * sin_phi * s2l * sin_b),
        sin_b * (sin_phi - s2l * cos_b * cos_phi),
        s * (cos_b * sin_phi + sin_b * cos_phi * s2l * sin_b),
        -cos_b / l,
        s * sin_b / l,
    )
}

/// Row of $H_k$ for a compass reading $h = \theta$.
pub fn compass_jacobian() -> RowVector3<f64> {
    RowVector3::new(0.0, 0.0, 1.0)
}

/// Row of $H_k$ for the bearing $\alpha = \operatorname{atan2}(y_L - y, x_L - x) - \theta$ to a
/// landmark.
///
/// $$
/// H = \begin{bmatrix} \frac{y_L - y}{r^2} & -\frac{x_L - x}{r^2} & -1 \end{bmatrix}
/// $$
pub fn landmark_bearing_jacobian(state: &Vector3<f64>, landmark: &Point2<f64>) -> RowVector3<f64> {
    let dx = landmark.x - state[0];
    let dy = landmark.y - state[1];
    let r2 = dx * dx + dy * dy;
    RowVector3::new(dy / r2, -dx / r2, -1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{
        DifferentialDrive, MotionModel, SteeringControl, TricycleDrive, WheelSpeeds,
    };
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector2;

    const EPS: f64 = 1e-6;

    /// Central difference Jacobian of a 2-input pose function.
    fn numeric_input_jacobian<F: Fn(f64, f64) -> Pose>(f: F, a: f64, b: f64) -> Matrix3x2<f64> {
        let mut jac = Matrix3x2::zeros();
        for col in 0..2 {
            let (da, db) = if col == 0 { (EPS, 0.0) } else { (0.0, EPS) };
            let plus: Vector3<f64> = f(a + da, b + db).into();
            let minus: Vector3<f64> = f(a - da, b - db).into();
            jac.set_column(col, &((plus - minus) / (2.0 * EPS)));
        }
        jac
    }

    fn numeric_pose_jacobian<F: Fn(&Pose) -> Pose>(f: F, pose: &Pose) -> Matrix3<f64> {
        let mut jac = Matrix3::zeros();
        for col in 0..3 {
            let mut delta = Vector3::zeros();
            delta[col] = EPS;
            let base: Vector3<f64> = pose.into();
            let plus: Vector3<f64> = f(&Pose::from(base + delta)).into();
            let minus: Vector3<f64> = f(&Pose::from(base - delta)).into();
            jac.set_column(col, &((plus - minus) / (2.0 * EPS)));
        }
        jac
    }

    fn assert_matrix_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_approx_eq!(*x, *y, tol);
        }
    }

    #[test]
    fn differential_jacobians_match_finite_differences() {
        let drive = DifferentialDrive::new(0.25, 0.0, 0.0);
        let pose = Pose::new(1.0, 2.0, 0.7);
        let (s_left, s_right) = (0.3, 0.45);

        let analytic = differential_motion_jacobian(0.25, &pose, s_left, s_right);
        // columns ordered (s_r, s_l)
        let numeric = numeric_input_jacobian(
            |sr, sl| {
                drive.integrate(
                    &pose,
                    &WheelSpeeds {
                        left: sl,
                        right: sr,
                    },
                    1.0,
                )
            },
            s_right,
            s_left,
        );
        assert_matrix_close(analytic.as_slice(), numeric.as_slice(), 1e-6);

        let analytic = differential_pose_jacobian(0.25, &pose, s_left, s_right);
        let control = WheelSpeeds {
            left: s_left,
            right: s_right,
        };
        let numeric = numeric_pose_jacobian(|p| drive.integrate(p, &control, 1.0), &pose);
        assert_matrix_close(analytic.as_slice(), numeric.as_slice(), 1e-6);
    }

    #[test]
    fn tricycle_jacobians_match_finite_differences() {
        let drive = TricycleDrive::new(0.46, 0.0, 0.0);
        let pose = Pose::new(-1.0, 0.5, -0.3);
        let (distance, beta) = (0.2, 1.2);

        let analytic = tricycle_motion_jacobian(0.46, &pose, distance, beta);
        let numeric = numeric_input_jacobian(
            |s, b| {
                drive.integrate(
                    &pose,
                    &SteeringControl {
                        speed: s,
                        steering_angle: b,
                        steering_change: 0.0,
                    },
                    1.0,
                )
            },
            distance,
            beta,
        );
        assert_matrix_close(analytic.as_slice(), numeric.as_slice(), 1e-6);

        let control = SteeringControl {
            speed: distance,
            steering_angle: beta,
            steering_change: 0.0,
        };
        let analytic = tricycle_pose_jacobian(0.46, &pose, distance, beta);
        let numeric = numeric_pose_jacobian(|p| drive.integrate(p, &control, 1.0), &pose);
        assert_matrix_close(analytic.as_slice(), numeric.as_slice(), 1e-6);
    }

    #[test]
    fn zero_motion_pose_jacobians_are_identity() {
        let pose = Pose::new(3.0, 4.0, 1.0);
        assert_eq!(
            differential_pose_jacobian(0.2, &pose, 0.0, 0.0),
            Matrix3::identity()
        );
        assert_eq!(
            tricycle_pose_jacobian(0.5, &pose, 0.0, 0.3),
            Matrix3::identity()
        );
    }

    #[test]
    fn bearing_jacobian_matches_finite_differences() {
        let state = Vector3::new(1.0, 2.0, 0.4);
        let landmark = Point2::new(4.0, 6.0);
        let bearing = |s: &Vector3<f64>| (landmark.y - s[1]).atan2(landmark.x - s[0]) - s[2];
        let analytic = landmark_bearing_jacobian(&state, &landmark);
        for col in 0..3 {
            let mut delta = Vector3::zeros();
            delta[col] = EPS;
            let numeric = (bearing(&(state + delta)) - bearing(&(state - delta))) / (2.0 * EPS);
            assert_approx_eq!(analytic[col], numeric, 1e-6);
        }
        let r2 = Vector2::<f64>::new(3.0, 4.0).norm_squared();
        assert_approx_eq!(analytic[0], 4.0 / r2, 1e-12);
        assert_eq!(compass_jacobian(), RowVector3::new(0.0, 0.0, 1.0));
    }
}
