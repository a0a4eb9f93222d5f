//! Pose values and the convergence step used to smooth remote proxies.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Below this norm a wire quaternion is considered garbage.
const MIN_QUATERNION_NORM: f64 = 1.0e-9;

/// Rotations closer than this are treated as already converged.
const SLERP_EPSILON: f64 = 1.0e-9;

/// Position + orientation of an object in the shared scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        Self { position, orientation }
    }

    /// Origin, no rotation. This is where freshly spawned proxies sit.
    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Builds a pose from wire arrays (`p: [x,y,z]`, `q: [x,y,z,w]`).
    ///
    /// Returns `None` if either part is unusable.
    pub fn from_wire(p: [f64; 3], q: [f64; 4]) -> Option<Self> {
        Some(Self::new(position_from_wire(p)?, orientation_from_wire(q)?))
    }

    /// Wire form of the position.
    pub fn position_to_wire(&self) -> [f64; 3] {
        [self.position.x, self.position.y, self.position.z]
    }

    /// Wire form of the orientation, scalar last.
    pub fn orientation_to_wire(&self) -> [f64; 4] {
        let q = self.orientation.quaternion();
        [q.i, q.j, q.k, q.w]
    }

    /// One exponential-smoothing step toward an optional target.
    ///
    /// Each present target part is approached by `fraction` of the remaining
    /// distance (lerp for position, slerp for orientation). Absent parts are
    /// left where they are. `fraction` is clamped to `[0, 1]` so the step can
    /// never overshoot.
    pub fn converge_toward(
        &self,
        target_position: Option<&Vector3<f64>>,
        target_orientation: Option<&UnitQuaternion<f64>>,
        fraction: f64,
    ) -> Pose {
        let t = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };

        let position = match target_position {
            Some(target) => self.position + (target - self.position) * t,
            None => self.position,
        };

        let orientation = match target_orientation {
            Some(target) => self
                .orientation
                .try_slerp(target, t, SLERP_EPSILON)
                .unwrap_or(*target),
            None => self.orientation,
        };

        Pose::new(position, orientation)
    }

    /// Euclidean distance between the two positions.
    pub fn distance_to(&self, other: &Pose) -> f64 {
        (self.position - other.position).norm()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Parses a wire position; non-finite components reject the whole value.
pub fn position_from_wire(p: [f64; 3]) -> Option<Vector3<f64>> {
    if p.iter().all(|c| c.is_finite()) {
        Some(Vector3::new(p[0], p[1], p[2]))
    } else {
        None
    }
}

/// Parses a wire quaternion `[x, y, z, w]`, normalizing it.
///
/// Non-finite or (near) zero-norm quaternions are rejected.
pub fn orientation_from_wire(q: [f64; 4]) -> Option<UnitQuaternion<f64>> {
    if !q.iter().all(|c| c.is_finite()) {
        return None;
    }
    let raw = Quaternion::new(q[3], q[0], q[1], q[2]);
    UnitQuaternion::try_new(raw, MIN_QUATERNION_NORM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_wire_roundtrip_keeps_scalar_last() {
        let pose = Pose::new(
            Vector3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2),
        );
        let q = pose.orientation_to_wire();
        // Rotation about +Y: only j and w are non-zero
        assert_relative_eq!(q[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(q[2], 0.0, epsilon = 1e-12);
        assert!(q[1] > 0.0 && q[3] > 0.0);

        let back = Pose::from_wire(pose.position_to_wire(), q).unwrap();
        assert_relative_eq!(back.orientation.angle_to(&pose.orientation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_wire_quaternion_is_normalized() {
        let q = orientation_from_wire([0.0, 0.0, 0.0, 2.0]).unwrap();
        assert_relative_eq!(q.quaternion().w, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bad_wire_values_rejected() {
        assert!(orientation_from_wire([0.0, 0.0, 0.0, 0.0]).is_none());
        assert!(orientation_from_wire([f64::NAN, 0.0, 0.0, 1.0]).is_none());
        assert!(position_from_wire([0.0, f64::INFINITY, 0.0]).is_none());
    }

    #[test]
    fn test_converge_position_fraction() {
        let pose = Pose::identity();
        let target = Vector3::new(2.0, 0.0, 0.0);
        let next = pose.converge_toward(Some(&target), None, 0.1);
        assert_relative_eq!(next.position.x, 0.2, epsilon = 1e-12);
        assert_eq!(next.orientation, pose.orientation);
    }

    #[test]
    fn test_converge_orientation_fraction() {
        let pose = Pose::identity();
        let target = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 1.0);
        let next = pose.converge_toward(None, Some(&target), 0.1);
        assert_relative_eq!(next.orientation.angle(), 0.1, epsilon = 1e-9);
        assert_eq!(next.position, pose.position);
    }

    #[test]
    fn test_converge_takes_short_arc_for_negated_quaternion() {
        let pose = Pose::identity();
        let flipped = UnitQuaternion::new_unchecked(-*UnitQuaternion::<f64>::identity().quaternion());
        let next = pose.converge_toward(None, Some(&flipped), 0.5);
        assert_relative_eq!(next.orientation.angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fraction_is_clamped() {
        let pose = Pose::identity();
        let target = Vector3::new(1.0, 0.0, 0.0);
        let next = pose.converge_toward(Some(&target), None, 3.0);
        assert_relative_eq!(next.position.x, 1.0, epsilon = 1e-12);
        let stay = pose.converge_toward(Some(&target), None, f64::NAN);
        assert_eq!(stay.position, pose.position);
    }
}
