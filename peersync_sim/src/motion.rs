//! Ground truth motion for simulated peers.
//!
//! Every peer owns an `OrbitPath`; its true pose is a pure function of
//! simulation time, so any observer's proxy can be scored against it.

use nalgebra::{UnitQuaternion, Vector3};
use peersync_core::{Pose, PoseSource};
use peersync_env::SyncContext;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A circular walk around a center point, with a little vertical bob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitPath {
    /// Orbit center in meters
    pub center: Vector3<f64>,

    /// Orbit radius in meters
    pub radius: f64,

    /// Radians per second (0.0 = standing still)
    pub angular_speed: f64,

    /// Starting angle in radians
    pub phase: f64,

    /// Peak vertical offset in meters
    pub bob_amplitude: f64,
}

impl OrbitPath {
    /// A peer that never moves.
    pub fn stationary(position: Vector3<f64>) -> Self {
        Self {
            center: position,
            radius: 0.0,
            angular_speed: 0.0,
            phase: 0.0,
            bob_amplitude: 0.0,
        }
    }

    /// Draws a random path inside a 20 m arena.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        // Walking pace; clamped so a bad draw cannot produce a sprint
        let pace = Normal::<f64>::new(1.2, 0.3)
            .map(|n| n.sample(rng))
            .unwrap_or(1.2)
            .clamp(0.4, 2.0);
        let radius = rng.gen_range(2.0..6.0);
        let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };

        Self {
            center: Vector3::new(rng.gen_range(-10.0..10.0), 0.0, rng.gen_range(-10.0..10.0)),
            radius,
            angular_speed: direction * pace / radius,
            phase: rng.gen_range(0.0..std::f64::consts::TAU),
            bob_amplitude: rng.gen_range(0.0..0.3),
        }
    }

    fn angle_at(&self, t_secs: f64) -> f64 {
        self.phase + self.angular_speed * t_secs
    }

    /// True pose at `t_secs`, facing along the direction of travel.
    pub fn pose_at(&self, t_secs: f64) -> Pose {
        let theta = self.angle_at(t_secs);
        let position = self.center
            + Vector3::new(
                self.radius * theta.cos(),
                self.bob_amplitude * (2.0 * theta).sin(),
                self.radius * theta.sin(),
            );
        let heading = if self.angular_speed >= 0.0 {
            -theta
        } else {
            std::f64::consts::PI - theta
        };
        Pose::new(position, UnitQuaternion::from_axis_angle(&Vector3::y_axis(), heading))
    }

    /// Upper bound on the speed along the path in m/s.
    pub fn max_speed(&self) -> f64 {
        let w = self.angular_speed.abs();
        w * self.radius + 2.0 * w * self.bob_amplitude
    }
}

/// Samples an `OrbitPath` at the context's current time.
pub struct OrbitSource<Ctx: SyncContext> {
    context: Arc<Ctx>,
    path: OrbitPath,
}

impl<Ctx: SyncContext> OrbitSource<Ctx> {
    pub fn new(context: Arc<Ctx>, path: OrbitPath) -> Self {
        Self { context, path }
    }

    pub fn path(&self) -> &OrbitPath {
        &self.path
    }
}

impl<Ctx: SyncContext> PoseSource for OrbitSource<Ctx> {
    fn current_pose(&self) -> Pose {
        self.path.pose_at(self.context.now().as_secs_f64())
    }
}
