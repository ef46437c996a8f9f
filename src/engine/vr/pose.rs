//! Per-frame tracked device poses.
//!
//! One [`PoseSnapshot`] is built per wait cycle and handed from producer to
//! consumer through the [`PoseCache`], a single-slot reference swap. The
//! snapshot is immutable after construction; a reader either sees all of the
//! previous frame's data or all of the new frame's, never a mix.

use std::sync::{Arc, Mutex};

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3};

use crate::engine::vr::runtime::RawDevicePose;

/// Parse a row-major 3x4 rigid transform as the native layer reports them.
/// The rotation block is re-orthonormalized on the way in.
pub fn isometry_from_raw_3x4(m: &[[f32; 4]; 3]) -> Isometry3<f64> {
    let translation = Translation3::new(m[0][3] as f64, m[1][3] as f64, m[2][3] as f64);
    #[rustfmt::skip]
    let rotation = Matrix3::new(
        m[0][0] as f64, m[0][1] as f64, m[0][2] as f64,
        m[1][0] as f64, m[1][1] as f64, m[1][2] as f64,
        m[2][0] as f64, m[2][1] as f64, m[2][2] as f64,
    );
    Isometry3::from_parts(translation, UnitQuaternion::from_matrix(&rotation))
}

/// Pose of one tracked device slot at one measurement instant, parsed out of
/// the runtime's raw matrix form.
#[derive(Debug, Clone, Copy)]
pub struct TrackedDevicePose {
    device_index: usize,
    valid: bool,
    connected: bool,
    device_to_origin: Isometry3<f64>,
    velocity: Vector3<f64>,
    angular_velocity: Vector3<f64>,
    measurement_timestamp_nanos: i64,
}

impl TrackedDevicePose {
    pub fn from_raw(
        measurement_timestamp_nanos: i64,
        device_index: usize,
        raw: &RawDevicePose,
    ) -> Self {
        Self {
            device_index,
            valid: raw.pose_valid,
            connected: raw.device_connected,
            device_to_origin: isometry_from_raw_3x4(&raw.device_to_origin),
            velocity: Vector3::new(
                raw.velocity[0] as f64,
                raw.velocity[1] as f64,
                raw.velocity[2] as f64,
            ),
            angular_velocity: Vector3::new(
                raw.angular_velocity[0] as f64,
                raw.angular_velocity[1] as f64,
                raw.angular_velocity[2] as f64,
            ),
            measurement_timestamp_nanos,
        }
    }

    #[inline]
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Rigid transform from device coordinates to the tracking origin, in
    /// the runtime's axis convention.
    #[inline]
    pub fn device_to_origin(&self) -> &Isometry3<f64> {
        &self.device_to_origin
    }

    #[inline]
    pub fn velocity(&self) -> &Vector3<f64> {
        &self.velocity
    }

    #[inline]
    pub fn angular_velocity(&self) -> &Vector3<f64> {
        &self.angular_velocity
    }

    #[inline]
    pub fn measurement_timestamp_nanos(&self) -> i64 {
        self.measurement_timestamp_nanos
    }
}

/// One frame's worth of device poses, every slot, published as a unit.
#[derive(Debug)]
pub struct PoseSnapshot {
    poses: Vec<TrackedDevicePose>,
    measurement_timestamp_nanos: i64,
}

impl PoseSnapshot {
    pub fn new(measurement_timestamp_nanos: i64, poses: Vec<TrackedDevicePose>) -> Self {
        Self {
            poses,
            measurement_timestamp_nanos,
        }
    }

    pub fn device(&self, index: usize) -> Option<&TrackedDevicePose> {
        self.poses.get(index)
    }

    pub fn poses(&self) -> &[TrackedDevicePose] {
        &self.poses
    }

    #[inline]
    pub fn measurement_timestamp_nanos(&self) -> i64 {
        self.measurement_timestamp_nanos
    }
}

/// Single-slot handoff between the pose producer (`wait_get_poses`) and the
/// consumer (`poll_events`). The snapshot is built entirely outside the lock
/// and published as one reference swap.
#[derive(Debug, Default)]
pub struct PoseCache {
    slot: Mutex<Option<Arc<PoseSnapshot>>>,
}

impl PoseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh snapshot, replacing any unconsumed one.
    pub fn publish(&self, snapshot: PoseSnapshot) {
        *self.slot.lock().unwrap() = Some(Arc::new(snapshot));
    }

    /// Consume the pending snapshot, leaving the slot empty.
    pub fn take(&self) -> Option<Arc<PoseSnapshot>> {
        self.slot.lock().unwrap().take()
    }

    /// Peek at the pending snapshot without consuming it.
    pub fn latest(&self) -> Option<Arc<PoseSnapshot>> {
        self.slot.lock().unwrap().clone()
    }
}
