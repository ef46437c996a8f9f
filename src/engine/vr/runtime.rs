//! Capability interface to the native VR runtime.
//!
//! The context's per-frame scheduling only ever talks to [`VrRuntime`], so
//! the same wait/poll/submit logic runs against a native backend in
//! production and against [`crate::engine::vr::MockVrRuntime`] in tests and
//! headless mode. Poses cross this boundary in the native layer's raw shape
//! (row-major 3x4 matrices) and are parsed once per frame into the snapshot.

use std::path::Path;

use nalgebra::Matrix4;
use thiserror::Error;

use crate::engine::vr::Side;

/// Number of tracked device slots reported per frame.
pub const MAX_TRACKED_DEVICES: usize = 64;

/// Device slot the headset always occupies.
pub const HEADSET_DEVICE_INDEX: usize = 0;

/// At most this many trackers can pair with one receiver dongle.
pub const MAX_TRACKERS_PER_DONGLE: usize = 5;

#[derive(Debug, Error)]
pub enum VrError {
    /// The native runtime refused to initialize. Fatal; there is no retry.
    #[error("VR initialization failed: {0}")]
    Init(String),
    #[error("action manifest error: {0}")]
    ActionManifest(String),
    /// Device class could not be queried for a hot-plug event. Non-fatal;
    /// the event is skipped.
    #[error("device class query failed for device {device_index}: {description}")]
    DeviceClassQuery {
        device_index: usize,
        description: String,
    },
    #[error("VR context is not running")]
    NotRunning,
    #[error("eye render targets have not been allocated")]
    NoEyeSurfaces,
    #[error("compositor rejected the submitted layer: {0}")]
    Submit(String),
}

/// Per-eye render surface dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTargetSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Headset,
    Controller,
    GenericTracker,
    /// Base station / lighthouse.
    TrackingReference,
    Other,
}

/// Raw per-slot pose as the native layer reports it: a row-major 3x4
/// device-to-tracking-origin matrix plus velocities, in the runtime's own
/// axis convention.
#[derive(Debug, Clone, Copy)]
pub struct RawDevicePose {
    pub pose_valid: bool,
    pub device_connected: bool,
    pub device_to_origin: [[f32; 4]; 3],
    pub velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
}

impl Default for RawDevicePose {
    fn default() -> Self {
        Self {
            pose_valid: false,
            device_connected: false,
            device_to_origin: IDENTITY_3X4,
            velocity: [0.0; 3],
            angular_velocity: [0.0; 3],
        }
    }
}

const IDENTITY_3X4: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

impl RawDevicePose {
    /// Valid, connected pose at a plain translation.
    pub fn at_translation(x: f32, y: f32, z: f32) -> Self {
        let mut pose = Self {
            pose_valid: true,
            device_connected: true,
            ..Self::default()
        };
        pose.device_to_origin[0][3] = x;
        pose.device_to_origin[1][3] = y;
        pose.device_to_origin[2][3] = z;
        pose
    }
}

/// Compositor frame timing reported alongside each pose wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTiming {
    /// Runtime clock at the start of the frame, in seconds.
    pub system_time_seconds: f64,
    /// Milliseconds after `system_time_seconds` at which the new poses
    /// became ready.
    pub new_poses_ready_ms: f64,
}

/// Result of one pose wait: every device slot plus frame timing.
#[derive(Debug, Clone, Default)]
pub struct RawPoseFrame {
    pub poses: Vec<RawDevicePose>,
    pub timing: FrameTiming,
}

/// Runtime event drained during the poll step.
#[derive(Debug, Clone, Copy)]
pub struct VrEvent {
    pub tracked_device_index: usize,
    pub kind: VrEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrEventKind {
    TrackedDeviceActivated,
    TrackedDeviceDeactivated,
    Other,
}

/// Digital action value for one poll cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitalAction {
    pub state: bool,
    /// True when `state` differs from the previous cycle.
    pub changed: bool,
}

impl DigitalAction {
    #[inline]
    pub fn pressed(self) -> bool {
        self.changed && self.state
    }

    #[inline]
    pub fn released(self) -> bool {
        self.changed && !self.state
    }
}

/// Digital and analog action values for one controller, one poll cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerActions {
    pub b_button: DigitalAction,
    pub joystick_press: DigitalAction,
    pub touchpad_touched: DigitalAction,
    pub trigger: f32,
    pub joystick: [f32; 2],
    pub touchpad: [f32; 2],
}

/// All action values fetched by one `update_action_state` call. Scoped to a
/// single poll cycle; never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionState {
    pub left: ControllerActions,
    pub right: ControllerActions,
}

impl ActionState {
    pub fn controller(&self, side: Side) -> &ControllerActions {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn controller_mut(&mut self, side: Side) -> &mut ControllerActions {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

/// Handle for a surface shared with the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedLayer {
    pub texture_id: u64,
    pub extent: [u32; 2],
}

/// The native VR layer as the context consumes it.
///
/// `wait_get_poses` is the only blocking entry point: it parks the calling
/// thread until the compositor releases the next frame. There is no timeout
/// and no cancellation mid-wait; teardown happens between cycles.
pub trait VrRuntime: Send {
    /// Open the native runtime and report the recommended per-eye render
    /// target size. An error here is fatal for the whole VR feature.
    fn init(&mut self) -> Result<RenderTargetSize, VrError>;

    /// Register the action manifest file with the runtime's input system.
    fn set_action_manifest(&mut self, path: &Path) -> Result<(), VrError>;

    /// Block until the compositor signals the next frame, then return every
    /// device slot's raw pose plus the frame timing.
    fn wait_get_poses(&mut self) -> RawPoseFrame;

    /// Drain one queued runtime event, if any.
    fn poll_event(&mut self) -> Option<VrEvent>;

    /// Fetch this cycle's digital/analog action values.
    fn update_action_state(&mut self) -> ActionState;

    /// Device slots of generic trackers already connected at init, sorted.
    fn sorted_generic_tracker_indices(&self) -> Vec<usize>;

    fn device_class(&self, device_index: usize) -> Result<DeviceClass, VrError>;

    /// Device slot currently assigned to the given hand, if any.
    fn controller_index(&self, side: Side) -> Option<usize>;

    /// Head-to-eye offset for one eye, row-major 3x4, runtime convention.
    fn eye_to_head(&self, side: Side) -> [[f32; 4]; 3];

    /// Projection matrix for one eye.
    fn eye_projection(&self, side: Side, near: f32, far: f32) -> Matrix4<f32>;

    /// Hand one eye's completed color surface to the compositor.
    fn submit(&mut self, side: Side, layer: &SubmittedLayer) -> Result<(), VrError>;

    /// Close the native runtime. Called exactly once, from `dispose`.
    fn shutdown(&mut self);
}
