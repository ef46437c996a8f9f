//! Scripted VR runtime for tests and headless runs.
//!
//! State lives behind a shared handle so a test can keep driving the script
//! (push events, move devices, press buttons) after the runtime has been
//! boxed into a context, and inspect what the context submitted.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nalgebra::Matrix4;

use crate::engine::vr::runtime::{
    ActionState, DeviceClass, FrameTiming, MAX_TRACKED_DEVICES, RawDevicePose, RawPoseFrame,
    RenderTargetSize, SubmittedLayer, VrError, VrEvent, VrRuntime,
};
use crate::engine::vr::Side;

/// Seconds between scripted compositor frames (a 90 Hz headset).
const FRAME_PERIOD_SECONDS: f64 = 1.0 / 90.0;

#[derive(Debug)]
struct MockState {
    initialized: bool,
    init_error: Option<String>,
    frame: u64,
    render_size: RenderTargetSize,
    poses: Vec<RawDevicePose>,
    device_classes: HashMap<usize, DeviceClass>,
    initial_tracker_indices: Vec<usize>,
    controller_slots: [Option<usize>; 2],
    actions: ActionState,
    events: VecDeque<VrEvent>,
    action_manifest: Option<PathBuf>,
    submitted: Vec<(Side, SubmittedLayer)>,
    shutdown_count: u32,
}

impl Default for MockState {
    fn default() -> Self {
        let mut poses = vec![RawDevicePose::default(); MAX_TRACKED_DEVICES];
        // A headset standing at eye height and two controllers held out in
        // front, in the runtime's Y-up convention.
        poses[0] = RawDevicePose::at_translation(0.0, 1.7, 0.0);
        poses[1] = RawDevicePose::at_translation(-0.2, 1.2, -0.3);
        poses[2] = RawDevicePose::at_translation(0.2, 1.2, -0.3);

        let mut device_classes = HashMap::new();
        device_classes.insert(0, DeviceClass::Headset);
        device_classes.insert(1, DeviceClass::Controller);
        device_classes.insert(2, DeviceClass::Controller);

        Self {
            initialized: false,
            init_error: None,
            frame: 0,
            render_size: RenderTargetSize {
                width: 1852,
                height: 2056,
            },
            poses,
            device_classes,
            initial_tracker_indices: Vec::new(),
            controller_slots: [Some(1), Some(2)],
            actions: ActionState::default(),
            events: VecDeque::new(),
            action_manifest: None,
            submitted: Vec::new(),
            shutdown_count: 0,
        }
    }
}

/// Shared view into a [`MockVrRuntime`]'s script and recorded calls.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Make the next `init` call fail with the given description.
    pub fn fail_init(&self, description: impl Into<String>) {
        self.state.lock().unwrap().init_error = Some(description.into());
    }

    /// Queue a runtime event for the next poll step.
    pub fn push_event(&self, event: VrEvent) {
        self.state.lock().unwrap().events.push_back(event);
    }

    pub fn set_device_class(&self, device_index: usize, class: DeviceClass) {
        self.state
            .lock()
            .unwrap()
            .device_classes
            .insert(device_index, class);
    }

    /// Mark a generic tracker as already connected before init.
    pub fn connect_tracker_at_init(&self, device_index: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .device_classes
            .insert(device_index, DeviceClass::GenericTracker);
        state.initial_tracker_indices.push(device_index);
        state.initial_tracker_indices.sort_unstable();
    }

    pub fn set_device_pose(&self, device_index: usize, pose: RawDevicePose) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.poses.get_mut(device_index) {
            *slot = pose;
        }
    }

    pub fn set_controller_slot(&self, side: Side, device_index: Option<usize>) {
        self.state.lock().unwrap().controller_slots[side.index()] = device_index;
    }

    pub fn set_actions(&self, actions: ActionState) {
        self.state.lock().unwrap().actions = actions;
    }

    pub fn action_manifest_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().action_manifest.clone()
    }

    /// Every layer handed to `submit` so far, in call order.
    pub fn submitted(&self) -> Vec<(Side, SubmittedLayer)> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn shutdown_count(&self) -> u32 {
        self.state.lock().unwrap().shutdown_count
    }
}

/// In-process [`VrRuntime`] that serves a scripted device constellation and
/// never blocks.
#[derive(Debug, Default)]
pub struct MockVrRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockVrRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }
}

impl VrRuntime for MockVrRuntime {
    fn init(&mut self) -> Result<RenderTargetSize, VrError> {
        let mut state = self.state.lock().unwrap();
        if let Some(description) = state.init_error.take() {
            return Err(VrError::Init(description));
        }
        state.initialized = true;
        Ok(state.render_size)
    }

    fn set_action_manifest(&mut self, path: &Path) -> Result<(), VrError> {
        self.state.lock().unwrap().action_manifest = Some(path.to_path_buf());
        Ok(())
    }

    fn wait_get_poses(&mut self) -> RawPoseFrame {
        let mut state = self.state.lock().unwrap();
        state.frame += 1;
        RawPoseFrame {
            poses: state.poses.clone(),
            timing: FrameTiming {
                system_time_seconds: state.frame as f64 * FRAME_PERIOD_SECONDS,
                new_poses_ready_ms: 1.8,
            },
        }
    }

    fn poll_event(&mut self) -> Option<VrEvent> {
        self.state.lock().unwrap().events.pop_front()
    }

    fn update_action_state(&mut self) -> ActionState {
        self.state.lock().unwrap().actions
    }

    fn sorted_generic_tracker_indices(&self) -> Vec<usize> {
        self.state.lock().unwrap().initial_tracker_indices.clone()
    }

    fn device_class(&self, device_index: usize) -> Result<DeviceClass, VrError> {
        self.state
            .lock()
            .unwrap()
            .device_classes
            .get(&device_index)
            .copied()
            .ok_or(VrError::DeviceClassQuery {
                device_index,
                description: "unknown device".to_string(),
            })
    }

    fn controller_index(&self, side: Side) -> Option<usize> {
        self.state.lock().unwrap().controller_slots[side.index()]
    }

    fn eye_to_head(&self, side: Side) -> [[f32; 4]; 3] {
        // Half of a 64 mm interpupillary distance per eye.
        let x = match side {
            Side::Left => -0.032,
            Side::Right => 0.032,
        };
        [
            [1.0, 0.0, 0.0, x],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ]
    }

    fn eye_projection(&self, _side: Side, near: f32, far: f32) -> Matrix4<f32> {
        let state = self.state.lock().unwrap();
        let aspect = state.render_size.width as f32 / state.render_size.height as f32;
        Matrix4::new_perspective(aspect, 100f32.to_radians(), near, far)
    }

    fn submit(&mut self, side: Side, layer: &SubmittedLayer) -> Result<(), VrError> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            return Err(VrError::Submit("runtime is not initialized".to_string()));
        }
        state.submitted.push((side, *layer));
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.initialized = false;
        state.shutdown_count += 1;
    }
}
