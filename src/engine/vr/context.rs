//! VR context.
//!
//! Owns the native runtime handle, every device wrapper, the teleport frame
//! chain and the eye surfaces, and drives the strict per-frame cycle:
//! `wait_get_poses` -> `poll_events` -> `render_eyes`. One cycle per rendered
//! frame, single render/logic thread; the pose snapshot handoff is the only
//! producer/consumer seam and goes through [`PoseCache`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::frames::{FrameId, FrameTree};
use crate::engine::gpu::GpuContext;
use crate::engine::scene::SceneRenderer;
use crate::engine::vr::devices::{BaseStation, Controller, ControllerModel, Headset, Tracker};
use crate::engine::vr::eyes::{Eye, FAR_PLANE, NEAR_PLANE};
use crate::engine::vr::pose::{PoseCache, PoseSnapshot, TrackedDevicePose, isometry_from_raw_3x4};
use crate::engine::vr::runtime::{
    ActionState, DeviceClass, MAX_TRACKERS_PER_DONGLE, RenderTargetSize, VrError, VrRuntime,
};
use crate::engine::vr::{Side, SidePair};
use crate::engine::{EngineError, EngineResult};

/// The six body locations a tracker can be assigned to.
pub const DEFAULT_TRACKER_ROLES: [&str; 6] = [
    "chest",
    "waist",
    "left_wrist",
    "right_wrist",
    "left_ankle",
    "right_ankle",
];

/// Rotation taking the runtime's Y-up device space into the Z-up world
/// convention: yaw(-90 deg), pitch(0), roll(90 deg), zero translation.
/// Every device pose downstream composes through this edge, so it is built
/// once and never changes.
pub fn y_up_to_z_up() -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_euler_angles(
        90.0f64.to_radians(),
        0.0,
        (-90.0f64).to_radians(),
    );
    Isometry3::from_parts(Translation3::identity(), rotation)
}

/// Lifecycle of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Terminated,
}

/// Opaque identity a caller registers callbacks under, so it can later
/// remove exactly its own entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerKey(Uuid);

impl OwnerKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes pick/selection state from the fresh snapshot. Runs before input
/// processors so they observe up-to-date pick results.
pub trait VrPickCalculator: Send {
    fn calculate(&mut self, context: &mut VrContext);
}

/// Application logic reacting to button and pick state.
pub trait VrInputProcessor: Send {
    fn process(&mut self, context: &mut VrContext);
}

/// Ordered handler list keyed by owner. Locked so registration from another
/// thread (or from a handler mid-poll) is never lost or observed
/// half-mutated; iteration works on a snapshot taken under the lock.
struct Registry<T: ?Sized> {
    entries: Mutex<Vec<(OwnerKey, Arc<Mutex<T>>)>>,
}

impl<T: ?Sized> Registry<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registering an owner twice replaces its handler in place, keeping the
    /// original position in the call order.
    fn add(&self, owner: OwnerKey, handler: Arc<Mutex<T>>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = entries.iter_mut().find(|(key, _)| *key == owner) {
            slot.1 = handler;
        } else {
            entries.push((owner, handler));
        }
    }

    fn remove(&self, owner: OwnerKey) {
        self.entries.lock().unwrap().retain(|(key, _)| *key != owner);
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<T>>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ActionManifest {
    #[serde(default)]
    default_bindings: Vec<DefaultBinding>,
}

#[derive(Debug, Deserialize)]
struct DefaultBinding {
    binding_url: String,
}

pub struct VrContext {
    runtime: Box<dyn VrRuntime>,
    state: ContextState,
    runtime_initialized: bool,
    action_manifest_path: PathBuf,
    render_target_multiplier: f32,
    render_size: RenderTargetSize,

    frames: FrameTree,
    teleport_frame: FrameId,
    play_area_frame: FrameId,

    poses: PoseCache,
    timing_baseline_seconds: Option<f64>,
    last_runtime_seconds: Option<f64>,
    frame_period_seconds: Option<f64>,
    last_wait_instant: Option<Instant>,

    controller_model: ControllerModel,
    headset: Headset,
    controllers: SidePair<Controller>,
    trackers: BTreeMap<usize, Tracker>,
    base_stations: BTreeMap<usize, BaseStation>,
    new_tracker_indices: Vec<usize>,

    tracker_roles: HashMap<String, usize>,
    available_tracker_roles: BTreeSet<String>,
    roles_reset_pending: bool,

    action_state: ActionState,

    pick_calculators: Registry<dyn VrPickCalculator>,
    input_processors: Registry<dyn VrInputProcessor>,

    eyes: Option<SidePair<Eye>>,
}

impl VrContext {
    /// Build the frame chain and device wrappers around an injected runtime.
    /// Nothing talks to the native layer until [`VrContext::init_system`].
    pub fn new(
        runtime: Box<dyn VrRuntime>,
        action_manifest_path: impl Into<PathBuf>,
    ) -> EngineResult<Self> {
        let mut frames = FrameTree::new();
        let world = frames.world();
        let teleport_frame = frames.add_frame("teleport", world, Isometry3::identity())?;
        let play_area_frame = frames.add_frame("play_area", teleport_frame, y_up_to_z_up())?;

        let headset = Headset::new(&mut frames, play_area_frame)?;
        let controllers = SidePair::new(
            Controller::new(&mut frames, play_area_frame, Side::Left)?,
            Controller::new(&mut frames, play_area_frame, Side::Right)?,
        );

        Ok(Self {
            runtime,
            state: ContextState::Uninitialized,
            runtime_initialized: false,
            action_manifest_path: action_manifest_path.into(),
            render_target_multiplier: 1.0,
            render_size: RenderTargetSize::default(),
            frames,
            teleport_frame,
            play_area_frame,
            poses: PoseCache::new(),
            timing_baseline_seconds: None,
            last_runtime_seconds: None,
            frame_period_seconds: None,
            last_wait_instant: None,
            controller_model: ControllerModel::Unknown,
            headset,
            controllers,
            trackers: BTreeMap::new(),
            base_stations: BTreeMap::new(),
            new_tracker_indices: Vec::new(),
            tracker_roles: HashMap::new(),
            available_tracker_roles: DEFAULT_TRACKER_ROLES
                .iter()
                .map(|role| role.to_string())
                .collect(),
            roles_reset_pending: false,
            action_state: ActionState::default(),
            pick_calculators: Registry::new(),
            input_processors: Registry::new(),
            eyes: None,
        })
    }

    /// Scale factor applied to the runtime-recommended render target size.
    /// Takes effect at `init_system`.
    pub fn set_render_target_multiplier(&mut self, multiplier: f32) {
        self.render_target_multiplier = multiplier;
    }

    /// Open the native runtime, read the action manifest, and wrap every
    /// already-connected tracker. A runtime error here is fatal: the context
    /// lands in `Terminated` and the per-frame cycle refuses to run.
    pub fn init_system(&mut self) -> EngineResult<()> {
        self.state = ContextState::Initializing;
        log::info!("initializing VR runtime");

        let size = match self.runtime.init() {
            Ok(size) => size,
            Err(e) => {
                self.state = ContextState::Terminated;
                return Err(e.into());
            }
        };
        self.runtime_initialized = true;
        self.render_size = RenderTargetSize {
            width: (size.width as f32 * self.render_target_multiplier) as u32,
            height: (size.height as f32 * self.render_target_multiplier) as u32,
        };

        self.controller_model = match self.load_controller_model() {
            Ok(model) => model,
            Err(e) => {
                self.state = ContextState::Terminated;
                return Err(e);
            }
        };
        log::info!("using VR controller model: {:?}", self.controller_model);
        if let Err(e) = self.runtime.set_action_manifest(&self.action_manifest_path) {
            self.state = ContextState::Terminated;
            return Err(e.into());
        }
        for side in Side::BOTH {
            self.controllers.get_mut(side).set_model(self.controller_model);
        }

        for index in self
            .runtime
            .sorted_generic_tracker_indices()
            .into_iter()
            .take(MAX_TRACKERS_PER_DONGLE)
        {
            let tracker = Tracker::new(&mut self.frames, self.play_area_frame, index)?;
            self.trackers.insert(index, tracker);
        }

        self.state = ContextState::Running;
        Ok(())
    }

    /// Controller bindings are usability relevant, so a missing or malformed
    /// manifest fails init instead of silently defaulting.
    fn load_controller_model(&self) -> EngineResult<ControllerModel> {
        let path = &self.action_manifest_path;
        let file = File::open(path).map_err(|e| {
            VrError::ActionManifest(format!("{}: {e}", path.display()))
        })?;
        let manifest: ActionManifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| VrError::ActionManifest(format!("{}: {e}", path.display())))?;
        if manifest.default_bindings.is_empty() {
            return Err(
                VrError::ActionManifest(format!("{}: no default_bindings", path.display())).into(),
            );
        }

        let model = if manifest
            .default_bindings
            .iter()
            .any(|binding| binding.binding_url.contains("focus3"))
        {
            ControllerModel::Focus3
        } else {
            ControllerModel::Index
        };
        Ok(model)
    }

    /// Allocate both eyes' render surfaces at the recommended size. GPU
    /// resources: must run on the rendering thread, after `init_system`.
    pub fn setup_eyes(&mut self, gpu: &GpuContext) -> EngineResult<()> {
        self.ensure_running()?;
        log::info!(
            "VR per eye render size: {} x {}",
            self.render_size.width,
            self.render_size.height
        );

        let build_eye = |runtime: &dyn VrRuntime, side| {
            let head_from_eye = isometry_from_raw_3x4(&runtime.eye_to_head(side));
            let projection = runtime.eye_projection(side, NEAR_PLANE, FAR_PLANE);
            Eye::new(gpu, side, self.render_size, head_from_eye, projection)
        };
        let left = build_eye(self.runtime.as_ref(), Side::Left)?;
        let right = build_eye(self.runtime.as_ref(), Side::Right)?;
        self.eyes = Some(SidePair::new(left, right));
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), VrError> {
        if self.state == ContextState::Running {
            Ok(())
        } else {
            Err(VrError::NotRunning)
        }
    }

    /// Step 1 of the cycle. Blocks on the compositor's frame pacing, then
    /// publishes the full pose array as one immutable snapshot stamped with
    /// a monotonically increasing measurement timestamp. The timing baseline
    /// is fixed on the first frame.
    pub fn wait_get_poses(&mut self) -> EngineResult<()> {
        self.ensure_running()?;

        let frame = self.runtime.wait_get_poses();
        let runtime_seconds =
            frame.timing.system_time_seconds + frame.timing.new_poses_ready_ms * 1.0e-3;
        let baseline = *self.timing_baseline_seconds.get_or_insert(runtime_seconds);
        if let Some(previous) = self.last_runtime_seconds {
            let period = runtime_seconds - previous;
            if period > 0.0 {
                self.frame_period_seconds = Some(period);
            }
        }
        self.last_runtime_seconds = Some(runtime_seconds);
        self.last_wait_instant = Some(Instant::now());

        let measurement_timestamp_nanos = ((runtime_seconds - baseline) * 1.0e9) as i64;
        let poses = frame
            .poses
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                TrackedDevicePose::from_raw(measurement_timestamp_nanos, index, raw)
            })
            .collect();
        self.poses
            .publish(PoseSnapshot::new(measurement_timestamp_nanos, poses));
        Ok(())
    }

    /// Step 2 of the cycle: consume the pending snapshot, refresh action
    /// state and every device wrapper, reconcile hot-plug events, then run
    /// pick calculators, per-controller pick results, and input processors,
    /// in that order.
    pub fn poll_events(&mut self) -> EngineResult<()> {
        self.ensure_running()?;
        let Some(snapshot) = self.poses.take() else {
            return Ok(());
        };

        self.action_state = self.runtime.update_action_state();

        self.headset.update(&mut self.frames, &snapshot)?;
        for side in Side::BOTH {
            let device_index = self.runtime.controller_index(side);
            let actions = *self.action_state.controller(side);
            let controller = self.controllers.get_mut(side);
            controller.set_actions(actions);
            controller.update(&mut self.frames, &snapshot, device_index)?;
        }

        while let Some(event) = self.runtime.poll_event() {
            self.reconcile_device(event.tracked_device_index)?;
        }

        for tracker in self.trackers.values_mut() {
            tracker.update(&mut self.frames, &snapshot)?;
        }
        for station in self.base_stations.values_mut() {
            station.update(&mut self.frames, &snapshot)?;
        }

        for calculator in self.pick_calculators.snapshot() {
            calculator.lock().unwrap().calculate(self);
        }
        for side in Side::BOTH {
            self.controllers.get_mut(side).update_pick_results();
        }
        for processor in self.input_processors.snapshot() {
            processor.lock().unwrap().process(self);
        }
        Ok(())
    }

    /// Wrap a device the first time an event mentions it. A failed class
    /// query is non-fatal: skip the event, keep polling.
    fn reconcile_device(&mut self, device_index: usize) -> EngineResult<()> {
        if self.trackers.contains_key(&device_index)
            || self.base_stations.contains_key(&device_index)
        {
            return Ok(());
        }
        match self.runtime.device_class(device_index) {
            Ok(DeviceClass::GenericTracker) => {
                let tracker = Tracker::new(&mut self.frames, self.play_area_frame, device_index)?;
                self.trackers.insert(device_index, tracker);
                self.new_tracker_indices.push(device_index);
                log::info!("discovered tracker at device slot {device_index}");
            }
            Ok(DeviceClass::TrackingReference) => {
                let station =
                    BaseStation::new(&mut self.frames, self.play_area_frame, device_index)?;
                self.base_stations.insert(device_index, station);
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("skipping event for device {device_index}: {e}");
            }
        }
        Ok(())
    }

    /// Step 3 of the cycle: render the scene into each eye surface, then
    /// submit both to the compositor. Must land before the next
    /// `wait_get_poses`; a late pair makes the compositor reuse the previous
    /// frame, which is logged as a performance signal, not surfaced as an
    /// error.
    pub fn render_eyes(&mut self, scene: &mut dyn SceneRenderer) -> EngineResult<()> {
        self.ensure_running()?;
        let Some(eyes) = self.eyes.as_ref() else {
            return Err(VrError::NoEyeSurfaces.into());
        };

        let world_from_headset = self.frames.transform_to_world(self.headset.frame())?;
        for side in Side::BOTH {
            let eye = eyes.get(side);
            let view = eye.world_from_eye(&world_from_headset).inverse();
            scene.render(&view, eye.projection(), eye)?;
        }
        for side in Side::BOTH {
            self.runtime.submit(side, &eyes.get(side).layer())?;
        }

        if let (Some(started), Some(period)) = (self.last_wait_instant, self.frame_period_seconds)
        {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > period {
                log::debug!(
                    "eyes submitted {:.2} ms past the frame period, compositor will reuse a stale frame",
                    (elapsed - period) * 1.0e3
                );
            }
        }
        Ok(())
    }

    /// Single write path for locomotion. The mutator receives the current
    /// world-from-teleport transform; afterwards every descendant device
    /// frame recomputes on its next read.
    pub fn teleport(&mut self, mutator: impl FnOnce(&mut Isometry3<f64>)) {
        self.frames
            .update_transform(self.teleport_frame, mutator)
            .expect("teleport frame is always in the tree");
    }

    /// Release eye surfaces and the native runtime. Idempotent, and safe to
    /// call after a failed `init_system`.
    pub fn dispose(&mut self) {
        if self.state == ContextState::Terminated {
            return;
        }
        self.state = ContextState::ShuttingDown;
        self.eyes = None;
        if self.runtime_initialized {
            self.runtime.shutdown();
            self.runtime_initialized = false;
        }
        self.state = ContextState::Terminated;
    }

    pub fn add_pick_calculator(&self, owner: OwnerKey, calculator: Arc<Mutex<dyn VrPickCalculator>>) {
        self.pick_calculators.add(owner, calculator);
    }

    pub fn remove_pick_calculator(&self, owner: OwnerKey) {
        self.pick_calculators.remove(owner);
    }

    pub fn add_input_processor(&self, owner: OwnerKey, processor: Arc<Mutex<dyn VrInputProcessor>>) {
        self.input_processors.add(owner, processor);
    }

    pub fn remove_input_processor(&self, owner: OwnerKey) {
        self.input_processors.remove(owner);
    }

    pub fn set_tracker_role(&mut self, role: impl Into<String>, device_index: usize) {
        self.tracker_roles.insert(role.into(), device_index);
    }

    pub fn tracker_for_role(&self, role: &str) -> Option<&Tracker> {
        self.tracker_roles
            .get(role)
            .and_then(|index| self.trackers.get(index))
    }

    pub fn assigned_tracker_roles(&self) -> Vec<&str> {
        self.tracker_roles.keys().map(String::as_str).collect()
    }

    pub fn available_tracker_roles(&self) -> &BTreeSet<String> {
        &self.available_tracker_roles
    }

    pub fn set_tracker_role_unavailable(&mut self, role: &str) {
        self.available_tracker_roles.remove(role);
    }

    pub fn set_tracker_role_available(&mut self, role: impl Into<String>) {
        self.available_tracker_roles.insert(role.into());
    }

    /// Clear all assignments, restore the default role set, and arm the
    /// one-shot reset flag.
    pub fn reset_tracker_roles(&mut self) {
        self.tracker_roles.clear();
        self.available_tracker_roles = DEFAULT_TRACKER_ROLES
            .iter()
            .map(|role| role.to_string())
            .collect();
        self.roles_reset_pending = true;
    }

    /// True exactly once after each `reset_tracker_roles`.
    pub fn is_roles_reset_pending(&mut self) -> bool {
        std::mem::take(&mut self.roles_reset_pending)
    }

    /// Device slots of trackers discovered since the last call. Drained on
    /// read.
    pub fn take_new_tracker_indices(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.new_tracker_indices)
    }

    #[inline]
    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn controller_model(&self) -> ControllerModel {
        self.controller_model
    }

    pub fn render_size(&self) -> RenderTargetSize {
        self.render_size
    }

    pub fn headset(&self) -> &Headset {
        &self.headset
    }

    pub fn controller(&self, side: Side) -> &Controller {
        self.controllers.get(side)
    }

    pub fn controller_mut(&mut self, side: Side) -> &mut Controller {
        self.controllers.get_mut(side)
    }

    pub fn trackers(&self) -> &BTreeMap<usize, Tracker> {
        &self.trackers
    }

    pub fn base_stations(&self) -> &BTreeMap<usize, BaseStation> {
        &self.base_stations
    }

    pub fn eyes(&self) -> Option<&SidePair<Eye>> {
        self.eyes.as_ref()
    }

    #[inline]
    pub fn teleport_frame(&self) -> FrameId {
        self.teleport_frame
    }

    /// The frame fixed to the physical tracking volume's floor center.
    #[inline]
    pub fn play_area_frame(&self) -> FrameId {
        self.play_area_frame
    }

    pub fn frames(&self) -> &FrameTree {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameTree {
        &mut self.frames
    }

    /// Convenience over the frame tree's lazy composition.
    pub fn transform_to_world(&mut self, frame: FrameId) -> EngineResult<Isometry3<f64>> {
        self.frames.transform_to_world(frame).map_err(EngineError::from)
    }

    /// Peek at the currently published snapshot (the one `poll_events` will
    /// consume), if any.
    pub fn latest_poses(&self) -> Option<Arc<PoseSnapshot>> {
        self.poses.latest()
    }
}
