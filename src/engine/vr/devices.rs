//! Tracked device wrappers.
//!
//! Each wrapper owns one reference frame parented to the play-area frame and
//! refreshes it from the current pose snapshot. Headset and controllers
//! toggle their connected flag from pose validity every frame; trackers and
//! base stations persist for the context's whole lifetime once discovered,
//! so a transient signal loss only clears the flag.

use crate::engine::frames::{FrameError, FrameId, FrameTree};
use crate::engine::vr::Side;
use crate::engine::vr::context::OwnerKey;
use crate::engine::vr::pose::{PoseSnapshot, TrackedDevicePose};
use crate::engine::vr::runtime::{ControllerActions, HEADSET_DEVICE_INDEX};

use nalgebra::Isometry3;

/// Visual model variant of the connected controllers, selected from the
/// action manifest's binding URLs at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerModel {
    #[default]
    Unknown,
    Focus3,
    Index,
}

/// One pick calculator's result for a controller this frame.
#[derive(Debug, Clone, Copy)]
pub struct PickResult {
    pub owner: OwnerKey,
    /// Distance from the controller to the picked point, meters.
    pub distance: f64,
}

/// Frame and connection state shared by every wrapper.
#[derive(Debug)]
struct TrackedDevice {
    frame: FrameId,
    connected: bool,
}

impl TrackedDevice {
    fn new(
        frames: &mut FrameTree,
        play_area: FrameId,
        name: impl Into<String>,
    ) -> Result<Self, FrameError> {
        let frame = frames.add_frame(name, play_area, Isometry3::identity())?;
        Ok(Self {
            frame,
            connected: false,
        })
    }

    fn apply(
        &mut self,
        frames: &mut FrameTree,
        pose: Option<&TrackedDevicePose>,
    ) -> Result<(), FrameError> {
        match pose {
            Some(pose) if pose.is_valid() => {
                self.connected = pose.is_connected();
                frames.set_transform_to_parent(self.frame, *pose.device_to_origin())
            }
            _ => {
                self.connected = false;
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub struct Headset {
    device: TrackedDevice,
}

impl Headset {
    pub(crate) fn new(frames: &mut FrameTree, play_area: FrameId) -> Result<Self, FrameError> {
        Ok(Self {
            device: TrackedDevice::new(frames, play_area, "headset")?,
        })
    }

    pub(crate) fn update(
        &mut self,
        frames: &mut FrameTree,
        snapshot: &PoseSnapshot,
    ) -> Result<(), FrameError> {
        self.device
            .apply(frames, snapshot.device(HEADSET_DEVICE_INDEX))
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.device.connected
    }

    #[inline]
    pub fn frame(&self) -> FrameId {
        self.device.frame
    }
}

#[derive(Debug)]
pub struct Controller {
    side: Side,
    model: ControllerModel,
    device: TrackedDevice,
    device_index: Option<usize>,
    actions: ControllerActions,
    pick_results: Vec<PickResult>,
    selected_pick: Option<PickResult>,
}

impl Controller {
    pub(crate) fn new(
        frames: &mut FrameTree,
        play_area: FrameId,
        side: Side,
    ) -> Result<Self, FrameError> {
        Ok(Self {
            side,
            model: ControllerModel::Unknown,
            device: TrackedDevice::new(frames, play_area, format!("{}_controller", side.name()))?,
            device_index: None,
            actions: ControllerActions::default(),
            pick_results: Vec::new(),
            selected_pick: None,
        })
    }

    /// Refresh from the snapshot. A controller with no device slot this
    /// frame is disconnected.
    pub(crate) fn update(
        &mut self,
        frames: &mut FrameTree,
        snapshot: &PoseSnapshot,
        device_index: Option<usize>,
    ) -> Result<(), FrameError> {
        self.device_index = device_index;
        let pose = device_index.and_then(|i| snapshot.device(i));
        self.device.apply(frames, pose)
    }

    pub(crate) fn set_model(&mut self, model: ControllerModel) {
        self.model = model;
    }

    pub(crate) fn set_actions(&mut self, actions: ControllerActions) {
        self.actions = actions;
    }

    /// Closest pick wins; the result list is rebuilt by the calculators each
    /// frame.
    pub(crate) fn update_pick_results(&mut self) {
        self.selected_pick = self
            .pick_results
            .iter()
            .copied()
            .min_by(|a, b| a.distance.total_cmp(&b.distance));
        self.pick_results.clear();
    }

    /// Called by pick calculators during the poll step.
    pub fn add_pick_result(&mut self, result: PickResult) {
        self.pick_results.push(result);
    }

    pub fn selected_pick(&self) -> Option<PickResult> {
        self.selected_pick
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn model(&self) -> ControllerModel {
        self.model
    }

    pub fn device_index(&self) -> Option<usize> {
        self.device_index
    }

    pub fn actions(&self) -> &ControllerActions {
        &self.actions
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.device.connected
    }

    #[inline]
    pub fn frame(&self) -> FrameId {
        self.device.frame
    }
}

#[derive(Debug)]
pub struct Tracker {
    device_index: usize,
    device: TrackedDevice,
}

impl Tracker {
    pub(crate) fn new(
        frames: &mut FrameTree,
        play_area: FrameId,
        device_index: usize,
    ) -> Result<Self, FrameError> {
        Ok(Self {
            device_index,
            device: TrackedDevice::new(frames, play_area, format!("tracker_{device_index}"))?,
        })
    }

    pub(crate) fn update(
        &mut self,
        frames: &mut FrameTree,
        snapshot: &PoseSnapshot,
    ) -> Result<(), FrameError> {
        self.device.apply(frames, snapshot.device(self.device_index))
    }

    #[inline]
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.device.connected
    }

    #[inline]
    pub fn frame(&self) -> FrameId {
        self.device.frame
    }
}

#[derive(Debug)]
pub struct BaseStation {
    device_index: usize,
    device: TrackedDevice,
}

impl BaseStation {
    pub(crate) fn new(
        frames: &mut FrameTree,
        play_area: FrameId,
        device_index: usize,
    ) -> Result<Self, FrameError> {
        Ok(Self {
            device_index,
            device: TrackedDevice::new(frames, play_area, format!("base_station_{device_index}"))?,
        })
    }

    pub(crate) fn update(
        &mut self,
        frames: &mut FrameTree,
        snapshot: &PoseSnapshot,
    ) -> Result<(), FrameError> {
        self.device.apply(frames, snapshot.device(self.device_index))
    }

    #[inline]
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.device.connected
    }

    #[inline]
    pub fn frame(&self) -> FrameId {
        self.device.frame
    }
}
