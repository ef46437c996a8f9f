pub mod context;
pub mod devices;
pub mod eyes;
pub mod mock;
pub mod pose;
pub mod runtime;
pub mod teleporter;

#[cfg(test)]
mod context_tests;

pub use context::{ContextState, OwnerKey, VrContext, VrInputProcessor, VrPickCalculator};
pub use devices::{BaseStation, Controller, ControllerModel, Headset, PickResult, Tracker};
pub use eyes::Eye;
pub use mock::{MockHandle, MockVrRuntime};
pub use pose::{PoseCache, PoseSnapshot, TrackedDevicePose};
pub use runtime::{
    ActionState, ControllerActions, DeviceClass, DigitalAction, FrameTiming, RawDevicePose,
    RawPoseFrame, RenderTargetSize, SubmittedLayer, VrError, VrEvent, VrEventKind, VrRuntime,
};
pub use teleporter::Teleporter;

/// Left or right, for anything that comes in a mirrored pair (eyes, hands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Pair of values addressed by [`Side`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SidePair<T> {
    left: T,
    right: T,
}

impl<T> SidePair<T> {
    pub fn new(left: T, right: T) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Side, &T)> {
        [(Side::Left, &self.left), (Side::Right, &self.right)].into_iter()
    }
}
