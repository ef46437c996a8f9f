//! Controller-driven locomotion.
//!
//! Holding the right controller's B button aims a teleport: the controller's
//! forward ray is intersected with the world floor plane and the landing yaw
//! faces along the ray. Releasing the button snaps the teleport frame so the
//! headset ends up over the landing point. Touchpad vertical travel applies
//! a smooth height offset. Every write goes through
//! [`VrContext::teleport`], the single locomotion write path.

use std::sync::{Arc, Mutex};

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::engine::vr::Side;
use crate::engine::vr::context::{OwnerKey, VrContext, VrInputProcessor};

/// Vertical translation per unit of touchpad travel, meters.
const TOUCHPAD_HEIGHT_GAIN: f64 = 0.3;

/// Rays steeper than this toward the horizon never land.
const MIN_DOWNWARD_SLOPE: f64 = 1.0e-3;

#[derive(Debug, Default)]
pub struct Teleporter {
    preparing_to_teleport: bool,
    proposed: Option<Isometry3<f64>>,
    last_touchpad_y: Option<f64>,
}

impl Teleporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teleporter with the context under `owner`.
    pub fn register(context: &VrContext, owner: OwnerKey) -> Arc<Mutex<Teleporter>> {
        let teleporter = Arc::new(Mutex::new(Teleporter::new()));
        context.add_input_processor(owner, teleporter.clone());
        teleporter
    }

    /// Landing pose for the current controller ray: forward (+X of the
    /// controller frame) intersected with the world floor, yawed along the
    /// ray's horizontal direction.
    fn propose_landing(context: &mut VrContext) -> Option<Isometry3<f64>> {
        let frame = context.controller(Side::Right).frame();
        let world_from_controller = context.transform_to_world(frame).ok()?;

        let origin = world_from_controller.translation.vector;
        let direction = world_from_controller.rotation * Vector3::x();
        if direction.z > -MIN_DOWNWARD_SLOPE {
            return None;
        }

        let t = -origin.z / direction.z;
        let hit = origin + direction * t;
        let yaw = direction.y.atan2(direction.x);
        Some(Isometry3::from_parts(
            Translation3::new(hit.x, hit.y, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
        ))
    }

    /// Snap the teleport frame so the headset's flattened (XY + yaw) pose
    /// lands on `proposed`.
    fn snap_to(context: &mut VrContext, proposed: Isometry3<f64>) {
        let headset_frame = context.headset().frame();
        let teleport_frame = context.teleport_frame();
        let Ok(headset_in_teleport) = context
            .frames_mut()
            .transform_between(headset_frame, teleport_frame)
        else {
            return;
        };

        let translation = headset_in_teleport.translation.vector;
        let (_, _, yaw) = headset_in_teleport.rotation.euler_angles();
        let flattened = Isometry3::from_parts(
            Translation3::new(translation.x, translation.y, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
        );

        let world_from_teleport = proposed * flattened.inverse();
        context.teleport(|teleport| *teleport = world_from_teleport);
    }
}

impl VrInputProcessor for Teleporter {
    fn process(&mut self, context: &mut VrContext) {
        let controller = context.controller(Side::Right);
        if !controller.is_connected() || controller.selected_pick().is_some() {
            self.preparing_to_teleport = false;
            self.last_touchpad_y = None;
            return;
        }
        let actions = *controller.actions();

        if actions.b_button.pressed() {
            self.preparing_to_teleport = true;
        }

        if self.preparing_to_teleport {
            if let Some(landing) = Self::propose_landing(context) {
                self.proposed = Some(landing);
            }
        }

        if self.preparing_to_teleport && actions.b_button.released() {
            if let Some(proposed) = self.proposed.take() {
                Self::snap_to(context, proposed);
            }
            self.preparing_to_teleport = false;
        }

        if actions.touchpad_touched.state {
            let y = actions.touchpad[1] as f64;
            if let Some(last) = self.last_touchpad_y {
                let delta = y - last;
                context.teleport(|teleport| {
                    teleport.translation.vector.z += delta * TOUCHPAD_HEIGHT_GAIN;
                });
            }
            self.last_touchpad_y = Some(y);
        } else {
            self.last_touchpad_y = None;
        }
    }
}
