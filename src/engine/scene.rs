//! Scene rendering seam.
//!
//! `render_eyes` drives whatever implements [`SceneRenderer`]; the engine
//! itself only owns the eye surfaces and the camera math. The bundled
//! [`ClearRenderer`] is the demo binary's stand-in: it clears each eye to a
//! solid color so the submit path is exercised end to end.

use std::sync::Arc;

use nalgebra::{Isometry3, Matrix4};
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::command_buffer::{
    AutoCommandBufferBuilder, ClearColorImageInfo, CommandBufferUsage,
    PrimaryCommandBufferAbstract,
};
use vulkano::device::Queue;
use vulkano::format::ClearColorValue;
use vulkano::sync::GpuFuture;

use crate::engine::gpu::{GpuContext, GpuError};
use crate::engine::vr::Eye;
use crate::engine::EngineResult;

/// Renders the world into one eye's offscreen surface.
pub trait SceneRenderer {
    /// Fill `eye`'s color target. `view` is the eye-from-world transform,
    /// `projection` the eye's projection matrix.
    fn render(
        &mut self,
        view: &Isometry3<f64>,
        projection: &Matrix4<f32>,
        eye: &Eye,
    ) -> EngineResult<()>;
}

/// Minimal renderer: a single clear pass per eye.
pub struct ClearRenderer {
    queue: Arc<Queue>,
    command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
    clear_color: [f32; 4],
}

impl ClearRenderer {
    pub fn new(gpu: &GpuContext, clear_color: [f32; 4]) -> Self {
        Self {
            queue: gpu.queue().clone(),
            command_buffer_allocator: gpu.command_buffer_allocator().clone(),
            clear_color,
        }
    }
}

impl SceneRenderer for ClearRenderer {
    fn render(
        &mut self,
        _view: &Isometry3<f64>,
        _projection: &Matrix4<f32>,
        eye: &Eye,
    ) -> EngineResult<()> {
        let mut builder = AutoCommandBufferBuilder::primary(
            self.command_buffer_allocator.clone(),
            self.queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )
        .map_err(|e| GpuError::Execution(e.to_string()))?;

        let mut clear = ClearColorImageInfo::image(eye.image().clone());
        clear.clear_value = ClearColorValue::Float(self.clear_color);
        builder
            .clear_color_image(clear)
            .map_err(|e| GpuError::Execution(e.to_string()))?;

        let command_buffer = builder
            .build()
            .map_err(|e| GpuError::Execution(e.to_string()))?;
        command_buffer
            .execute(self.queue.clone())
            .map_err(|e| GpuError::Execution(e.to_string()))?
            .then_signal_fence_and_flush()
            .map_err(|e| GpuError::Execution(e.to_string()))?
            .wait(None)
            .map_err(|e| GpuError::Execution(e.to_string()))?;

        Ok(())
    }
}
