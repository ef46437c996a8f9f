//! Per-eye offscreen render targets.
//!
//! Each eye owns a color image sized to the runtime-recommended resolution,
//! the head-to-eye offset, and the eye's projection. The scene renderer
//! fills the image; the context hands its layer to the compositor.

use std::sync::Arc;

use nalgebra::{Isometry3, Matrix4};
use vulkano::format::Format;
use vulkano::image::view::ImageView;
use vulkano::image::{Image, ImageCreateInfo, ImageType, ImageUsage};
use vulkano::memory::allocator::AllocationCreateInfo;

use crate::engine::gpu::{GpuContext, GpuError};
use crate::engine::vr::Side;
use crate::engine::vr::runtime::{RenderTargetSize, SubmittedLayer};

/// Near clip plane for the per-eye projection, meters.
pub const NEAR_PLANE: f32 = 0.05;
/// Far clip plane for the per-eye projection, meters.
pub const FAR_PLANE: f32 = 200.0;

pub struct Eye {
    side: Side,
    extent: RenderTargetSize,
    head_from_eye: Isometry3<f64>,
    projection: Matrix4<f32>,
    image: Arc<Image>,
    view: Arc<ImageView>,
    texture_id: u64,
}

impl Eye {
    /// Allocate this eye's color surface. GPU work: render thread only.
    pub(crate) fn new(
        gpu: &GpuContext,
        side: Side,
        extent: RenderTargetSize,
        head_from_eye: Isometry3<f64>,
        projection: Matrix4<f32>,
    ) -> Result<Self, GpuError> {
        let image = Image::new(
            gpu.memory_allocator().clone(),
            ImageCreateInfo {
                image_type: ImageType::Dim2d,
                format: Format::R8G8B8A8_UNORM,
                extent: [extent.width, extent.height, 1],
                usage: ImageUsage::COLOR_ATTACHMENT
                    | ImageUsage::SAMPLED
                    | ImageUsage::TRANSFER_DST
                    | ImageUsage::TRANSFER_SRC,
                ..Default::default()
            },
            AllocationCreateInfo::default(),
        )
        .map_err(|e| GpuError::Allocation(e.to_string()))?;
        let view =
            ImageView::new_default(image.clone()).map_err(|e| GpuError::Allocation(e.to_string()))?;

        Ok(Self {
            side,
            extent,
            head_from_eye,
            projection,
            image,
            view,
            texture_id: gpu.alloc_texture_id(),
        })
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn extent(&self) -> RenderTargetSize {
        self.extent
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn view(&self) -> &Arc<ImageView> {
        &self.view
    }

    pub fn head_from_eye(&self) -> &Isometry3<f64> {
        &self.head_from_eye
    }

    pub fn projection(&self) -> &Matrix4<f32> {
        &self.projection
    }

    /// World pose of this eye given the headset's world pose.
    pub fn world_from_eye(&self, world_from_headset: &Isometry3<f64>) -> Isometry3<f64> {
        world_from_headset * self.head_from_eye
    }

    /// Compositor-facing handle for this eye's surface.
    pub fn layer(&self) -> SubmittedLayer {
        SubmittedLayer {
            texture_id: self.texture_id,
            extent: [self.extent.width, self.extent.height],
        }
    }
}
