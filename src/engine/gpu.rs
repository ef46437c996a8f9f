//! Headless Vulkan bootstrap.
//!
//! Eye render surfaces are GPU images, so the context needs a device, a
//! graphics queue and allocators before `setup_eyes` runs. Nothing here
//! touches a window; the companion window is presentation-free glue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use vulkano::VulkanLibrary;
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::device::physical::PhysicalDeviceType;
use vulkano::device::{Device, DeviceCreateInfo, Queue, QueueCreateInfo, QueueFlags};
use vulkano::instance::{Instance, InstanceCreateInfo};
use vulkano::memory::allocator::StandardMemoryAllocator;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to load the Vulkan library: {0}")]
    Library(String),
    #[error("no graphics-capable GPU device found")]
    NoDevice,
    #[error("GPU allocation failed: {0}")]
    Allocation(String),
    #[error("GPU command execution failed: {0}")]
    Execution(String),
}

/// Device, queue and allocators for offscreen rendering.
pub struct GpuContext {
    device: Arc<Device>,
    queue: Arc<Queue>,
    memory_allocator: Arc<StandardMemoryAllocator>,
    command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
    next_texture_id: AtomicU64,
}

impl GpuContext {
    /// Open the first graphics-capable device, preferring discrete GPUs.
    pub fn new() -> Result<Self, GpuError> {
        let library = VulkanLibrary::new().map_err(|e| GpuError::Library(e.to_string()))?;
        let instance = Instance::new(library, InstanceCreateInfo::default())
            .map_err(|e| GpuError::Library(e.to_string()))?;

        let mut physical_devices: Vec<_> = instance
            .enumerate_physical_devices()
            .map_err(|e| GpuError::Library(e.to_string()))?
            .collect();
        physical_devices.sort_by_key(|d| match d.properties().device_type {
            PhysicalDeviceType::DiscreteGpu => 0,
            PhysicalDeviceType::IntegratedGpu => 1,
            _ => 2,
        });

        for physical in physical_devices {
            let Some(family) = physical
                .queue_family_properties()
                .iter()
                .position(|q| q.queue_flags.intersects(QueueFlags::GRAPHICS))
            else {
                continue;
            };

            let (device, mut queues) = Device::new(
                physical,
                DeviceCreateInfo {
                    queue_create_infos: vec![QueueCreateInfo {
                        queue_family_index: family as u32,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .map_err(|e| GpuError::Allocation(e.to_string()))?;
            let queue = queues.next().ok_or(GpuError::NoDevice)?;

            let memory_allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
            let command_buffer_allocator = Arc::new(StandardCommandBufferAllocator::new(
                device.clone(),
                Default::default(),
            ));

            log::info!(
                "using GPU device: {}",
                device.physical_device().properties().device_name
            );
            return Ok(Self {
                device,
                queue,
                memory_allocator,
                command_buffer_allocator,
                next_texture_id: AtomicU64::new(1),
            });
        }

        Err(GpuError::NoDevice)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn memory_allocator(&self) -> &Arc<StandardMemoryAllocator> {
        &self.memory_allocator
    }

    pub fn command_buffer_allocator(&self) -> &Arc<StandardCommandBufferAllocator> {
        &self.command_buffer_allocator
    }

    /// Process-unique id for a surface shared with the compositor.
    pub(crate) fn alloc_texture_id(&self) -> u64 {
        self.next_texture_id.fetch_add(1, Ordering::Relaxed)
    }
}
