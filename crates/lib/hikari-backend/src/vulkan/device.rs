use crate::BackendError;

use super::physical_device::{PhysicalDevice, QueueFamily};
use anyhow::Result;
use ash::{
    extensions::{ext, khr},
    vk,
};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocatorDebugSettings,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{collections::HashSet, os::raw::c_char, sync::Arc};

/// Upper bound on any single blocking GPU wait. A fence that does not signal
/// within this window is reported as `BackendError::GpuTimeout` instead of
/// hanging the calling thread forever.
pub const GPU_FENCE_TIMEOUT_NS: u64 = 5_000_000_000;

pub struct Queue {
    pub raw: vk::Queue,
    pub family: QueueFamily,
}

pub struct CommandBuffer {
    pub raw: vk::CommandBuffer,
    pub submit_done_fence: vk::Fence,
    pool: vk::CommandPool,
    device: ash::Device,
}

impl CommandBuffer {
    fn new(device: &ash::Device, queue_family: &QueueFamily) -> Result<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family.index);

        let pool = unsafe { device.create_command_pool(&pool_create_info, None)? };

        let command_buffer_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let cb = unsafe { device.allocate_command_buffers(&command_buffer_allocate_info)? }[0];

        let submit_done_fence = unsafe {
            device.create_fence(
                &vk::FenceCreateInfo::builder()
                    .flags(vk::FenceCreateFlags::SIGNALED)
                    .build(),
                None,
            )
        }?;

        Ok(CommandBuffer {
            raw: cb,
            submit_done_fence,
            pool,
            device: device.clone(),
        })
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // Dropped from within `Device`, after its `device_wait_idle`.
        // Destroying the pool frees the buffer allocated from it.
        unsafe {
            self.device.destroy_fence(self.submit_done_fence, None);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

pub struct DeviceFrame {
    pub main_command_buffer: CommandBuffer,
}

impl DeviceFrame {
    pub fn new(device: &ash::Device, queue_family: &QueueFamily) -> Result<Self> {
        Ok(Self {
            main_command_buffer: CommandBuffer::new(device, queue_family)?,
        })
    }
}

/// Plain-data slice of `VkPhysicalDeviceRayTracingPipelinePropertiesKHR`
/// that the shader-table layout math needs.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureProperties {
    pub min_scratch_alignment: u32,
}

/// Per-type descriptor blob sizes and the buffer offset alignment reported
/// by `VK_EXT_descriptor_buffer`.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorBufferProperties {
    pub offset_alignment: u64,
    pub uniform_buffer_size: usize,
    pub storage_buffer_size: usize,
    pub storage_image_size: usize,
    pub acceleration_structure_size: usize,
}

pub struct Device {
    pub raw: ash::Device,
    pub(crate) pdevice: Arc<PhysicalDevice>,
    pub(crate) instance: Arc<super::instance::Instance>,
    pub universal_queue: Queue,
    pub(crate) global_allocator: Arc<Mutex<Allocator>>,
    pub(crate) setup_cb: Mutex<CommandBuffer>,

    pub acceleration_structure_ext: khr::AccelerationStructure,
    pub ray_tracing_pipeline_ext: khr::RayTracingPipeline,
    pub descriptor_buffer_ext: ext::DescriptorBuffer,

    pub ray_tracing_properties: RayTracingProperties,
    pub acceleration_structure_properties: AccelerationStructureProperties,
    pub descriptor_buffer_properties: DescriptorBufferProperties,

    frames: [Mutex<Arc<DeviceFrame>>; 2],
}

impl Device {
    pub fn create(pdevice: &Arc<PhysicalDevice>) -> Result<Arc<Self>> {
        let supported_extensions: HashSet<String> = unsafe {
            let extension_properties = pdevice
                .instance
                .raw
                .enumerate_device_extension_properties(pdevice.raw)?;
            debug!("Extension properties:\n{:#?}", &extension_properties);

            extension_properties
                .iter()
                .map(|ext| {
                    std::ffi::CStr::from_ptr(ext.extension_name.as_ptr() as *const c_char)
                        .to_string_lossy()
                        .as_ref()
                        .to_owned()
                })
                .collect()
        };

        let device_extension_names = vec![
            khr::Swapchain::name().as_ptr(),
            vk::ExtScalarBlockLayoutFn::name().as_ptr(),
            vk::KhrPipelineLibraryFn::name().as_ptr(), // rt dep
            vk::KhrDeferredHostOperationsFn::name().as_ptr(), // rt dep
            vk::KhrBufferDeviceAddressFn::name().as_ptr(), // rt dep
            vk::KhrAccelerationStructureFn::name().as_ptr(),
            vk::KhrRayTracingPipelineFn::name().as_ptr(),
            vk::ExtDescriptorBufferFn::name().as_ptr(),
        ];

        unsafe {
            for &ext in &device_extension_names {
                let ext = std::ffi::CStr::from_ptr(ext).to_string_lossy();
                if !supported_extensions.contains(ext.as_ref()) {
                    anyhow::bail!("Device extension not supported: {}", ext);
                }
            }
        }

        let priorities = [1.0];

        let universal_queue = pdevice
            .queue_families
            .iter()
            .find(|qf| qf.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .copied();

        let universal_queue = if let Some(universal_queue) = universal_queue {
            universal_queue
        } else {
            anyhow::bail!("No suitable render queue found");
        };

        let universal_queue_info = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(universal_queue.index)
            .queue_priorities(&priorities)
            .build()];

        let mut scalar_block = vk::PhysicalDeviceScalarBlockLayoutFeaturesEXT::default();
        let mut buffer_device_address_features =
            vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut descriptor_buffer_features =
            vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default();

        unsafe {
            let instance = &pdevice.instance.raw;

            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut scalar_block)
                .push_next(&mut buffer_device_address_features)
                .push_next(&mut acceleration_structure_features)
                .push_next(&mut ray_tracing_pipeline_features)
                .push_next(&mut descriptor_buffer_features)
                .build();

            instance.get_physical_device_features2(pdevice.raw, &mut features2);

            anyhow::ensure!(
                scalar_block.scalar_block_layout != 0,
                "scalarBlockLayout not supported"
            );
            anyhow::ensure!(
                buffer_device_address_features.buffer_device_address != 0,
                "bufferDeviceAddress not supported"
            );
            anyhow::ensure!(
                acceleration_structure_features.acceleration_structure != 0,
                "accelerationStructure not supported"
            );
            anyhow::ensure!(
                ray_tracing_pipeline_features.ray_tracing_pipeline != 0,
                "rayTracingPipeline not supported"
            );
            anyhow::ensure!(
                descriptor_buffer_features.descriptor_buffer != 0,
                "descriptorBuffer not supported"
            );

            let device_create_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&universal_queue_info)
                .enabled_extension_names(&device_extension_names)
                .push_next(&mut features2)
                .build();

            let device = instance.create_device(pdevice.raw, &device_create_info, None)?;

            info!("Created a Vulkan device");

            let global_allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device: pdevice.raw,
                debug_settings: AllocatorDebugSettings {
                    log_leaks_on_shutdown: false,
                    log_memory_information: true,
                    log_allocations: true,
                    ..Default::default()
                },
                buffer_device_address: true,
            })?;

            let universal_queue = Queue {
                raw: device.get_device_queue(universal_queue.index, 0),
                family: universal_queue,
            };

            let frame0 = DeviceFrame::new(&device, &universal_queue.family)?;
            let frame1 = DeviceFrame::new(&device, &universal_queue.family)?;

            let setup_cb = CommandBuffer::new(&device, &universal_queue.family)?;

            let acceleration_structure_ext =
                khr::AccelerationStructure::new(&pdevice.instance.raw, &device);
            let ray_tracing_pipeline_ext =
                khr::RayTracingPipeline::new(&pdevice.instance.raw, &device);
            let descriptor_buffer_ext = ext::DescriptorBuffer::new(&pdevice.instance.raw, &device);

            let mut ray_tracing_pipeline_properties =
                vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut acceleration_structure_properties =
                vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut descriptor_buffer_properties =
                vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::builder()
                .push_next(&mut ray_tracing_pipeline_properties)
                .push_next(&mut acceleration_structure_properties)
                .push_next(&mut descriptor_buffer_properties)
                .build();
            instance.get_physical_device_properties2(pdevice.raw, &mut properties2);

            let ray_tracing_properties = RayTracingProperties {
                shader_group_handle_size: ray_tracing_pipeline_properties
                    .shader_group_handle_size,
                shader_group_handle_alignment: ray_tracing_pipeline_properties
                    .shader_group_handle_alignment,
                shader_group_base_alignment: ray_tracing_pipeline_properties
                    .shader_group_base_alignment,
                max_ray_recursion_depth: ray_tracing_pipeline_properties
                    .max_ray_recursion_depth,
            };
            info!("Ray tracing properties: {:?}", ray_tracing_properties);

            let acceleration_structure_properties = AccelerationStructureProperties {
                min_scratch_alignment: acceleration_structure_properties
                    .min_acceleration_structure_scratch_offset_alignment,
            };

            let descriptor_buffer_properties = DescriptorBufferProperties {
                offset_alignment: descriptor_buffer_properties.descriptor_buffer_offset_alignment,
                uniform_buffer_size: descriptor_buffer_properties.uniform_buffer_descriptor_size,
                storage_buffer_size: descriptor_buffer_properties.storage_buffer_descriptor_size,
                storage_image_size: descriptor_buffer_properties.storage_image_descriptor_size,
                acceleration_structure_size: descriptor_buffer_properties
                    .acceleration_structure_descriptor_size,
            };
            info!(
                "Descriptor buffer properties: {:?}",
                descriptor_buffer_properties
            );

            Ok(Arc::new(Device {
                pdevice: pdevice.clone(),
                instance: pdevice.instance.clone(),
                raw: device,
                universal_queue,
                global_allocator: Arc::new(Mutex::new(global_allocator)),
                setup_cb: Mutex::new(setup_cb),
                acceleration_structure_ext,
                ray_tracing_pipeline_ext,
                descriptor_buffer_ext,
                ray_tracing_properties,
                acceleration_structure_properties,
                descriptor_buffer_properties,
                frames: [Mutex::new(Arc::new(frame0)), Mutex::new(Arc::new(frame1))],
            }))
        }
    }

    /// Waits for `fence` for at most [`GPU_FENCE_TIMEOUT_NS`].
    pub fn wait_for_fence(&self, fence: vk::Fence, info: &str) -> Result<(), BackendError> {
        let result = unsafe {
            self.raw
                .wait_for_fences(std::slice::from_ref(&fence), true, GPU_FENCE_TIMEOUT_NS)
        };

        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(BackendError::GpuTimeout {
                info: info.to_owned(),
                timeout_ns: GPU_FENCE_TIMEOUT_NS,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Waits for the GPU to be done with the frame submitted two iterations
    /// ago, making its command buffer safe to re-record.
    pub fn begin_frame(&self) -> Result<Arc<DeviceFrame>, BackendError> {
        let mut frame0 = self.frames[0].lock();
        {
            let frame0: &mut DeviceFrame =
                Arc::get_mut(&mut frame0).ok_or_else(|| BackendError::ResourceAccess {
                    info: "Unable to begin frame: frame data is being held by user code"
                        .to_owned(),
                })?;

            self.wait_for_fence(
                frame0.main_command_buffer.submit_done_fence,
                "previous frame submission",
            )?;
        }

        Ok(frame0.clone())
    }

    pub fn finish_frame(&self, frame: Arc<DeviceFrame>) {
        drop(frame);

        let mut frame0 = self.frames[0].lock();
        let frame0: &mut DeviceFrame = Arc::get_mut(&mut frame0).unwrap_or_else(|| {
            panic!("Unable to finish frame: frame data is being held by user code")
        });

        {
            let mut frame1 = self.frames[1].lock();
            let frame1: &mut DeviceFrame = Arc::get_mut(&mut frame1).unwrap();

            std::mem::swap(frame0, frame1);
        }
    }

    /// Records a one-time command buffer, submits it, and blocks until the
    /// GPU has finished executing it.
    pub fn with_setup_cb(
        &self,
        callback: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), BackendError> {
        let cb = self.setup_cb.lock();

        unsafe {
            self.raw.begin_command_buffer(
                cb.raw,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }

        callback(cb.raw);

        unsafe {
            self.raw.end_command_buffer(cb.raw)?;

            self.raw
                .reset_fences(std::slice::from_ref(&cb.submit_done_fence))?;

            let submit_info =
                vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cb.raw));

            self.raw.queue_submit(
                self.universal_queue.raw,
                &[submit_info.build()],
                cb.submit_done_fence,
            )?;
        }

        self.wait_for_fence(cb.submit_done_fence, "setup command buffer")
    }

    pub fn submit_commands(
        &self,
        cb: &CommandBuffer,
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal_semaphores: &[vk::Semaphore],
    ) -> Result<(), BackendError> {
        let wait: Vec<vk::Semaphore> = wait_semaphores.iter().map(|(sem, _)| *sem).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            wait_semaphores.iter().map(|(_, stage)| *stage).collect();

        unsafe {
            self.raw
                .reset_fences(std::slice::from_ref(&cb.submit_done_fence))?;

            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(std::slice::from_ref(&cb.raw))
                .wait_semaphores(&wait)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(signal_semaphores);

            self.raw.queue_submit(
                self.universal_queue.raw,
                &[submit_info.build()],
                cb.submit_done_fence,
            )?;
        }

        Ok(())
    }

    pub fn wait_idle(&self) -> Result<(), BackendError> {
        unsafe { Ok(self.raw.device_wait_idle()?) }
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        self.pdevice.as_ref()
    }

    pub fn debug_utils(&self) -> Option<&ext::DebugUtils> {
        self.instance.debug_utils.as_ref()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            trace!("device_wait_idle");
            let _ = self.raw.device_wait_idle();
        }
    }
}
