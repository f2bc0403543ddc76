use crate::BackendError;

use super::device::Device;
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use std::sync::Arc;

pub struct Buffer {
    pub raw: vk::Buffer,
    pub desc: BufferDesc,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) device: Arc<Device>,
}

impl Buffer {
    pub fn device_address(&self) -> u64 {
        unsafe {
            self.device.raw.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::builder().buffer(self.raw),
            )
        }
    }

    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|alloc| alloc.mapped_slice())
    }

    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(|alloc| alloc.mapped_slice_mut())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_buffer(self.raw, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.global_allocator.lock().free(allocation);
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct BufferDesc {
    pub size: usize,
    pub usage: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
    pub alignment: Option<u64>,
}

impl BufferDesc {
    pub fn new_gpu_only(size: usize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_location: MemoryLocation::GpuOnly,
            alignment: None,
        }
    }

    pub fn new_cpu_to_gpu(size: usize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_location: MemoryLocation::CpuToGpu,
            alignment: None,
        }
    }

    pub fn new_gpu_to_cpu(size: usize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_location: MemoryLocation::GpuToCpu,
            alignment: None,
        }
    }

    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

impl Device {
    pub(crate) fn create_buffer_impl(
        self: &Arc<Self>,
        desc: BufferDesc,
        name: &str,
    ) -> Result<Buffer, BackendError> {
        let buffer_info = vk::BufferCreateInfo {
            size: desc.size as u64,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };

        let buffer = unsafe { self.raw.create_buffer(&buffer_info, None)? };
        let mut requirements = unsafe { self.raw.get_buffer_memory_requirements(buffer) };

        if let Some(alignment) = desc.alignment {
            requirements.alignment = requirements.alignment.max(alignment);
        }

        // TODO: why does `get_buffer_memory_requirements` fail to get the correct alignment on AMD?
        if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR)
        {
            requirements.alignment = requirements
                .alignment
                .max(self.ray_tracing_properties.shader_group_base_alignment as u64);
        }

        let allocation = self
            .global_allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: desc.memory_location,
                linear: true, // Buffers are always linear
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| BackendError::Allocation {
                inner: err,
                name: name.to_owned(),
            })?;

        // Bind memory to the buffer
        unsafe {
            self.raw
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?
        };

        Ok(Buffer {
            raw: buffer,
            desc,
            allocation: Some(allocation),
            device: self.clone(),
        })
    }

    pub fn create_buffer(
        self: &Arc<Self>,
        mut desc: BufferDesc,
        name: impl Into<String>,
        initial_data: Option<&[u8]>,
    ) -> Result<Buffer, BackendError> {
        let name = name.into();

        if initial_data.is_some() {
            desc.usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        let buffer = self.create_buffer_impl(desc, &name)?;

        if let Some(initial_data) = initial_data {
            let scratch_desc =
                BufferDesc::new_cpu_to_gpu(desc.size, vk::BufferUsageFlags::TRANSFER_SRC);

            let mut scratch_buffer =
                self.create_buffer_impl(scratch_desc, &format!("Initial data for {:?}", name))?;

            scratch_buffer
                .mapped_slice_mut()
                .ok_or_else(|| BackendError::ResourceAccess {
                    info: format!("Staging buffer for {:?} is not mapped", name),
                })?[0..initial_data.len()]
                .copy_from_slice(initial_data);

            self.with_setup_cb(|cb| unsafe {
                self.raw.cmd_copy_buffer(
                    cb,
                    scratch_buffer.raw,
                    buffer.raw,
                    &[vk::BufferCopy::builder()
                        .dst_offset(0)
                        .src_offset(0)
                        .size(desc.size as u64)
                        .build()],
                );
            })?;
        }

        Ok(buffer)
    }
}
