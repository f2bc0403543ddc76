use super::{
    buffer::{Buffer, BufferDesc},
    device::Device,
    sbt::align_up,
};
use crate::BackendError;
use ash::vk;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{collections::HashMap, sync::Arc};

/// Binding offsets within a descriptor set layout. Offsets are whatever the
/// implementation reports for the layout; they are never derived from
/// binding numbers or descriptor sizes on the host.
pub trait DescriptorLayoutOffsets {
    /// Total size of one set with this layout, aligned for placement in a
    /// descriptor buffer.
    fn layout_size(&self) -> u64;

    fn binding_offset(&self, binding: u32) -> Result<u64, BackendError>;
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

pub struct DescriptorSetLayout {
    pub raw: vk::DescriptorSetLayout,
    size: u64,
    offsets: HashMap<u32, u64>,
    device: Arc<Device>,
}

impl DescriptorLayoutOffsets for DescriptorSetLayout {
    fn layout_size(&self) -> u64 {
        self.size
    }

    fn binding_offset(&self, binding: u32) -> Result<u64, BackendError> {
        self.offsets
            .get(&binding)
            .copied()
            .ok_or_else(|| BackendError::ResourceAccess {
                info: format!("Descriptor set layout has no binding {}", binding),
            })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .raw
                .destroy_descriptor_set_layout(self.raw, None);
        }
    }
}

/// Writes device-reported descriptor blobs into a mapped descriptor buffer
/// slice. Rewriting an offset simply replaces the bytes there.
pub struct DescriptorWriter<'a> {
    data: &'a mut [u8],
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn write(&mut self, offset: u64, descriptor: &[u8]) -> Result<(), BackendError> {
        let start = offset as usize;
        let end = start + descriptor.len();

        if end > self.data.len() {
            return Err(BackendError::ResourceAccess {
                info: format!(
                    "Descriptor write of {} bytes at offset {} exceeds buffer size {}",
                    descriptor.len(),
                    offset,
                    self.data.len()
                ),
            });
        }

        self.data[start..end].copy_from_slice(descriptor);
        Ok(())
    }

    pub fn write_array(
        &mut self,
        binding_offset: u64,
        array_element: u32,
        descriptor: &[u8],
    ) -> Result<(), BackendError> {
        self.write(
            binding_offset + array_element as u64 * descriptor.len() as u64,
            descriptor,
        )
    }
}

/// A persistently mapped buffer holding descriptor sets for
/// `VK_EXT_descriptor_buffer`.
pub struct DescriptorBuffer {
    pub buffer: Buffer,
}

impl DescriptorBuffer {
    pub fn device_address(&self) -> u64 {
        self.buffer.device_address()
    }

    pub fn writer(&mut self) -> Result<DescriptorWriter<'_>, BackendError> {
        let data = self
            .buffer
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::ResourceAccess {
                info: "Descriptor buffer is not host mapped".to_owned(),
            })?;
        Ok(DescriptorWriter::new(data))
    }

    /// Binds this buffer for subsequent `set_offsets` calls.
    pub fn bind(&self, device: &Device, cb: vk::CommandBuffer) {
        let binding_info = vk::DescriptorBufferBindingInfoEXT::builder()
            .address(self.device_address())
            .usage(vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT)
            .build();

        unsafe {
            device
                .descriptor_buffer_ext
                .cmd_bind_descriptor_buffers(cb, std::slice::from_ref(&binding_info));
        }
    }

    pub fn set_offsets(
        &self,
        device: &Device,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        first_set: u32,
        offset: u64,
    ) {
        unsafe {
            device.descriptor_buffer_ext.cmd_set_descriptor_buffer_offsets(
                cb,
                bind_point,
                pipeline_layout,
                first_set,
                &[0],
                &[offset],
            );
        }
    }
}

impl Device {
    pub fn create_descriptor_set_layout(
        self: &Arc<Self>,
        bindings: &[DescriptorBindingDesc],
    ) -> Result<DescriptorSetLayout, BackendError> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|desc| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(desc.binding)
                    .descriptor_type(desc.ty)
                    .descriptor_count(desc.count)
                    .stage_flags(desc.stages)
                    .build()
            })
            .collect();

        let raw = unsafe {
            self.raw.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
                    .bindings(&vk_bindings),
                None,
            )?
        };

        let size = unsafe {
            self.descriptor_buffer_ext
                .get_descriptor_set_layout_size(raw)
        };
        let size = align_up(size, self.descriptor_buffer_properties.offset_alignment);

        let offsets = bindings
            .iter()
            .map(|desc| {
                let offset = unsafe {
                    self.descriptor_buffer_ext
                        .get_descriptor_set_layout_binding_offset(raw, desc.binding)
                };
                (desc.binding, offset)
            })
            .collect();

        Ok(DescriptorSetLayout {
            raw,
            size,
            offsets,
            device: self.clone(),
        })
    }

    pub fn create_descriptor_buffer(
        self: &Arc<Self>,
        name: impl Into<String>,
        size: u64,
    ) -> Result<DescriptorBuffer, BackendError> {
        let buffer = self.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                size as usize,
                vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )
            .alignment(self.descriptor_buffer_properties.offset_alignment),
            name,
            None,
        )?;

        Ok(DescriptorBuffer { buffer })
    }

    pub fn uniform_buffer_descriptor(&self, address: u64, range: u64) -> Vec<u8> {
        let address_info = vk::DescriptorAddressInfoEXT::builder()
            .address(address)
            .range(range)
            .build();

        self.get_descriptor(
            &vk::DescriptorGetInfoEXT::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .data(vk::DescriptorDataEXT {
                    p_uniform_buffer: &address_info,
                })
                .build(),
            self.descriptor_buffer_properties.uniform_buffer_size,
        )
    }

    pub fn storage_buffer_descriptor(&self, address: u64, range: u64) -> Vec<u8> {
        let address_info = vk::DescriptorAddressInfoEXT::builder()
            .address(address)
            .range(range)
            .build();

        self.get_descriptor(
            &vk::DescriptorGetInfoEXT::builder()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .data(vk::DescriptorDataEXT {
                    p_storage_buffer: &address_info,
                })
                .build(),
            self.descriptor_buffer_properties.storage_buffer_size,
        )
    }

    pub fn storage_image_descriptor(&self, view: vk::ImageView) -> Vec<u8> {
        let image_info = vk::DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL)
            .build();

        self.get_descriptor(
            &vk::DescriptorGetInfoEXT::builder()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .data(vk::DescriptorDataEXT {
                    p_storage_image: &image_info,
                })
                .build(),
            self.descriptor_buffer_properties.storage_image_size,
        )
    }

    pub fn acceleration_structure_descriptor(&self, address: u64) -> Vec<u8> {
        self.get_descriptor(
            &vk::DescriptorGetInfoEXT::builder()
                .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .data(vk::DescriptorDataEXT {
                    acceleration_structure: address,
                })
                .build(),
            self.descriptor_buffer_properties.acceleration_structure_size,
        )
    }

    fn get_descriptor(&self, info: &vk::DescriptorGetInfoEXT, size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        unsafe {
            self.descriptor_buffer_ext.get_descriptor(info, &mut data);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapLayoutOffsets {
        size: u64,
        offsets: HashMap<u32, u64>,
    }

    impl DescriptorLayoutOffsets for MapLayoutOffsets {
        fn layout_size(&self) -> u64 {
            self.size
        }

        fn binding_offset(&self, binding: u32) -> Result<u64, BackendError> {
            self.offsets
                .get(&binding)
                .copied()
                .ok_or_else(|| BackendError::ResourceAccess {
                    info: format!("no binding {}", binding),
                })
        }
    }

    // Implementations may lay bindings out in any order; consumers must go
    // through the queried offsets rather than assume binding order.
    fn scrambled_layout() -> MapLayoutOffsets {
        MapLayoutOffsets {
            size: 256,
            offsets: [(0u32, 64u64), (1, 0), (2, 192)].into_iter().collect(),
        }
    }

    #[test]
    fn offsets_come_from_the_layout_not_binding_numbers() {
        let layout = scrambled_layout();

        assert_eq!(layout.binding_offset(0).unwrap(), 64);
        assert_eq!(layout.binding_offset(1).unwrap(), 0);
        assert_eq!(layout.binding_offset(2).unwrap(), 192);
        assert!(layout.binding_offset(3).is_err());
    }

    #[test]
    fn writes_land_at_the_given_offsets() {
        let layout = scrambled_layout();
        let mut storage = vec![0u8; layout.layout_size() as usize];
        let mut writer = DescriptorWriter::new(&mut storage);

        let descriptor = [0xaa; 16];
        writer
            .write(layout.binding_offset(2).unwrap(), &descriptor)
            .unwrap();

        assert!(storage[192..208].iter().all(|&b| b == 0xaa));
        assert!(storage[..192].iter().all(|&b| b == 0));
        assert!(storage[208..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rewriting_a_slot_replaces_the_previous_descriptor() {
        let mut storage = vec![0u8; 64];
        let mut writer = DescriptorWriter::new(&mut storage);

        writer.write(16, &[0x11; 16]).unwrap();
        writer.write(16, &[0x22; 16]).unwrap();

        assert!(storage[16..32].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn array_elements_are_spaced_by_descriptor_size() {
        let mut storage = vec![0u8; 128];
        let mut writer = DescriptorWriter::new(&mut storage);

        writer.write_array(32, 0, &[0x01; 16]).unwrap();
        writer.write_array(32, 2, &[0x03; 16]).unwrap();

        assert!(storage[32..48].iter().all(|&b| b == 0x01));
        assert!(storage[48..64].iter().all(|&b| b == 0));
        assert!(storage[64..80].iter().all(|&b| b == 0x03));
    }

    #[test]
    fn out_of_bounds_writes_are_rejected() {
        let mut storage = vec![0u8; 32];
        let mut writer = DescriptorWriter::new(&mut storage);

        assert!(writer.write(24, &[0u8; 16]).is_err());
        // The buffer must be untouched after a rejected write.
        assert!(storage.iter().all(|&b| b == 0));
    }
}
