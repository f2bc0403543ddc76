use super::{
    buffer::{Buffer, BufferDesc},
    device::{Device, RayTracingProperties},
};
use crate::BackendError;
use ash::vk;
use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    assert!(
        alignment.is_power_of_two(),
        "alignment {} is not a power of two",
        alignment
    );
    (value + alignment - 1) & !(alignment - 1)
}

/// Stride of one shader table record: the group handle rounded up to the
/// handle alignment, plus optional inline data, rounded up again. All
/// records of a table share this stride.
pub fn record_stride(props: &RayTracingProperties, inline_data_size: usize) -> u64 {
    let handle_alignment = props.shader_group_handle_alignment as u64;
    let aligned_handle = align_up(props.shader_group_handle_size as u64, handle_alignment);
    let stride = align_up(aligned_handle + inline_data_size as u64, handle_alignment);

    assert_eq!(stride % handle_alignment, 0);
    stride
}

/// Opaque group handles, fetched in one bulk query in pipeline group order.
pub struct ShaderGroupHandles {
    data: Bytes,
    handle_size: usize,
}

impl ShaderGroupHandles {
    pub fn new(data: Bytes, handle_size: usize) -> Self {
        debug_assert_eq!(data.len() % handle_size, 0);
        Self { data, handle_size }
    }

    pub fn group_count(&self) -> usize {
        self.data.len() / self.handle_size
    }

    pub fn handle(&self, group_index: usize) -> Result<&[u8], BackendError> {
        if group_index >= self.group_count() {
            return Err(BackendError::ResourceAccess {
                info: format!(
                    "Shader group index {} out of range ({} groups)",
                    group_index,
                    self.group_count()
                ),
            });
        }

        Ok(&self.data[group_index * self.handle_size..(group_index + 1) * self.handle_size])
    }
}

/// One record of a shader table: which group handle to place there, and the
/// bytes of inline data appended after the handle (shader record data).
#[derive(Clone, Copy)]
pub struct SbtRecord<'a> {
    pub group_index: usize,
    pub inline_data: &'a [u8],
}

impl<'a> SbtRecord<'a> {
    pub fn new(group_index: usize) -> Self {
        Self {
            group_index,
            inline_data: &[],
        }
    }

    pub fn with_inline_data(group_index: usize, inline_data: &'a [u8]) -> Self {
        Self {
            group_index,
            inline_data,
        }
    }
}

/// Packs one table into host bytes. Returns the byte blob and the uniform
/// record stride. Records must all carry the same amount of inline data.
pub fn pack_table(
    props: &RayTracingProperties,
    handles: &ShaderGroupHandles,
    records: &[SbtRecord],
) -> Result<(Vec<u8>, u64), BackendError> {
    let inline_data_size = records.first().map(|r| r.inline_data.len()).unwrap_or(0);

    if records
        .iter()
        .any(|record| record.inline_data.len() != inline_data_size)
    {
        return Err(BackendError::ResourceAccess {
            info: "Shader table records carry differing amounts of inline data".to_owned(),
        });
    }

    let stride = record_stride(props, inline_data_size);
    let handle_size = props.shader_group_handle_size as usize;

    let mut data = vec![0u8; stride as usize * records.len()];
    for (record_index, record) in records.iter().enumerate() {
        let base = record_index * stride as usize;
        data[base..base + handle_size].copy_from_slice(handles.handle(record.group_index)?);
        data[base + handle_size..base + handle_size + record.inline_data.len()]
            .copy_from_slice(record.inline_data);
    }

    Ok((data, stride))
}

pub struct ShaderBindingTableDesc<'a> {
    pub raygen_records: Vec<SbtRecord<'a>>,
    pub miss_records: Vec<SbtRecord<'a>>,
    pub hit_records: Vec<SbtRecord<'a>>,
}

pub struct ShaderBindingTable {
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,

    // The regions point into these.
    #[allow(dead_code)]
    raygen_buffer: Option<Buffer>,
    #[allow(dead_code)]
    miss_buffer: Option<Buffer>,
    #[allow(dead_code)]
    hit_buffer: Option<Buffer>,
}

impl Device {
    /// Fetches all group handles of a ray tracing pipeline in one call, in
    /// group creation order.
    pub fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
    ) -> Result<ShaderGroupHandles, BackendError> {
        let handle_size = self.ray_tracing_properties.shader_group_handle_size as usize;

        let data = unsafe {
            self.ray_tracing_pipeline_ext
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    group_count,
                    handle_size * group_count as usize,
                )?
        };

        Ok(ShaderGroupHandles::new(Bytes::from(data), handle_size))
    }

    pub fn create_ray_tracing_shader_table(
        self: &Arc<Self>,
        pipeline: vk::Pipeline,
        group_count: u32,
        desc: &ShaderBindingTableDesc<'_>,
    ) -> Result<ShaderBindingTable, BackendError> {
        let props = self.ray_tracing_properties;
        let handles = self.ray_tracing_shader_group_handles(pipeline, group_count)?;

        let upload_table = |records: &[SbtRecord],
                                name: &str|
         -> Result<(Option<Buffer>, u64, u64), BackendError> {
            if records.is_empty() {
                return Ok((None, 0, 0));
            }

            let (data, stride) = pack_table(&props, &handles, records)?;

            let buffer = self.create_buffer(
                BufferDesc::new_gpu_only(
                    data.len(),
                    vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )
                .alignment(props.shader_group_base_alignment as u64),
                name,
                Some(&data),
            )?;

            debug!(
                "Shader table {}: {} records, stride {}",
                name,
                records.len(),
                stride
            );

            Ok((Some(buffer), stride, data.len() as u64))
        };

        let (raygen_buffer, raygen_stride, raygen_size) =
            upload_table(&desc.raygen_records, "sbt raygen")?;
        let (miss_buffer, miss_stride, miss_size) = upload_table(&desc.miss_records, "sbt miss")?;
        let (hit_buffer, hit_stride, hit_size) = upload_table(&desc.hit_records, "sbt hit")?;

        let region = |buffer: &Option<Buffer>, stride: u64, size: u64| {
            buffer
                .as_ref()
                .map(|buffer| vk::StridedDeviceAddressRegionKHR {
                    device_address: buffer.device_address(),
                    stride,
                    size,
                })
                .unwrap_or_default()
        };

        // The raygen region is special-cased by the API: its size must equal
        // its stride, and exactly one record is read from it per trace.
        let mut raygen_region = region(&raygen_buffer, raygen_stride, raygen_size);
        raygen_region.size = raygen_region.stride;

        Ok(ShaderBindingTable {
            raygen_region,
            miss_region: region(&miss_buffer, miss_stride, miss_size),
            hit_region: region(&hit_buffer, hit_stride, hit_size),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
            raygen_buffer,
            miss_buffer,
            hit_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop_props() -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
        }
    }

    fn test_handles(group_count: usize, handle_size: usize) -> ShaderGroupHandles {
        let data: Vec<u8> = (0..group_count)
            .flat_map(|group| std::iter::repeat(group as u8 + 1).take(handle_size))
            .collect();
        ShaderGroupHandles::new(Bytes::from(data), handle_size)
    }

    #[test]
    fn stride_without_inline_data_is_the_aligned_handle() {
        assert_eq!(record_stride(&desktop_props(), 0), 32);
    }

    #[test]
    fn stride_with_eight_byte_address_payload() {
        assert_eq!(record_stride(&desktop_props(), 8), 64);
    }

    #[test]
    fn stride_is_always_a_multiple_of_the_handle_alignment() {
        let props = desktop_props();
        for inline in [0usize, 1, 5, 8, 16, 31, 32, 33, 64, 100] {
            let stride = record_stride(&props, inline);
            assert_eq!(stride % props.shader_group_handle_alignment as u64, 0);
            assert!(stride >= props.shader_group_handle_size as u64 + inline as u64);
        }
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn non_power_of_two_alignment_panics() {
        align_up(128, 24);
    }

    #[test]
    fn stride_with_larger_handle_alignment() {
        let props = RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 64,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
        };

        assert_eq!(record_stride(&props, 0), 64);
        assert_eq!(record_stride(&props, 8), 128);
    }

    #[test]
    fn packed_records_place_handles_at_stride_offsets() {
        let props = desktop_props();
        let handles = test_handles(3, 32);

        let payload_a = 0x1111_2222_3333_4444u64.to_le_bytes();
        let payload_b = 0x5555_6666_7777_8888u64.to_le_bytes();
        let records = [
            SbtRecord::with_inline_data(1, &payload_a),
            SbtRecord::with_inline_data(2, &payload_b),
        ];

        let (data, stride) = pack_table(&props, &handles, &records).unwrap();
        assert_eq!(stride, 64);
        assert_eq!(data.len(), 128);

        assert!(data[0..32].iter().all(|&b| b == 2));
        assert_eq!(&data[32..40], &payload_a);
        assert!(data[40..64].iter().all(|&b| b == 0));

        assert!(data[64..96].iter().all(|&b| b == 3));
        assert_eq!(&data[96..104], &payload_b);
    }

    #[test]
    fn mixed_inline_data_sizes_are_rejected() {
        let props = desktop_props();
        let handles = test_handles(2, 32);

        let payload = [0u8; 8];
        let records = [
            SbtRecord::new(0),
            SbtRecord::with_inline_data(1, &payload),
        ];

        assert!(pack_table(&props, &handles, &records).is_err());
    }

    #[test]
    fn out_of_range_group_index_is_rejected() {
        let props = desktop_props();
        let handles = test_handles(2, 32);

        let records = [SbtRecord::new(2)];
        assert!(pack_table(&props, &handles, &records).is_err());
    }
}
