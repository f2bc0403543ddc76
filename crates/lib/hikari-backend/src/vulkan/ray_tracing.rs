use super::{
    barrier,
    buffer::{Buffer, BufferDesc},
    device::Device,
};
use crate::BackendError;
use ash::vk;
use glam::Affine3A;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{cell::Cell, sync::Arc};

#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometryDesc {
    pub vertex_buffer_address: u64,
    pub vertex_format: vk::Format,
    pub vertex_stride: usize,
    pub max_vertex: u32,
    pub index_buffer_address: u64,
    pub index_type: vk::IndexType,
    pub triangle_count: u32,
    pub opaque: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct AabbGeometryDesc {
    pub buffer_address: u64,
    pub stride: usize,
    pub aabb_count: u32,
    pub opaque: bool,
}

/// One geometry record of an acceleration structure build. A single buffer
/// feeds either triangles or AABBs, never both; the enum makes the mix-up
/// unrepresentable.
#[derive(Clone, Copy, Debug)]
pub enum AccelGeometry {
    Triangles(TriangleGeometryDesc),
    Aabbs(AabbGeometryDesc),
    Instances {
        buffer_address: u64,
        instance_count: u32,
    },
}

impl AccelGeometry {
    fn primitive_count(&self) -> u32 {
        match self {
            AccelGeometry::Triangles(desc) => desc.triangle_count,
            AccelGeometry::Aabbs(desc) => desc.aabb_count,
            AccelGeometry::Instances { instance_count, .. } => *instance_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelKind {
    BottomLevel,
    TopLevel,
}

impl AccelKind {
    fn to_vk(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            AccelKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AccelBuildOptions {
    pub allow_compaction: bool,
}

#[derive(Clone, Debug)]
pub struct AccelBuildDesc {
    pub kind: AccelKind,
    pub geometries: Vec<AccelGeometry>,
    pub options: AccelBuildOptions,
    pub name: String,
}

impl AccelBuildDesc {
    fn validate(&self) -> Result<(), BackendError> {
        if self.geometries.is_empty() {
            return Err(BackendError::ResourceAccess {
                info: format!("Acceleration structure {:?} has no geometry", self.name),
            });
        }

        let uniform_kind = match self.kind {
            AccelKind::BottomLevel => {
                self.geometries
                    .iter()
                    .all(|geo| matches!(geo, AccelGeometry::Triangles(..)))
                    || self
                        .geometries
                        .iter()
                        .all(|geo| matches!(geo, AccelGeometry::Aabbs(..)))
            }
            AccelKind::TopLevel => self
                .geometries
                .iter()
                .all(|geo| matches!(geo, AccelGeometry::Instances { .. })),
        };

        if !uniform_kind {
            return Err(BackendError::ResourceAccess {
                info: format!(
                    "Acceleration structure {:?} mixes geometry kinds: {:?}",
                    self.name, self.geometries
                ),
            });
        }

        Ok(())
    }

    fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        if self.options.allow_compaction {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }
        flags
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelBuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
}

/// The device-facing half of the acceleration structure build protocol.
///
/// The driver in [`build_acceleration`] owns the sequencing: size query,
/// storage allocation, build, then optional compaction. Implementations only
/// perform the individual steps, which keeps the protocol itself testable
/// without a GPU.
pub trait AccelBuildBackend {
    type Accel;

    fn query_build_sizes(&mut self, desc: &AccelBuildDesc) -> Result<AccelBuildSizes, BackendError>;

    fn create_acceleration(
        &mut self,
        desc: &AccelBuildDesc,
        size: u64,
    ) -> Result<Self::Accel, BackendError>;

    /// Records and submits the build, then blocks until it completes.
    fn build(
        &mut self,
        desc: &AccelBuildDesc,
        accel: &Self::Accel,
        scratch_size: u64,
    ) -> Result<(), BackendError>;

    fn query_compacted_size(&mut self, accel: &Self::Accel) -> Result<u64, BackendError>;

    /// Copies `accel` into a freshly allocated structure of `compacted_size`
    /// bytes, consuming the original.
    fn compact(
        &mut self,
        desc: &AccelBuildDesc,
        accel: Self::Accel,
        compacted_size: u64,
    ) -> Result<Self::Accel, BackendError>;
}

/// Runs the full two-phase build: query sizes, allocate, build, and - when
/// requested and profitable - compact. Zero-size query results are rejected
/// before any allocation happens.
pub fn build_acceleration<B: AccelBuildBackend>(
    backend: &mut B,
    desc: &AccelBuildDesc,
) -> Result<B::Accel, BackendError> {
    desc.validate()?;

    let sizes = backend.query_build_sizes(desc)?;
    if sizes.acceleration_structure_size == 0 || sizes.build_scratch_size == 0 {
        return Err(BackendError::SizeQuery {
            name: desc.name.clone(),
        });
    }

    trace!(
        "Acceleration structure {:?} build sizes: {:?}",
        desc.name,
        sizes
    );

    let accel = backend.create_acceleration(desc, sizes.acceleration_structure_size)?;
    backend.build(desc, &accel, sizes.build_scratch_size)?;

    if desc.options.allow_compaction {
        let compacted_size = backend.query_compacted_size(&accel)?;

        // Copying into an equal or larger structure would only waste memory
        // and a GPU round-trip.
        if compacted_size > 0 && compacted_size < sizes.acceleration_structure_size {
            info!(
                "Compacting {:?}: {} -> {} bytes",
                desc.name, sizes.acceleration_structure_size, compacted_size
            );
            return backend.compact(desc, accel, compacted_size);
        }

        debug!(
            "Skipping compaction of {:?}: {} -> {} bytes",
            desc.name, sizes.acceleration_structure_size, compacted_size
        );
    }

    Ok(accel)
}

pub struct RayTracingAcceleration {
    pub raw: vk::AccelerationStructureKHR,
    device_address: u64,
    built: Cell<bool>,
    backing_buffer: Buffer,
    device: Arc<Device>,
}

impl RayTracingAcceleration {
    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn is_built(&self) -> bool {
        self.built.get()
    }
}

impl Drop for RayTracingAcceleration {
    fn drop(&mut self) {
        unsafe {
            self.device
                .acceleration_structure_ext
                .destroy_acceleration_structure(self.raw, None);
        }
        // `backing_buffer` frees itself afterwards.
    }
}

/// The subset of a bottom-level structure that instance packing needs.
/// Factored into a trait so the TLAS input validation can run in tests
/// against stand-in structures.
pub trait TlasBuildInput {
    fn is_built(&self) -> bool;
    fn device_address(&self) -> u64;
}

impl TlasBuildInput for RayTracingAcceleration {
    fn is_built(&self) -> bool {
        self.built.get()
    }

    fn device_address(&self) -> u64 {
        self.device_address
    }
}

#[derive(Clone)]
pub struct TlasInstance<B> {
    pub blas: Arc<B>,
    pub transformation: Affine3A,
    /// Lower 24 bits; surfaced to shaders as `gl_InstanceCustomIndexEXT`.
    pub custom_index: u32,
    pub mask: u8,
    /// Lower 24 bits; selects the hit-group record in the shader table.
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

/// Hardware layout of `VkAccelerationStructureInstanceKHR`.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GpuInstance {
    transform: [f32; 12],
    instance_id_and_mask: u32,
    instance_sbt_offset_and_flags: u32,
    blas_address: vk::DeviceAddress,
}

impl GpuInstance {
    pub fn new(
        transform: [f32; 12],
        id: u32,
        mask: u8,
        sbt_offset: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        blas_address: vk::DeviceAddress,
    ) -> Self {
        let mut ret = Self {
            transform,
            instance_id_and_mask: 0,
            instance_sbt_offset_and_flags: 0,
            blas_address,
        };
        ret.set_id(id);
        ret.set_mask(mask);
        ret.set_sbt_offset(sbt_offset);
        ret.set_flags(flags);
        ret
    }

    fn set_id(&mut self, id: u32) {
        let id = id & 0x00ff_ffff;
        self.instance_id_and_mask |= id;
    }

    fn set_mask(&mut self, mask: u8) {
        let mask = mask as u32;
        self.instance_id_and_mask |= mask << 24;
    }

    fn set_sbt_offset(&mut self, offset: u32) {
        let offset = offset & 0x00ff_ffff;
        self.instance_sbt_offset_and_flags |= offset;
    }

    fn set_flags(&mut self, flags: vk::GeometryInstanceFlagsKHR) {
        self.instance_sbt_offset_and_flags |= (flags.as_raw() as u32) << 24;
    }
}

fn instance_transform(transformation: &Affine3A) -> [f32; 12] {
    let t = transformation;
    // Row-major 3x4 as `VkTransformMatrixKHR` expects it.
    [
        t.x_axis.x,
        t.y_axis.x,
        t.z_axis.x,
        t.translation.x,
        t.x_axis.y,
        t.y_axis.y,
        t.z_axis.y,
        t.translation.y,
        t.x_axis.z,
        t.y_axis.z,
        t.z_axis.z,
        t.translation.z,
    ]
}

/// Packs instance descriptors into the hardware layout. Fails if any
/// referenced bottom-level structure has not finished building, or if a
/// 24-bit field would overflow.
pub fn pack_tlas_instances<B: TlasBuildInput>(
    instances: &[TlasInstance<B>],
) -> Result<Vec<GpuInstance>, BackendError> {
    instances
        .iter()
        .enumerate()
        .map(|(idx, instance)| {
            if !instance.blas.is_built() {
                return Err(BackendError::ResourceAccess {
                    info: format!(
                        "TLAS instance {} references a bottom-level structure that has not been built",
                        idx
                    ),
                });
            }
            if instance.custom_index >= (1 << 24) {
                return Err(BackendError::ResourceAccess {
                    info: format!(
                        "TLAS instance {}: custom index {} exceeds 24 bits",
                        idx, instance.custom_index
                    ),
                });
            }
            if instance.sbt_record_offset >= (1 << 24) {
                return Err(BackendError::ResourceAccess {
                    info: format!(
                        "TLAS instance {}: SBT record offset {} exceeds 24 bits",
                        idx, instance.sbt_record_offset
                    ),
                });
            }

            Ok(GpuInstance::new(
                instance_transform(&instance.transformation),
                instance.custom_index,
                instance.mask,
                instance.sbt_record_offset,
                instance.flags,
                instance.blas.device_address(),
            ))
        })
        .collect()
}

fn to_vk_geometry(geo: &AccelGeometry) -> vk::AccelerationStructureGeometryKHR {
    match geo {
        AccelGeometry::Triangles(desc) => vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: desc.vertex_buffer_address,
                    })
                    .vertex_stride(desc.vertex_stride as u64)
                    .max_vertex(desc.max_vertex)
                    .vertex_format(desc.vertex_format)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: desc.index_buffer_address,
                    })
                    .index_type(desc.index_type)
                    .build(),
            })
            .flags(if desc.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            })
            .build(),
        AccelGeometry::Aabbs(desc) => vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::builder()
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: desc.buffer_address,
                    })
                    .stride(desc.stride as u64)
                    .build(),
            })
            .flags(if desc.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            })
            .build(),
        AccelGeometry::Instances { buffer_address, .. } => {
            vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: *buffer_address,
                        })
                        .build(),
                })
                .build()
        }
    }
}

/// Vulkan implementation of the build protocol.
pub(crate) struct DeviceAccelBackend {
    device: Arc<Device>,
}

impl DeviceAccelBackend {
    fn geometries_and_counts(
        desc: &AccelBuildDesc,
    ) -> (Vec<vk::AccelerationStructureGeometryKHR>, Vec<u32>) {
        let geometries = desc.geometries.iter().map(to_vk_geometry).collect();
        let counts = desc
            .geometries
            .iter()
            .map(AccelGeometry::primitive_count)
            .collect();
        (geometries, counts)
    }
}

impl AccelBuildBackend for DeviceAccelBackend {
    type Accel = RayTracingAcceleration;

    fn query_build_sizes(&mut self, desc: &AccelBuildDesc) -> Result<AccelBuildSizes, BackendError> {
        let (geometries, counts) = Self::geometries_and_counts(desc);

        let geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(desc.kind.to_vk())
            .flags(desc.build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        let sizes = unsafe {
            self.device
                .acceleration_structure_ext
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &geometry_info,
                    &counts,
                )
        };

        Ok(AccelBuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
        })
    }

    fn create_acceleration(
        &mut self,
        desc: &AccelBuildDesc,
        size: u64,
    ) -> Result<RayTracingAcceleration, BackendError> {
        let backing_buffer = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                size as usize,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            &desc.name,
            None,
        )?;

        let raw = unsafe {
            self.device
                .acceleration_structure_ext
                .create_acceleration_structure(
                    &vk::AccelerationStructureCreateInfoKHR::builder()
                        .ty(desc.kind.to_vk())
                        .buffer(backing_buffer.raw)
                        .size(size),
                    None,
                )?
        };

        let device_address = unsafe {
            self.device
                .acceleration_structure_ext
                .get_acceleration_structure_device_address(
                    &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                        .acceleration_structure(raw),
                )
        };

        Ok(RayTracingAcceleration {
            raw,
            device_address,
            built: Cell::new(false),
            backing_buffer,
            device: self.device.clone(),
        })
    }

    fn build(
        &mut self,
        desc: &AccelBuildDesc,
        accel: &RayTracingAcceleration,
        scratch_size: u64,
    ) -> Result<(), BackendError> {
        let scratch_buffer = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                scratch_size as usize,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )
            .alignment(
                self.device
                    .acceleration_structure_properties
                    .min_scratch_alignment as u64,
            ),
            format!("{} scratch", desc.name),
            None,
        )?;

        let (geometries, counts) = Self::geometries_and_counts(desc);

        let geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(desc.kind.to_vk())
            .flags(desc.build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(accel.raw)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_buffer.device_address(),
            })
            .geometries(&geometries)
            .build();

        let range_infos: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = counts
            .iter()
            .map(|&count| {
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(count)
                    .build()
            })
            .collect();

        self.device
            .with_setup_cb(|cb| unsafe {
                self.device
                    .acceleration_structure_ext
                    .cmd_build_acceleration_structures(
                        cb,
                        std::slice::from_ref(&geometry_info),
                        &[&range_infos],
                    );

                barrier::acceleration_structure_build_barrier(&self.device.raw, cb);
            })
            .map_err(|err| match err {
                BackendError::Vulkan { err, .. } => BackendError::BuildSubmission { err },
                other => other,
            })?;

        accel.built.set(true);
        Ok(())
    }

    fn query_compacted_size(
        &mut self,
        accel: &RayTracingAcceleration,
    ) -> Result<u64, BackendError> {
        let query_pool = unsafe {
            self.device.raw.create_query_pool(
                &vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
                    .query_count(1),
                None,
            )?
        };

        let result = self.device.with_setup_cb(|cb| unsafe {
            self.device.raw.cmd_reset_query_pool(cb, query_pool, 0, 1);
            self.device
                .acceleration_structure_ext
                .cmd_write_acceleration_structures_properties(
                    cb,
                    std::slice::from_ref(&accel.raw),
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_pool,
                    0,
                );
        });

        let compacted_size = result.and_then(|()| {
            // 64-bit readback; the size must not be truncated on its way
            // through the host.
            let mut sizes = [0u64; 1];
            unsafe {
                self.device.raw.get_query_pool_results(
                    query_pool,
                    0,
                    1,
                    &mut sizes,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )?;
            }
            Ok(sizes[0])
        });

        unsafe {
            self.device.raw.destroy_query_pool(query_pool, None);
        }

        compacted_size
    }

    fn compact(
        &mut self,
        desc: &AccelBuildDesc,
        accel: RayTracingAcceleration,
        compacted_size: u64,
    ) -> Result<RayTracingAcceleration, BackendError> {
        let compacted = self.create_acceleration(desc, compacted_size)?;

        self.device.with_setup_cb(|cb| unsafe {
            self.device
                .acceleration_structure_ext
                .cmd_copy_acceleration_structure(
                    cb,
                    &vk::CopyAccelerationStructureInfoKHR::builder()
                        .src(accel.raw)
                        .dst(compacted.raw)
                        .mode(vk::CopyAccelerationStructureModeKHR::COMPACT),
                );

            barrier::acceleration_structure_build_barrier(&self.device.raw, cb);
        })?;

        compacted.built.set(true);

        // The original structure is no longer referenced; RAII reclaims it.
        drop(accel);

        Ok(compacted)
    }
}

impl Device {
    pub fn create_bottom_level_acceleration(
        self: &Arc<Self>,
        name: impl Into<String>,
        geometries: Vec<AccelGeometry>,
        options: AccelBuildOptions,
    ) -> Result<RayTracingAcceleration, BackendError> {
        let desc = AccelBuildDesc {
            kind: AccelKind::BottomLevel,
            geometries,
            options,
            name: name.into(),
        };

        let mut backend = DeviceAccelBackend {
            device: self.clone(),
        };
        build_acceleration(&mut backend, &desc)
    }

    /// Builds a top-level structure over already-built bottom-level
    /// structures. The packed instance buffer only needs to live for the
    /// duration of the build, which completes before this returns.
    pub fn create_top_level_acceleration(
        self: &Arc<Self>,
        name: impl Into<String>,
        instances: &[TlasInstance<RayTracingAcceleration>],
        options: AccelBuildOptions,
    ) -> Result<RayTracingAcceleration, BackendError> {
        let name = name.into();
        let packed = pack_tlas_instances(instances)?;

        let instance_buffer_size = std::mem::size_of::<GpuInstance>() * packed.len().max(1);
        let instance_buffer = self.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                instance_buffer_size,
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            ),
            format!("{} instances", name),
            Some(crate::bytes::as_byte_slice(&packed)),
        )?;

        let desc = AccelBuildDesc {
            kind: AccelKind::TopLevel,
            geometries: vec![AccelGeometry::Instances {
                buffer_address: instance_buffer.device_address(),
                instance_count: packed.len() as u32,
            }],
            options,
            name,
        };

        let mut backend = DeviceAccelBackend {
            device: self.clone(),
        };
        build_acceleration(&mut backend, &desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockAccel {
        size: u64,
        built: bool,
        address: u64,
    }

    impl TlasBuildInput for MockAccel {
        fn is_built(&self) -> bool {
            self.built
        }

        fn device_address(&self) -> u64 {
            self.address
        }
    }

    struct MockBackend {
        sizes: AccelBuildSizes,
        compacted_size: u64,
        ops: Vec<String>,
        next_address: u64,
    }

    impl MockBackend {
        fn new(accel_size: u64, scratch_size: u64, compacted_size: u64) -> Self {
            Self {
                sizes: AccelBuildSizes {
                    acceleration_structure_size: accel_size,
                    build_scratch_size: scratch_size,
                },
                compacted_size,
                ops: Vec::new(),
                next_address: 0x1000,
            }
        }
    }

    impl AccelBuildBackend for MockBackend {
        type Accel = MockAccel;

        fn query_build_sizes(
            &mut self,
            _desc: &AccelBuildDesc,
        ) -> Result<AccelBuildSizes, BackendError> {
            self.ops.push("query_sizes".to_owned());
            Ok(self.sizes)
        }

        fn create_acceleration(
            &mut self,
            _desc: &AccelBuildDesc,
            size: u64,
        ) -> Result<MockAccel, BackendError> {
            self.ops.push(format!("create:{}", size));
            let address = self.next_address;
            self.next_address += 0x1000;
            Ok(MockAccel {
                size,
                built: false,
                address,
            })
        }

        fn build(
            &mut self,
            _desc: &AccelBuildDesc,
            _accel: &MockAccel,
            scratch_size: u64,
        ) -> Result<(), BackendError> {
            self.ops.push(format!("build:{}", scratch_size));
            Ok(())
        }

        fn query_compacted_size(&mut self, _accel: &MockAccel) -> Result<u64, BackendError> {
            self.ops.push("query_compacted".to_owned());
            Ok(self.compacted_size)
        }

        fn compact(
            &mut self,
            _desc: &AccelBuildDesc,
            accel: MockAccel,
            compacted_size: u64,
        ) -> Result<MockAccel, BackendError> {
            self.ops.push(format!("compact:{}", compacted_size));
            Ok(MockAccel {
                size: compacted_size,
                built: true,
                address: accel.address,
            })
        }
    }

    fn triangle_desc(options: AccelBuildOptions) -> AccelBuildDesc {
        AccelBuildDesc {
            kind: AccelKind::BottomLevel,
            geometries: vec![AccelGeometry::Triangles(TriangleGeometryDesc {
                vertex_buffer_address: 0x10000,
                vertex_format: vk::Format::R32G32B32_SFLOAT,
                vertex_stride: 12,
                max_vertex: 23,
                index_buffer_address: 0x20000,
                index_type: vk::IndexType::UINT32,
                triangle_count: 8,
                opaque: true,
            })],
            options,
            name: "test blas".to_owned(),
        }
    }

    #[test]
    fn build_follows_query_allocate_build_order() {
        let mut backend = MockBackend::new(4096, 1024, 0);
        build_acceleration(&mut backend, &triangle_desc(Default::default())).unwrap();

        assert_eq!(
            backend.ops,
            vec!["query_sizes", "create:4096", "build:1024"]
        );
    }

    #[test]
    fn identical_inputs_take_identical_steps() {
        let desc = triangle_desc(Default::default());

        let mut a = MockBackend::new(4096, 1024, 0);
        let mut b = MockBackend::new(4096, 1024, 0);
        build_acceleration(&mut a, &desc).unwrap();
        build_acceleration(&mut b, &desc).unwrap();

        assert_eq!(a.ops, b.ops);
    }

    #[test]
    fn zero_size_query_is_an_error() {
        let mut backend = MockBackend::new(0, 1024, 0);
        let err = build_acceleration(&mut backend, &triangle_desc(Default::default()))
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::SizeQuery { .. }));

        // Nothing may be allocated after a failed size query.
        assert_eq!(backend.ops, vec!["query_sizes"]);
    }

    #[test]
    fn compaction_shrinks_when_profitable() {
        let mut backend = MockBackend::new(4096, 1024, 1000);
        let accel = build_acceleration(
            &mut backend,
            &triangle_desc(AccelBuildOptions {
                allow_compaction: true,
            }),
        )
        .unwrap();

        assert_eq!(accel.size, 1000);
        assert_eq!(
            backend.ops,
            vec![
                "query_sizes",
                "create:4096",
                "build:1024",
                "query_compacted",
                "compact:1000"
            ]
        );
    }

    #[test]
    fn compaction_never_grows_the_structure() {
        let mut backend = MockBackend::new(4096, 1024, 4096);
        let accel = build_acceleration(
            &mut backend,
            &triangle_desc(AccelBuildOptions {
                allow_compaction: true,
            }),
        )
        .unwrap();

        assert_eq!(accel.size, 4096);
        assert!(!backend.ops.iter().any(|op| op.starts_with("compact")));
    }

    #[test]
    fn compaction_not_queried_unless_requested() {
        let mut backend = MockBackend::new(4096, 1024, 16);
        build_acceleration(&mut backend, &triangle_desc(Default::default())).unwrap();

        assert!(!backend.ops.iter().any(|op| op.starts_with("query_compacted")));
    }

    #[test]
    fn packing_rejects_unbuilt_blas() {
        let instances = [TlasInstance {
            blas: Arc::new(MockAccel {
                size: 4096,
                built: false,
                address: 0x1000,
            }),
            transformation: Affine3A::IDENTITY,
            custom_index: 0,
            mask: 0xff,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        }];

        let err = pack_tlas_instances(&instances).err().unwrap();
        assert!(matches!(err, BackendError::ResourceAccess { .. }));
    }

    #[test]
    fn packing_rejects_custom_index_overflow() {
        let instances = [TlasInstance {
            blas: Arc::new(MockAccel {
                size: 4096,
                built: true,
                address: 0x1000,
            }),
            transformation: Affine3A::IDENTITY,
            custom_index: 1 << 24,
            mask: 0xff,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        }];

        assert!(pack_tlas_instances(&instances).is_err());
    }

    #[test]
    fn packed_instance_matches_hardware_layout() {
        assert_eq!(std::mem::size_of::<GpuInstance>(), 64);

        let instances = [TlasInstance {
            blas: Arc::new(MockAccel {
                size: 4096,
                built: true,
                address: 0xdead_beef_0000,
            }),
            transformation: Affine3A::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)),
            custom_index: 7,
            mask: 0xab,
            sbt_record_offset: 2,
            flags: vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE,
        }];

        let packed = pack_tlas_instances(&instances).unwrap();
        let inst = &packed[0];

        assert_eq!(
            inst.transform,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
        assert_eq!(inst.instance_id_and_mask, (0xab << 24) | 7);
        assert_eq!(
            inst.instance_sbt_offset_and_flags,
            ((vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw() as u32) << 24) | 2
        );
        assert_eq!(inst.blas_address, 0xdead_beef_0000);
    }

    #[test]
    fn instances_sharing_a_blas_keep_their_own_transforms() {
        let blas = Arc::new(MockAccel {
            size: 4096,
            built: true,
            address: 0x4000,
        });

        let instance_at = |translation: glam::Vec3, custom_index| TlasInstance {
            blas: blas.clone(),
            transformation: Affine3A::from_translation(translation),
            custom_index,
            mask: 0xff,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        };

        let instances = [
            instance_at(glam::Vec3::new(-2.0, 0.0, 0.0), 0),
            instance_at(glam::Vec3::new(5.0, 1.0, 0.0), 1),
        ];

        let packed = pack_tlas_instances(&instances).unwrap();

        // Same geometry, two placements: the address field repeats while
        // each instance carries its own transform row.
        assert_eq!(packed[0].blas_address, packed[1].blas_address);
        assert_ne!(packed[0].transform, packed[1].transform);
        assert_eq!(packed[0].transform[3], -2.0);
        assert_eq!(packed[1].transform[3], 5.0);
        assert_eq!(packed[1].transform[7], 1.0);
    }

    #[test]
    fn tlas_desc_rejects_triangle_geometry() {
        let mut desc = triangle_desc(Default::default());
        desc.kind = AccelKind::TopLevel;

        let mut backend = MockBackend::new(4096, 1024, 0);
        assert!(build_acceleration(&mut backend, &desc).is_err());
        assert!(backend.ops.is_empty());
    }
}
