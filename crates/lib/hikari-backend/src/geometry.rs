use crate::{
    bytes::as_byte_slice,
    vulkan::{
        buffer::{Buffer, BufferDesc},
        device::Device,
        ray_tracing::{AabbGeometryDesc, AccelGeometry, TriangleGeometryDesc},
    },
    BackendError,
};
use ash::vk;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

const GEOMETRY_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw(),
);

pub struct TriangleMesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

fn validate_mesh(mesh: &TriangleMesh, name: &str) -> Result<(), BackendError> {
    if mesh.indices.len() % 3 != 0 {
        return Err(BackendError::ResourceAccess {
            info: format!(
                "Mesh {:?}: index count {} is not a multiple of 3",
                name,
                mesh.indices.len()
            ),
        });
    }
    if mesh.positions.is_empty() {
        return Err(BackendError::ResourceAccess {
            info: format!("Mesh {:?} has no vertices", name),
        });
    }
    if !mesh.normals.is_empty() && mesh.normals.len() != mesh.positions.len() {
        return Err(BackendError::ResourceAccess {
            info: format!(
                "Mesh {:?}: {} normals for {} positions",
                name,
                mesh.normals.len(),
                mesh.positions.len()
            ),
        });
    }

    Ok(())
}

/// Device-resident triangle mesh. The buffers are immutable once uploaded;
/// acceleration structure builds and hit shaders read them by address.
pub struct UploadedTriangleMesh {
    pub index_buffer: Buffer,
    pub position_buffer: Buffer,
    pub normal_buffer: Option<Buffer>,
    pub vertex_count: u32,
    pub triangle_count: u32,
}

impl UploadedTriangleMesh {
    pub fn blas_geometry(&self, opaque: bool) -> AccelGeometry {
        AccelGeometry::Triangles(TriangleGeometryDesc {
            vertex_buffer_address: self.position_buffer.device_address(),
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_stride: std::mem::size_of::<[f32; 3]>(),
            max_vertex: self.vertex_count.saturating_sub(1),
            index_buffer_address: self.index_buffer.device_address(),
            index_type: vk::IndexType::UINT32,
            triangle_count: self.triangle_count,
            opaque,
        })
    }
}

/// Device-resident AABB list for procedural geometry.
pub struct UploadedAabbs {
    pub buffer: Buffer,
    pub count: u32,
}

impl UploadedAabbs {
    pub fn blas_geometry(&self, opaque: bool) -> AccelGeometry {
        AccelGeometry::Aabbs(AabbGeometryDesc {
            buffer_address: self.buffer.device_address(),
            stride: std::mem::size_of::<vk::AabbPositionsKHR>(),
            aabb_count: self.count,
            opaque,
        })
    }
}

pub struct GeometryStore {
    device: Arc<Device>,
}

impl GeometryStore {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    pub fn upload_triangle_mesh(
        &self,
        mesh: &TriangleMesh,
        name: &str,
    ) -> Result<Arc<UploadedTriangleMesh>, BackendError> {
        validate_mesh(mesh, name)?;

        let index_buffer = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                mesh.indices.len() * std::mem::size_of::<u32>(),
                GEOMETRY_BUFFER_USAGE,
            ),
            format!("{} indices", name),
            Some(as_byte_slice(&mesh.indices)),
        )?;

        let position_buffer = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                mesh.positions.len() * std::mem::size_of::<[f32; 3]>(),
                GEOMETRY_BUFFER_USAGE,
            ),
            format!("{} positions", name),
            Some(as_byte_slice(&mesh.positions)),
        )?;

        let normal_buffer = if mesh.normals.is_empty() {
            None
        } else {
            Some(self.device.create_buffer(
                BufferDesc::new_gpu_only(
                    mesh.normals.len() * std::mem::size_of::<[f32; 3]>(),
                    GEOMETRY_BUFFER_USAGE,
                ),
                format!("{} normals", name),
                Some(as_byte_slice(&mesh.normals)),
            )?)
        };

        debug!(
            "Uploaded mesh {:?}: {} vertices, {} triangles",
            name,
            mesh.positions.len(),
            mesh.indices.len() / 3
        );

        Ok(Arc::new(UploadedTriangleMesh {
            index_buffer,
            position_buffer,
            normal_buffer,
            vertex_count: mesh.positions.len() as u32,
            triangle_count: (mesh.indices.len() / 3) as u32,
        }))
    }

    pub fn upload_aabbs(
        &self,
        aabbs: &[vk::AabbPositionsKHR],
        name: &str,
    ) -> Result<Arc<UploadedAabbs>, BackendError> {
        if aabbs.is_empty() {
            return Err(BackendError::ResourceAccess {
                info: format!("AABB list {:?} is empty", name),
            });
        }

        let buffer = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                aabbs.len() * std::mem::size_of::<vk::AabbPositionsKHR>(),
                GEOMETRY_BUFFER_USAGE,
            ),
            name,
            Some(as_byte_slice(aabbs)),
        )?;

        Ok(Arc::new(UploadedAabbs {
            buffer,
            count: aabbs.len() as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> TriangleMesh {
        TriangleMesh {
            positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    #[test]
    fn well_formed_mesh_is_accepted() {
        assert!(validate_mesh(&quad(), "quad").is_ok());
    }

    #[test]
    fn dangling_indices_are_rejected() {
        let mut mesh = quad();
        mesh.indices.pop();
        assert!(validate_mesh(&mesh, "quad").is_err());
    }

    #[test]
    fn empty_mesh_is_rejected() {
        let mesh = TriangleMesh {
            positions: Vec::new(),
            normals: Vec::new(),
            indices: Vec::new(),
        };
        assert!(validate_mesh(&mesh, "empty").is_err());
    }

    #[test]
    fn normal_count_must_match_positions() {
        let mut mesh = quad();
        mesh.normals.pop();
        assert!(validate_mesh(&mesh, "quad").is_err());
    }

    #[test]
    fn normals_are_optional() {
        let mut mesh = quad();
        mesh.normals.clear();
        assert!(validate_mesh(&mesh, "quad").is_ok());
    }
}
