pub mod bytes;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod vulkan;

pub use ash;
pub use error::BackendError;
pub use gpu_allocator;
pub use vulkan::{
    buffer::{Buffer, BufferDesc},
    device::Device,
    image::*,
    RenderBackend, RenderBackendConfig,
};
