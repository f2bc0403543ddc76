use backtrace::Backtrace as Bt;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Allocation failed for {name:?}: {inner:?}")]
    Allocation {
        inner: gpu_allocator::AllocationError,
        name: String,
    },

    #[error("Vulkan error: {err:?}; {trace:?}")]
    Vulkan { err: ash::vk::Result, trace: Bt },

    #[error("Acceleration structure size query for {name:?} returned zero sizes")]
    SizeQuery { name: String },

    #[error("Acceleration structure build submission failed: {err:?}")]
    BuildSubmission { err: ash::vk::Result },

    #[error("Invalid resource access: {info:?}")]
    ResourceAccess { info: String },

    #[error("Shader module creation failed for {name:?}: {err:?}")]
    ShaderModule { name: String, err: ash::vk::Result },

    #[error("Timed out after {timeout_ns}ns waiting for the GPU ({info})")]
    GpuTimeout { info: String, timeout_ns: u64 },
}

impl From<ash::vk::Result> for BackendError {
    fn from(err: ash::vk::Result) -> Self {
        Self::Vulkan {
            err,
            trace: Bt::new(),
        }
    }
}
