use ash::vk;

/// Makes acceleration structure builds visible to subsequent builds and to
/// ray traversal on the same queue.
pub fn acceleration_structure_build_barrier(device: &ash::Device, cb: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_access_mask(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        )
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::DependencyFlags::empty(),
            std::slice::from_ref(&barrier),
            &[],
            &[],
        );
    }
}

#[derive(Clone, Copy)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl ImageState {
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        access: vk::AccessFlags::empty(),
        stage: vk::PipelineStageFlags::TOP_OF_PIPE,
    };

    pub const RAY_TRACING_WRITE: Self = Self {
        layout: vk::ImageLayout::GENERAL,
        access: vk::AccessFlags::SHADER_WRITE,
        stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
    };

    pub const COMPUTE_WRITE: Self = Self {
        layout: vk::ImageLayout::GENERAL,
        access: vk::AccessFlags::SHADER_WRITE,
        stage: vk::PipelineStageFlags::COMPUTE_SHADER,
    };

    pub const PRESENT: Self = Self {
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        access: vk::AccessFlags::empty(),
        stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    };
}

pub fn image_barrier(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    from: ImageState,
    to: ImageState,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(from.access)
        .dst_access_mask(to.access)
        .old_layout(from.layout)
        .new_layout(to.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            from.stage,
            to.stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
}
