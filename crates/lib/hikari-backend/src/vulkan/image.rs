use crate::BackendError;

use super::device::Device;
use ash::vk;
use derive_builder::Builder;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ImageType {
    Tex1d = 0,
    Tex2d = 1,
    Tex3d = 2,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: ImageType,
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub extent: [u32; 3],
    pub tiling: vk::ImageTiling,
    pub mip_levels: u16,
}

impl ImageDesc {
    pub fn new(format: vk::Format, image_type: ImageType, extent: [u32; 3]) -> Self {
        Self {
            image_type,
            usage: vk::ImageUsageFlags::default(),
            format,
            extent,
            tiling: vk::ImageTiling::OPTIMAL,
            mip_levels: 1,
        }
    }

    pub fn new_2d(format: vk::Format, extent: [u32; 2]) -> Self {
        let [width, height] = extent;
        Self::new(format, ImageType::Tex2d, [width, height, 1])
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    pub fn extent_2d(&self) -> [u32; 2] {
        [self.extent[0], self.extent[1]]
    }
}

pub struct Image {
    pub raw: vk::Image,
    pub desc: ImageDesc,
    pub(crate) views: Mutex<HashMap<ImageViewDesc, vk::ImageView>>,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) device: Arc<Device>,
}

impl Image {
    pub fn view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView, BackendError> {
        let mut views = self.views.lock();

        if let Some(entry) = views.get(desc) {
            Ok(*entry)
        } else {
            let view = self.device.create_image_view(*desc, &self.desc, self.raw)?;
            Ok(*views.entry(*desc).or_insert(view))
        }
    }

    fn view_desc_impl(desc: ImageViewDesc, image_desc: &ImageDesc) -> vk::ImageViewCreateInfo {
        vk::ImageViewCreateInfo::builder()
            .format(desc.format.unwrap_or(image_desc.format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .view_type(
                desc.view_type
                    .unwrap_or_else(|| convert_image_type_to_view_type(image_desc.image_type)),
            )
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect_mask,
                base_mip_level: desc.base_mip_level,
                level_count: desc.level_count.unwrap_or(image_desc.mip_levels as u32),
                base_array_layer: 0,
                layer_count: 1,
            })
            .build()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            for (_, view) in self.views.get_mut().drain() {
                self.device.raw.destroy_image_view(view, None);
            }

            // Swapchain images are owned by the swapchain; only destroy the
            // ones we allocated ourselves.
            if let Some(allocation) = self.allocation.take() {
                self.device.raw.destroy_image(self.raw, None);
                let _ = self.device.global_allocator.lock().free(allocation);
            }
        }
    }
}

#[derive(Clone, Copy, Builder, Eq, PartialEq, Hash)]
#[builder(pattern = "owned", derive(Clone))]
pub struct ImageViewDesc {
    #[builder(setter(strip_option), default)]
    pub view_type: Option<vk::ImageViewType>,
    #[builder(setter(strip_option), default)]
    pub format: Option<vk::Format>,
    #[builder(default = "vk::ImageAspectFlags::COLOR")]
    pub aspect_mask: vk::ImageAspectFlags,
    #[builder(default = "0")]
    pub base_mip_level: u32,
    #[builder(default = "None")]
    pub level_count: Option<u32>,
}

impl ImageViewDesc {
    pub fn builder() -> ImageViewDescBuilder {
        Default::default()
    }
}

impl Default for ImageViewDesc {
    fn default() -> Self {
        Self::builder().build().unwrap()
    }
}

impl Device {
    pub fn create_image(
        self: &Arc<Self>,
        desc: ImageDesc,
        name: &str,
    ) -> Result<Image, BackendError> {
        log::info!("Creating an image: {:?}", desc);

        let create_info = get_image_create_info(&desc);

        let image = unsafe { self.raw.create_image(&create_info, None)? };
        let requirements = unsafe { self.raw.get_image_memory_requirements(image) };

        let allocation = self
            .global_allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| BackendError::Allocation {
                inner: err,
                name: name.to_owned(),
            })?;

        // Bind memory to the image
        unsafe {
            self.raw
                .bind_image_memory(image, allocation.memory(), allocation.offset())?
        };

        Ok(Image {
            raw: image,
            desc,
            views: Default::default(),
            allocation: Some(allocation),
            device: self.clone(),
        })
    }

    fn create_image_view(
        &self,
        desc: ImageViewDesc,
        image_desc: &ImageDesc,
        image_raw: vk::Image,
    ) -> Result<vk::ImageView, BackendError> {
        let create_info = vk::ImageViewCreateInfo {
            image: image_raw,
            ..Image::view_desc_impl(desc, image_desc)
        };

        Ok(unsafe { self.raw.create_image_view(&create_info, None)? })
    }
}

pub fn convert_image_type_to_view_type(image_type: ImageType) -> vk::ImageViewType {
    match image_type {
        ImageType::Tex1d => vk::ImageViewType::TYPE_1D,
        ImageType::Tex2d => vk::ImageViewType::TYPE_2D,
        ImageType::Tex3d => vk::ImageViewType::TYPE_3D,
    }
}

pub fn get_image_create_info(desc: &ImageDesc) -> vk::ImageCreateInfo {
    let (image_type, image_extent) = match desc.image_type {
        ImageType::Tex1d => (
            vk::ImageType::TYPE_1D,
            vk::Extent3D {
                width: desc.extent[0],
                height: 1,
                depth: 1,
            },
        ),
        ImageType::Tex2d => (
            vk::ImageType::TYPE_2D,
            vk::Extent3D {
                width: desc.extent[0],
                height: desc.extent[1],
                depth: 1,
            },
        ),
        ImageType::Tex3d => (
            vk::ImageType::TYPE_3D,
            vk::Extent3D {
                width: desc.extent[0],
                height: desc.extent[1],
                depth: desc.extent[2],
            },
        ),
    };

    vk::ImageCreateInfo {
        image_type,
        format: desc.format,
        extent: image_extent,
        mip_levels: desc.mip_levels as u32,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: desc.tiling,
        usage: desc.usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    }
}
