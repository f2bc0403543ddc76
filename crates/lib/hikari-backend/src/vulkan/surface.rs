use super::instance::Instance;
use anyhow::Result;
use ash::extensions::khr;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;

pub struct Surface {
    pub(crate) fns: khr::Surface,
    pub(crate) raw: ash::vk::SurfaceKHR,
}

impl Surface {
    pub fn create(
        instance: &Arc<Instance>,
        window: &(impl HasRawWindowHandle + HasRawDisplayHandle),
    ) -> Result<Arc<Self>> {
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )?
        };
        let surface_loader = khr::Surface::new(&instance.entry, &instance.raw);

        Ok(Arc::new(Self {
            fns: surface_loader,
            raw: surface,
        }))
    }
}
