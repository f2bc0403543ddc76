use anyhow::Context;
use ash::vk;
use bytes::Bytes;
use glam::{Affine3A, Mat4, Vec3};
use hikari_backend::{
    bytes::as_byte_slice,
    frame::CameraState,
    geometry::GeometryStore,
    vulkan::{
        barrier::{image_barrier, ImageState},
        descriptor_buffer::{DescriptorBindingDesc, DescriptorBuffer, DescriptorLayoutOffsets,
            DescriptorSetLayout},
        ray_tracing::{AccelBuildOptions, RayTracingAcceleration, TlasInstance},
        sbt::{SbtRecord, ShaderBindingTable, ShaderBindingTableDesc},
        shader::{RayTracingPipeline, ShaderGroupDesc},
        swapchain::SwapchainAcquireImageErr,
    },
    Buffer, BufferDesc, ImageViewDesc, RenderBackend, RenderBackendConfig,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{path::Path, sync::Arc};
use winit::{
    dpi::LogicalSize,
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    platform::run_return::EventLoopExtRunReturn,
    window::WindowBuilder,
};

const RENDER_EXTENT: [u32; 2] = [1280, 720];
const FLAKE_DEPTH: u32 = 3;

#[derive(Clone, Copy)]
#[repr(C)]
struct GpuCamera {
    view_inverse: [[f32; 4]; 4],
    proj_inverse: [[f32; 4]; 4],
}

/// All mutable scene parameters in one place. Arrow keys orbit the camera.
struct SceneState {
    orbit_angle: f32,
}

impl SceneState {
    fn camera(&self) -> CameraState {
        let position = Vec3::new(
            8.0 * self.orbit_angle.sin(),
            3.0,
            8.0 * self.orbit_angle.cos(),
        );
        CameraState::new(position, Vec3::new(0.0, 1.0, 0.0), 50.0f32.to_radians())
    }

    fn gpu_camera(&self, aspect_ratio: f32) -> GpuCamera {
        let camera = self.camera();
        let view = Mat4::look_at_rh(camera.position, camera.look_at, Vec3::Y);
        let proj = Mat4::perspective_rh(camera.vertical_fov, aspect_ratio, 0.1, 100.0);

        GpuCamera {
            view_inverse: view.inverse().to_cols_array_2d(),
            proj_inverse: proj.inverse().to_cols_array_2d(),
        }
    }
}

/// Recursively places child spheres on the faces of the parent, producing
/// the classic sphere-flake fractal as (center, radius) records.
fn sphere_flake(center: Vec3, radius: f32, depth: u32, out: &mut Vec<[f32; 4]>) {
    out.push([center.x, center.y, center.z, radius]);

    if depth == 0 {
        return;
    }

    let child_radius = radius * 0.45;
    let directions = [
        Vec3::X,
        Vec3::NEG_X,
        Vec3::Y,
        Vec3::Z,
        Vec3::NEG_Z,
        Vec3::new(1.0, 1.0, 1.0).normalize(),
        Vec3::new(-1.0, 1.0, -1.0).normalize(),
    ];

    for dir in directions {
        sphere_flake(
            center + dir * (radius + child_radius),
            child_radius,
            depth - 1,
            out,
        );
    }
}

fn sphere_aabbs(spheres: &[[f32; 4]]) -> Vec<vk::AabbPositionsKHR> {
    spheres
        .iter()
        .map(|&[x, y, z, r]| vk::AabbPositionsKHR {
            min_x: x - r,
            min_y: y - r,
            min_z: z - r,
            max_x: x + r,
            max_y: y + r,
            max_z: z + r,
        })
        .collect()
}

fn load_spirv(name: &str) -> anyhow::Result<Bytes> {
    let path = Path::new("assets/spirv").join(name);
    let data =
        std::fs::read(&path).with_context(|| format!("Reading shader {}", path.display()))?;
    Ok(Bytes::from(data))
}

struct App {
    backend: RenderBackend,
    scene: SceneState,

    pipeline: RayTracingPipeline,
    sbt: ShaderBindingTable,
    set_layout: DescriptorSetLayout,
    descriptor_buffer: DescriptorBuffer,
    camera_buffer: Buffer,

    // Referenced by descriptors and hit records on the GPU timeline.
    #[allow(dead_code)]
    blas: Arc<RayTracingAcceleration>,
    #[allow(dead_code)]
    tlas: RayTracingAcceleration,
    #[allow(dead_code)]
    sphere_buffer: Buffer,
}

impl App {
    fn new(backend: RenderBackend) -> anyhow::Result<Self> {
        let device = backend.device.clone();
        let geometry = GeometryStore::new(device.clone());

        let mut spheres = Vec::new();
        sphere_flake(Vec3::new(0.0, 1.0, 0.0), 1.0, FLAKE_DEPTH, &mut spheres);
        info!("Sphere flake: {} spheres", spheres.len());

        let sphere_buffer = device.create_buffer(
            BufferDesc::new_gpu_only(
                spheres.len() * std::mem::size_of::<[f32; 4]>(),
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            "spheres",
            Some(as_byte_slice(&spheres)),
        )?;

        let aabbs = geometry.upload_aabbs(&sphere_aabbs(&spheres), "sphere flake aabbs")?;

        let blas = Arc::new(device.create_bottom_level_acceleration(
            "sphere flake blas",
            vec![aabbs.blas_geometry(true)],
            AccelBuildOptions {
                allow_compaction: true,
            },
        )?);

        let tlas = device.create_top_level_acceleration(
            "scene tlas",
            &[TlasInstance {
                blas: blas.clone(),
                transformation: Affine3A::IDENTITY,
                custom_index: 0,
                mask: 0xff,
                sbt_record_offset: 0,
                flags: vk::GeometryInstanceFlagsKHR::empty(),
            }],
            Default::default(),
        )?;

        let set_layout = device.create_descriptor_set_layout(&[
            DescriptorBindingDesc {
                binding: 0,
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            },
            DescriptorBindingDesc {
                binding: 1,
                ty: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
            DescriptorBindingDesc {
                binding: 2,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            },
        ])?;

        let pipeline = device.create_ray_tracing_pipeline(
            &[&set_layout],
            &[
                ShaderGroupDesc::RayGen(load_spirv("reflect.rgen.spv")?),
                ShaderGroupDesc::Miss(load_spirv("reflect.rmiss.spv")?),
                ShaderGroupDesc::ProceduralHit {
                    closest_hit: load_spirv("reflect.rchit.spv")?,
                    intersection: load_spirv("reflect.rint.spv")?,
                },
            ],
            2,
        )?;

        // The hit record carries the sphere buffer address so the
        // intersection shader can fetch primitive data without a binding.
        let sphere_address = sphere_buffer.device_address().to_le_bytes();
        let sbt = device.create_ray_tracing_shader_table(
            pipeline.raw,
            pipeline.group_count,
            &ShaderBindingTableDesc {
                raygen_records: vec![SbtRecord::new(0)],
                miss_records: vec![SbtRecord::new(1)],
                hit_records: vec![SbtRecord::with_inline_data(2, &sphere_address)],
            },
        )?;

        let camera_buffer = device.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                std::mem::size_of::<GpuCamera>(),
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            "camera",
            None,
        )?;

        let mut descriptor_buffer =
            device.create_descriptor_buffer("descriptors", set_layout.layout_size())?;

        // Static bindings are written once; the output image (binding 1) is
        // rewritten each frame for the acquired swapchain image.
        let tlas_descriptor = device.acceleration_structure_descriptor(tlas.device_address());
        let camera_descriptor = device.uniform_buffer_descriptor(
            camera_buffer.device_address(),
            std::mem::size_of::<GpuCamera>() as u64,
        );
        {
            let mut writer = descriptor_buffer.writer()?;
            writer.write(set_layout.binding_offset(0)?, &tlas_descriptor)?;
            writer.write(set_layout.binding_offset(2)?, &camera_descriptor)?;
        }

        Ok(Self {
            backend,
            scene: SceneState { orbit_angle: 0.4 },
            pipeline,
            sbt,
            set_layout,
            descriptor_buffer,
            camera_buffer,
            blas,
            tlas,
            sphere_buffer,
        })
    }

    fn render_frame(&mut self) -> anyhow::Result<()> {
        let device = self.backend.device.clone();
        let frame = device.begin_frame()?;

        let swapchain_image = match self.backend.swapchain.acquire_next_image() {
            Ok(image) => image,
            Err(SwapchainAcquireImageErr::RecreateFramebuffer) => {
                device.finish_frame(frame);
                return Ok(());
            }
            Err(SwapchainAcquireImageErr::Err(err)) => return Err(err.into()),
        };

        let extent = self.backend.swapchain.extent();
        let aspect_ratio = extent[0] as f32 / extent[1] as f32;

        // The previous frame fully completed (wait below), so the mapped
        // uniform and descriptor writes cannot race GPU reads.
        let camera = [self.scene.gpu_camera(aspect_ratio)];
        let camera_bytes = as_byte_slice(&camera);
        self.camera_buffer
            .mapped_slice_mut()
            .context("Camera buffer is not mapped")?[..camera_bytes.len()]
            .copy_from_slice(camera_bytes);

        let output_view = swapchain_image.image.view(&ImageViewDesc::default())?;
        let output_descriptor = device.storage_image_descriptor(output_view);
        self.descriptor_buffer
            .writer()?
            .write(self.set_layout.binding_offset(1)?, &output_descriptor)?;

        let cb = &frame.main_command_buffer;
        unsafe {
            device.raw.begin_command_buffer(
                cb.raw,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }

        image_barrier(
            &device.raw,
            cb.raw,
            swapchain_image.image.raw,
            ImageState::UNDEFINED,
            ImageState::RAY_TRACING_WRITE,
        );

        unsafe {
            device.raw.cmd_bind_pipeline(
                cb.raw,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.raw,
            );
        }
        self.descriptor_buffer.bind(&device, cb.raw);
        self.descriptor_buffer.set_offsets(
            &device,
            cb.raw,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.pipeline.layout,
            0,
            0,
        );

        unsafe {
            device.ray_tracing_pipeline_ext.cmd_trace_rays(
                cb.raw,
                &self.sbt.raygen_region,
                &self.sbt.miss_region,
                &self.sbt.hit_region,
                &self.sbt.callable_region,
                extent[0],
                extent[1],
                1,
            );
        }

        image_barrier(
            &device.raw,
            cb.raw,
            swapchain_image.image.raw,
            ImageState::RAY_TRACING_WRITE,
            ImageState::PRESENT,
        );

        unsafe {
            device.raw.end_command_buffer(cb.raw)?;
        }

        device.submit_commands(
            cb,
            &[(
                swapchain_image.acquire_semaphore,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            )],
            &[swapchain_image.rendering_finished_semaphore],
        )?;
        self.backend.swapchain.present_image(swapchain_image)?;
        device.finish_frame(frame);

        // Full sync per frame; serializes CPU descriptor/uniform rewrites
        // against GPU reads.
        device.wait_idle()?;

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("reflect")
        .with_inner_size(LogicalSize::new(RENDER_EXTENT[0], RENDER_EXTENT[1]))
        .with_resizable(false)
        .build(&event_loop)?;

    let backend = RenderBackend::new(
        &window,
        RenderBackendConfig {
            swapchain_extent: RENDER_EXTENT,
            vsync: true,
            graphics_debugging: false,
            device_index: None,
        },
    )?;

    let mut app = App::new(backend)?;
    let mut result = Ok(());

    event_loop.run_return(|event, _, control_flow| {
        control_flow.set_poll();

        match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => *control_flow = ControlFlow::Exit,
            Event::WindowEvent {
                event:
                    WindowEvent::KeyboardInput {
                        input:
                            KeyboardInput {
                                state: ElementState::Pressed,
                                virtual_keycode: Some(key),
                                ..
                            },
                        ..
                    },
                ..
            } => match key {
                VirtualKeyCode::Escape => *control_flow = ControlFlow::Exit,
                VirtualKeyCode::Left => app.scene.orbit_angle -= 0.05,
                VirtualKeyCode::Right => app.scene.orbit_angle += 0.05,
                _ => {}
            },
            Event::MainEventsCleared => window.request_redraw(),
            Event::RedrawRequested(_) => {
                if let Err(err) = app.render_frame() {
                    result = Err(err);
                    *control_flow = ControlFlow::Exit;
                }
            }
            _ => {}
        }
    });

    let _ = app.backend.device.wait_idle();
    result
}
