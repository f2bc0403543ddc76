use anyhow::Context;
use ash::vk;
use bytes::Bytes;
use glam::{Affine3A, Mat4, Quat, Vec3};
use hikari_backend::{
    bytes::as_byte_slice,
    frame::{AccumulationState, CameraState},
    geometry::{GeometryStore, TriangleMesh, UploadedTriangleMesh},
    vulkan::{
        barrier::{image_barrier, ImageState},
        descriptor_buffer::{DescriptorBindingDesc, DescriptorBuffer, DescriptorLayoutOffsets,
            DescriptorSetLayout},
        ray_tracing::{RayTracingAcceleration, TlasInstance},
        sbt::{SbtRecord, ShaderBindingTable, ShaderBindingTableDesc},
        shader::{ComputePipeline, RayTracingPipeline, ShaderGroupDesc},
        swapchain::SwapchainAcquireImageErr,
    },
    Buffer, BufferDesc, Image, ImageDesc, ImageViewDesc, RenderBackend, RenderBackendConfig,
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
const DEFAULT_MAX_SAMPLES: u32 = 1024;

// Material ids surfaced to the hit shader via gl_InstanceCustomIndexEXT.
const MATERIAL_DIFFUSE_RED: u32 = 0;
const MATERIAL_DIFFUSE_GREEN: u32 = 1;
const MATERIAL_METAL: u32 = 2;
const MATERIAL_GLASS: u32 = 3;
const MATERIAL_BOX: u32 = 4;

#[derive(Clone, Copy)]
#[repr(C)]
struct GpuScene {
    view_inverse: [[f32; 4]; 4],
    proj_inverse: [[f32; 4]; 4],
    light_dir: [f32; 4],
    frame_index: u32,
    max_samples: u32,
    pad: [u32; 2],
}

/// All mutable scene parameters in one place. Arrow keys orbit the camera
/// (restarting accumulation), up/down scale the sample budget.
struct SceneState {
    orbit_angle: f32,
    light_dir: Vec3,
    max_samples: u32,
    frame_index: u32,
}

impl SceneState {
    fn camera(&self) -> CameraState {
        let position = Vec3::new(
            10.0 * self.orbit_angle.sin(),
            2.5,
            10.0 * self.orbit_angle.cos(),
        );
        CameraState::new(position, Vec3::new(0.0, 1.0, 0.0), 45.0f32.to_radians())
    }

    fn gpu_scene(&self, aspect_ratio: f32) -> GpuScene {
        let camera = self.camera();
        let view = Mat4::look_at_rh(camera.position, camera.look_at, Vec3::Y);
        let proj = Mat4::perspective_rh(camera.vertical_fov, aspect_ratio, 0.1, 100.0);
        let light = self.light_dir.normalize();

        GpuScene {
            view_inverse: view.inverse().to_cols_array_2d(),
            proj_inverse: proj.inverse().to_cols_array_2d(),
            light_dir: [light.x, light.y, light.z, 0.0],
            frame_index: self.frame_index,
            max_samples: self.max_samples,
            pad: [0; 2],
        }
    }
}

fn uv_sphere(stacks: u32, slices: u32, radius: f32) -> TriangleMesh {
    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut indices = Vec::new();

    for stack in 0..=stacks {
        let phi = std::f32::consts::PI * stack as f32 / stacks as f32;
        for slice in 0..=slices {
            let theta = std::f32::consts::TAU * slice as f32 / slices as f32;
            let normal = Vec3::new(
                phi.sin() * theta.cos(),
                phi.cos(),
                phi.sin() * theta.sin(),
            );
            positions.push((normal * radius).to_array());
            normals.push(normal.to_array());
        }
    }

    let row = slices + 1;
    for stack in 0..stacks {
        for slice in 0..slices {
            let a = stack * row + slice;
            let b = a + row;
            indices.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
        }
    }

    TriangleMesh {
        positions,
        normals,
        indices,
    }
}

fn box_mesh(half_extents: Vec3) -> TriangleMesh {
    let h = half_extents;
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
        (Vec3::Z, Vec3::Y, Vec3::NEG_X),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];

    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut indices = Vec::new();

    for (normal, up, right) in faces {
        let base = positions.len() as u32;
        for (u, v) in [(-1.0f32, -1.0f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let corner = (normal + right * u + up * v) * h;
            positions.push(corner.to_array());
            normals.push(normal.to_array());
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    TriangleMesh {
        positions,
        normals,
        indices,
    }
}

fn load_spirv(name: &str) -> anyhow::Result<Bytes> {
    let path = Path::new("assets/spirv").join(name);
    let data =
        std::fs::read(&path).with_context(|| format!("Reading shader {}", path.display()))?;
    Ok(Bytes::from(data))
}

/// The 16-byte hit record payload: index and normal buffer addresses, so the
/// hit shader can reconstruct the surface without extra bindings.
fn hit_record_data(mesh: &UploadedTriangleMesh) -> anyhow::Result<[u8; 16]> {
    let normal_buffer = mesh
        .normal_buffer
        .as_ref()
        .context("Mesh has no normal buffer")?;

    let mut data = [0u8; 16];
    data[..8].copy_from_slice(&mesh.index_buffer.device_address().to_le_bytes());
    data[8..].copy_from_slice(&normal_buffer.device_address().to_le_bytes());
    Ok(data)
}

struct App {
    backend: RenderBackend,
    scene: SceneState,
    accumulation: AccumulationState,

    pipeline: RayTracingPipeline,
    clear_pipeline: ComputePipeline,
    sbt: ShaderBindingTable,

    set_layout: DescriptorSetLayout,
    descriptor_buffer: DescriptorBuffer,
    #[allow(dead_code)]
    clear_set_layout: DescriptorSetLayout,
    clear_descriptor_buffer: DescriptorBuffer,

    scene_buffer: Buffer,
    accumulation_image: Image,

    // Referenced by descriptors and hit records on the GPU timeline.
    #[allow(dead_code)]
    sample_count_buffer: Buffer,
    #[allow(dead_code)]
    meshes: Vec<Arc<UploadedTriangleMesh>>,
    #[allow(dead_code)]
    blases: Vec<Arc<RayTracingAcceleration>>,
    #[allow(dead_code)]
    tlas: RayTracingAcceleration,
}

impl App {
    fn new(backend: RenderBackend) -> anyhow::Result<Self> {
        let device = backend.device.clone();
        let geometry = GeometryStore::new(device.clone());

        let sphere = geometry.upload_triangle_mesh(&uv_sphere(32, 64, 1.0), "sphere")?;
        let cube = geometry.upload_triangle_mesh(&box_mesh(Vec3::splat(1.0)), "box")?;

        let sphere_blas = Arc::new(device.create_bottom_level_acceleration(
            "sphere blas",
            vec![sphere.blas_geometry(false)],
            Default::default(),
        )?);
        let box_blas = Arc::new(device.create_bottom_level_acceleration(
            "box blas",
            vec![cube.blas_geometry(false)],
            Default::default(),
        )?);

        let opaque = vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE;
        let sphere_at = |x: f32, z: f32, material: u32, flags: vk::GeometryInstanceFlagsKHR| {
            TlasInstance {
                blas: sphere_blas.clone(),
                transformation: Affine3A::from_translation(Vec3::new(x, 1.0, z)),
                custom_index: material,
                mask: 0xff,
                sbt_record_offset: 0,
                flags,
            }
        };

        let instances = vec![
            sphere_at(-3.0, 0.0, MATERIAL_DIFFUSE_RED, opaque),
            sphere_at(-1.0, 2.0, MATERIAL_DIFFUSE_GREEN, opaque),
            sphere_at(1.5, -1.0, MATERIAL_METAL, opaque),
            // Glass needs both faces and the any-hit path.
            sphere_at(
                3.0,
                1.0,
                MATERIAL_GLASS,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
                    | vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE,
            ),
            TlasInstance {
                blas: box_blas.clone(),
                transformation: Affine3A::from_scale_rotation_translation(
                    Vec3::new(8.0, 0.1, 8.0),
                    Quat::IDENTITY,
                    Vec3::new(0.0, -0.1, 0.0),
                ),
                custom_index: MATERIAL_BOX,
                mask: 0xff,
                sbt_record_offset: 1,
                flags: opaque,
            },
        ];

        let tlas = device.create_top_level_acceleration("scene tlas", &instances, Default::default())?;

        let accumulation_image = device.create_image(
            ImageDesc::new_2d(vk::Format::R32G32B32A32_SFLOAT, RENDER_EXTENT)
                .usage(vk::ImageUsageFlags::STORAGE),
            "accumulation",
        )?;

        let pixel_count = (RENDER_EXTENT[0] * RENDER_EXTENT[1]) as usize;
        let sample_count_buffer = device.create_buffer(
            BufferDesc::new_gpu_only(
                pixel_count * std::mem::size_of::<u32>(),
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            "per-pixel sample counts",
            None,
        )?;

        let rt_stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR;
        let set_layout = device.create_descriptor_set_layout(&[
            DescriptorBindingDesc {
                binding: 0,
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
            DescriptorBindingDesc {
                binding: 1,
                ty: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
            DescriptorBindingDesc {
                binding: 2,
                ty: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
            DescriptorBindingDesc {
                binding: 3,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: rt_stages,
            },
            DescriptorBindingDesc {
                binding: 4,
                ty: vk::DescriptorType::STORAGE_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::RAYGEN_KHR,
            },
        ])?;

        let clear_set_layout = device.create_descriptor_set_layout(&[
            DescriptorBindingDesc {
                binding: 0,
                ty: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            },
            DescriptorBindingDesc {
                binding: 1,
                ty: vk::DescriptorType::STORAGE_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            },
        ])?;

        let pipeline = device.create_ray_tracing_pipeline(
            &[&set_layout],
            &[
                ShaderGroupDesc::RayGen(load_spirv("path_trace.rgen.spv")?),
                ShaderGroupDesc::Miss(load_spirv("path_trace.rmiss.spv")?),
                ShaderGroupDesc::TriangleHit {
                    closest_hit: load_spirv("path_trace.rchit.spv")?,
                },
            ],
            1,
        )?;

        let clear_pipeline = device.create_compute_pipeline(
            &[&clear_set_layout],
            &load_spirv("clear.comp.spv")?,
            "accumulation clear",
        )?;

        // One hit record per mesh; instances pick theirs via the SBT record
        // offset baked into the TLAS.
        let sphere_hit = hit_record_data(&sphere)?;
        let box_hit = hit_record_data(&cube)?;
        let sbt = device.create_ray_tracing_shader_table(
            pipeline.raw,
            pipeline.group_count,
            &ShaderBindingTableDesc {
                raygen_records: vec![SbtRecord::new(0)],
                miss_records: vec![SbtRecord::new(1)],
                hit_records: vec![
                    SbtRecord::with_inline_data(2, &sphere_hit),
                    SbtRecord::with_inline_data(2, &box_hit),
                ],
            },
        )?;

        let scene_buffer = device.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                std::mem::size_of::<GpuScene>(),
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            "scene uniforms",
            None,
        )?;

        let accumulation_view = accumulation_image.view(&ImageViewDesc::default())?;

        let mut descriptor_buffer =
            device.create_descriptor_buffer("rt descriptors", set_layout.layout_size())?;
        {
            let tlas_descriptor =
                device.acceleration_structure_descriptor(tlas.device_address());
            let accumulation_descriptor = device.storage_image_descriptor(accumulation_view);
            let scene_descriptor = device.uniform_buffer_descriptor(
                scene_buffer.device_address(),
                std::mem::size_of::<GpuScene>() as u64,
            );
            let counts_descriptor = device.storage_buffer_descriptor(
                sample_count_buffer.device_address(),
                sample_count_buffer.desc.size as u64,
            );

            let mut writer = descriptor_buffer.writer()?;
            writer.write(set_layout.binding_offset(0)?, &tlas_descriptor)?;
            writer.write(set_layout.binding_offset(1)?, &accumulation_descriptor)?;
            // Binding 2 (output image) is rewritten per frame.
            writer.write(set_layout.binding_offset(3)?, &scene_descriptor)?;
            writer.write(set_layout.binding_offset(4)?, &counts_descriptor)?;
        }

        let mut clear_descriptor_buffer = device
            .create_descriptor_buffer("clear descriptors", clear_set_layout.layout_size())?;
        {
            let accumulation_descriptor = device.storage_image_descriptor(accumulation_view);
            let counts_descriptor = device.storage_buffer_descriptor(
                sample_count_buffer.device_address(),
                sample_count_buffer.desc.size as u64,
            );

            let mut writer = clear_descriptor_buffer.writer()?;
            writer.write(clear_set_layout.binding_offset(0)?, &accumulation_descriptor)?;
            writer.write(clear_set_layout.binding_offset(1)?, &counts_descriptor)?;
        }

        let scene = SceneState {
            orbit_angle: 0.5,
            light_dir: Vec3::new(0.4, 1.0, 0.3),
            max_samples: DEFAULT_MAX_SAMPLES,
            frame_index: 0,
        };
        let accumulation = AccumulationState::new(scene.camera(), scene.max_samples);

        Ok(Self {
            backend,
            scene,
            accumulation,
            pipeline,
            clear_pipeline,
            sbt,
            set_layout,
            descriptor_buffer,
            clear_set_layout,
            clear_descriptor_buffer,
            scene_buffer,
            accumulation_image,
            sample_count_buffer,
            meshes: vec![sphere, cube],
            blases: vec![sphere_blas, box_blas],
            tlas,
        })
    }

    fn set_max_samples(&mut self, max_samples: u32) {
        let max_samples = max_samples.clamp(1, 1 << 20);
        self.scene.max_samples = max_samples;
        self.accumulation.set_max_samples(max_samples);
        info!("Sample budget: {}", max_samples);
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

        let advance = self.accumulation.begin_frame(self.scene.camera());
        // The accumulation image starts undefined; treat the very first
        // frame as a reset regardless of camera state.
        let reset = advance.reset_accumulation || self.scene.frame_index == 0;

        if advance.converged && !reset {
            trace!(
                "Converged at {} samples; tracing is a per-pixel no-op",
                advance.accumulated_samples
            );
        }

        let extent = self.backend.swapchain.extent();
        let aspect_ratio = extent[0] as f32 / extent[1] as f32;

        // The previous frame fully completed (wait below), so the mapped
        // uniform and descriptor writes cannot race GPU reads.
        let uniforms = [self.scene.gpu_scene(aspect_ratio)];
        let uniform_bytes = as_byte_slice(&uniforms);
        self.scene_buffer
            .mapped_slice_mut()
            .context("Scene uniform buffer is not mapped")?[..uniform_bytes.len()]
            .copy_from_slice(uniform_bytes);

        let output_view = swapchain_image.image.view(&ImageViewDesc::default())?;
        let output_descriptor = device.storage_image_descriptor(output_view);
        self.descriptor_buffer
            .writer()?
            .write(self.set_layout.binding_offset(2)?, &output_descriptor)?;

        let cb = &frame.main_command_buffer;
        unsafe {
            device.raw.begin_command_buffer(
                cb.raw,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }

        if reset {
            image_barrier(
                &device.raw,
                cb.raw,
                self.accumulation_image.raw,
                ImageState::UNDEFINED,
                ImageState::COMPUTE_WRITE,
            );

            unsafe {
                device.raw.cmd_bind_pipeline(
                    cb.raw,
                    vk::PipelineBindPoint::COMPUTE,
                    self.clear_pipeline.raw,
                );
            }
            self.clear_descriptor_buffer.bind(&device, cb.raw);
            self.clear_descriptor_buffer.set_offsets(
                &device,
                cb.raw,
                vk::PipelineBindPoint::COMPUTE,
                self.clear_pipeline.layout,
                0,
                0,
            );
            unsafe {
                device.raw.cmd_dispatch(
                    cb.raw,
                    (extent[0] + 7) / 8,
                    (extent[1] + 7) / 8,
                    1,
                );
            }

            image_barrier(
                &device.raw,
                cb.raw,
                self.accumulation_image.raw,
                ImageState::COMPUTE_WRITE,
                ImageState::RAY_TRACING_WRITE,
            );
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
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
            )],
            &[swapchain_image.rendering_finished_semaphore],
        )?;
        self.backend.swapchain.present_image(swapchain_image)?;
        device.finish_frame(frame);

        // Full sync per frame; serializes CPU descriptor/uniform rewrites
        // against GPU reads.
        device.wait_idle()?;

        self.scene.frame_index += 1;
        if advance.accumulated_samples % 64 == 0 || advance.converged {
            debug!(
                "Accumulated {}/{} samples",
                advance.accumulated_samples,
                self.accumulation.max_samples()
            );
        }

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("path-trace")
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
                VirtualKeyCode::Up => app.set_max_samples(app.scene.max_samples * 2),
                VirtualKeyCode::Down => app.set_max_samples(app.scene.max_samples / 2),
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
