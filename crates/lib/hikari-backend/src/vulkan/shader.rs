use super::{descriptor_buffer::DescriptorSetLayout, device::Device};
use crate::BackendError;
use ash::vk;
use byte_slice_cast::AsSliceOf;
use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{ffi::CString, sync::Arc};

/// One shader group of a ray tracing pipeline, in the order it should
/// appear: all ray-gen groups first, then miss groups, then hit groups.
/// Group indices used by shader tables refer to this order.
#[derive(Clone)]
pub enum ShaderGroupDesc {
    RayGen(Bytes),
    Miss(Bytes),
    TriangleHit {
        closest_hit: Bytes,
    },
    ProceduralHit {
        closest_hit: Bytes,
        intersection: Bytes,
    },
}

impl ShaderGroupDesc {
    fn order_rank(&self) -> u32 {
        match self {
            ShaderGroupDesc::RayGen(..) => 0,
            ShaderGroupDesc::Miss(..) => 1,
            ShaderGroupDesc::TriangleHit { .. } | ShaderGroupDesc::ProceduralHit { .. } => 2,
        }
    }
}

pub(crate) fn validate_group_order(groups: &[ShaderGroupDesc]) -> Result<(), BackendError> {
    if !matches!(groups.first(), Some(ShaderGroupDesc::RayGen(..))) {
        return Err(BackendError::ResourceAccess {
            info: "Ray tracing pipeline must start with a ray-gen group".to_owned(),
        });
    }

    let ordered = groups
        .windows(2)
        .all(|pair| pair[0].order_rank() <= pair[1].order_rank());
    if !ordered {
        return Err(BackendError::ResourceAccess {
            info: "Ray tracing pipeline groups must be ordered: ray-gen, miss, hit".to_owned(),
        });
    }

    Ok(())
}

pub struct RayTracingPipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub group_count: u32,
    device: Arc<Device>,
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_pipeline(self.raw, None);
            self.device.raw.destroy_pipeline_layout(self.layout, None);
        }
    }
}

pub struct ComputePipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<Device>,
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_pipeline(self.raw, None);
            self.device.raw.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl Device {
    fn create_shader_module(
        &self,
        spirv: &[u8],
        name: &str,
    ) -> Result<vk::ShaderModule, BackendError> {
        let code = spirv
            .as_slice_of::<u32>()
            .map_err(|err| BackendError::ResourceAccess {
                info: format!("SPIR-V blob {:?} is not u32 aligned: {}", name, err),
            })?;

        unsafe {
            self.raw
                .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(code), None)
                .map_err(|err| BackendError::ShaderModule {
                    name: name.to_owned(),
                    err,
                })
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[&DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, BackendError> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|layout| layout.raw).collect();

        Ok(unsafe {
            self.raw.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder().set_layouts(&raw_layouts),
                None,
            )?
        })
    }

    pub fn create_ray_tracing_pipeline(
        self: &Arc<Self>,
        set_layouts: &[&DescriptorSetLayout],
        groups: &[ShaderGroupDesc],
        max_recursion_depth: u32,
    ) -> Result<RayTracingPipeline, BackendError> {
        validate_group_order(groups)?;

        if max_recursion_depth > self.ray_tracing_properties.max_ray_recursion_depth {
            return Err(BackendError::ResourceAccess {
                info: format!(
                    "Requested ray recursion depth {} exceeds the device limit {}",
                    max_recursion_depth, self.ray_tracing_properties.max_ray_recursion_depth
                ),
            });
        }

        let layout = self.create_pipeline_layout(set_layouts)?;

        let entry_point = CString::new("main").unwrap();
        let mut modules: Vec<vk::ShaderModule> = Vec::new();
        let mut stages: Vec<vk::PipelineShaderStageCreateInfo> = Vec::new();
        let mut vk_groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = Vec::new();

        let push_stage = |modules: &mut Vec<vk::ShaderModule>,
                              stages: &mut Vec<vk::PipelineShaderStageCreateInfo>,
                              spirv: &Bytes,
                              stage: vk::ShaderStageFlags,
                              name: &str|
         -> Result<u32, BackendError> {
            let module = self.create_shader_module(spirv, name)?;
            modules.push(module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(&entry_point)
                    .build(),
            );
            Ok(stages.len() as u32 - 1)
        };

        for group in groups {
            match group {
                ShaderGroupDesc::RayGen(spirv) => {
                    let stage = push_stage(
                        &mut modules,
                        &mut stages,
                        spirv,
                        vk::ShaderStageFlags::RAYGEN_KHR,
                        "raygen",
                    )?;
                    vk_groups.push(
                        vk::RayTracingShaderGroupCreateInfoKHR::builder()
                            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                            .general_shader(stage)
                            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                            .any_hit_shader(vk::SHADER_UNUSED_KHR)
                            .intersection_shader(vk::SHADER_UNUSED_KHR)
                            .build(),
                    );
                }
                ShaderGroupDesc::Miss(spirv) => {
                    let stage = push_stage(
                        &mut modules,
                        &mut stages,
                        spirv,
                        vk::ShaderStageFlags::MISS_KHR,
                        "miss",
                    )?;
                    vk_groups.push(
                        vk::RayTracingShaderGroupCreateInfoKHR::builder()
                            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                            .general_shader(stage)
                            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                            .any_hit_shader(vk::SHADER_UNUSED_KHR)
                            .intersection_shader(vk::SHADER_UNUSED_KHR)
                            .build(),
                    );
                }
                ShaderGroupDesc::TriangleHit { closest_hit } => {
                    let stage = push_stage(
                        &mut modules,
                        &mut stages,
                        closest_hit,
                        vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                        "closest hit",
                    )?;
                    vk_groups.push(
                        vk::RayTracingShaderGroupCreateInfoKHR::builder()
                            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                            .general_shader(vk::SHADER_UNUSED_KHR)
                            .closest_hit_shader(stage)
                            .any_hit_shader(vk::SHADER_UNUSED_KHR)
                            .intersection_shader(vk::SHADER_UNUSED_KHR)
                            .build(),
                    );
                }
                ShaderGroupDesc::ProceduralHit {
                    closest_hit,
                    intersection,
                } => {
                    let closest_hit_stage = push_stage(
                        &mut modules,
                        &mut stages,
                        closest_hit,
                        vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                        "closest hit",
                    )?;
                    let intersection_stage = push_stage(
                        &mut modules,
                        &mut stages,
                        intersection,
                        vk::ShaderStageFlags::INTERSECTION_KHR,
                        "intersection",
                    )?;
                    vk_groups.push(
                        vk::RayTracingShaderGroupCreateInfoKHR::builder()
                            .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                            .general_shader(vk::SHADER_UNUSED_KHR)
                            .closest_hit_shader(closest_hit_stage)
                            .any_hit_shader(vk::SHADER_UNUSED_KHR)
                            .intersection_shader(intersection_stage)
                            .build(),
                    );
                }
            }
        }

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stages(&stages)
            .groups(&vk_groups)
            .max_pipeline_ray_recursion_depth(max_recursion_depth)
            .layout(layout)
            .build();

        let pipeline = unsafe {
            self.ray_tracing_pipeline_ext.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        };

        for module in modules {
            unsafe {
                self.raw.destroy_shader_module(module, None);
            }
        }

        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err(err) => {
                unsafe {
                    self.raw.destroy_pipeline_layout(layout, None);
                }
                return Err(err.into());
            }
        };

        info!(
            "Created a ray tracing pipeline: {} groups, recursion depth {}",
            vk_groups.len(),
            max_recursion_depth
        );

        Ok(RayTracingPipeline {
            raw: pipeline,
            layout,
            group_count: vk_groups.len() as u32,
            device: self.clone(),
        })
    }

    pub fn create_compute_pipeline(
        self: &Arc<Self>,
        set_layouts: &[&DescriptorSetLayout],
        spirv: &[u8],
        name: &str,
    ) -> Result<ComputePipeline, BackendError> {
        let layout = self.create_pipeline_layout(set_layouts)?;
        let module = self.create_shader_module(spirv, name)?;

        let entry_point = CString::new("main").unwrap();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stage(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(module)
                    .name(&entry_point)
                    .build(),
            )
            .layout(layout)
            .build();

        let pipeline = unsafe {
            self.raw.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        };

        unsafe {
            self.raw.destroy_shader_module(module, None);
        }

        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe {
                    self.raw.destroy_pipeline_layout(layout, None);
                }
                return Err(err.into());
            }
        };

        Ok(ComputePipeline {
            raw: pipeline,
            layout,
            device: self.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> Bytes {
        Bytes::from_static(&[0u8; 8])
    }

    #[test]
    fn raygen_then_miss_then_hit_is_accepted() {
        let groups = [
            ShaderGroupDesc::RayGen(blob()),
            ShaderGroupDesc::Miss(blob()),
            ShaderGroupDesc::Miss(blob()),
            ShaderGroupDesc::TriangleHit { closest_hit: blob() },
            ShaderGroupDesc::ProceduralHit {
                closest_hit: blob(),
                intersection: blob(),
            },
        ];
        assert!(validate_group_order(&groups).is_ok());
    }

    #[test]
    fn pipeline_must_start_with_raygen() {
        let groups = [
            ShaderGroupDesc::Miss(blob()),
            ShaderGroupDesc::RayGen(blob()),
        ];
        assert!(validate_group_order(&groups).is_err());
    }

    #[test]
    fn hit_before_miss_is_rejected() {
        let groups = [
            ShaderGroupDesc::RayGen(blob()),
            ShaderGroupDesc::TriangleHit { closest_hit: blob() },
            ShaderGroupDesc::Miss(blob()),
        ];
        assert!(validate_group_order(&groups).is_err());
    }

    #[test]
    fn empty_group_list_is_rejected() {
        assert!(validate_group_order(&[]).is_err());
    }
}
