//! Vulkan pipeline creation from resolved pipeline descriptions.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;

use ash::vk;

use crate::backend::SHADER_IDENTIFIER_SIZE;
use crate::error::GpuError;
use crate::pipeline::{
    BindingKind, BindingLayout, BindingParameter, BindingVisibility, ComputePipelineDesc,
    GraphicsPipelineDesc, PipelineDesc, RaytracingPipelineDesc,
};
use crate::shader::{Shader, ShaderStage};

use super::conversion::texture_format;

/// Pipeline creation output.
pub struct CreatedPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub bind_point: vk::PipelineBindPoint,
    pub identifiers: HashMap<String, [u8; SHADER_IDENTIFIER_SIZE]>,
}

/// Create a pipeline for a resolved description.
pub fn create_pipeline(
    device: &ash::Device,
    rt_fns: Option<&ash::khr::ray_tracing_pipeline::Device>,
    rt_handle_size: u32,
    desc: &PipelineDesc,
) -> Result<CreatedPipeline, GpuError> {
    match desc {
        PipelineDesc::Graphics(desc) => create_graphics(device, desc),
        PipelineDesc::Compute(desc) => create_compute(device, desc),
        PipelineDesc::Mesh(_) => Err(GpuError::FeatureNotSupported(
            "mesh shading pipelines are not enabled on this backend".to_string(),
        )),
        PipelineDesc::Raytracing(desc) => {
            let rt_fns = rt_fns.ok_or_else(|| {
                GpuError::FeatureNotSupported("ray tracing pipelines".to_string())
            })?;
            create_raytracing(device, rt_fns, rt_handle_size, desc)
        }
    }
}

fn shader_module(device: &ash::Device, shader: &Shader) -> Result<vk::ShaderModule, GpuError> {
    let code = ash::util::read_spv(&mut Cursor::new(shader.bytecode())).map_err(|e| {
        GpuError::InvalidParameter(format!("shader bytecode is not valid SPIR-V: {e}"))
    })?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
    unsafe { device.create_shader_module(&create_info, None) }.map_err(GpuError::from)
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::ShaderResource => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::UnorderedAccess => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

fn stage_flags(visibility: BindingVisibility) -> vk::ShaderStageFlags {
    match visibility {
        BindingVisibility::All => vk::ShaderStageFlags::ALL,
        BindingVisibility::Vertex => vk::ShaderStageFlags::VERTEX,
        BindingVisibility::Pixel => vk::ShaderStageFlags::FRAGMENT,
        BindingVisibility::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

/// Build the pipeline layout: one descriptor set per table/descriptor
/// parameter, inline constants as push constants.
fn pipeline_layout(
    device: &ash::Device,
    layout: &BindingLayout,
) -> Result<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>), GpuError> {
    let mut set_layouts = Vec::new();
    let mut push_offset = 0u32;
    let mut push_ranges = Vec::new();

    for parameter in layout.parameters() {
        match parameter {
            BindingParameter::Constants { count, .. } => {
                push_ranges.push(vk::PushConstantRange {
                    stage_flags: vk::ShaderStageFlags::ALL,
                    offset: push_offset,
                    size: count * 4,
                });
                push_offset += count * 4;
            }
            BindingParameter::Descriptor { kind, register, .. } => {
                let binding = vk::DescriptorSetLayoutBinding::default()
                    .binding(*register)
                    .descriptor_type(descriptor_type(*kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL);
                let info = vk::DescriptorSetLayoutCreateInfo::default()
                    .bindings(std::slice::from_ref(&binding));
                let set_layout = unsafe { device.create_descriptor_set_layout(&info, None) }
                    .map_err(GpuError::from)?;
                set_layouts.push(set_layout);
            }
            BindingParameter::Table { ranges, visibility } => {
                let bindings: Vec<vk::DescriptorSetLayoutBinding> = ranges
                    .iter()
                    .map(|range| {
                        vk::DescriptorSetLayoutBinding::default()
                            .binding(range.base_register)
                            .descriptor_type(descriptor_type(range.kind))
                            .descriptor_count(range.count)
                            .stage_flags(stage_flags(*visibility))
                    })
                    .collect();
                let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
                let set_layout = unsafe { device.create_descriptor_set_layout(&info, None) }
                    .map_err(GpuError::from)?;
                set_layouts.push(set_layout);
            }
        }
    }

    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_ranges);
    let pipeline_layout =
        unsafe { device.create_pipeline_layout(&info, None) }.map_err(GpuError::from)?;
    Ok((pipeline_layout, set_layouts))
}

fn create_graphics(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc,
) -> Result<CreatedPipeline, GpuError> {
    let (layout, set_layouts) = pipeline_layout(device, &desc.layout)?;

    let vertex_module = shader_module(device, &desc.vertex)?;
    let pixel_module = desc
        .pixel
        .as_ref()
        .map(|pixel| shader_module(device, pixel))
        .transpose()?;

    let vertex_entry = CString::new(desc.vertex.entry_point()).unwrap();
    let pixel_entry = desc
        .pixel
        .as_ref()
        .map(|pixel| CString::new(pixel.entry_point()).unwrap());

    let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vertex_module)
        .name(&vertex_entry)];
    if let (Some(module), Some(entry)) = (pixel_module, &pixel_entry) {
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(entry),
        );
    }

    // Vertex data is pulled through buffer device addresses; no fixed
    // function vertex input.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let topology = match desc.topology {
        crate::pipeline::PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        crate::pipeline::PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        crate::pipeline::PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        crate::pipeline::PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    };
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(topology);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(if desc.rasterizer.wireframe {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        })
        .cull_mode(if desc.rasterizer.cull_back {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_stencil.depth_test)
        .depth_write_enable(desc.depth_stencil.depth_write)
        .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_formats
        .iter()
        .map(|_| {
            let mut attachment = vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA);
            if desc.blend.alpha_blend {
                attachment = attachment
                    .blend_enable(true)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .alpha_blend_op(vk::BlendOp::ADD);
            }
            attachment
        })
        .collect();
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc
        .color_formats
        .iter()
        .map(|format| texture_format(*format))
        .collect();
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if let Some(depth_format) = desc.depth_format {
        rendering_info = rendering_info.depth_attachment_format(texture_format(depth_format));
    }

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let result = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&create_info),
            None,
        )
    };

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        if let Some(module) = pixel_module {
            device.destroy_shader_module(module, None);
        }
    }

    let pipeline = result.map_err(|(_, e)| GpuError::from(e))?[0];
    Ok(CreatedPipeline {
        pipeline,
        layout,
        set_layouts,
        bind_point: vk::PipelineBindPoint::GRAPHICS,
        identifiers: HashMap::new(),
    })
}

fn create_compute(
    device: &ash::Device,
    desc: &ComputePipelineDesc,
) -> Result<CreatedPipeline, GpuError> {
    let (layout, set_layouts) = pipeline_layout(device, &desc.layout)?;
    let module = shader_module(device, &desc.shader)?;
    let entry = CString::new(desc.shader.entry_point()).unwrap();

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry);
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let result = unsafe {
        device.create_compute_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&create_info),
            None,
        )
    };
    unsafe { device.destroy_shader_module(module, None) };

    let pipeline = result.map_err(|(_, e)| GpuError::from(e))?[0];
    Ok(CreatedPipeline {
        pipeline,
        layout,
        set_layouts,
        bind_point: vk::PipelineBindPoint::COMPUTE,
        identifiers: HashMap::new(),
    })
}

fn rt_stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        other => panic!("shader stage {other:?} in a ray tracing pipeline"),
    }
}

fn create_raytracing(
    device: &ash::Device,
    rt_fns: &ash::khr::ray_tracing_pipeline::Device,
    handle_size: u32,
    desc: &RaytracingPipelineDesc,
) -> Result<CreatedPipeline, GpuError> {
    let (layout, set_layouts) = pipeline_layout(device, &desc.layout)?;

    let mut modules = Vec::with_capacity(desc.shaders.len());
    let mut entries = Vec::with_capacity(desc.shaders.len());
    for shader in &desc.shaders {
        modules.push(shader_module(device, &shader.shader)?);
        entries.push(CString::new(shader.shader.entry_point()).unwrap());
    }

    let stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
        .shaders
        .iter()
        .enumerate()
        .map(|(index, shader)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(rt_stage_flags(shader.shader.stage()))
                .module(modules[index])
                .name(&entries[index])
        })
        .collect();

    let stage_index = |export: &str| -> u32 {
        desc.shaders
            .iter()
            .position(|s| s.export == export)
            .unwrap_or_else(|| panic!("hit group references unknown export '{export}'"))
            as u32
    };

    // Group order defines identifier order: general groups first (raygen
    // and miss), then one triangles group per hit group.
    let mut groups = Vec::new();
    let mut group_names = Vec::new();
    for shader in &desc.shaders {
        if matches!(
            shader.shader.stage(),
            ShaderStage::RayGeneration | ShaderStage::Miss
        ) {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(stage_index(&shader.export))
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
            group_names.push(shader.export.clone());
        }
    }
    for hit_group in &desc.hit_groups {
        let group_type = if hit_group.intersection.is_some() {
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        } else {
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        };
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(group_type)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(
                    hit_group
                        .closest_hit
                        .as_deref()
                        .map_or(vk::SHADER_UNUSED_KHR, &stage_index),
                )
                .any_hit_shader(
                    hit_group
                        .any_hit
                        .as_deref()
                        .map_or(vk::SHADER_UNUSED_KHR, &stage_index),
                )
                .intersection_shader(
                    hit_group
                        .intersection
                        .as_deref()
                        .map_or(vk::SHADER_UNUSED_KHR, &stage_index),
                ),
        );
        group_names.push(hit_group.name.clone());
    }

    let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
        .layout(layout);

    let result = unsafe {
        rt_fns.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            std::slice::from_ref(&create_info),
            None,
        )
    };
    for module in modules {
        unsafe { device.destroy_shader_module(module, None) };
    }
    let pipeline = result.map_err(|(_, e)| GpuError::from(e))?[0];

    let handle_data = unsafe {
        rt_fns.get_ray_tracing_shader_group_handles(
            pipeline,
            0,
            groups.len() as u32,
            groups.len() * handle_size as usize,
        )
    }
    .map_err(GpuError::from)?;

    let mut identifiers = HashMap::new();
    for (index, name) in group_names.into_iter().enumerate() {
        let mut identifier = [0u8; SHADER_IDENTIFIER_SIZE];
        let start = index * handle_size as usize;
        let len = (handle_size as usize).min(SHADER_IDENTIFIER_SIZE);
        identifier[..len].copy_from_slice(&handle_data[start..start + len]);
        identifiers.insert(name, identifier);
    }

    Ok(CreatedPipeline {
        pipeline,
        layout,
        set_layouts,
        bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
        identifiers,
    })
}
