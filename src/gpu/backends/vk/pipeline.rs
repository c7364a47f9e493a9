use std::io::Cursor;
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use crate::gpu::backends::vk::conv;
use crate::gpu::types::{ComputePipelineDesc, Format, GraphicsPipelineDesc, ShaderStage};

pub struct VulkanShader {
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
}

impl VulkanShader {
    /// `code` is SPIR-V with entry point `main`.
    pub fn new(stage: ShaderStage, code: &[u8], device: &ash::Device) -> Result<Self> {
        if stage.bits().count_ones() != 1 {
            return Err(eyre!("A shader must target exactly one stage, got {:?}", stage));
        }
        let words = ash::util::read_spv(&mut Cursor::new(code))?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { device.create_shader_module(&info, None)? };
        Ok(Self { module, stage })
    }
}

pub struct VulkanPipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

impl VulkanPipeline {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.raw, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn create_pipeline_layout(
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
    push_constant_stages: vk::ShaderStageFlags,
    device: &ash::Device,
) -> Result<vk::PipelineLayout> {
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: push_constant_stages,
        offset: 0,
        size: push_constant_size,
    }];
    let ranges: &[vk::PushConstantRange] = if push_constant_size > 0 {
        &push_constant_ranges
    } else {
        &[]
    };
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(ranges);
    Ok(unsafe { device.create_pipeline_layout(&layout_info, None)? })
}

/// Builds a graphics pipeline for dynamic rendering. Viewport and scissor
/// are dynamic state.
pub fn create_graphics_pipeline(
    desc: &GraphicsPipelineDesc,
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
    set_layouts: &[vk::DescriptorSetLayout],
    device: &ash::Device,
) -> Result<VulkanPipeline> {
    let layout = create_pipeline_layout(
        set_layouts,
        desc.push_constant_size,
        conv::shader_stages(desc.push_constant_stages),
        device,
    )?;

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment)
            .name(c"main"),
    ];

    let bindings = desc
        .input_bindings
        .iter()
        .map(|binding| vk::VertexInputBindingDescription {
            binding: binding.binding,
            stride: binding.stride,
            input_rate: conv::input_rate(binding.input_rate),
        })
        .collect::<Vec<_>>();
    let attributes = desc
        .input_attributes
        .iter()
        .map(|attribute| vk::VertexInputAttributeDescription {
            location: attribute.location,
            binding: attribute.binding,
            format: conv::format(attribute.format),
            offset: attribute.offset,
        })
        .collect::<Vec<_>>();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(conv::topology(desc.primitive_type))
        .primitive_restart_enable(false);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(conv::polygon_mode(desc.polygon_mode))
        .line_width(1.0)
        .cull_mode(conv::cull_mode(desc.cull_mode))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    // 1 sample per pixel means no multisampling
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .min_sample_shading(1.0);

    let depth_enabled = desc.depth_format != Format::Undefined;
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth_enabled)
        .depth_write_enable(depth_enabled)
        .depth_compare_op(if depth_enabled {
            vk::CompareOp::LESS_OR_EQUAL
        } else {
            vk::CompareOp::ALWAYS
        })
        .depth_bounds_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .stencil_test_enable(false);

    let blend_attachments = desc
        .color_formats
        .iter()
        .map(|_| conv::blend_state(desc.blend_mode))
        .collect::<Vec<_>>();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .logic_op(vk::LogicOp::COPY)
        .attachments(&blend_attachments);

    let viewport_state = vk::PipelineViewportStateCreateInfo {
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_info = vk::PipelineDynamicStateCreateInfo::default()
        .dynamic_states(&dynamic_states);

    let color_formats = desc
        .color_formats
        .iter()
        .map(|format| conv::format(*format))
        .collect::<Vec<_>>();
    let depth_format = conv::format(desc.depth_format);
    let stencil_format = if desc.depth_format.has_stencil() {
        depth_format
    } else {
        vk::Format::UNDEFINED
    };
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .push_next(&mut rendering_info)
        .stages(&shader_stages)
        .layout(layout)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .depth_stencil_state(&depth_stencil)
        .dynamic_state(&dynamic_info);

    let pipeline = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    match pipeline {
        Ok(pipelines) if !pipelines.is_empty() => Ok(VulkanPipeline {
            raw: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        }),
        Ok(_) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(eyre!("Driver returned no graphics pipeline"))
        }
        Err((_, err)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(eyre!("Failed to create graphics pipeline: {}", err))
        }
    }
}

pub fn create_compute_pipeline(
    desc: &ComputePipelineDesc,
    shader: vk::ShaderModule,
    set_layouts: &[vk::DescriptorSetLayout],
    device: &ash::Device,
) -> Result<VulkanPipeline> {
    let layout = create_pipeline_layout(
        set_layouts,
        desc.push_constant_size,
        vk::ShaderStageFlags::COMPUTE,
        device,
    )?;

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader)
        .name(c"main");
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let pipeline = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    match pipeline {
        Ok(pipelines) if !pipelines.is_empty() => Ok(VulkanPipeline {
            raw: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        }),
        Ok(_) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(eyre!("Driver returned no compute pipeline"))
        }
        Err((_, err)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(eyre!("Failed to create compute pipeline: {}", err))
        }
    }
}
