use ash::vk;
use crate::gpu::contexts::resource_ctx::state_tracker::ResolvedRange;
use crate::gpu::types::*;

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::Undefined => vk::Format::UNDEFINED,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32G32Float => vk::Format::R32G32_SFLOAT,
        Format::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
        Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D16UnormS8Uint => vk::Format::D16_UNORM_S8_UINT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32Sfloat => vk::Format::D32_SFLOAT,
        Format::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        Format::Bc1RgbUnormBlock => vk::Format::BC1_RGB_UNORM_BLOCK,
        Format::Bc1RgbSrgbBlock => vk::Format::BC1_RGB_SRGB_BLOCK,
        Format::Bc1RgbaUnormBlock => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Format::Bc1RgbaSrgbBlock => vk::Format::BC1_RGBA_SRGB_BLOCK,
        Format::Bc2UnormBlock => vk::Format::BC2_UNORM_BLOCK,
        Format::Bc2SrgbBlock => vk::Format::BC2_SRGB_BLOCK,
        Format::Bc3UnormBlock => vk::Format::BC3_UNORM_BLOCK,
        Format::Bc3SrgbBlock => vk::Format::BC3_SRGB_BLOCK,
        Format::Bc5UnormBlock => vk::Format::BC5_UNORM_BLOCK,
        Format::Bc5SnormBlock => vk::Format::BC5_SNORM_BLOCK,
    }
}

/// Surface formats the swapchain may end up with. Anything else reports
/// `Undefined`.
pub fn surface_format(format: vk::Format) -> Format {
    match format {
        vk::Format::B8G8R8A8_SRGB => Format::B8G8R8A8Srgb,
        vk::Format::B8G8R8A8_UNORM => Format::B8G8R8A8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::R8G8B8A8Srgb,
        vk::Format::R8G8B8A8_UNORM => Format::R8G8B8A8Unorm,
        _ => Format::Undefined,
    }
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Image layout, pipeline stages and access mask a resource has while in
/// `state`.
pub fn state(state: ResourceState) -> (vk::ImageLayout, vk::PipelineStageFlags2, vk::AccessFlags2) {
    match state {
        ResourceState::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::NONE,
        ),
        ResourceState::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        ResourceState::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        ResourceState::GeneralRead => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::SHADER_READ
                | vk::AccessFlags2::UNIFORM_READ
                | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags2::INDEX_READ
                | vk::AccessFlags2::INDIRECT_COMMAND_READ,
        ),
        ResourceState::GeneralWrite => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        ),
        ResourceState::ColorTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthTarget => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        ResourceState::Present => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::NONE,
        ),
    }
}

pub fn layout(state: ResourceState) -> vk::ImageLayout {
    self::state(state).0
}

pub fn image_barrier(
    image: vk::Image,
    format: Format,
    range: vk::ImageSubresourceRange,
    old_state: ResourceState,
    new_state: ResourceState,
) -> vk::ImageMemoryBarrier2<'static> {
    let (old_layout, src_stage, src_access) = self::state(old_state);
    let (new_layout, dst_stage, dst_access) = self::state(new_state);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect(format),
            ..range
        })
}

pub fn buffer_barrier(
    buffer: vk::Buffer,
    old_state: ResourceState,
    new_state: ResourceState,
) -> vk::BufferMemoryBarrier2<'static> {
    let (_, src_stage, src_access) = self::state(old_state);
    let (_, dst_stage, dst_access) = self::state(new_state);
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

pub fn subresource_range(range: SubresourceRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: range.base_mip_level,
        level_count: if range.mip_level_count == REMAINING_MIP_LEVELS {
            vk::REMAINING_MIP_LEVELS
        } else {
            range.mip_level_count
        },
        base_array_layer: range.base_array_layer,
        layer_count: if range.array_layer_count == REMAINING_ARRAY_LAYERS {
            vk::REMAINING_ARRAY_LAYERS
        } else {
            range.array_layer_count
        },
    }
}

pub fn resolved_range(range: ResolvedRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: range.base_mip_level,
        level_count: range.mip_level_count,
        base_array_layer: range.base_array_layer,
        layer_count: range.array_layer_count,
    }
}

pub fn subresource_layers(
    format: Format,
    mip_level: u32,
    base_array_layer: u32,
    layer_count: u32,
) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect(format),
        mip_level,
        base_array_layer,
        layer_count,
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    // Copies move any buffer through the transfer states.
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    flags
}

pub fn image_usage(format: Format) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    if format.is_depth() {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    } else if !format.is_compressed() {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if !format.is_srgb() {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
    }
    flags
}

pub fn image_type(texture_type: TextureType) -> vk::ImageType {
    match texture_type {
        TextureType::Texture3D => vk::ImageType::TYPE_3D,
        _ => vk::ImageType::TYPE_2D,
    }
}

pub fn view_type(texture_type: TextureType, array_layers: u32) -> vk::ImageViewType {
    match texture_type {
        TextureType::Texture2D if array_layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureType::Texture2D => vk::ImageViewType::TYPE_2D,
        TextureType::Texture2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureType::Texture3D => vk::ImageViewType::TYPE_3D,
        TextureType::TextureCube if array_layers > 6 => vk::ImageViewType::CUBE_ARRAY,
        TextureType::TextureCube => vk::ImageViewType::CUBE,
    }
}

pub fn shader_stages(stages: ShaderStage) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStage::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStage::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStage::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub fn input_rate(rate: InputRate) -> vk::VertexInputRate {
    match rate {
        InputRate::Vertex => vk::VertexInputRate::VERTEX,
        InputRate::Instance => vk::VertexInputRate::INSTANCE,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::Front => vk::CullModeFlags::FRONT,
    }
}

pub fn topology(primitive: PrimitiveType) -> vk::PrimitiveTopology {
    match primitive {
        PrimitiveType::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveType::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveType::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveType::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub fn blend_state(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let blend = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD);
    let (src, dst) = match mode {
        BlendMode::Opaque => return blend.blend_enable(false),
        BlendMode::Alpha => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
        BlendMode::Premultiplied => (vk::BlendFactor::ONE, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
        BlendMode::Additive => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE),
        BlendMode::Multiply => (vk::BlendFactor::DST_COLOR, vk::BlendFactor::ZERO),
        BlendMode::Modulate => (vk::BlendFactor::DST_COLOR, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
    };
    blend
        .blend_enable(true)
        .src_color_blend_factor(src)
        .dst_color_blend_factor(dst)
}

pub fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub fn offset(x: i32, y: i32, z: i32) -> vk::Offset3D {
    vk::Offset3D { x, y, z }
}

pub fn extent(width: u32, height: u32, depth: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: width.max(1),
        height: height.max(1),
        depth: depth.max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(aspect(Format::D32Sfloat), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        );
        assert_eq!(aspect(Format::R8G8B8A8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn states_map_to_layouts() {
        assert_eq!(layout(ResourceState::Present), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(layout(ResourceState::GeneralWrite), vk::ImageLayout::GENERAL);
        let (_, stage, access) = state(ResourceState::TransferDst);
        assert_eq!(stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(access, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn remaining_sentinels_map_to_vulkan_sentinels() {
        let range = subresource_range(SubresourceRange::ALL);
        assert_eq!(range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(range.layer_count, vk::REMAINING_ARRAY_LAYERS);
    }

    #[test]
    fn srgb_and_compressed_images_skip_storage_usage() {
        assert!(!image_usage(Format::R8G8B8A8Srgb).contains(vk::ImageUsageFlags::STORAGE));
        assert!(image_usage(Format::R8G8B8A8Unorm).contains(vk::ImageUsageFlags::STORAGE));
        assert!(!image_usage(Format::Bc3UnormBlock).contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }
}
