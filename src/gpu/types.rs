use bitflags::bitflags;
use crate::gpu::handle::{BindingLayout, Buffer, DescriptorTable, Sampler, Shader, Texture};

/// Expands to every mip level from the base level to the end of the chain.
pub const REMAINING_MIP_LEVELS: u32 = u32::MAX;
/// Expands to every array layer from the base layer to the last layer.
pub const REMAINING_ARRAY_LAYERS: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    #[default]
    Undefined,

    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Srgb,
    B8G8R8A8Unorm,
    R32Uint,
    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,

    D16Unorm,
    D16UnormS8Uint,
    D24UnormS8Uint,
    D32Sfloat,
    D32SfloatS8Uint,

    Bc1RgbUnormBlock,
    Bc1RgbSrgbBlock,
    Bc1RgbaUnormBlock,
    Bc1RgbaSrgbBlock,
    Bc2UnormBlock,
    Bc2SrgbBlock,
    Bc3UnormBlock,
    Bc3SrgbBlock,
    Bc5UnormBlock,
    Bc5SnormBlock,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D16Unorm
                | Self::D16UnormS8Uint
                | Self::D24UnormS8Uint
                | Self::D32Sfloat
                | Self::D32SfloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Self::D16UnormS8Uint | Self::D24UnormS8Uint | Self::D32SfloatS8Uint
        )
    }

    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            Self::R8G8B8A8Srgb
                | Self::B8G8R8A8Srgb
                | Self::Bc1RgbSrgbBlock
                | Self::Bc1RgbaSrgbBlock
                | Self::Bc2SrgbBlock
                | Self::Bc3SrgbBlock
        )
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1RgbUnormBlock
                | Self::Bc1RgbSrgbBlock
                | Self::Bc1RgbaUnormBlock
                | Self::Bc1RgbaSrgbBlock
                | Self::Bc2UnormBlock
                | Self::Bc2SrgbBlock
                | Self::Bc3UnormBlock
                | Self::Bc3SrgbBlock
                | Self::Bc5UnormBlock
                | Self::Bc5SnormBlock
        )
    }

    /// Bytes per 4x4 block, or 0 for uncompressed formats.
    pub fn compressed_block_size(self) -> u32 {
        match self {
            Self::Bc1RgbUnormBlock
            | Self::Bc1RgbSrgbBlock
            | Self::Bc1RgbaUnormBlock
            | Self::Bc1RgbaSrgbBlock => 8,
            f if f.is_compressed() => 16,
            _ => 0,
        }
    }

    /// Bytes per texel, or 0 for compressed and undefined formats.
    pub fn pixel_size(self) -> u32 {
        match self {
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8Srgb
            | Self::B8G8R8A8Unorm
            | Self::B8G8R8A8Srgb
            | Self::R32Uint
            | Self::R32Float
            | Self::D32Sfloat
            | Self::D24UnormS8Uint => 4,
            Self::R32G32Float | Self::D32SfloatS8Uint => 8,
            Self::R32G32B32Float => 12,
            Self::R32G32B32A32Float => 16,
            Self::D16Unorm => 2,
            Self::D16UnormS8Uint => 3,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureType {
    #[default]
    Texture2D,
    Texture3D,
    TextureCube,
    Texture2DArray,
}

/// Last requested access of a buffer or texture subresource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceState {
    #[default]
    Undefined,
    TransferSrc,
    TransferDst,
    GeneralRead,
    GeneralWrite,
    ColorTarget,
    DepthTarget,
    Present,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStage: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const ALL = Self::VERTEX.bits() | Self::FRAGMENT.bits() | Self::COMPUTE.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER = 1 << 4;
        const INDIRECT = 1 << 5;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    #[default]
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InputRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    #[default]
    Alpha,
    Premultiplied,
    Additive,
    Multiply,
    Modulate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    #[default]
    DontCare,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 0.0,
            h: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// A block of mip levels and array layers. Counts may be the
/// `REMAINING_*` sentinels, which are resolved against the texture's extents
/// when the range is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}

impl SubresourceRange {
    pub const ALL: Self = Self {
        base_mip_level: 0,
        mip_level_count: REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        array_layer_count: REMAINING_ARRAY_LAYERS,
    };

    /// Mip 0 of layer 0, the subresource render attachments draw into.
    pub const BASE: Self = Self {
        base_mip_level: 0,
        mip_level_count: 1,
        base_array_layer: 0,
        array_layer_count: 1,
    };

    pub const fn new(
        base_mip_level: u32,
        mip_level_count: u32,
        base_array_layer: u32,
        array_layer_count: u32,
    ) -> Self {
        Self {
            base_mip_level,
            mip_level_count,
            base_array_layer,
            array_layer_count,
        }
    }

    /// Every mip level of the given layers.
    pub const fn layers(base_array_layer: u32, array_layer_count: u32) -> Self {
        Self::new(0, REMAINING_MIP_LEVELS, base_array_layer, array_layer_count)
    }

    /// The given mip levels of every layer.
    pub const fn mips(base_mip_level: u32, mip_level_count: u32) -> Self {
        Self::new(base_mip_level, mip_level_count, 0, REMAINING_ARRAY_LAYERS)
    }
}

impl Default for SubresourceRange {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferDesc {
    pub size_bytes: u64,
    pub usage: BufferUsage,
    pub host_visible: bool,
    pub debug_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub texture_type: TextureType,
    pub debug_name: Option<String>,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format: Format::Undefined,
            texture_type: TextureType::Texture2D,
            debug_name: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplerDesc {
    pub linear_filter: bool,
    pub repeat_uv: bool,
    pub debug_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingLayoutEntry {
    pub binding: u32,
    pub count: u32,
    pub visibility: ShaderStage,
    pub ty: DescriptorType,
}

impl Default for BindingLayoutEntry {
    fn default() -> Self {
        Self {
            binding: 0,
            count: 1,
            visibility: ShaderStage::COMPUTE,
            ty: DescriptorType::UniformBuffer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: Buffer,
        offset: u64,
        /// 0 binds the rest of the buffer.
        range: u64,
    },
    Texture {
        texture: Texture,
        /// Falls back to the context's default sampler for sampled images.
        sampler: Option<Sampler>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorUpdate {
    pub table: DescriptorTable,
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
    pub skip_update: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureBarrier {
    pub texture: Texture,
    pub range: SubresourceRange,
    pub old_state: ResourceState,
    pub new_state: ResourceState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: Buffer,
    pub old_state: ResourceState,
    pub new_state: ResourceState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: InputRate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub layer_count: u32,
    pub level_count: u32,
    pub format: Format,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ColorAttachment {
    pub texture: Texture,
    pub resolve_target: Option<Texture>,
    pub clear_color: [f32; 4],
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

impl ColorAttachment {
    pub fn set_clear_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        self.clear_color = [r, g, b, a];
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthAttachment {
    pub texture: Texture,
    pub clear_depth: f32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

impl Default for DepthAttachment {
    fn default() -> Self {
        Self {
            texture: Texture::default(),
            clear_depth: 1.0,
            load_op: LoadOp::DontCare,
            store_op: StoreOp::DontCare,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureBlitRegion {
    pub src_mip_level: u32,
    pub src_base_array_layer: u32,
    pub src_layer_count: u32,
    pub src_x: i32,
    pub src_y: i32,
    pub src_z: i32,
    pub src_width: u32,
    pub src_height: u32,
    pub src_depth: u32,

    pub dst_mip_level: u32,
    pub dst_base_array_layer: u32,
    pub dst_layer_count: u32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_z: i32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub dst_depth: u32,
}

impl Default for TextureBlitRegion {
    fn default() -> Self {
        Self {
            src_mip_level: 0,
            src_base_array_layer: 0,
            src_layer_count: 1,
            src_x: 0,
            src_y: 0,
            src_z: 0,
            src_width: 1,
            src_height: 1,
            src_depth: 1,
            dst_mip_level: 0,
            dst_base_array_layer: 0,
            dst_layer_count: 1,
            dst_x: 0,
            dst_y: 0,
            dst_z: 0,
            dst_width: 1,
            dst_height: 1,
            dst_depth: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureCopyRegion {
    pub src_texture: Texture,
    pub src_mip_level: u32,
    pub src_base_array_layer: u32,
    pub src_layer_count: u32,
    pub src_x: i32,
    pub src_y: i32,
    pub src_z: i32,

    pub dst_texture: Texture,
    pub dst_mip_level: u32,
    pub dst_base_array_layer: u32,
    pub dst_layer_count: u32,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_z: i32,

    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Default for TextureCopyRegion {
    fn default() -> Self {
        Self {
            src_texture: Texture::default(),
            src_mip_level: 0,
            src_base_array_layer: 0,
            src_layer_count: 1,
            src_x: 0,
            src_y: 0,
            src_z: 0,
            dst_texture: Texture::default(),
            dst_mip_level: 0,
            dst_base_array_layer: 0,
            dst_layer_count: 1,
            dst_x: 0,
            dst_y: 0,
            dst_z: 0,
            width: 1,
            height: 1,
            depth: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTextureCopyRegion {
    pub buffer_offset: u64,
    /// 0 means tightly packed.
    pub buffer_row_length: u32,
    /// 0 means tightly packed.
    pub buffer_image_height: u32,

    pub texture: Texture,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub texture_x: i32,
    pub texture_y: i32,
    pub texture_z: i32,

    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl BufferTextureCopyRegion {
    pub fn subresource_range(&self) -> SubresourceRange {
        SubresourceRange::new(self.mip_level, 1, self.base_array_layer, self.layer_count)
    }
}

impl Default for BufferTextureCopyRegion {
    fn default() -> Self {
        Self {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            texture: Texture::default(),
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
            texture_x: 0,
            texture_y: 0,
            texture_z: 0,
            width: 1,
            height: 1,
            depth: 1,
        }
    }
}

/// At most this many binding layouts per pipeline.
pub const MAX_PIPELINE_LAYOUTS: usize = 8;
/// At most this many color attachments per graphics pipeline.
pub const MAX_COLOR_ATTACHMENTS: usize = 7;

#[derive(Clone, Debug, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub vertex_shader: Shader,
    pub fragment_shader: Shader,
    pub layouts: Vec<BindingLayout>,
    pub input_bindings: Vec<VertexInputBinding>,
    pub input_attributes: Vec<VertexInputAttribute>,
    pub color_formats: Vec<Format>,
    pub depth_format: Format,
    pub push_constant_size: u32,
    pub push_constant_stages: ShaderStage,
    pub cull_mode: CullMode,
    pub blend_mode: BlendMode,
    pub polygon_mode: PolygonMode,
    pub primitive_type: PrimitiveType,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            vertex_shader: Shader::default(),
            fragment_shader: Shader::default(),
            layouts: Vec::new(),
            input_bindings: Vec::new(),
            input_attributes: Vec::new(),
            color_formats: Vec::new(),
            depth_format: Format::Undefined,
            push_constant_size: 0,
            push_constant_stages: ShaderStage::ALL,
            cull_mode: CullMode::Back,
            blend_mode: BlendMode::Alpha,
            polygon_mode: PolygonMode::Fill,
            primitive_type: PrimitiveType::TriangleList,
        }
    }
}

impl GraphicsPipelineDesc {
    pub fn set_shaders(mut self, vertex: Shader, fragment: Shader) -> Self {
        self.vertex_shader = vertex;
        self.fragment_shader = fragment;
        self
    }

    pub fn set_layouts(mut self, layouts: &[BindingLayout]) -> Self {
        self.layouts = layouts.iter().copied().take(MAX_PIPELINE_LAYOUTS).collect();
        self
    }

    pub fn add_layout(mut self, layout: BindingLayout) -> Self {
        if self.layouts.len() < MAX_PIPELINE_LAYOUTS {
            self.layouts.push(layout);
        }
        self
    }

    pub fn set_vertex_input(
        mut self,
        bindings: &[VertexInputBinding],
        attributes: &[VertexInputAttribute],
    ) -> Self {
        self.input_bindings = bindings.to_vec();
        self.input_attributes = attributes.to_vec();
        self
    }

    pub fn add_color_attachment(mut self, format: Format) -> Self {
        if self.color_formats.len() < MAX_COLOR_ATTACHMENTS {
            self.color_formats.push(format);
        }
        self
    }

    pub fn set_depth_stencil(mut self, format: Format) -> Self {
        self.depth_format = format;
        self
    }

    pub fn set_push_constants(mut self, size: u32, stages: ShaderStage) -> Self {
        self.push_constant_size = size;
        self.push_constant_stages = stages;
        self
    }

    pub fn set_rasterization(
        mut self,
        cull_mode: CullMode,
        blend_mode: BlendMode,
        polygon_mode: PolygonMode,
        primitive_type: PrimitiveType,
    ) -> Self {
        self.cull_mode = cull_mode;
        self.blend_mode = blend_mode;
        self.polygon_mode = polygon_mode;
        self.primitive_type = primitive_type;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComputePipelineDesc {
    pub compute_shader: Shader,
    pub layouts: Vec<BindingLayout>,
    pub push_constant_size: u32,
}

impl ComputePipelineDesc {
    pub fn set_shader(mut self, shader: Shader) -> Self {
        self.compute_shader = shader;
        self
    }

    pub fn set_layouts(mut self, layouts: &[BindingLayout]) -> Self {
        self.layouts = layouts.iter().copied().take(MAX_PIPELINE_LAYOUTS).collect();
        self
    }

    pub fn set_layout(self, layout: BindingLayout) -> Self {
        self.set_layouts(&[layout])
    }

    pub fn set_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_are_detected() {
        assert!(Format::D32Sfloat.is_depth());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::R8G8B8A8Unorm.is_depth());
        assert!(!Format::D32Sfloat.has_stencil());
    }

    #[test]
    fn compressed_formats_report_block_sizes() {
        assert_eq!(Format::Bc1RgbaSrgbBlock.compressed_block_size(), 8);
        assert_eq!(Format::Bc3UnormBlock.compressed_block_size(), 16);
        assert_eq!(Format::R32Float.compressed_block_size(), 0);
        assert_eq!(Format::Bc5SnormBlock.pixel_size(), 0);
    }

    #[test]
    fn pixel_sizes_match_layout() {
        assert_eq!(Format::R8G8B8A8Unorm.pixel_size(), 4);
        assert_eq!(Format::R32G32B32Float.pixel_size(), 12);
        assert_eq!(Format::R32G32B32A32Float.pixel_size(), 16);
        assert_eq!(Format::D16Unorm.pixel_size(), 2);
    }

    #[test]
    fn pipeline_builder_caps_attachments() {
        let mut desc = GraphicsPipelineDesc::default();
        for _ in 0..10 {
            desc = desc.add_color_attachment(Format::R8G8B8A8Unorm);
        }
        assert_eq!(desc.color_formats.len(), MAX_COLOR_ATTACHMENTS);
    }
}
