pub mod backends;
pub mod config;
pub mod contexts;
pub mod handle;
pub mod types;

use color_eyre::Result;
use crate::gpu::contexts::resource_ctx::state_tracker::PendingTransition;
use crate::gpu::handle::*;
use crate::gpu::types::*;

/// Records commands into one native command buffer.
///
/// Transition requests are tracked against the context's resource states and
/// batched; the batch is emitted before the next draw, dispatch, copy, blit or
/// render pass begin, or explicitly with [`CommandList::flush_transitions`].
pub trait CommandList {
    /// Transitions every color attachment (and resolve target) to
    /// `ColorTarget` and the depth attachment to `DepthTarget`, then begins
    /// dynamic rendering.
    fn begin_rendering(&mut self, color: &[ColorAttachment], depth: Option<&DepthAttachment>);
    fn end_rendering(&mut self);
    fn begin_compute(&mut self);
    fn end_compute(&mut self);

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[Buffer], offsets: &[u64]);
    fn bind_index_buffer(&mut self, buffer: Buffer, offset: u64, is_uint32: bool);
    fn bind_pipeline(&mut self, pipeline: Pipeline);
    fn bind_descriptor_table(&mut self, set: u32, table: DescriptorTable);
    fn push_constants(&mut self, stages: ShaderStage, offset: u32, data: &[u8]);
    fn push_constant_value<T: bytemuck::Pod>(&mut self, stages: ShaderStage, offset: u32, value: &T)
    where
        Self: Sized,
    {
        self.push_constants(stages, offset, bytemuck::bytes_of(value));
    }

    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, scissor: Rect2D);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn draw_indexed_indirect(&mut self, buffer: Buffer, offset: u64, draw_count: u32, stride: u32);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn transition_buffer(&mut self, buffer: Buffer, new_state: ResourceState);
    fn transition_texture(&mut self, texture: Texture, new_state: ResourceState) {
        self.transition_texture_range(texture, SubresourceRange::ALL, new_state);
    }
    fn transition_texture_range(&mut self, texture: Texture, range: SubresourceRange, new_state: ResourceState);
    /// Emits every pending transition as one barrier batch.
    fn flush_transitions(&mut self);
    /// Flushes pending transitions, then emits the given barriers as is. The
    /// tracked states are updated to each barrier's new state.
    fn pipeline_barrier(&mut self, buffer_barriers: &[BufferBarrier], texture_barriers: &[TextureBarrier]);
    fn pending_transitions(&self) -> &[PendingTransition];

    /// Moves `src` to `TransferSrc` and `dst` to `TransferDst` before copying.
    fn copy_buffer(&mut self, src: Buffer, dst: Buffer, regions: &[BufferCopyRegion]);
    fn copy_texture(&mut self, regions: &[TextureCopyRegion]);
    fn copy_buffer_to_texture(&mut self, buffer: Buffer, regions: &[BufferTextureCopyRegion]);
    fn copy_texture_to_buffer(&mut self, buffer: Buffer, regions: &[BufferTextureCopyRegion]);
    /// Moves the blitted subresources of `src` and `dst` into the given
    /// states before blitting.
    fn blit_texture(
        &mut self,
        src: Texture,
        src_state: ResourceState,
        dst: Texture,
        dst_state: ResourceState,
        regions: &[TextureBlitRegion],
        linear_filter: bool,
    );
}

/// Everything a client needs from a device: frame lifecycle, resources,
/// pipelines and command recording.
///
/// Batched creation calls are all-or-nothing. Destruction of a stale handle is
/// ignored with a warning.
pub trait Context: Sized {
    type CommandList: CommandList;

    /// Blocks until the device has finished all submitted work.
    fn wait_idle(&mut self) -> bool;

    /// Waits for the current frame slot to retire and hands out a recording
    /// command list together with the slot index. `None` when the slot did
    /// not retire in time or no swapchain image could be acquired; check
    /// [`Context::needs_resize`] in that case.
    fn begin_frame(&mut self) -> Option<(Self::CommandList, u32)>;
    /// Submits the frame and presents when the context has a surface.
    fn end_frame(&mut self, cmd: Self::CommandList) -> bool;
    fn needs_resize(&self) -> bool;
    fn frame_index(&self) -> u32;
    fn frames_in_flight(&self) -> u32;

    fn create_buffers(&mut self, descs: &[BufferDesc]) -> Option<Vec<Buffer>>;
    fn destroy_buffers(&mut self, buffers: &[Buffer]);
    fn create_textures(&mut self, descs: &[TextureDesc]) -> Option<Vec<Texture>>;
    fn destroy_textures(&mut self, textures: &[Texture]);
    fn create_samplers(&mut self, descs: &[SamplerDesc]) -> Option<Vec<Sampler>>;
    fn destroy_samplers(&mut self, samplers: &[Sampler]);
    /// Linear, repeating sampler created with the context.
    fn default_sampler(&self) -> Sampler;

    fn create_fences(&mut self, count: u32, signaled: bool) -> Option<Vec<Fence>>;
    fn destroy_fences(&mut self, fences: &[Fence]);
    /// `false` on timeout.
    fn wait_for_fences(&self, fences: &[Fence], wait_all: bool, timeout_ns: u64) -> bool;
    fn reset_fences(&self, fences: &[Fence]) -> bool;

    fn create_shader(&mut self, stage: ShaderStage, code: &[u8]) -> Result<Shader>;
    fn destroy_shader(&mut self, shader: Shader);
    fn create_binding_layout(&mut self, entries: &[BindingLayoutEntry]) -> Result<BindingLayout>;
    fn destroy_binding_layout(&mut self, layout: BindingLayout);
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<Pipeline>;
    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<Pipeline>;
    fn destroy_pipeline(&mut self, pipeline: Pipeline);
    fn create_descriptor_tables(&mut self, layout: BindingLayout, count: u32) -> Option<Vec<DescriptorTable>>;
    fn destroy_descriptor_tables(&mut self, tables: &[DescriptorTable]);
    fn update_descriptor_tables(&mut self, updates: &[DescriptorUpdate]);

    /// Recreates the swapchain for a new surface size. Previously returned
    /// back buffer handles become stale.
    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<()>;
    /// Texture of the swapchain image acquired for the current frame.
    fn back_buffer(&self) -> Option<Texture>;
    fn swapchain_extent(&self) -> Option<Extent2D>;

    fn update_host_visible_buffer(&mut self, buffer: Buffer, offset: u64, data: &[u8]) -> bool;
    fn read_host_visible_buffer(&self, buffer: Buffer, offset: u64, out: &mut [u8]) -> bool;
    /// Writes `data` as raw bytes, see [`Context::update_host_visible_buffer`].
    fn update_host_visible_buffer_with<T: bytemuck::Pod>(&mut self, buffer: Buffer, offset: u64, data: &[T]) -> bool {
        self.update_host_visible_buffer(buffer, offset, bytemuck::cast_slice(data))
    }

    /// Records `func` into a command list outside the frame ring, submits it
    /// and blocks until the device has executed it.
    fn execute_immediate_commands<F>(&mut self, func: F) -> bool
    where
        F: FnOnce(&mut Self::CommandList);

    fn buffer_size(&self, buffer: Buffer) -> u64;
    fn texture_info(&self, texture: Texture) -> Option<TextureInfo>;
    fn buffer_state(&self, buffer: Buffer) -> ResourceState;
    fn texture_state(&self, texture: Texture, layer: u32, level: u32) -> ResourceState;

    /// Uploads `data` through a staging buffer. Region buffer offsets are
    /// relative to `data`. Updated subresources end up in `GeneralRead`.
    fn update_texture(&mut self, texture: Texture, data: &[u8], regions: &[BufferTextureCopyRegion]) -> bool {
        if data.is_empty() || regions.is_empty() {
            return true;
        }
        let Some(staging) = self.create_buffers(&[BufferDesc {
            size_bytes: data.len() as u64,
            usage: BufferUsage::TRANSFER,
            host_visible: true,
            debug_name: Some("texture staging".into()),
        }]) else {
            return false;
        };
        let staging = staging[0];

        let regions: Vec<_> = regions
            .iter()
            .map(|region| BufferTextureCopyRegion { texture, ..*region })
            .collect();

        let uploaded = self.update_host_visible_buffer(staging, 0, data)
            && self.execute_immediate_commands(|cmd| {
                cmd.copy_buffer_to_texture(staging, &regions);
                for region in &regions {
                    cmd.transition_texture_range(texture, region.subresource_range(), ResourceState::GeneralRead);
                }
            });

        self.destroy_buffers(&[staging]);
        uploaded
    }

    /// Fills mip levels 1.. of every layer by successive linear blits from
    /// the level above. All levels end up in `GeneralRead`.
    fn generate_mipmaps(&mut self, texture: Texture) -> bool {
        let Some(info) = self.texture_info(texture) else {
            log::warn!("Mipmap generation requested for stale texture handle {:?}", texture);
            return false;
        };
        if info.format.is_compressed() || info.format.is_depth() {
            log::warn!("Cannot generate mipmaps for {:?} textures", info.format);
            return false;
        }

        self.execute_immediate_commands(|cmd| {
            let mut width = info.width.max(1);
            let mut height = info.height.max(1);
            for level in 1..info.level_count {
                let next_width = (width / 2).max(1);
                let next_height = (height / 2).max(1);
                let region = TextureBlitRegion {
                    src_mip_level: level - 1,
                    src_base_array_layer: 0,
                    src_layer_count: info.layer_count,
                    src_width: width,
                    src_height: height,
                    dst_mip_level: level,
                    dst_base_array_layer: 0,
                    dst_layer_count: info.layer_count,
                    dst_width: next_width,
                    dst_height: next_height,
                    ..Default::default()
                };
                cmd.blit_texture(
                    texture,
                    ResourceState::TransferSrc,
                    texture,
                    ResourceState::TransferDst,
                    &[region],
                    true,
                );
                width = next_width;
                height = next_height;
            }
            cmd.transition_texture(texture, ResourceState::GeneralRead);
        })
    }
}
