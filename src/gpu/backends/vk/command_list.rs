use std::sync::Arc;
use ash::vk;
use smallvec::SmallVec;
use crate::gpu::CommandList;
use crate::gpu::backends::vk::VulkanResources;
use crate::gpu::backends::vk::conv;
use crate::gpu::backends::vk::device::VulkanDevice;
use crate::gpu::contexts::frame_ctx::command_list_pool::PooledCommandList;
use crate::gpu::contexts::resource_ctx::state_tracker::{
    self, PendingTransition, PendingTransitions, TransitionTarget,
};
use crate::gpu::contexts::resource_ctx::{lock, SharedStorage};
use crate::gpu::handle::*;
use crate::gpu::types::*;

/// Records into one primary command buffer with dynamic rendering and
/// synchronization2 barriers.
pub struct VulkanCommandList {
    raw: vk::CommandBuffer,
    pending: PendingTransitions,
    bound_pipeline: Option<(vk::PipelineLayout, vk::PipelineBindPoint)>,
    in_rendering: bool,

    storage: SharedStorage<VulkanResources>,
    device: Arc<VulkanDevice>,
}

impl VulkanCommandList {
    pub fn new(
        raw: vk::CommandBuffer,
        storage: SharedStorage<VulkanResources>,
        device: Arc<VulkanDevice>,
    ) -> Self {
        Self {
            raw,
            pending: PendingTransitions::new(),
            bound_pipeline: None,
            in_rendering: false,
            storage,
            device,
        }
    }

    fn logical(&self) -> &ash::Device {
        &self.device.logical
    }

    fn transition_region(&mut self, texture: Texture, mip_level: u32, base_layer: u32, layer_count: u32, state: ResourceState) {
        self.transition_texture_range(
            texture,
            SubresourceRange::new(mip_level, 1, base_layer, layer_count),
            state,
        );
    }

    fn emit_barriers(
        &self,
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        if buffer_barriers.is_empty() && image_barriers.is_empty() {
            return;
        }
        let dependency_info = vk::DependencyInfo::default()
            .buffer_memory_barriers(buffer_barriers)
            .image_memory_barriers(image_barriers);
        unsafe { self.logical().cmd_pipeline_barrier2(self.raw, &dependency_info) };
    }

    /// Image, format and extent of a live texture.
    fn texture(&self, texture: Texture) -> Option<(vk::Image, Format, vk::ImageView, Extent2D)> {
        let storage = lock(&self.storage);
        let entry = storage.textures.get(texture)?;
        Some((
            entry.raw.image,
            entry.desc.format,
            entry.raw.view,
            Extent2D::new(entry.desc.width, entry.desc.height),
        ))
    }

    fn buffer(&self, buffer: Buffer) -> Option<vk::Buffer> {
        lock(&self.storage).buffers.get(buffer).map(|entry| entry.raw.raw)
    }

    fn buffer_image_copy(region: &BufferTextureCopyRegion, format: Format) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: region.buffer_offset,
            buffer_row_length: region.buffer_row_length,
            buffer_image_height: region.buffer_image_height,
            image_subresource: conv::subresource_layers(
                format,
                region.mip_level,
                region.base_array_layer,
                region.layer_count,
            ),
            image_offset: conv::offset(region.texture_x, region.texture_y, region.texture_z),
            image_extent: conv::extent(region.width, region.height, region.depth),
        }
    }
}

impl PooledCommandList for VulkanCommandList {
    type Raw = vk::CommandBuffer;

    fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    fn recycle(&mut self) {
        self.pending.clear();
        self.bound_pipeline = None;
        self.in_rendering = false;
    }
}

impl CommandList for VulkanCommandList {
    fn begin_rendering(&mut self, color: &[ColorAttachment], depth: Option<&DepthAttachment>) {
        for attachment in color {
            self.transition_texture_range(attachment.texture, SubresourceRange::BASE, ResourceState::ColorTarget);
            if let Some(resolve) = attachment.resolve_target {
                self.transition_texture_range(resolve, SubresourceRange::BASE, ResourceState::ColorTarget);
            }
        }
        if let Some(depth) = depth {
            self.transition_texture_range(depth.texture, SubresourceRange::BASE, ResourceState::DepthTarget);
        }
        self.flush_transitions();

        let mut render_extent: Option<Extent2D> = None;
        let mut color_infos: SmallVec<[vk::RenderingAttachmentInfo; MAX_COLOR_ATTACHMENTS]> = SmallVec::new();
        for attachment in color {
            let Some((_, _, view, extent)) = self.texture(attachment.texture) else {
                log::warn!("Color attachment {:?} is stale", attachment.texture);
                continue;
            };
            render_extent.get_or_insert(extent);
            let mut info = vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(conv::load_op(attachment.load_op))
                .store_op(conv::store_op(attachment.store_op))
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: attachment.clear_color,
                    },
                });
            if let Some((_, _, resolve_view, _)) = attachment.resolve_target.and_then(|t| self.texture(t)) {
                info = info
                    .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                    .resolve_image_view(resolve_view)
                    .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            }
            color_infos.push(info);
        }

        let depth_info = depth.and_then(|depth| {
            let (_, format, view, extent) = self.texture(depth.texture)?;
            render_extent.get_or_insert(extent);
            Some((
                format,
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(conv::load_op(depth.load_op))
                    .store_op(conv::store_op(depth.store_op))
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: depth.clear_depth,
                            stencil: 0,
                        },
                    }),
            ))
        });

        let Some(extent) = render_extent else {
            log::error!("begin_rendering without any live attachment");
            return;
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some((format, info)) = &depth_info {
            rendering_info = rendering_info.depth_attachment(info);
            if format.has_stencil() {
                rendering_info = rendering_info.stencil_attachment(info);
            }
        }

        unsafe { self.logical().cmd_begin_rendering(self.raw, &rendering_info) };
        self.in_rendering = true;
    }

    fn end_rendering(&mut self) {
        if !self.in_rendering {
            log::warn!("end_rendering without a matching begin_rendering");
            return;
        }
        self.in_rendering = false;
        unsafe { self.logical().cmd_end_rendering(self.raw) };
    }

    fn begin_compute(&mut self) {
        self.flush_transitions();
    }

    fn end_compute(&mut self) {}

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[Buffer], offsets: &[u64]) {
        let raw: SmallVec<[vk::Buffer; 8]> = buffers
            .iter()
            .map(|buffer| self.buffer(*buffer).unwrap_or_default())
            .collect();
        if raw.contains(&vk::Buffer::null()) {
            log::warn!("Bind of stale vertex buffer handle");
            return;
        }
        let offsets: SmallVec<[u64; 8]> = (0..buffers.len())
            .map(|i| offsets.get(i).copied().unwrap_or(0))
            .collect();
        unsafe {
            self.logical()
                .cmd_bind_vertex_buffers(self.raw, first_binding, &raw, &offsets)
        };
    }

    fn bind_index_buffer(&mut self, buffer: Buffer, offset: u64, is_uint32: bool) {
        let Some(raw) = self.buffer(buffer) else {
            log::warn!("Bind of stale index buffer handle {:?}", buffer);
            return;
        };
        let index_type = if is_uint32 {
            vk::IndexType::UINT32
        } else {
            vk::IndexType::UINT16
        };
        unsafe {
            self.logical()
                .cmd_bind_index_buffer(self.raw, raw, offset, index_type)
        };
    }

    fn bind_pipeline(&mut self, pipeline: Pipeline) {
        let Some((raw, layout, bind_point)) = lock(&self.storage)
            .pipelines
            .get(pipeline)
            .map(|p| (p.raw, p.layout, p.bind_point))
        else {
            log::warn!("Bind of stale pipeline handle {:?}", pipeline);
            return;
        };
        self.bound_pipeline = Some((layout, bind_point));
        unsafe { self.logical().cmd_bind_pipeline(self.raw, bind_point, raw) };
    }

    fn bind_descriptor_table(&mut self, set: u32, table: DescriptorTable) {
        let Some((layout, bind_point)) = self.bound_pipeline else {
            log::warn!("Descriptor table bound before any pipeline");
            return;
        };
        let Some(raw) = lock(&self.storage)
            .descriptor_tables
            .get(table)
            .map(|table| *table.set.raw())
        else {
            log::warn!("Bind of stale descriptor table handle {:?}", table);
            return;
        };
        unsafe {
            self.logical()
                .cmd_bind_descriptor_sets(self.raw, bind_point, layout, set, &[raw], &[])
        };
    }

    fn push_constants(&mut self, stages: ShaderStage, offset: u32, data: &[u8]) {
        let Some((layout, _)) = self.bound_pipeline else {
            log::warn!("Push constants recorded before any pipeline");
            return;
        };
        unsafe {
            self.logical().cmd_push_constants(
                self.raw,
                layout,
                conv::shader_stages(stages),
                offset,
                data,
            )
        };
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.w,
            height: viewport.h,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.logical().cmd_set_viewport(self.raw, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.w,
                height: scissor.h,
            },
        };
        unsafe { self.logical().cmd_set_scissor(self.raw, 0, &[scissor]) };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.flush_transitions();
        unsafe {
            self.logical()
                .cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.flush_transitions();
        unsafe {
            self.logical().cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn draw_indexed_indirect(&mut self, buffer: Buffer, offset: u64, draw_count: u32, stride: u32) {
        self.flush_transitions();
        let Some(raw) = self.buffer(buffer) else {
            log::warn!("Indirect draw from stale buffer handle {:?}", buffer);
            return;
        };
        unsafe {
            self.logical()
                .cmd_draw_indexed_indirect(self.raw, raw, offset, draw_count, stride)
        };
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.flush_transitions();
        unsafe { self.logical().cmd_dispatch(self.raw, x, y, z) };
    }

    fn transition_buffer(&mut self, buffer: Buffer, new_state: ResourceState) {
        lock(&self.storage).request_buffer_transition(&mut self.pending, buffer, new_state);
    }

    fn transition_texture_range(&mut self, texture: Texture, range: SubresourceRange, new_state: ResourceState) {
        lock(&self.storage).request_texture_transition(&mut self.pending, texture, range, new_state);
    }

    fn flush_transitions(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = state_tracker::coalesce(&self.pending.take());

        let mut buffer_barriers: SmallVec<[vk::BufferMemoryBarrier2; 8]> = SmallVec::new();
        let mut image_barriers: SmallVec<[vk::ImageMemoryBarrier2; 8]> = SmallVec::new();
        {
            let storage = lock(&self.storage);
            for transition in &batch {
                match transition.target {
                    TransitionTarget::Buffer(buffer) => {
                        if let Some(entry) = storage.buffers.get(buffer) {
                            buffer_barriers.push(conv::buffer_barrier(
                                entry.raw.raw,
                                transition.old_state,
                                transition.new_state,
                            ));
                        }
                    }
                    TransitionTarget::Texture { texture, range } => {
                        if let Some(entry) = storage.textures.get(texture) {
                            image_barriers.push(conv::image_barrier(
                                entry.raw.image,
                                entry.desc.format,
                                conv::resolved_range(range),
                                transition.old_state,
                                transition.new_state,
                            ));
                        }
                    }
                }
            }
        }
        self.emit_barriers(&buffer_barriers, &image_barriers);
    }

    fn pipeline_barrier(&mut self, buffer_barriers: &[BufferBarrier], texture_barriers: &[TextureBarrier]) {
        self.flush_transitions();

        let mut raw_buffer_barriers: SmallVec<[vk::BufferMemoryBarrier2; 8]> = SmallVec::new();
        let mut raw_image_barriers: SmallVec<[vk::ImageMemoryBarrier2; 8]> = SmallVec::new();
        {
            let mut storage = lock(&self.storage);
            for barrier in buffer_barriers {
                if let Some(entry) = storage.buffers.get(barrier.buffer) {
                    raw_buffer_barriers.push(conv::buffer_barrier(
                        entry.raw.raw,
                        barrier.old_state,
                        barrier.new_state,
                    ));
                }
            }
            for barrier in texture_barriers {
                if let Some(entry) = storage.textures.get(barrier.texture) {
                    raw_image_barriers.push(conv::image_barrier(
                        entry.raw.image,
                        entry.desc.format,
                        conv::subresource_range(barrier.range),
                        barrier.old_state,
                        barrier.new_state,
                    ));
                }
            }
            storage.apply_barriers(buffer_barriers, texture_barriers);
        }
        self.emit_barriers(&raw_buffer_barriers, &raw_image_barriers);
    }

    fn pending_transitions(&self) -> &[PendingTransition] {
        self.pending.as_slice()
    }

    fn copy_buffer(&mut self, src: Buffer, dst: Buffer, regions: &[BufferCopyRegion]) {
        self.transition_buffer(src, ResourceState::TransferSrc);
        self.transition_buffer(dst, ResourceState::TransferDst);
        self.flush_transitions();

        let (Some(src_raw), Some(dst_raw)) = (self.buffer(src), self.buffer(dst)) else {
            log::warn!("Copy between stale buffer handles {:?} -> {:?}", src, dst);
            return;
        };
        let copies: SmallVec<[vk::BufferCopy; 4]> = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect();
        unsafe { self.logical().cmd_copy_buffer(self.raw, src_raw, dst_raw, &copies) };
    }

    fn copy_texture(&mut self, regions: &[TextureCopyRegion]) {
        for region in regions {
            self.transition_region(
                region.src_texture,
                region.src_mip_level,
                region.src_base_array_layer,
                region.src_layer_count,
                ResourceState::TransferSrc,
            );
            self.transition_region(
                region.dst_texture,
                region.dst_mip_level,
                region.dst_base_array_layer,
                region.dst_layer_count,
                ResourceState::TransferDst,
            );
        }
        self.flush_transitions();

        for region in regions {
            let (Some((src, src_format, _, _)), Some((dst, dst_format, _, _))) =
                (self.texture(region.src_texture), self.texture(region.dst_texture))
            else {
                log::warn!("Copy between stale texture handles");
                continue;
            };
            let copy = vk::ImageCopy {
                src_subresource: conv::subresource_layers(
                    src_format,
                    region.src_mip_level,
                    region.src_base_array_layer,
                    region.src_layer_count,
                ),
                src_offset: conv::offset(region.src_x, region.src_y, region.src_z),
                dst_subresource: conv::subresource_layers(
                    dst_format,
                    region.dst_mip_level,
                    region.dst_base_array_layer,
                    region.dst_layer_count,
                ),
                dst_offset: conv::offset(region.dst_x, region.dst_y, region.dst_z),
                extent: conv::extent(region.width, region.height, region.depth),
            };
            unsafe {
                self.logical().cmd_copy_image(
                    self.raw,
                    src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                )
            };
        }
    }

    fn copy_buffer_to_texture(&mut self, buffer: Buffer, regions: &[BufferTextureCopyRegion]) {
        self.transition_buffer(buffer, ResourceState::TransferSrc);
        for region in regions {
            self.transition_texture_range(region.texture, region.subresource_range(), ResourceState::TransferDst);
        }
        self.flush_transitions();

        let Some(raw_buffer) = self.buffer(buffer) else {
            log::warn!("Copy from stale buffer handle {:?}", buffer);
            return;
        };
        for region in regions {
            let Some((image, format, _, _)) = self.texture(region.texture) else {
                log::warn!("Copy into stale texture handle {:?}", region.texture);
                continue;
            };
            unsafe {
                self.logical().cmd_copy_buffer_to_image(
                    self.raw,
                    raw_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[Self::buffer_image_copy(region, format)],
                )
            };
        }
    }

    fn copy_texture_to_buffer(&mut self, buffer: Buffer, regions: &[BufferTextureCopyRegion]) {
        for region in regions {
            self.transition_texture_range(region.texture, region.subresource_range(), ResourceState::TransferSrc);
        }
        self.transition_buffer(buffer, ResourceState::TransferDst);
        self.flush_transitions();

        let Some(raw_buffer) = self.buffer(buffer) else {
            log::warn!("Copy into stale buffer handle {:?}", buffer);
            return;
        };
        for region in regions {
            let Some((image, format, _, _)) = self.texture(region.texture) else {
                log::warn!("Copy from stale texture handle {:?}", region.texture);
                continue;
            };
            unsafe {
                self.logical().cmd_copy_image_to_buffer(
                    self.raw,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    raw_buffer,
                    &[Self::buffer_image_copy(region, format)],
                )
            };
        }
    }

    fn blit_texture(
        &mut self,
        src: Texture,
        src_state: ResourceState,
        dst: Texture,
        dst_state: ResourceState,
        regions: &[TextureBlitRegion],
        linear_filter: bool,
    ) {
        for region in regions {
            self.transition_region(src, region.src_mip_level, region.src_base_array_layer, region.src_layer_count, src_state);
            self.transition_region(dst, region.dst_mip_level, region.dst_base_array_layer, region.dst_layer_count, dst_state);
        }
        self.flush_transitions();

        let (Some((src_image, src_format, _, _)), Some((dst_image, dst_format, _, _))) =
            (self.texture(src), self.texture(dst))
        else {
            log::warn!("Blit between stale texture handles {:?} -> {:?}", src, dst);
            return;
        };
        let blits: SmallVec<[vk::ImageBlit2; 4]> = regions
            .iter()
            .map(|region| {
                let corner = |x: i32, y: i32, z: i32, w: u32, h: u32, d: u32| {
                    [
                        conv::offset(x, y, z),
                        conv::offset(x + w.max(1) as i32, y + h.max(1) as i32, z + d.max(1) as i32),
                    ]
                };
                vk::ImageBlit2::default()
                    .src_subresource(conv::subresource_layers(
                        src_format,
                        region.src_mip_level,
                        region.src_base_array_layer,
                        region.src_layer_count,
                    ))
                    .src_offsets(corner(
                        region.src_x,
                        region.src_y,
                        region.src_z,
                        region.src_width,
                        region.src_height,
                        region.src_depth,
                    ))
                    .dst_subresource(conv::subresource_layers(
                        dst_format,
                        region.dst_mip_level,
                        region.dst_base_array_layer,
                        region.dst_layer_count,
                    ))
                    .dst_offsets(corner(
                        region.dst_x,
                        region.dst_y,
                        region.dst_z,
                        region.dst_width,
                        region.dst_height,
                        region.dst_depth,
                    ))
            })
            .collect();

        let blit_info = vk::BlitImageInfo2::default()
            .src_image(src_image)
            .src_image_layout(conv::layout(src_state))
            .dst_image(dst_image)
            .dst_image_layout(conv::layout(dst_state))
            .regions(&blits)
            .filter(if linear_filter {
                vk::Filter::LINEAR
            } else {
                vk::Filter::NEAREST
            });
        unsafe { self.logical().cmd_blit_image2(self.raw, &blit_info) };
    }
}
