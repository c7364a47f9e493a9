use std::sync::Arc;
use crate::gpu::CommandList;
use crate::gpu::backends::headless::HeadlessResources;
use crate::gpu::backends::headless::device::{CommandBufferId, HeadlessDevice};
use crate::gpu::contexts::frame_ctx::command_list_pool::PooledCommandList;
use crate::gpu::contexts::resource_ctx::state_tracker::{PendingTransition, PendingTransitions};
use crate::gpu::contexts::resource_ctx::{lock, SharedStorage};
use crate::gpu::handle::*;
use crate::gpu::types::*;

/// A command as the headless device received it.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// One batch of tracked transitions.
    Barriers(Vec<PendingTransition>),
    PipelineBarrier {
        buffers: Vec<BufferBarrier>,
        textures: Vec<TextureBarrier>,
    },
    BeginRendering {
        color: Vec<Texture>,
        depth: Option<Texture>,
    },
    EndRendering,
    BeginCompute,
    EndCompute,
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<Buffer>,
    },
    BindIndexBuffer {
        buffer: Buffer,
        offset: u64,
        is_uint32: bool,
    },
    BindPipeline(Pipeline),
    BindDescriptorTable {
        set: u32,
        table: DescriptorTable,
    },
    PushConstants {
        stages: ShaderStage,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport(Viewport),
    SetScissor(Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    DrawIndexedIndirect {
        buffer: Buffer,
        draw_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: Buffer,
        dst: Buffer,
        regions: Vec<BufferCopyRegion>,
    },
    CopyTexture {
        regions: Vec<TextureCopyRegion>,
    },
    CopyBufferToTexture {
        buffer: Buffer,
        regions: Vec<BufferTextureCopyRegion>,
    },
    CopyTextureToBuffer {
        buffer: Buffer,
        regions: Vec<BufferTextureCopyRegion>,
    },
    BlitTexture {
        src: Texture,
        dst: Texture,
        regions: Vec<TextureBlitRegion>,
        linear_filter: bool,
    },
}

pub struct HeadlessCommandList {
    raw: CommandBufferId,
    pending: PendingTransitions,
    bound_pipeline: Option<Pipeline>,
    in_rendering: bool,

    storage: SharedStorage<HeadlessResources>,
    device: Arc<HeadlessDevice>,
}

impl HeadlessCommandList {
    pub fn new(
        raw: CommandBufferId,
        storage: SharedStorage<HeadlessResources>,
        device: Arc<HeadlessDevice>,
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

    /// Commands recorded so far in this cycle.
    pub fn commands(&self) -> Vec<Command> {
        self.device.recorded(self.raw)
    }

    pub fn bound_pipeline(&self) -> Option<Pipeline> {
        self.bound_pipeline
    }

    fn record(&self, command: Command) {
        self.device.record(self.raw, command);
    }

    fn transition_region(&mut self, texture: Texture, mip_level: u32, base_layer: u32, layer_count: u32, state: ResourceState) {
        self.transition_texture_range(
            texture,
            SubresourceRange::new(mip_level, 1, base_layer, layer_count),
            state,
        );
    }
}

impl PooledCommandList for HeadlessCommandList {
    type Raw = CommandBufferId;

    fn raw(&self) -> CommandBufferId {
        self.raw
    }

    fn recycle(&mut self) {
        self.pending.clear();
        self.bound_pipeline = None;
        self.in_rendering = false;
    }
}

impl CommandList for HeadlessCommandList {
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

        self.in_rendering = true;
        self.record(Command::BeginRendering {
            color: color.iter().map(|attachment| attachment.texture).collect(),
            depth: depth.map(|depth| depth.texture),
        });
    }

    fn end_rendering(&mut self) {
        if !self.in_rendering {
            log::warn!("end_rendering without a matching begin_rendering");
        }
        self.in_rendering = false;
        self.record(Command::EndRendering);
    }

    fn begin_compute(&mut self) {
        self.record(Command::BeginCompute);
    }

    fn end_compute(&mut self) {
        self.record(Command::EndCompute);
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[Buffer], _offsets: &[u64]) {
        self.record(Command::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
        });
    }

    fn bind_index_buffer(&mut self, buffer: Buffer, offset: u64, is_uint32: bool) {
        self.record(Command::BindIndexBuffer {
            buffer,
            offset,
            is_uint32,
        });
    }

    fn bind_pipeline(&mut self, pipeline: Pipeline) {
        if !lock(&self.storage).pipelines.contains_key(pipeline) {
            log::warn!("Bind of stale pipeline handle {:?}", pipeline);
            return;
        }
        self.bound_pipeline = Some(pipeline);
        self.record(Command::BindPipeline(pipeline));
    }

    fn bind_descriptor_table(&mut self, set: u32, table: DescriptorTable) {
        if self.bound_pipeline.is_none() {
            log::warn!("Descriptor table bound before any pipeline");
            return;
        }
        self.record(Command::BindDescriptorTable { set, table });
    }

    fn push_constants(&mut self, stages: ShaderStage, offset: u32, data: &[u8]) {
        self.record(Command::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(Command::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        self.record(Command::SetScissor(scissor));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.flush_transitions();
        self.record(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.flush_transitions();
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
        });
    }

    fn draw_indexed_indirect(&mut self, buffer: Buffer, _offset: u64, draw_count: u32, _stride: u32) {
        self.flush_transitions();
        self.record(Command::DrawIndexedIndirect { buffer, draw_count });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.flush_transitions();
        self.record(Command::Dispatch { x, y, z });
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
        let batch = self.pending.take();
        self.record(Command::Barriers(batch.into_vec()));
    }

    fn pipeline_barrier(&mut self, buffer_barriers: &[BufferBarrier], texture_barriers: &[TextureBarrier]) {
        self.flush_transitions();
        lock(&self.storage).apply_barriers(buffer_barriers, texture_barriers);
        self.record(Command::PipelineBarrier {
            buffers: buffer_barriers.to_vec(),
            textures: texture_barriers.to_vec(),
        });
    }

    fn pending_transitions(&self) -> &[PendingTransition] {
        self.pending.as_slice()
    }

    fn copy_buffer(&mut self, src: Buffer, dst: Buffer, regions: &[BufferCopyRegion]) {
        self.transition_buffer(src, ResourceState::TransferSrc);
        self.transition_buffer(dst, ResourceState::TransferDst);
        self.flush_transitions();
        self.record(Command::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
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
        self.record(Command::CopyTexture {
            regions: regions.to_vec(),
        });
    }

    fn copy_buffer_to_texture(&mut self, buffer: Buffer, regions: &[BufferTextureCopyRegion]) {
        self.transition_buffer(buffer, ResourceState::TransferSrc);
        for region in regions {
            self.transition_texture_range(region.texture, region.subresource_range(), ResourceState::TransferDst);
        }
        self.flush_transitions();
        self.record(Command::CopyBufferToTexture {
            buffer,
            regions: regions.to_vec(),
        });
    }

    fn copy_texture_to_buffer(&mut self, buffer: Buffer, regions: &[BufferTextureCopyRegion]) {
        for region in regions {
            self.transition_texture_range(region.texture, region.subresource_range(), ResourceState::TransferSrc);
        }
        self.transition_buffer(buffer, ResourceState::TransferDst);
        self.flush_transitions();
        self.record(Command::CopyTextureToBuffer {
            buffer,
            regions: regions.to_vec(),
        });
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
        self.record(Command::BlitTexture {
            src,
            dst,
            regions: regions.to_vec(),
            linear_filter,
        });
    }
}
