//! Backend without hardware, used to exercise the frame and state tracking
//! core deterministically. Buffers hold plain bytes, commands are recorded
//! into a log and recent submissions are kept for inspection.

pub mod command_list;
pub mod device;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crate::gpu::Context;
use crate::gpu::backends::headless::command_list::HeadlessCommandList;
use crate::gpu::backends::headless::device::{FenceId, HeadlessDevice, VirtualImage};
use crate::gpu::config::ContextConfig;
use crate::gpu::contexts::device_ctx::submission::{self, ImmediateSubmitter};
use crate::gpu::contexts::device_ctx::{QueueKind, SurfaceCapabilities};
use crate::gpu::contexts::frame_ctx::frame_loop::FrameLoop;
use crate::gpu::contexts::resource_ctx::{
    lock, new_shared_storage, BufferEntry, ResourceKinds, SharedStorage, TextureEntry,
};
use crate::gpu::handle::*;
use crate::gpu::types::*;
use crate::gpu::CommandList;

/// Settings only the headless backend understands.
#[derive(Clone, Debug, Default)]
pub struct HeadlessConfig {
    /// Time between a submission and the signal of its fence.
    pub submit_latency: Duration,
    /// Capabilities of the virtual surface. `None` creates a context that
    /// does not present.
    pub surface: Option<SurfaceCapabilities>,
}

impl HeadlessConfig {
    /// A virtual surface that accepts 1x1 up to 4096x4096 with at least two
    /// images.
    pub fn with_default_surface(mut self) -> Self {
        self.surface = Some(SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: None,
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(4096, 4096),
            format: Format::B8G8R8A8Srgb,
        });
        self
    }
}

pub struct HeadlessBuffer {
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadlessTexture {
    Owned,
    BackBuffer(VirtualImage),
}

pub struct HeadlessShader {
    pub stage: ShaderStage,
    pub code_size: usize,
}

pub struct HeadlessPipeline {
    pub layouts: Vec<BindingLayout>,
    pub compute: bool,
}

pub struct HeadlessTable {
    pub layout: BindingLayout,
    pub bindings: HashMap<(u32, u32), DescriptorResource>,
}

pub struct HeadlessResources;

impl ResourceKinds for HeadlessResources {
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
    type Sampler = SamplerDesc;
    type Shader = HeadlessShader;
    type Pipeline = HeadlessPipeline;
    type BindingLayout = Vec<BindingLayoutEntry>;
    type DescriptorTable = HeadlessTable;
    type Fence = FenceId;
}

pub struct HeadlessContext {
    frame_loop: FrameLoop<HeadlessDevice, HeadlessCommandList>,
    immediate: ImmediateSubmitter<HeadlessDevice>,
    back_buffers: Vec<Texture>,
    default_sampler: Sampler,

    storage: SharedStorage<HeadlessResources>,
    device: Arc<HeadlessDevice>,
}

impl HeadlessContext {
    pub fn new(config: ContextConfig, headless: HeadlessConfig) -> Result<Self> {
        let presenting = headless.surface.is_some();
        let device = Arc::new(HeadlessDevice::new(headless.submit_latency, headless.surface));
        let storage = new_shared_storage();

        let frame_loop = FrameLoop::new(&config, presenting, device.clone())?;
        let immediate = ImmediateSubmitter::new(QueueKind::Graphics, device.clone())?;

        let default_sampler = lock(&storage).samplers.insert(SamplerDesc {
            linear_filter: true,
            repeat_uv: true,
            debug_name: Some("default sampler".into()),
        });

        let mut ctx = Self {
            frame_loop,
            immediate,
            back_buffers: Vec::new(),
            default_sampler,
            storage,
            device,
        };
        ctx.register_back_buffers();

        log::info!(
            "Created headless context '{}' with {} frames in flight",
            config.app_name,
            ctx.frames_in_flight(),
        );
        Ok(ctx)
    }

    pub fn device(&self) -> &Arc<HeadlessDevice> {
        &self.device
    }

    fn register_back_buffers(&mut self) {
        let mut storage = lock(&self.storage);
        for texture in self.back_buffers.drain(..) {
            storage.textures.remove(texture);
        }

        let Some(swapchain) = self.frame_loop.swapchain() else {
            return;
        };
        let extent = swapchain.extent();
        for (index, image) in swapchain.images().iter().enumerate() {
            let desc = TextureDesc {
                width: extent.width,
                height: extent.height,
                format: swapchain.format(),
                debug_name: Some(format!("back buffer {}", index)),
                ..Default::default()
            };
            let texture = storage
                .textures
                .insert(TextureEntry::new(desc, HeadlessTexture::BackBuffer(*image)));
            self.back_buffers.push(texture);
        }
    }

    fn new_command_list(&self) -> impl FnOnce(device::CommandBufferId) -> HeadlessCommandList + use<> {
        let storage = self.storage.clone();
        let device = self.device.clone();
        move |raw| HeadlessCommandList::new(raw, storage, device)
    }
}

impl Context for HeadlessContext {
    type CommandList = HeadlessCommandList;

    fn wait_idle(&mut self) -> bool {
        self.frame_loop.wait_idle()
    }

    fn begin_frame(&mut self) -> Option<(HeadlessCommandList, u32)> {
        let create = self.new_command_list();
        self.frame_loop.begin(create)
    }

    fn end_frame(&mut self, mut cmd: HeadlessCommandList) -> bool {
        if let Some(back_buffer) = self.back_buffer() {
            cmd.transition_texture(back_buffer, ResourceState::Present);
        }
        cmd.flush_transitions();
        self.frame_loop.end(cmd)
    }

    fn needs_resize(&self) -> bool {
        self.frame_loop.needs_resize()
    }

    fn frame_index(&self) -> u32 {
        self.frame_loop.frame_index()
    }

    fn frames_in_flight(&self) -> u32 {
        self.frame_loop.frames_in_flight()
    }

    fn create_buffers(&mut self, descs: &[BufferDesc]) -> Option<Vec<Buffer>> {
        if let Some(desc) = descs.iter().find(|desc| desc.size_bytes == 0) {
            log::error!("Cannot create empty buffer {:?}", desc.debug_name);
            return None;
        }
        let mut storage = lock(&self.storage);
        Some(
            descs
                .iter()
                .map(|desc| {
                    storage.buffers.insert(BufferEntry {
                        desc: desc.clone(),
                        state: ResourceState::Undefined,
                        raw: HeadlessBuffer {
                            bytes: vec![0; desc.size_bytes as usize],
                        },
                    })
                })
                .collect(),
        )
    }

    fn destroy_buffers(&mut self, buffers: &[Buffer]) {
        let mut storage = lock(&self.storage);
        for buffer in buffers {
            if storage.buffers.remove(*buffer).is_none() {
                log::warn!("Destroy requested for stale buffer handle {:?}", buffer);
            }
        }
    }

    fn create_textures(&mut self, descs: &[TextureDesc]) -> Option<Vec<Texture>> {
        if let Some(desc) = descs
            .iter()
            .find(|desc| desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0)
        {
            log::error!("Invalid texture description {:?}", desc);
            return None;
        }
        let mut storage = lock(&self.storage);
        Some(
            descs
                .iter()
                .map(|desc| storage.textures.insert(TextureEntry::new(desc.clone(), HeadlessTexture::Owned)))
                .collect(),
        )
    }

    fn destroy_textures(&mut self, textures: &[Texture]) {
        let mut storage = lock(&self.storage);
        for texture in textures {
            if self.back_buffers.contains(texture) {
                log::warn!("Back buffers are owned by the swapchain and cannot be destroyed");
                continue;
            }
            if storage.textures.remove(*texture).is_none() {
                log::warn!("Destroy requested for stale texture handle {:?}", texture);
            }
        }
    }

    fn create_samplers(&mut self, descs: &[SamplerDesc]) -> Option<Vec<Sampler>> {
        let mut storage = lock(&self.storage);
        Some(descs.iter().map(|desc| storage.samplers.insert(desc.clone())).collect())
    }

    fn destroy_samplers(&mut self, samplers: &[Sampler]) {
        let mut storage = lock(&self.storage);
        for sampler in samplers {
            if *sampler == self.default_sampler {
                log::warn!("The default sampler is owned by the context");
                continue;
            }
            if storage.samplers.remove(*sampler).is_none() {
                log::warn!("Destroy requested for stale sampler handle {:?}", sampler);
            }
        }
    }

    fn default_sampler(&self) -> Sampler {
        self.default_sampler
    }

    fn create_fences(&mut self, count: u32, signaled: bool) -> Option<Vec<Fence>> {
        submission::create_fences(&*self.device, &mut lock(&self.storage).fences, count, signaled)
    }

    fn destroy_fences(&mut self, fences: &[Fence]) {
        submission::destroy_fences(&*self.device, &mut lock(&self.storage).fences, fences);
    }

    fn wait_for_fences(&self, fences: &[Fence], wait_all: bool, timeout_ns: u64) -> bool {
        let raw = submission::resolve_fences::<HeadlessDevice>(&lock(&self.storage).fences, fences);
        submission::wait_for_resolved_fences(&*self.device, &raw, wait_all, timeout_ns)
    }

    fn reset_fences(&self, fences: &[Fence]) -> bool {
        submission::reset_fences(&*self.device, &lock(&self.storage).fences, fences)
    }

    fn create_shader(&mut self, stage: ShaderStage, code: &[u8]) -> Result<Shader> {
        if code.is_empty() {
            return Err(eyre!("Shader code is empty"));
        }
        if stage.bits().count_ones() != 1 {
            return Err(eyre!("A shader must target exactly one stage, got {:?}", stage));
        }
        Ok(lock(&self.storage).shaders.insert(HeadlessShader {
            stage,
            code_size: code.len(),
        }))
    }

    fn destroy_shader(&mut self, shader: Shader) {
        if lock(&self.storage).shaders.remove(shader).is_none() {
            log::warn!("Destroy requested for stale shader handle {:?}", shader);
        }
    }

    fn create_binding_layout(&mut self, entries: &[BindingLayoutEntry]) -> Result<BindingLayout> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|other| other.binding == entry.binding) {
                return Err(eyre!("Binding {} declared twice", entry.binding));
            }
        }
        Ok(lock(&self.storage).binding_layouts.insert(entries.to_vec()))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayout) {
        if lock(&self.storage).binding_layouts.remove(layout).is_none() {
            log::warn!("Destroy requested for stale binding layout handle {:?}", layout);
        }
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<Pipeline> {
        let mut storage = lock(&self.storage);
        let stage_of = |shader: Shader| storage.shaders.get(shader).map(|s| s.stage);
        if stage_of(desc.vertex_shader) != Some(ShaderStage::VERTEX) {
            return Err(eyre!("Graphics pipeline needs a vertex shader"));
        }
        if stage_of(desc.fragment_shader) != Some(ShaderStage::FRAGMENT) {
            return Err(eyre!("Graphics pipeline needs a fragment shader"));
        }
        if desc.color_formats.is_empty() && desc.depth_format == Format::Undefined {
            return Err(eyre!("Graphics pipeline has no attachments"));
        }
        if let Some(layout) = desc.layouts.iter().find(|l| !storage.binding_layouts.contains_key(**l)) {
            return Err(eyre!("Unknown binding layout {:?}", layout));
        }
        Ok(storage.pipelines.insert(HeadlessPipeline {
            layouts: desc.layouts.clone(),
            compute: false,
        }))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<Pipeline> {
        let mut storage = lock(&self.storage);
        match storage.shaders.get(desc.compute_shader) {
            Some(shader) if shader.stage == ShaderStage::COMPUTE => {}
            _ => return Err(eyre!("Compute pipeline needs a compute shader")),
        }
        if let Some(layout) = desc.layouts.iter().find(|l| !storage.binding_layouts.contains_key(**l)) {
            return Err(eyre!("Unknown binding layout {:?}", layout));
        }
        Ok(storage.pipelines.insert(HeadlessPipeline {
            layouts: desc.layouts.clone(),
            compute: true,
        }))
    }

    fn destroy_pipeline(&mut self, pipeline: Pipeline) {
        if lock(&self.storage).pipelines.remove(pipeline).is_none() {
            log::warn!("Destroy requested for stale pipeline handle {:?}", pipeline);
        }
    }

    fn create_descriptor_tables(&mut self, layout: BindingLayout, count: u32) -> Option<Vec<DescriptorTable>> {
        let mut storage = lock(&self.storage);
        if !storage.binding_layouts.contains_key(layout) {
            log::error!("Descriptor tables requested for stale layout {:?}", layout);
            return None;
        }
        Some(
            (0..count)
                .map(|_| {
                    storage.descriptor_tables.insert(HeadlessTable {
                        layout,
                        bindings: HashMap::new(),
                    })
                })
                .collect(),
        )
    }

    fn destroy_descriptor_tables(&mut self, tables: &[DescriptorTable]) {
        let mut storage = lock(&self.storage);
        for table in tables {
            if storage.descriptor_tables.remove(*table).is_none() {
                log::warn!("Destroy requested for stale descriptor table handle {:?}", table);
            }
        }
    }

    fn update_descriptor_tables(&mut self, updates: &[DescriptorUpdate]) {
        let mut storage = lock(&self.storage);
        for update in updates.iter().filter(|update| !update.skip_update) {
            let live = match update.resource {
                DescriptorResource::Buffer { buffer, .. } => storage.buffers.contains_key(buffer),
                DescriptorResource::Texture { texture, .. } => storage.textures.contains_key(texture),
            };
            if !live {
                log::warn!("Descriptor update references a stale resource: {:?}", update.resource);
                continue;
            }
            match storage.descriptor_tables.get_mut(update.table) {
                Some(table) => {
                    table.bindings.insert((update.binding, update.array_element), update.resource);
                }
                None => log::warn!("Update of stale descriptor table {:?}", update.table),
            }
        }
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.frame_loop.resize(Extent2D::new(width, height))?;
        self.register_back_buffers();
        Ok(())
    }

    fn back_buffer(&self) -> Option<Texture> {
        let image = self.frame_loop.acquired_image()?;
        self.back_buffers.get(image as usize).copied()
    }

    fn swapchain_extent(&self) -> Option<Extent2D> {
        self.frame_loop.swapchain().map(|swapchain| swapchain.extent())
    }

    fn update_host_visible_buffer(&mut self, buffer: Buffer, offset: u64, data: &[u8]) -> bool {
        let mut storage = lock(&self.storage);
        let Some(entry) = storage.buffers.get_mut(buffer) else {
            log::warn!("Write to stale buffer handle {:?}", buffer);
            return false;
        };
        if !entry.desc.host_visible {
            log::error!("Buffer {:?} is not host visible", entry.desc.debug_name);
            return false;
        }
        let start = offset as usize;
        let Some(target) = entry.raw.bytes.get_mut(start..start.saturating_add(data.len())) else {
            log::error!("Write of {} bytes at {} overruns buffer of {} bytes", data.len(), offset, entry.desc.size_bytes);
            return false;
        };
        target.copy_from_slice(data);
        true
    }

    fn read_host_visible_buffer(&self, buffer: Buffer, offset: u64, out: &mut [u8]) -> bool {
        let storage = lock(&self.storage);
        let Some(entry) = storage.buffers.get(buffer) else {
            log::warn!("Read of stale buffer handle {:?}", buffer);
            return false;
        };
        if !entry.desc.host_visible {
            log::error!("Buffer {:?} is not host visible", entry.desc.debug_name);
            return false;
        }
        let start = offset as usize;
        let Some(source) = entry.raw.bytes.get(start..start.saturating_add(out.len())) else {
            log::error!("Read of {} bytes at {} overruns buffer of {} bytes", out.len(), offset, entry.desc.size_bytes);
            return false;
        };
        out.copy_from_slice(source);
        true
    }

    fn execute_immediate_commands<F>(&mut self, func: F) -> bool
    where
        F: FnOnce(&mut HeadlessCommandList),
    {
        let create = self.new_command_list();
        let result = self.immediate.submit(|raw| {
            let mut cmd = create(raw);
            func(&mut cmd);
            cmd.flush_transitions();
            Ok(())
        });
        if let Err(err) = &result {
            log::error!("Immediate submission failed: {}", err);
        }
        result.is_ok()
    }

    fn buffer_size(&self, buffer: Buffer) -> u64 {
        lock(&self.storage).buffer_size(buffer)
    }

    fn texture_info(&self, texture: Texture) -> Option<TextureInfo> {
        lock(&self.storage).texture_info(texture)
    }

    fn buffer_state(&self, buffer: Buffer) -> ResourceState {
        lock(&self.storage).buffer_state(buffer)
    }

    fn texture_state(&self, texture: Texture, layer: u32, level: u32) -> ResourceState {
        lock(&self.storage).texture_state(texture, layer, level)
    }
}

impl Drop for HeadlessContext {
    fn drop(&mut self) {
        self.frame_loop.wait_idle();
    }
}
