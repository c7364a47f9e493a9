//! Vulkan 1.3 backend. Rendering uses dynamic rendering, barriers go through
//! synchronization2, memory comes from `gpu-allocator` and descriptor sets
//! from `gpu-descriptor`.

pub mod command_list;
pub mod conv;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod queue;
pub mod resources;

use std::mem::ManuallyDrop;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_descriptor::DescriptorSetLayoutCreateFlags;
use crate::gpu::{CommandList, Context};
use crate::gpu::backends::vk::command_list::VulkanCommandList;
use crate::gpu::backends::vk::descriptor::{
    DescriptorAllocator, DescriptorAshDevice, VulkanBindingLayout, VulkanTable,
};
use crate::gpu::backends::vk::device::VulkanDevice;
use crate::gpu::backends::vk::instance::VulkanInstance;
use crate::gpu::backends::vk::pipeline::{VulkanPipeline, VulkanShader};
use crate::gpu::backends::vk::resources::{VulkanBuffer, VulkanTexture};
use crate::gpu::config::ContextConfig;
use crate::gpu::contexts::device_ctx::submission::{self, ImmediateSubmitter};
use crate::gpu::contexts::device_ctx::QueueKind;
use crate::gpu::contexts::frame_ctx::frame_loop::FrameLoop;
use crate::gpu::contexts::resource_ctx::{
    lock, new_shared_storage, BufferEntry, ResourceKinds, SharedStorage, TextureEntry,
};
use crate::gpu::handle::*;
use crate::gpu::types::*;

pub struct VulkanResources;

impl ResourceKinds for VulkanResources {
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type Sampler = vk::Sampler;
    type Shader = VulkanShader;
    type Pipeline = VulkanPipeline;
    type BindingLayout = VulkanBindingLayout;
    type DescriptorTable = VulkanTable;
    type Fence = vk::Fence;
}

/// Context on a Vulkan device.
///
/// Every native object lives in the shared resource storage; the memory and
/// descriptor allocators are released in `Drop` after all of them.
pub struct VulkanContext {
    frame_loop: FrameLoop<VulkanDevice, VulkanCommandList>,
    immediate: ImmediateSubmitter<VulkanDevice>,
    back_buffers: Vec<Texture>,
    default_sampler: Sampler,

    allocator: ManuallyDrop<Allocator>,
    descriptor_allocator: DescriptorAllocator,

    storage: SharedStorage<VulkanResources>,
    device: Arc<VulkanDevice>,
}

impl VulkanContext {
    /// A context without a surface. Frames are submitted but never
    /// presented.
    pub fn new(config: ContextConfig) -> Result<Self> {
        let instance = VulkanInstance::new(&config, &[])?;
        let device = VulkanDevice::new(instance, None)?;
        Self::from_device(config, device)
    }

    /// A context presenting to `window`. The initial swapchain extent is the
    /// window's inner size.
    #[cfg(feature = "graphics")]
    pub fn with_window(
        config: ContextConfig,
        window: Arc<winit::window::Window>,
    ) -> Result<Self> {
        let extensions = instance::window::required_extensions(&window)?;
        let vk_instance = VulkanInstance::new(&config, &extensions)?;
        let surface = instance::window::create_surface(&vk_instance.entry, &vk_instance.instance, &window)?;
        let device = VulkanDevice::new(vk_instance, Some(surface))?;

        let size = window.inner_size();
        let config = ContextConfig {
            initial_extent: Extent2D::new(size.width, size.height),
            ..config
        };
        Self::from_device(config, device)
    }

    fn from_device(config: ContextConfig, device: VulkanDevice) -> Result<Self> {
        let presenting = device.has_surface();
        let device = Arc::new(device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance.instance.clone(),
            device: device.logical.clone(),
            physical_device: device.physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: config.validation_enabled,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let storage = new_shared_storage();
        let frame_loop = FrameLoop::new(&config, presenting, device.clone())?;
        let immediate = ImmediateSubmitter::new(QueueKind::Graphics, device.clone())?;

        let default_sampler = resources::create_sampler(
            &SamplerDesc {
                linear_filter: true,
                repeat_uv: true,
                debug_name: Some("default sampler".into()),
            },
            device.max_sampler_anisotropy(),
            &device.logical,
        )?;
        let default_sampler = lock(&storage).samplers.insert(default_sampler);

        let mut ctx = Self {
            frame_loop,
            immediate,
            back_buffers: Vec::new(),
            default_sampler,
            allocator: ManuallyDrop::new(allocator),
            descriptor_allocator: DescriptorAllocator::new(1024),
            storage,
            device,
        };
        ctx.register_back_buffers()?;

        log::info!(
            "Created Vulkan context '{}' with {} frames in flight",
            config.app_name,
            ctx.frames_in_flight(),
        );
        Ok(ctx)
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Replaces the back buffer textures with views of the current
    /// swapchain images.
    fn register_back_buffers(&mut self) -> Result<()> {
        let mut storage = lock(&self.storage);
        for texture in self.back_buffers.drain(..) {
            if let Some(entry) = storage.textures.remove(texture) {
                entry.raw.destroy(&self.device.logical, &mut self.allocator);
            }
        }

        let Some(swapchain) = self.frame_loop.swapchain() else {
            return Ok(());
        };
        let extent = swapchain.extent();
        let format = swapchain.format();
        for (index, image) in swapchain.images().iter().enumerate() {
            let raw = VulkanTexture::from_swapchain_image(*image, conv::format(format), &self.device.logical)?;
            let desc = TextureDesc {
                width: extent.width,
                height: extent.height,
                format,
                debug_name: Some(format!("back buffer {}", index)),
                ..Default::default()
            };
            self.back_buffers.push(storage.textures.insert(TextureEntry::new(desc, raw)));
        }
        Ok(())
    }

    fn new_command_list(&self) -> impl FnOnce(vk::CommandBuffer) -> VulkanCommandList + use<> {
        let storage = self.storage.clone();
        let device = self.device.clone();
        move |raw| VulkanCommandList::new(raw, storage, device)
    }

    fn set_layouts(&self, layouts: &[BindingLayout]) -> Result<Vec<vk::DescriptorSetLayout>> {
        let storage = lock(&self.storage);
        layouts
            .iter()
            .map(|layout| {
                storage
                    .binding_layouts
                    .get(*layout)
                    .map(|layout| layout.raw)
                    .ok_or_else(|| eyre!("Unknown binding layout {:?}", layout))
            })
            .collect()
    }

    fn shader_module(&self, shader: Shader, stage: ShaderStage) -> Result<vk::ShaderModule> {
        match lock(&self.storage).shaders.get(shader) {
            Some(s) if s.stage == stage => Ok(s.module),
            Some(s) => Err(eyre!("Shader {:?} is a {:?} shader, expected {:?}", shader, s.stage, stage)),
            None => Err(eyre!("Unknown shader {:?}", shader)),
        }
    }
}

impl Context for VulkanContext {
    type CommandList = VulkanCommandList;

    fn wait_idle(&mut self) -> bool {
        self.frame_loop.wait_idle()
    }

    fn begin_frame(&mut self) -> Option<(VulkanCommandList, u32)> {
        let create = self.new_command_list();
        self.frame_loop.begin(create)
    }

    fn end_frame(&mut self, mut cmd: VulkanCommandList) -> bool {
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
        let mut created = Vec::with_capacity(descs.len());
        for desc in descs {
            match VulkanBuffer::new(desc, &self.device.logical, &mut self.allocator) {
                Ok(raw) => created.push(raw),
                Err(err) => {
                    log::error!("Failed to create buffer {:?}: {}", desc.debug_name, err);
                    for raw in created {
                        raw.destroy(&self.device.logical, &mut self.allocator);
                    }
                    return None;
                }
            }
        }
        let mut storage = lock(&self.storage);
        Some(
            descs
                .iter()
                .zip(created)
                .map(|(desc, raw)| {
                    storage.buffers.insert(BufferEntry {
                        desc: desc.clone(),
                        state: ResourceState::Undefined,
                        raw,
                    })
                })
                .collect(),
        )
    }

    fn destroy_buffers(&mut self, buffers: &[Buffer]) {
        let mut storage = lock(&self.storage);
        for buffer in buffers {
            match storage.buffers.remove(*buffer) {
                Some(entry) => entry.raw.destroy(&self.device.logical, &mut self.allocator),
                None => log::warn!("Destroy requested for stale buffer handle {:?}", buffer),
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
        let mut created = Vec::with_capacity(descs.len());
        for desc in descs {
            match VulkanTexture::new(desc, &self.device.logical, &mut self.allocator) {
                Ok(raw) => created.push(raw),
                Err(err) => {
                    log::error!("Failed to create texture {:?}: {}", desc.debug_name, err);
                    for raw in created {
                        raw.destroy(&self.device.logical, &mut self.allocator);
                    }
                    return None;
                }
            }
        }
        let mut storage = lock(&self.storage);
        Some(
            descs
                .iter()
                .zip(created)
                .map(|(desc, raw)| storage.textures.insert(TextureEntry::new(desc.clone(), raw)))
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
            match storage.textures.remove(*texture) {
                Some(entry) => entry.raw.destroy(&self.device.logical, &mut self.allocator),
                None => log::warn!("Destroy requested for stale texture handle {:?}", texture),
            }
        }
    }

    fn create_samplers(&mut self, descs: &[SamplerDesc]) -> Option<Vec<Sampler>> {
        let anisotropy = self.device.max_sampler_anisotropy();
        let mut created = Vec::with_capacity(descs.len());
        for desc in descs {
            match resources::create_sampler(desc, anisotropy, &self.device.logical) {
                Ok(raw) => created.push(raw),
                Err(err) => {
                    log::error!("Failed to create sampler {:?}: {}", desc.debug_name, err);
                    for raw in created {
                        unsafe { self.device.logical.destroy_sampler(raw, None) };
                    }
                    return None;
                }
            }
        }
        let mut storage = lock(&self.storage);
        Some(created.into_iter().map(|raw| storage.samplers.insert(raw)).collect())
    }

    fn destroy_samplers(&mut self, samplers: &[Sampler]) {
        let mut storage = lock(&self.storage);
        for sampler in samplers {
            if *sampler == self.default_sampler {
                log::warn!("The default sampler is owned by the context");
                continue;
            }
            match storage.samplers.remove(*sampler) {
                Some(raw) => unsafe { self.device.logical.destroy_sampler(raw, None) },
                None => log::warn!("Destroy requested for stale sampler handle {:?}", sampler),
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
        let raw = submission::resolve_fences::<VulkanDevice>(&lock(&self.storage).fences, fences);
        submission::wait_for_resolved_fences(&*self.device, &raw, wait_all, timeout_ns)
    }

    fn reset_fences(&self, fences: &[Fence]) -> bool {
        submission::reset_fences(&*self.device, &lock(&self.storage).fences, fences)
    }

    fn create_shader(&mut self, stage: ShaderStage, code: &[u8]) -> Result<Shader> {
        if code.is_empty() {
            return Err(eyre!("Shader code is empty"));
        }
        let shader = VulkanShader::new(stage, code, &self.device.logical)?;
        Ok(lock(&self.storage).shaders.insert(shader))
    }

    fn destroy_shader(&mut self, shader: Shader) {
        match lock(&self.storage).shaders.remove(shader) {
            Some(s) => unsafe { self.device.logical.destroy_shader_module(s.module, None) },
            None => log::warn!("Destroy requested for stale shader handle {:?}", shader),
        }
    }

    fn create_binding_layout(&mut self, entries: &[BindingLayoutEntry]) -> Result<BindingLayout> {
        let layout = VulkanBindingLayout::new(entries, &self.device.logical)?;
        Ok(lock(&self.storage).binding_layouts.insert(layout))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayout) {
        match lock(&self.storage).binding_layouts.remove(layout) {
            Some(l) => unsafe { self.device.logical.destroy_descriptor_set_layout(l.raw, None) },
            None => log::warn!("Destroy requested for stale binding layout handle {:?}", layout),
        }
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<Pipeline> {
        if desc.color_formats.is_empty() && desc.depth_format == Format::Undefined {
            return Err(eyre!("Graphics pipeline has no attachments"));
        }
        let vertex = self.shader_module(desc.vertex_shader, ShaderStage::VERTEX)?;
        let fragment = self.shader_module(desc.fragment_shader, ShaderStage::FRAGMENT)?;
        let set_layouts = self.set_layouts(&desc.layouts)?;
        let pipeline = pipeline::create_graphics_pipeline(
            desc,
            vertex,
            fragment,
            &set_layouts,
            &self.device.logical,
        )?;
        Ok(lock(&self.storage).pipelines.insert(pipeline))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<Pipeline> {
        let shader = self.shader_module(desc.compute_shader, ShaderStage::COMPUTE)?;
        let set_layouts = self.set_layouts(&desc.layouts)?;
        let pipeline = pipeline::create_compute_pipeline(desc, shader, &set_layouts, &self.device.logical)?;
        Ok(lock(&self.storage).pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: Pipeline) {
        match lock(&self.storage).pipelines.remove(pipeline) {
            Some(p) => p.destroy(&self.device.logical),
            None => log::warn!("Destroy requested for stale pipeline handle {:?}", pipeline),
        }
    }

    fn create_descriptor_tables(&mut self, layout: BindingLayout, count: u32) -> Option<Vec<DescriptorTable>> {
        let mut storage = lock(&self.storage);
        let Some(binding_layout) = storage.binding_layouts.get(layout) else {
            log::error!("Descriptor tables requested for stale layout {:?}", layout);
            return None;
        };
        let sets = unsafe {
            self.descriptor_allocator.allocate(
                &DescriptorAshDevice(&self.device.logical),
                &binding_layout.raw,
                DescriptorSetLayoutCreateFlags::empty(),
                &binding_layout.counts,
                count,
            )
        };
        match sets {
            Ok(sets) => Some(
                sets.into_iter()
                    .map(|set| storage.descriptor_tables.insert(VulkanTable { set, layout }))
                    .collect(),
            ),
            Err(err) => {
                log::error!("Failed to allocate {} descriptor tables: {:?}", count, err);
                None
            }
        }
    }

    fn destroy_descriptor_tables(&mut self, tables: &[DescriptorTable]) {
        let mut storage = lock(&self.storage);
        let mut sets = Vec::with_capacity(tables.len());
        for table in tables {
            match storage.descriptor_tables.remove(*table) {
                Some(table) => sets.push(table.set),
                None => log::warn!("Destroy requested for stale descriptor table handle {:?}", table),
            }
        }
        unsafe {
            self.descriptor_allocator
                .free(&DescriptorAshDevice(&self.device.logical), sets)
        };
    }

    fn update_descriptor_tables(&mut self, updates: &[DescriptorUpdate]) {
        let storage = lock(&self.storage);
        let Some(default_sampler) = storage.samplers.get(self.default_sampler).copied() else {
            log::error!("Default sampler is missing");
            return;
        };
        descriptor::write_descriptor_sets(updates, &storage, default_sampler, &self.device.logical);
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.frame_loop.resize(Extent2D::new(width, height))?;
        self.register_back_buffers()
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
        if let Err(err) = entry.raw.write(data, offset as usize) {
            log::error!("Write of {} bytes at {} failed: {}", data.len(), offset, err);
            return false;
        }
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
        if let Err(err) = entry.raw.read(offset as usize, out) {
            log::error!("Read of {} bytes at {} failed: {}", out.len(), offset, err);
            return false;
        }
        true
    }

    fn execute_immediate_commands<F>(&mut self, func: F) -> bool
    where
        F: FnOnce(&mut VulkanCommandList),
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

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.frame_loop.wait_idle();

        let logical = &self.device.logical;
        let mut storage = lock(&self.storage);
        let storage = &mut *storage;

        let sets = storage.descriptor_tables.drain().map(|(_, table)| table.set);
        unsafe {
            let descriptor_device = DescriptorAshDevice(logical);
            self.descriptor_allocator.free(&descriptor_device, sets);
            self.descriptor_allocator.cleanup(&descriptor_device);
        }
        for (_, pipeline) in storage.pipelines.drain() {
            pipeline.destroy(logical);
        }
        for (_, layout) in storage.binding_layouts.drain() {
            unsafe { logical.destroy_descriptor_set_layout(layout.raw, None) };
        }
        for (_, shader) in storage.shaders.drain() {
            unsafe { logical.destroy_shader_module(shader.module, None) };
        }
        for (_, sampler) in storage.samplers.drain() {
            unsafe { logical.destroy_sampler(sampler, None) };
        }
        for (_, fence) in storage.fences.drain() {
            unsafe { logical.destroy_fence(fence, None) };
        }
        for (_, entry) in storage.textures.drain() {
            entry.raw.destroy(logical, &mut self.allocator);
        }
        for (_, entry) in storage.buffers.drain() {
            entry.raw.destroy(logical, &mut self.allocator);
        }
        self.back_buffers.clear();

        // Memory blocks go back to the device before it is destroyed with the
        // last reference to it.
        unsafe { ManuallyDrop::drop(&mut self.allocator) };
    }
}
