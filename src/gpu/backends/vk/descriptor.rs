use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use gpu_descriptor::{
    CreatePoolError, DescriptorDevice, DescriptorPoolCreateFlags, DescriptorTotalCount,
    DeviceAllocationError,
};
use crate::gpu::backends::vk::VulkanResources;
use crate::gpu::backends::vk::conv;
use crate::gpu::contexts::resource_ctx::ResourceStorage;
use crate::gpu::handle::BindingLayout;
use crate::gpu::types::{BindingLayoutEntry, DescriptorResource, DescriptorType, DescriptorUpdate};

pub type DescriptorAllocator = gpu_descriptor::DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>;

pub struct VulkanBindingLayout {
    pub raw: vk::DescriptorSetLayout,
    pub entries: Vec<BindingLayoutEntry>,
    pub counts: DescriptorTotalCount,
}

impl VulkanBindingLayout {
    pub fn new(entries: &[BindingLayoutEntry], device: &ash::Device) -> Result<Self> {
        let mut counts = DescriptorTotalCount::default();
        let mut builder = DescriptorSetLayoutBuilder::new();
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|other| other.binding == entry.binding) {
                return Err(eyre!("Binding {} declared twice", entry.binding));
            }
            let count = entry.count.max(1);
            match entry.ty {
                DescriptorType::UniformBuffer => counts.uniform_buffer += count,
                DescriptorType::StorageBuffer => counts.storage_buffer += count,
                DescriptorType::SampledImage => counts.combined_image_sampler += count,
                DescriptorType::StorageImage => counts.storage_image += count,
            }
            builder = builder.add_binding(
                entry.binding,
                conv::descriptor_type(entry.ty),
                count,
                conv::shader_stages(entry.visibility),
            );
        }

        Ok(Self {
            raw: builder.build(device)?,
            entries: entries.to_vec(),
            counts,
        })
    }

    pub fn binding_type(&self, binding: u32) -> Option<DescriptorType> {
        self.entries
            .iter()
            .find(|entry| entry.binding == binding)
            .map(|entry| entry.ty)
    }
}

pub struct VulkanTable {
    pub set: gpu_descriptor::DescriptorSet<vk::DescriptorSet>,
    pub layout: BindingLayout,
}

struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(descriptor_type)
            .descriptor_count(descriptor_count)
            .stage_flags(stages);

        self.bindings.push(binding);
        self
    }

    fn build(
        self,
        device: &ash::Device,
    ) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings);
        Ok(unsafe {
            device.create_descriptor_set_layout(&layout_info, None)?
        })
    }
}

enum WriteInfo {
    Buffer(usize),
    Image(usize),
}

/// Writes every non-skipped update. Updates naming a stale table, binding or
/// resource are dropped with a warning.
pub fn write_descriptor_sets(
    updates: &[DescriptorUpdate],
    storage: &ResourceStorage<VulkanResources>,
    default_sampler: vk::Sampler,
    device: &ash::Device,
) {
    let mut buffer_infos = Vec::new();
    let mut image_infos = Vec::new();
    let mut pending = Vec::new();

    for update in updates.iter().filter(|update| !update.skip_update) {
        let Some(table) = storage.descriptor_tables.get(update.table) else {
            log::warn!("Update of stale descriptor table {:?}", update.table);
            continue;
        };
        let Some(ty) = storage
            .binding_layouts
            .get(table.layout)
            .and_then(|layout| layout.binding_type(update.binding))
        else {
            log::warn!("Binding {} is not part of the table's layout", update.binding);
            continue;
        };

        let info = match (update.resource, ty) {
            (
                DescriptorResource::Buffer { buffer, offset, range },
                DescriptorType::UniformBuffer | DescriptorType::StorageBuffer,
            ) => {
                let Some(entry) = storage.buffers.get(buffer) else {
                    log::warn!("Descriptor update references stale buffer {:?}", buffer);
                    continue;
                };
                buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(entry.raw.raw)
                        .offset(offset)
                        .range(if range == 0 { vk::WHOLE_SIZE } else { range }),
                );
                WriteInfo::Buffer(buffer_infos.len() - 1)
            }
            (
                DescriptorResource::Texture { texture, sampler },
                DescriptorType::SampledImage | DescriptorType::StorageImage,
            ) => {
                let Some(entry) = storage.textures.get(texture) else {
                    log::warn!("Descriptor update references stale texture {:?}", texture);
                    continue;
                };
                let (image_layout, sampler) = if ty == DescriptorType::StorageImage {
                    (vk::ImageLayout::GENERAL, vk::Sampler::null())
                } else {
                    let sampler = sampler
                        .and_then(|sampler| storage.samplers.get(sampler).copied())
                        .unwrap_or(default_sampler);
                    (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, sampler)
                };
                image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(entry.raw.view)
                        .image_layout(image_layout)
                        .sampler(sampler),
                );
                WriteInfo::Image(image_infos.len() - 1)
            }
            (resource, ty) => {
                log::warn!("Cannot bind {:?} to a {:?} binding", resource, ty);
                continue;
            }
        };
        pending.push((*table.set.raw(), update.binding, update.array_element, ty, info));
    }

    let writes = pending
        .iter()
        .map(|(set, binding, element, ty, info)| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(*set)
                .dst_binding(*binding)
                .dst_array_element(*element)
                .descriptor_type(conv::descriptor_type(*ty));
            match info {
                WriteInfo::Buffer(i) => write.buffer_info(std::slice::from_ref(&buffer_infos[*i])),
                WriteInfo::Image(i) => write.image_info(std::slice::from_ref(&image_infos[*i])),
            }
        })
        .collect::<Vec<_>>();

    if !writes.is_empty() {
        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }
}

pub struct DescriptorAshDevice<'a>(pub &'a ash::Device);

impl<'a> From<&'a ash::Device> for DescriptorAshDevice<'a> {
    fn from(device: &'a ash::Device) -> Self {
        Self(device)
    }
}

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
for DescriptorAshDevice<'_>
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let mut array = [vk::DescriptorPoolSize::default(); 13];
        let mut len = 0;

        let counts = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
            (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, descriptor_count.acceleration_structure),
        ];
        for (ty, count) in counts {
            if count != 0 {
                array[len].ty = ty;
                array[len].descriptor_count = count;
                len += 1;
            }
        }

        if descriptor_count.inline_uniform_block_bytes != 0
            || descriptor_count.inline_uniform_block_bindings != 0
        {
            log::error!("Inline uniform blocks are not supported");
            return Err(CreatePoolError::OutOfHostMemory);
        }

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();

        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }

        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&array[..len])
                    .flags(ash_flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("vkCreateDescriptorPool failed: {}", err);
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.0.destroy_descriptor_pool(pool, None)
        }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();

        unsafe {
            match self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            ) {
                Ok(allocated) => {
                    sets.extend(allocated);
                    Ok(())
                }
                Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
                    Err(DeviceAllocationError::OutOfDeviceMemory)
                }
                Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
                Err(err) => {
                    log::error!("vkAllocateDescriptorSets failed: {}", err);
                    Err(DeviceAllocationError::OutOfHostMemory)
                }
            }
        }
    }

    unsafe fn dealloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        unsafe {
            if let Err(err) = self.0.free_descriptor_sets(*pool, &sets) {
                log::error!("vkFreeDescriptorSets failed: {}", err);
            }
        }
    }
}
