use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use crate::gpu::backends::vk::conv;
use crate::gpu::types::{BufferDesc, SamplerDesc, TextureDesc, TextureType};

pub struct VulkanBuffer {
    pub raw: vk::Buffer,
    allocation: Option<Allocation>,
}

impl VulkanBuffer {
    /// Host visible buffers live in `CpuToGpu` memory and stay mapped.
    pub fn new(
        desc: &BufferDesc,
        device: &ash::Device,
        allocator: &mut Allocator,
    ) -> Result<Self> {
        let buffer = {
            let buffer_info = vk::BufferCreateInfo {
                size: desc.size_bytes,
                usage: conv::buffer_usage(desc.usage),
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            unsafe { device.create_buffer(&buffer_info, None)? }
        };

        let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = allocator.allocate(&AllocationCreateDesc {
            name: desc.debug_name.as_deref().unwrap_or("buffer"),
            requirements: reqs,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe {
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { device.destroy_buffer(buffer, None) };
            let _ = allocator.free(allocation);
            return Err(err.into());
        }

        Ok(Self {
            raw: buffer,
            allocation: Some(allocation),
        })
    }

    pub fn write(&mut self, data: &[u8], start_offset: usize) -> Result<()> {
        let allocation = self
            .allocation
            .as_mut()
            .ok_or_eyre("Buffer has no memory")?;
        presser::copy_from_slice_to_offset(data, allocation, start_offset)?;
        Ok(())
    }

    pub fn read(&self, start_offset: usize, out: &mut [u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_eyre("Buffer memory is not mapped")?;
        let source = mapped
            .get(start_offset..start_offset.saturating_add(out.len()))
            .ok_or_else(|| eyre!("Read of {} bytes at {} is out of bounds", out.len(), start_offset))?;
        out.copy_from_slice(source);
        Ok(())
    }

    pub fn destroy(mut self, device: &ash::Device, allocator: &mut Allocator) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {}", err);
            }
        }
        unsafe { device.destroy_buffer(self.raw, None) };
    }
}

pub struct VulkanTexture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    // None for swapchain images, which the swapchain owns.
    allocation: Option<Allocation>,
}

impl VulkanTexture {
    pub fn new(
        desc: &TextureDesc,
        device: &ash::Device,
        allocator: &mut Allocator,
    ) -> Result<Self> {
        let format = conv::format(desc.format);
        let flags = if desc.texture_type == TextureType::TextureCube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(conv::image_type(desc.texture_type))
            .format(format)
            .extent(conv::extent(desc.width, desc.height, desc.depth))
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::image_usage(desc.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&image_info, None)? };

        let reqs = unsafe { device.get_image_memory_requirements(image) };
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: desc.debug_name.as_deref().unwrap_or("texture"),
            requirements: reqs,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::DedicatedImage(image),
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err.into());
            }
        };

        let view = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
            .map_err(Into::into)
            .and_then(|()| {
                Self::create_view(
                    image,
                    format,
                    conv::view_type(desc.texture_type, desc.array_layers),
                    conv::aspect(desc.format),
                    device,
                )
            });
        match view {
            Ok(view) => Ok(Self {
                image,
                view,
                allocation: Some(allocation),
            }),
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                let _ = allocator.free(allocation);
                Err(err)
            }
        }
    }

    pub fn from_swapchain_image(
        image: vk::Image,
        format: vk::Format,
        device: &ash::Device,
    ) -> Result<Self> {
        let view = Self::create_view(
            image,
            format,
            vk::ImageViewType::TYPE_2D,
            vk::ImageAspectFlags::COLOR,
            device,
        )?;
        Ok(Self {
            image,
            view,
            allocation: None,
        })
    }

    fn create_view(
        image: vk::Image,
        format: vk::Format,
        view_type: vk::ImageViewType,
        aspect_mask: vk::ImageAspectFlags,
        device: &ash::Device,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .view_type(view_type)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .image(image);
        Ok(unsafe { device.create_image_view(&view_info, None)? })
    }

    pub fn destroy(mut self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe { device.destroy_image_view(self.view, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = allocator.free(allocation) {
                log::error!("Failed to free texture memory: {}", err);
            }
            unsafe { device.destroy_image(self.image, None) };
        }
    }
}

pub fn create_sampler(
    desc: &SamplerDesc,
    max_anisotropy: Option<f32>,
    device: &ash::Device,
) -> Result<vk::Sampler> {
    let (filter, mipmap_mode) = if desc.linear_filter {
        (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR)
    } else {
        (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST)
    };
    let address_mode = if desc.repeat_uv {
        vk::SamplerAddressMode::REPEAT
    } else {
        vk::SamplerAddressMode::CLAMP_TO_EDGE
    };
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(max_anisotropy.is_some() && desc.linear_filter)
        .max_anisotropy(max_anisotropy.unwrap_or(1.0))
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE);
    Ok(unsafe { device.create_sampler(&sampler_info, None)? })
}
