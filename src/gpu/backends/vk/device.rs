use std::ffi::{c_char, CStr};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use smallvec::SmallVec;
use crate::gpu::backends::vk::conv;
use crate::gpu::backends::vk::instance::VulkanInstance;
use crate::gpu::backends::vk::queue::{self, Queue, QueueFamily};
use crate::gpu::contexts::device_ctx::{
    AcquireOutcome, PresentDevice, PresentOutcome, QueueKind, SubmitInfo, SurfaceCapabilities,
    SyncDevice,
};
use crate::gpu::types::Extent2D;

pub struct VulkanSurface {
    pub raw: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
    pub format: vk::SurfaceFormatKHR,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Logical device plus its queues and, for presenting contexts, the surface.
/// Implements the synchronization and presentation primitives the frame
/// ring and swapchain run on.
pub struct VulkanDevice {
    pub logical: ash::Device,
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,

    graphics_queue: Queue,
    compute_queue: Queue,
    transfer_queue: Queue,

    surface: Option<VulkanSurface>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,

    // Dropped last.
    pub instance: VulkanInstance,
}

impl VulkanDevice {
    /// Takes ownership of `surface`; it is destroyed with the device, or
    /// right away if device creation fails.
    pub fn new(
        instance: VulkanInstance,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<Self> {
        let surface_loader = ash::khr::surface::Instance::new(&instance.entry, &instance.instance);
        match Self::create(&instance, surface, &surface_loader) {
            Ok((logical, physical, properties, queues, surface)) => {
                let [graphics_queue, compute_queue, transfer_queue] = queues;
                let swapchain_loader = surface
                    .as_ref()
                    .map(|_| ash::khr::swapchain::Device::new(&instance.instance, &logical));
                Ok(Self {
                    logical,
                    physical,
                    properties,
                    graphics_queue,
                    compute_queue,
                    transfer_queue,
                    surface,
                    swapchain_loader,
                    instance,
                })
            }
            Err(err) => {
                if let Some(surface) = surface {
                    unsafe { surface_loader.destroy_surface(surface, None) };
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create(
        instance: &VulkanInstance,
        surface: Option<vk::SurfaceKHR>,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<(ash::Device, vk::PhysicalDevice, vk::PhysicalDeviceProperties, [Queue; 3], Option<VulkanSurface>)> {
        let presenting = surface.is_some();
        let (physical, graphics_family, compute_family, transfer_family) =
            Self::select_physical_device(&instance.instance, surface.map(|s| (s, surface_loader)))?;
        let properties = unsafe { instance.instance.get_physical_device_properties(physical) };

        let surface = match surface {
            Some(raw) => Some(Self::describe_surface(raw, surface_loader.clone(), physical)?),
            None => None,
        };

        let (logical, queues) = Self::create_logical_device(
            &instance.instance,
            physical,
            [graphics_family, compute_family, transfer_family],
            presenting,
        )?;

        log::info!(
            "Using {:?} (graphics family {}, compute family {}, transfer family {})",
            properties.device_name_as_c_str().unwrap_or(c"unknown device"),
            graphics_family.index,
            compute_family.index,
            transfer_family.index,
        );
        Ok((logical, physical, properties, queues, surface))
    }

    pub fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Graphics => &self.graphics_queue,
            QueueKind::Compute => &self.compute_queue,
            QueueKind::Transfer => &self.transfer_queue,
        }
    }

    /// `None` when anisotropic filtering was not enabled on the device.
    pub fn max_sampler_anisotropy(&self) -> Option<f32> {
        let features = unsafe {
            self.instance
                .instance
                .get_physical_device_features(self.physical)
        };
        (features.sampler_anisotropy == vk::TRUE)
            .then(|| self.properties.limits.max_sampler_anisotropy.min(16.0))
    }

    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    fn surface(&self) -> Result<&VulkanSurface> {
        self.surface
            .as_ref()
            .ok_or_eyre("Device was created without a surface")
    }

    fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }

    fn describe_surface(
        raw: vk::SurfaceKHR,
        loader: ash::khr::surface::Instance,
        physical: vk::PhysicalDevice,
    ) -> Result<VulkanSurface> {
        let formats = unsafe { loader.get_physical_device_surface_formats(physical, raw)? };
        let present_modes = unsafe { loader.get_physical_device_surface_present_modes(physical, raw)? };

        let format = formats
            .iter()
            .find(|format| {
                format.format == vk::Format::B8G8R8A8_SRGB
                    && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| {
                formats
                    .iter()
                    .find(|format| conv::surface_format(format.format) != crate::gpu::types::Format::Undefined)
            })
            .copied()
            .ok_or_eyre("No suitable surface format found")?;

        Ok(VulkanSurface {
            raw,
            loader,
            format,
            present_modes,
        })
    }

    fn required_device_extensions(presenting: bool) -> Vec<&'static CStr> {
        let mut exts = Vec::new();
        if presenting {
            exts.push(ash::khr::swapchain::NAME);
        }
        #[cfg(target_os = "macos")]
        exts.push(ash::khr::portability_subset::NAME);
        exts
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
    ) -> Result<(vk::PhysicalDevice, QueueFamily, QueueFamily, QueueFamily)> {
        let req_device_exts = Self::required_device_extensions(surface.is_some());

        let devices = unsafe { instance.enumerate_physical_devices()? };
        devices
            .into_iter()
            // Dynamic rendering and synchronization2 are core in 1.3
            .filter(|device| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                props.api_version >= vk::API_VERSION_1_3
            })
            // Filter out devices that do not contain the required device extensions
            .filter(|device| {
                let supported_extensions = unsafe {
                    instance
                        .enumerate_device_extension_properties(*device)
                        .unwrap_or_default()
                };
                req_device_exts.iter().all(|req_ext| {
                    let supported = supported_extensions
                        .iter()
                        .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *req_ext));
                    if !supported {
                        log::warn!("Device extension not supported: {:?}", req_ext);
                    }
                    supported
                })
            })
            // Filter out devices that do not contain the required queues
            .filter_map(|device| {
                let props = unsafe { instance.get_physical_device_queue_family_properties(device) };
                let supports_present = |index: u32| match surface {
                    Some((surface, loader)) => unsafe {
                        loader
                            .get_physical_device_surface_support(device, index, surface)
                            .unwrap_or(false)
                    },
                    None => false,
                };
                let (graphics, compute, transfer) =
                    queue::select_families(&props, supports_present, surface.is_some())?;
                Some((device, graphics, compute, transfer))
            })
            .min_by_key(|(device, _, _, _)| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                    vk::PhysicalDeviceType::CPU => 3,
                    vk::PhysicalDeviceType::OTHER => 4,
                    _ => 5,
                }
            })
            .ok_or_eyre("No suitable physical device found")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: [QueueFamily; 3],
        presenting: bool,
    ) -> Result<(ash::Device, [Queue; 3])> {
        let queue_priorities = [1.0];
        let mut unique_families: SmallVec<[u32; 3]> = SmallVec::new();
        for family in &families {
            if !unique_families.contains(&family.index) {
                unique_families.push(family.index);
            }
        }
        let queue_create_infos = unique_families
            .iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(*index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let enabled_extension_names = Self::required_device_extensions(presenting)
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures::default()
            .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
            .image_cube_array(supported.image_cube_array == vk::TRUE)
            .multi_draw_indirect(supported.multi_draw_indirect == vk::TRUE)
            .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);
        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&features)
            .push_next(&mut vulkan_13_features);

        let device = unsafe {
            instance.create_device(physical_device, &device_create_info, None)?
        };

        let queues = families.map(|family| {
            let handle = unsafe { device.get_device_queue(family.index, 0) };
            Queue::new(family, handle)
        });

        Ok((device, queues))
    }

    fn present_mode(&self, surface: &VulkanSurface, vsync: bool) -> vk::PresentModeKHR {
        if vsync {
            return vk::PresentModeKHR::FIFO;
        }
        [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
            .into_iter()
            .find(|mode| surface.present_modes.contains(mode))
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }
}

impl SyncDevice for VulkanDevice {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type CommandPool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        Ok(unsafe {
            self.logical
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.logical.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64) -> Result<bool> {
        if fences.is_empty() {
            return Ok(true);
        }
        match unsafe { self.logical.wait_for_fences(fences, wait_all, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        if fences.is_empty() {
            return Ok(());
        }
        Ok(unsafe { self.logical.reset_fences(fences)? })
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(unsafe {
            self.logical
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.logical.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, queue: QueueKind, transient: bool) -> Result<vk::CommandPool> {
        let flags = if transient {
            vk::CommandPoolCreateFlags::TRANSIENT
        } else {
            vk::CommandPoolCreateFlags::empty()
        };
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue(queue).family.index)
            .flags(flags);
        Ok(unsafe { self.logical.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.logical.destroy_command_pool(pool, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        Ok(unsafe {
            self.logical
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        })
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.logical.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_eyre("Driver returned no command buffer")
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        Ok(unsafe { self.logical.begin_command_buffer(command_buffer, &info)? })
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { self.logical.end_command_buffer(command_buffer)? })
    }

    fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_, Self>) -> Result<()> {
        let semaphore_info = |semaphore: &vk::Semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(*semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        };
        let waits: SmallVec<[_; 4]> = info.wait_semaphores.iter().map(semaphore_info).collect();
        let signals: SmallVec<[_; 4]> = info.signal_semaphores.iter().map(semaphore_info).collect();
        let command_buffers: SmallVec<[_; 4]> = info
            .command_buffers
            .iter()
            .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(*cb))
            .collect();

        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        let queue = self.queue(queue).lock();
        Ok(unsafe {
            self.logical.queue_submit2(
                *queue,
                &[submit],
                info.fence.unwrap_or(vk::Fence::null()),
            )?
        })
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(unsafe { self.logical.device_wait_idle()? })
    }
}

impl PresentDevice for VulkanDevice {
    type Swapchain = vk::SwapchainKHR;
    type Image = vk::Image;

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        let surface = self.surface()?;
        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(self.physical, surface.raw)?
        };
        let current_extent = (caps.current_extent.width != u32::MAX)
            .then(|| Extent2D::new(caps.current_extent.width, caps.current_extent.height));
        Ok(SurfaceCapabilities {
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            current_extent,
            min_extent: Extent2D::new(caps.min_image_extent.width, caps.min_image_extent.height),
            max_extent: Extent2D::new(caps.max_image_extent.width, caps.max_image_extent.height),
            format: conv::surface_format(surface.format.format),
        })
    }

    fn create_swapchain(
        &self,
        extent: Extent2D,
        image_count: u32,
        vsync: bool,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<vk::SwapchainKHR> {
        let surface = self.surface()?;
        let loader = self
            .swapchain_loader()
            .ok_or_eyre("Swapchain extension not loaded")?;
        if extent.width == 0 || extent.height == 0 {
            return Err(eyre!("Cannot create a {}x{} swapchain", extent.width, extent.height));
        }

        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(self.physical, surface.raw)?
        };
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw)
            .min_image_count(image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(vk::Extent2D {
                width: extent.width,
                height: extent.height,
            })
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode(surface, vsync))
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old.unwrap_or(vk::SwapchainKHR::null()));

        Ok(unsafe { loader.create_swapchain(&swapchain_info, None)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = self.swapchain_loader() {
            unsafe { loader.destroy_swapchain(swapchain, None) }
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let loader = self
            .swapchain_loader()
            .ok_or_eyre("Swapchain extension not loaded")?;
        Ok(unsafe { loader.get_swapchain_images(swapchain)? })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> AcquireOutcome {
        let Some(loader) = self.swapchain_loader() else {
            return AcquireOutcome::Failed;
        };
        match unsafe { loader.acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null()) } {
            Ok((index, false)) => AcquireOutcome::Acquired(index),
            Ok((index, true)) => AcquireOutcome::Suboptimal(index),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => AcquireOutcome::OutOfDate,
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => AcquireOutcome::Timeout,
            Err(err) => {
                log::error!("vkAcquireNextImageKHR failed: {}", err);
                AcquireOutcome::Failed
            }
        }
    }

    fn present(
        &self,
        queue: QueueKind,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> PresentOutcome {
        let Some(loader) = self.swapchain_loader() else {
            return PresentOutcome::Failed;
        };
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue(queue).lock();
        match unsafe { loader.queue_present(*queue, &present_info) } {
            Ok(false) => PresentOutcome::Presented,
            Ok(true) => PresentOutcome::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentOutcome::OutOfDate,
            Err(err) => {
                log::error!("vkQueuePresentKHR failed: {}", err);
                PresentOutcome::Failed
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.logical.device_wait_idle() {
                log::error!("Failed to wait for device idle on shutdown: {}", err);
            }
            self.logical.destroy_device(None);
            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.raw, None);
            }
        }
    }
}
