use std::sync::Arc;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crate::gpu::contexts::device_ctx::{
    AcquireOutcome, PresentDevice, PresentOutcome, QueueKind, SurfaceCapabilities,
};
use crate::gpu::types::{Extent2D, Format};

/// Number of frames to keep in flight for a surface: at least
/// `min_pending_frames`, at least the surface's minimum image count, and
/// never more than its maximum when it has one.
pub fn derive_frame_count(min_pending_frames: u32, caps: &SurfaceCapabilities) -> u32 {
    let count = min_pending_frames.max(caps.min_image_count).max(1);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// The extent a swapchain will actually get for a requested size.
pub fn clamp_extent(requested: Extent2D, caps: &SurfaceCapabilities) -> Extent2D {
    if let Some(current) = caps.current_extent {
        return current;
    }
    Extent2D {
        width: requested.width.clamp(caps.min_extent.width, caps.max_extent.width.max(caps.min_extent.width)),
        height: requested.height.clamp(caps.min_extent.height, caps.max_extent.height.max(caps.min_extent.height)),
    }
}

/// Presentation target: the swapchain and its images, sized against the
/// surface capabilities.
pub struct SwapchainSync<D: PresentDevice> {
    swapchain: D::Swapchain,
    images: Vec<D::Image>,
    extent: Extent2D,
    format: Format,
    frame_count: u32,

    min_pending_frames: u32,
    vsync: bool,
    device: Arc<D>,
}

impl<D: PresentDevice> SwapchainSync<D> {
    pub fn new(
        extent: Extent2D,
        min_pending_frames: u32,
        vsync: bool,
        device: Arc<D>,
    ) -> Result<Self> {
        let caps = device.surface_capabilities()?;
        let (swapchain, images, extent, frame_count) =
            Self::create(&device, &caps, extent, min_pending_frames, vsync, None)?;

        Ok(Self {
            swapchain,
            images,
            extent,
            format: caps.format,
            frame_count,
            min_pending_frames,
            vsync,
            device,
        })
    }

    fn create(
        device: &D,
        caps: &SurfaceCapabilities,
        requested: Extent2D,
        min_pending_frames: u32,
        vsync: bool,
        old: Option<D::Swapchain>,
    ) -> Result<(D::Swapchain, Vec<D::Image>, Extent2D, u32)> {
        let extent = clamp_extent(requested, caps);
        if extent.width == 0 || extent.height == 0 {
            return Err(eyre!("Cannot create a swapchain with an empty extent"));
        }
        let frame_count = derive_frame_count(min_pending_frames, caps);

        let swapchain = device.create_swapchain(extent, frame_count, vsync, old)?;
        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(err) => {
                device.destroy_swapchain(swapchain);
                return Err(err);
            }
        };

        log::info!(
            "Created swapchain {}x{} with {} images, {} frames in flight",
            extent.width,
            extent.height,
            images.len(),
            frame_count,
        );

        Ok((swapchain, images, extent, frame_count))
    }

    /// Replaces the swapchain with one of the requested size. The device
    /// must be idle.
    pub fn recreate(&mut self, requested: Extent2D) -> Result<()> {
        let caps = self.device.surface_capabilities()?;
        let (swapchain, images, extent, frame_count) = Self::create(
            &self.device,
            &caps,
            requested,
            self.min_pending_frames,
            self.vsync,
            Some(self.swapchain),
        )?;

        self.device.destroy_swapchain(self.swapchain);
        self.swapchain = swapchain;
        self.images = images;
        self.extent = extent;
        self.format = caps.format;
        self.frame_count = frame_count;
        Ok(())
    }

    pub fn acquire(&self, signal: D::Semaphore, timeout_ns: u64) -> AcquireOutcome {
        self.device.acquire_next_image(self.swapchain, signal, timeout_ns)
    }

    pub fn present(&self, queue: QueueKind, image_index: u32, wait: D::Semaphore) -> PresentOutcome {
        self.device.present(queue, self.swapchain, image_index, wait)
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn images(&self) -> &[D::Image] {
        &self.images
    }
}

impl<D: PresentDevice> Drop for SwapchainSync<D> {
    fn drop(&mut self) {
        self.device.destroy_swapchain(self.swapchain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min_images: u32, max_images: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: None,
            min_extent: Extent2D::new(64, 64),
            max_extent: Extent2D::new(1920, 1080),
            format: Format::B8G8R8A8Srgb,
        }
    }

    #[test]
    fn frame_count_respects_surface_limits() {
        assert_eq!(derive_frame_count(2, &caps(3, 8)), 3);
        assert_eq!(derive_frame_count(4, &caps(2, 3)), 3);
        assert_eq!(derive_frame_count(5, &caps(2, 0)), 5);
        assert_eq!(derive_frame_count(0, &caps(0, 0)), 1);
    }

    #[test]
    fn extent_is_clamped_into_surface_range() {
        let caps = caps(2, 0);
        assert_eq!(clamp_extent(Extent2D::new(4000, 10), &caps), Extent2D::new(1920, 64));
        assert_eq!(clamp_extent(Extent2D::new(800, 600), &caps), Extent2D::new(800, 600));
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let mut caps = caps(2, 0);
        caps.current_extent = Some(Extent2D::new(1280, 720));
        assert_eq!(clamp_extent(Extent2D::new(10, 10), &caps), Extent2D::new(1280, 720));
    }
}
