use std::sync::Arc;
use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use crate::gpu::config::ContextConfig;
use crate::gpu::contexts::device_ctx::target::SwapchainSync;
use crate::gpu::contexts::device_ctx::{
    AcquireOutcome, PresentDevice, PresentOutcome, QueueKind,
};
use crate::gpu::contexts::frame_ctx::FrameRing;
use crate::gpu::contexts::frame_ctx::command_list_pool::PooledCommandList;
use crate::gpu::types::Extent2D;

/// Frame lifecycle shared by every context: the frame ring plus, when the
/// context presents, the swapchain feeding it.
pub struct FrameLoop<D: PresentDevice, L> {
    ring: FrameRing<D, L>,
    swapchain: Option<SwapchainSync<D>>,
    needs_resize: bool,
    timeout_ns: u64,
    device: Arc<D>,
}

impl<D, L> FrameLoop<D, L>
where
    D: PresentDevice,
    L: PooledCommandList<Raw = D::CommandBuffer>,
{
    pub fn new(
        config: &ContextConfig,
        presenting: bool,
        device: Arc<D>,
    ) -> Result<Self> {
        let swapchain = if presenting {
            Some(SwapchainSync::new(
                config.initial_extent,
                config.min_pending_frames,
                config.vsync,
                device.clone(),
            )?)
        } else {
            None
        };

        let frame_count = swapchain
            .as_ref()
            .map_or(config.min_pending_frames.max(1), SwapchainSync::frame_count);
        let ring = FrameRing::new(device.clone(), frame_count, QueueKind::Graphics, presenting)?;

        Ok(Self {
            ring,
            swapchain,
            needs_resize: false,
            timeout_ns: config.frame_timeout_ns,
            device,
        })
    }

    /// Waits for the current frame to retire, acquires a swapchain image when
    /// presenting, then resets the frame and hands out a recording list.
    /// Nothing is reset if any earlier step fails. An image acquired by a
    /// failed call is kept and reused by the next one.
    pub fn begin<F>(&mut self, create: F) -> Option<(L, u32)>
    where
        F: FnOnce(D::CommandBuffer) -> L,
    {
        if !self.ring.wait_current(self.timeout_ns) {
            return None;
        }

        if let Some(swapchain) = &self.swapchain {
            let frame = self.ring.current_mut();
            if frame.image_index.is_some() {
                let list = self.ring.prepare_current(create)?;
                return Some((list, self.ring.active_index()));
            }
            let Some(sync) = &frame.present_sync else {
                log::error!("Presenting frame {} has no semaphores", frame.index);
                return None;
            };

            let image_index = match swapchain.acquire(sync.image_acquired, self.timeout_ns) {
                AcquireOutcome::Acquired(index) => index,
                AcquireOutcome::Suboptimal(index) => {
                    self.needs_resize = true;
                    index
                }
                AcquireOutcome::OutOfDate => {
                    log::debug!("Swapchain out of date, resize required");
                    self.needs_resize = true;
                    return None;
                }
                AcquireOutcome::Timeout => {
                    log::warn!("Timed out acquiring a swapchain image");
                    return None;
                }
                AcquireOutcome::Failed => {
                    log::error!("Failed to acquire a swapchain image");
                    self.needs_resize = true;
                    return None;
                }
            };
            frame.image_index = Some(image_index);
        }

        let list = self.ring.prepare_current(create)?;
        Some((list, self.ring.active_index()))
    }

    /// Swapchain image acquired by the current frame.
    pub fn acquired_image(&self) -> Option<u32> {
        self.ring.current().image_index
    }

    /// Submits the current frame, advances the ring and presents. The list
    /// must already have all of its transitions flushed.
    pub fn end(&mut self, list: L) -> bool {
        let frame = self.ring.current_mut();
        let image_index = frame.image_index.take();
        let (wait, signal) = match (&frame.present_sync, image_index) {
            (Some(sync), Some(_)) => (Some(sync.image_acquired), Some(sync.render_finished)),
            _ => (None, None),
        };

        let submitted = self.ring.submit_current(list, wait, signal);
        self.ring.advance();
        if !submitted {
            // The acquired image and its semaphore signal were never consumed.
            if self.swapchain.is_some() {
                self.needs_resize = true;
            }
            return false;
        }

        let (Some(swapchain), Some(image_index), Some(render_finished)) =
            (&self.swapchain, image_index, signal)
        else {
            return true;
        };

        match swapchain.present(self.ring.queue(), image_index, render_finished) {
            PresentOutcome::Presented => true,
            PresentOutcome::Suboptimal => {
                self.needs_resize = true;
                true
            }
            PresentOutcome::OutOfDate => {
                log::debug!("Swapchain out of date after present, resize required");
                self.needs_resize = true;
                false
            }
            PresentOutcome::Failed => {
                log::error!("Failed to present swapchain image {}", image_index);
                false
            }
        }
    }

    /// Drains the device, recreates the swapchain and rebuilds the frame
    /// ring for the new image count. The active index restarts at 0.
    pub fn resize(&mut self, requested: Extent2D) -> Result<()> {
        if !cfg!(feature = "graphics") {
            return Err(eyre!("Swapchain resize requires the `graphics` feature"));
        }
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_eyre("Swapchain resize requires a context created with a surface")?;

        self.device.wait_idle()?;
        self.ring.wait_all();

        swapchain.recreate(requested)?;
        self.ring = FrameRing::new(
            self.device.clone(),
            swapchain.frame_count(),
            self.ring.queue(),
            true,
        )?;
        self.needs_resize = false;

        log::info!(
            "Swapchain resized to {}x{}",
            swapchain.extent().width,
            swapchain.extent().height,
        );
        Ok(())
    }

    pub fn wait_idle(&mut self) -> bool {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {}", err);
            return false;
        }
        self.ring.wait_all()
    }

    pub fn needs_resize(&self) -> bool {
        self.needs_resize
    }

    pub fn frame_index(&self) -> u32 {
        self.ring.active_index()
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.ring.len()
    }

    pub fn ring(&self) -> &FrameRing<D, L> {
        &self.ring
    }

    pub fn swapchain(&self) -> Option<&SwapchainSync<D>> {
        self.swapchain.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::gpu::backends::headless::device::{CommandBufferId, FaultPoint, HeadlessDevice};
    use crate::gpu::contexts::device_ctx::SurfaceCapabilities;
    use crate::gpu::types::Format;

    struct TestList(CommandBufferId);

    impl PooledCommandList for TestList {
        type Raw = CommandBufferId;

        fn raw(&self) -> CommandBufferId {
            self.0
        }

        fn recycle(&mut self) {}
    }

    fn presenting_loop() -> (Arc<HeadlessDevice>, FrameLoop<HeadlessDevice, TestList>) {
        let caps = SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: None,
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(4096, 4096),
            format: Format::B8G8R8A8Srgb,
        };
        let device = Arc::new(HeadlessDevice::new(Duration::ZERO, Some(caps)));
        let config = ContextConfig {
            initial_extent: Extent2D::new(64, 64),
            ..Default::default()
        };
        let frame_loop = FrameLoop::new(&config, true, device.clone()).unwrap();
        (device, frame_loop)
    }

    #[test]
    fn failed_reset_keeps_the_acquired_image() {
        let (device, mut frame_loop) = presenting_loop();

        device.fail_next(FaultPoint::PoolReset);
        assert!(frame_loop.begin(TestList).is_none());
        let acquired = frame_loop.acquired_image();
        assert!(acquired.is_some());

        let (list, _) = frame_loop.begin(TestList).unwrap();
        assert_eq!(frame_loop.acquired_image(), acquired);
        assert!(frame_loop.end(list));

        for _ in 0..4 {
            let (list, _) = frame_loop.begin(TestList).unwrap();
            assert!(frame_loop.end(list));
        }
        assert!(device.violations().is_empty());
        assert_eq!(device.present_count(), 5);
    }

    #[cfg(feature = "graphics")]
    #[test]
    fn failed_submit_requests_a_resize() {
        let (device, mut frame_loop) = presenting_loop();

        let (list, _) = frame_loop.begin(TestList).unwrap();
        device.fail_next(FaultPoint::Submit);
        assert!(!frame_loop.end(list));
        assert!(frame_loop.needs_resize());

        frame_loop.resize(Extent2D::new(64, 64)).unwrap();
        assert!(!frame_loop.needs_resize());
        for _ in 0..4 {
            let (list, _) = frame_loop.begin(TestList).unwrap();
            assert!(frame_loop.end(list));
        }
        assert!(device.violations().is_empty());
    }
}
