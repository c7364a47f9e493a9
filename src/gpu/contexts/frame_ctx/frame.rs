use std::sync::Arc;
use color_eyre::Result;
use crate::gpu::contexts::device_ctx::{QueueKind, SyncDevice};
use crate::gpu::contexts::frame_ctx::command_list_pool::{CommandListPool, PooledCommandList};

pub struct PresentSync<D: SyncDevice> {
    // Signals when the swapchain image is ready to be rendered into.
    pub image_acquired: D::Semaphore,

    // Signals when rendering commands have finished and the image can be presented.
    pub render_finished: D::Semaphore,
}

/// One slot of the frame ring.
pub struct Frame<D: SyncDevice, L> {
    pub index: u32,

    // Signals when all commands submitted through this frame have finished execution.
    pub fence: D::Fence,
    pub command_pool: D::CommandPool,
    pub command_lists: CommandListPool<L>,

    /// Work was submitted with `fence` and nobody has waited on it yet.
    pub in_flight: bool,

    pub present_sync: Option<PresentSync<D>>,
    /// Swapchain image acquired for the current cycle.
    pub image_index: Option<u32>,

    device: Arc<D>,
}

impl<D: SyncDevice, L: PooledCommandList> Frame<D, L> {
    pub fn new(
        index: u32,
        queue: QueueKind,
        presenting: bool,
        device: Arc<D>,
    ) -> Result<Self> {
        // Created unsignalled; the first cycle never waits because nothing is in flight.
        let fence = device.create_fence(false)?;
        let command_pool = match device.create_command_pool(queue, true) {
            Ok(pool) => pool,
            Err(err) => {
                device.destroy_fence(fence);
                return Err(err);
            }
        };

        let present_sync = if presenting {
            match Self::create_present_sync(&device) {
                Ok(sync) => Some(sync),
                Err(err) => {
                    device.destroy_command_pool(command_pool);
                    device.destroy_fence(fence);
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Self {
            index,
            fence,
            command_pool,
            command_lists: CommandListPool::new(),
            in_flight: false,
            present_sync,
            image_index: None,
            device,
        })
    }

    fn create_present_sync(device: &D) -> Result<PresentSync<D>> {
        let image_acquired = device.create_semaphore()?;
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(err) => {
                device.destroy_semaphore(image_acquired);
                return Err(err);
            }
        };
        Ok(PresentSync {
            image_acquired,
            render_finished,
        })
    }
}

impl<D: SyncDevice, L> Drop for Frame<D, L> {
    fn drop(&mut self) {
        if let Some(sync) = self.present_sync.take() {
            self.device.destroy_semaphore(sync.image_acquired);
            self.device.destroy_semaphore(sync.render_finished);
        }
        self.device.destroy_command_pool(self.command_pool);
        self.device.destroy_fence(self.fence);
    }
}
