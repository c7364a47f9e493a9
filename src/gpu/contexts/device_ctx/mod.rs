pub mod submission;
pub mod target;

use std::fmt::Debug;
use color_eyre::Result;
use crate::gpu::types::{Extent2D, Format};

/// Timeout that never expires.
pub const WAIT_FOREVER: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// One batch of command buffers plus the synchronization around it.
pub struct SubmitInfo<'a, D: SyncDevice + ?Sized> {
    pub command_buffers: &'a [D::CommandBuffer],
    pub wait_semaphores: &'a [D::Semaphore],
    pub signal_semaphores: &'a [D::Semaphore],
    pub fence: Option<D::Fence>,
}

/// Native synchronization and command recording objects of a device.
///
/// Responsibilities:
/// - Create and destroy fences, semaphores, command pools and buffers
/// - Submit recorded command buffers to a queue
/// - Block the host on fences
pub trait SyncDevice {
    type Fence: Copy + Eq + Debug;
    type Semaphore: Copy + Eq + Debug;
    type CommandPool: Copy + Eq + Debug;
    type CommandBuffer: Copy + Eq + Debug;

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence>;
    fn destroy_fence(&self, fence: Self::Fence);
    /// `Ok(false)` when the timeout expired first.
    fn wait_for_fences(&self, fences: &[Self::Fence], wait_all: bool, timeout_ns: u64) -> Result<bool>;
    fn reset_fences(&self, fences: &[Self::Fence]) -> Result<()>;

    fn create_semaphore(&self) -> Result<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    /// Transient pools are reset as a whole after every use.
    fn create_command_pool(&self, queue: QueueKind, transient: bool) -> Result<Self::CommandPool>;
    /// Destroys the pool together with every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: Self::CommandPool);
    fn reset_command_pool(&self, pool: Self::CommandPool) -> Result<()>;
    fn allocate_command_buffer(&self, pool: Self::CommandPool) -> Result<Self::CommandBuffer>;
    fn begin_command_buffer(&self, command_buffer: Self::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: Self::CommandBuffer) -> Result<()>;

    fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_, Self>) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// 0 means no upper limit.
    pub max_image_count: u32,
    /// Size the surface already has, if the platform fixes it.
    pub current_extent: Option<Extent2D>,
    pub min_extent: Extent2D,
    pub max_extent: Extent2D,
    pub format: Format,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// Usable, but the swapchain should be recreated.
    Suboptimal(u32),
    OutOfDate,
    Timeout,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
    Failed,
}

/// A device that can drive a presentation surface.
pub trait PresentDevice: SyncDevice {
    type Swapchain: Copy + Eq + Debug;
    type Image: Copy + Eq + Debug;

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities>;
    fn create_swapchain(
        &self,
        extent: Extent2D,
        image_count: u32,
        vsync: bool,
        old: Option<Self::Swapchain>,
    ) -> Result<Self::Swapchain>;
    fn destroy_swapchain(&self, swapchain: Self::Swapchain);
    fn swapchain_images(&self, swapchain: Self::Swapchain) -> Result<Vec<Self::Image>>;

    fn acquire_next_image(
        &self,
        swapchain: Self::Swapchain,
        signal: Self::Semaphore,
        timeout_ns: u64,
    ) -> AcquireOutcome;
    fn present(
        &self,
        queue: QueueKind,
        swapchain: Self::Swapchain,
        image_index: u32,
        wait: Self::Semaphore,
    ) -> PresentOutcome;
}
