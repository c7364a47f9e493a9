//! Hardware abstraction layer for issuing draw, compute and copy work.
//!
//! The interesting parts live in [`gpu::contexts`]: the frame ring that keeps a
//! bounded number of frames in flight, the per-frame command list cache, the
//! subresource state tracker and the swapchain synchronization. Backends in
//! [`gpu::backends`] plug native objects into that core.

pub mod gpu;

pub use gpu::backends::headless::{HeadlessConfig, HeadlessContext};
pub use gpu::backends::vk::VulkanContext;
pub use gpu::config::ContextConfig;
pub use gpu::handle::*;
pub use gpu::types::*;
pub use gpu::{CommandList, Context};
