//! Backend independent core of a context.
//!
//! [`device_ctx`] abstracts the native device and holds the submission and
//! swapchain paths, [`frame_ctx`] owns the ring of frames in flight and
//! [`resource_ctx`] owns resources and their tracked states.

pub mod device_ctx;
pub mod frame_ctx;
pub mod resource_ctx;
