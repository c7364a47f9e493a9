use crate::gpu::contexts::device_ctx::WAIT_FOREVER;
use crate::gpu::types::Extent2D;

/// Contains configuration options for a context like validation, the number
/// of frames kept in flight and the initial surface size. The backend is
/// picked by the context type it is passed to.
#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub app_name: String,
    pub validation_enabled: bool,
    /// Lower bound on the number of frame contexts. Presenting contexts may
    /// use more if the surface needs more images.
    pub min_pending_frames: u32,
    pub initial_extent: Extent2D,
    /// How long `begin_frame` blocks on a frame fence before giving up.
    pub frame_timeout_ns: u64,
    pub vsync: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "raxa_app".into(),
            validation_enabled: cfg!(debug_assertions),
            min_pending_frames: 2,
            initial_extent: Extent2D::new(800, 600),
            frame_timeout_ns: WAIT_FOREVER,
            vsync: true,
        }
    }
}
