use std::sync::Arc;
use std::time::Instant;
use color_eyre::Result;
use glam::Vec3;
use raxa_hal::{ColorAttachment, CommandList, Context, ContextConfig, LoadOp, StoreOp, VulkanContext};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

/// Clears the window to a slowly cycling color, one render pass per frame.
pub struct App {
    window: Option<Arc<Window>>,
    context: Option<VulkanContext>,
    start_time: Instant,
    error: Option<color_eyre::Report>,
}

impl App {
    pub fn new() -> Self {
        Self {
            window: None,
            context: None,
            start_time: Instant::now(),
            error: None,
        }
    }

    /// The error that stopped the event loop, if any.
    pub fn take_error(&mut self) -> Result<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(event_loop.create_window(
            Window::default_attributes().with_title("raxa-hal"),
        )?);
        let context = VulkanContext::with_window(
            ContextConfig {
                app_name: "raxa-hal-demo".into(),
                ..Default::default()
            },
            window.clone(),
        )?;
        self.window = Some(window);
        self.context = Some(context);
        Ok(())
    }

    fn resize(&mut self) -> Result<()> {
        let (Some(window), Some(context)) = (&self.window, &mut self.context) else {
            return Ok(());
        };
        let size = window.inner_size();
        // Minimized windows have no extent to render into.
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        context.resize_swapchain(size.width, size.height)
    }

    fn draw(&mut self) -> Result<()> {
        let needs_resize = self.context.as_ref().is_some_and(|c| c.needs_resize());
        if needs_resize {
            self.resize()?;
        }
        let Some(context) = &mut self.context else {
            return Ok(());
        };

        let Some((mut cmd, _frame_index)) = context.begin_frame() else {
            return Ok(());
        };
        if let Some(back_buffer) = context.back_buffer() {
            let t = self.start_time.elapsed().as_secs_f32();
            let color = Vec3::new(t.sin(), (t + 2.0).sin(), (t + 4.0).sin()) * 0.5 + Vec3::splat(0.5);
            let attachment = ColorAttachment {
                texture: back_buffer,
                resolve_target: None,
                clear_color: color.extend(1.0).to_array(),
                load_op: LoadOp::Clear,
                store_op: StoreOp::Store,
            };
            cmd.begin_rendering(&[attachment], None);
            cmd.end_rendering();
        }
        if !context.end_frame(cmd) && !context.needs_resize() {
            log::warn!("Frame {} was not submitted", context.frame_index());
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: color_eyre::Report) {
        log::error!("{}", err);
        self.error = Some(err);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.context.is_none() {
            if let Err(err) = self.init(event_loop) {
                self.fail(event_loop, err);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent
    ) {
        if self.window.as_ref().is_none_or(|window| window.id() != window_id) {
            return;
        }

        let result = match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
                Ok(())
            }
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => self.resize(),
            WindowEvent::RedrawRequested => self.draw(),
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: Key::Named(NamedKey::Escape),
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => {
                event_loop.exit();
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            self.fail(event_loop, err);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(context) = &mut self.context {
            context.wait_idle();
        }
        // The surface must go before the window it was created for.
        self.context = None;
    }
}
