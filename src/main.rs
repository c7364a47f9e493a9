mod app;

use color_eyre::Result;
use winit::event_loop::{ControlFlow, EventLoop};
use app::App;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new();
    event_loop.run_app(&mut app)?;

    app.take_error()
}
