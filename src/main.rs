use anyhow::{Context, Result};
use log::{error, info};
use winit::{
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::EventLoop,
    window::WindowBuilder,
};

use gpu_rt_renderer::{
    Camera, GpuContext, InputState, Model, OrbitController, Presenter, Renderer, RendererConfig,
};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

/// Scene from the first argument (with its camera, if any), or the demo scene
fn load_model() -> Result<(Model, Option<Camera>)> {
    match std::env::args().nth(1) {
        Some(path) => Model::load_gltf(&path).with_context(|| format!("failed to load scene {path}")),
        None => {
            info!("No scene given, using the demo scene");
            Ok((Model::demo(), None))
        }
    }
}

fn run() -> Result<()> {
    // The renderer borrows the model for the whole event loop
    let (model, scene_camera) = load_model()?;
    let model: &'static Model = Box::leak(Box::new(model));
    let config = RendererConfig::from_env();

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("GPU Ray Tracer")
        .build(&event_loop)
        .context("failed to create window")?;

    let (context, surface) = GpuContext::with_surface(&config, &window)?;
    let size = window.inner_size();
    let mut presenter = Presenter::new(&context, surface, size.width, size.height)?;
    let mut renderer = Renderer::new(context, model, config)?;

    let bounds = model.bounds();
    let initial_camera = match scene_camera {
        Some(camera) => camera,
        None if bounds.is_empty() => Camera::default(),
        None => Camera::framing(bounds.center(), bounds.span()),
    };
    let mut controller = OrbitController::from_camera(&initial_camera);
    let mut input = InputState::new();
    renderer.set_camera(&controller.camera());
    renderer.resize(size.width, size.height)?;
    let mut pixels = vec![0u32; (size.width * size.height) as usize];

    event_loop.run(move |event, _, control_flow| match event {
        Event::WindowEvent { ref event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                input: KeyboardInput {
                    state: ElementState::Pressed,
                    virtual_keycode: Some(VirtualKeyCode::Escape),
                    ..
                },
                ..
            } => control_flow.set_exit(),
            WindowEvent::Resized(physical_size) => {
                let (width, height) = (physical_size.width, physical_size.height);
                if let Err(err) = renderer.resize(width, height) {
                    error!("Resize failed: {err}");
                    control_flow.set_exit_with_code(1);
                    return;
                }
                presenter.resize(renderer.context(), width, height);
                let (fb_width, fb_height) = renderer.fb_size();
                pixels.resize((fb_width * fb_height) as usize, 0);
            }
            other => {
                if controller.handle_window_event(&mut input, other) {
                    renderer.set_camera(&controller.camera());
                }
            }
        },
        Event::RedrawRequested(window_id) if window_id == window.id() => {
            if let Err(err) = renderer.render().and_then(|()| renderer.download_pixels(&mut pixels)) {
                error!("Frame {} failed: {err}", renderer.frame_id());
                control_flow.set_exit_with_code(1);
                return;
            }
            let (width, height) = renderer.fb_size();
            match presenter.present(renderer.context(), &pixels, width, height) {
                Ok(()) => {}
                Err(wgpu::SurfaceError::Lost) => presenter.reconfigure(renderer.context()),
                Err(wgpu::SurfaceError::OutOfMemory) => control_flow.set_exit_with_code(1),
                Err(e) => error!("{e:?}"),
            }
        }
        Event::MainEventsCleared => {
            window.request_redraw();
        }
        _ => {}
    })
}
