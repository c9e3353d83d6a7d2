use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use winit::{
    event::{ElementState, Event, KeyEvent, MouseButton, Touch, TouchPhase, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
};

use fluid_backdrop::{create_backdrop, Backdrop, EngineState, PointerId, SimulationConfig, StaticBackdrop};

const WINDOW_TITLE: &str = "Fluid Backdrop";

fn load_config() -> SimulationConfig {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(SimulationConfig::default_path);
    match SimulationConfig::load_from_disk(&path) {
        Ok(config) => {
            log::info!("Loaded configuration from {:?}", path);
            config
        }
        Err(err) => {
            log::info!("Using default configuration ({:?}: {err})", path);
            SimulationConfig::default()
        }
    }
}

struct FpsCounter {
    frames: u32,
    since: Instant,
}

impl FpsCounter {
    fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.duration_since(self.since).as_secs_f32();
        if elapsed < 0.5 {
            return None;
        }
        let fps = self.frames as f32 / elapsed;
        self.frames = 0;
        self.since = now;
        Some(fps)
    }
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = load_config();

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title(WINDOW_TITLE)
                .with_transparent(config.transparent)
                .with_inner_size(winit::dpi::PhysicalSize::new(1280, 720)),
        )?,
    );

    let mut backdrop: Box<dyn Backdrop> = create_backdrop(window.clone(), config.clone());
    let mut fallback_active = backdrop.state() != EngineState::Ready;
    if fallback_active {
        log::warn!("GPU fluid unavailable; presenting static backdrop");
    }

    let mut paused = config.paused;
    let mut cursor_px = (0.0f32, 0.0f32);
    let mut fps = FpsCounter {
        frames: 0,
        since: Instant::now(),
    };

    event_loop.run(move |event, control_flow| match event {
        Event::WindowEvent { ref event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        ..
                    },
                ..
            } => {
                backdrop.dispose();
                control_flow.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match key {
                KeyCode::KeyP => {
                    paused = !paused;
                    backdrop.set_paused(paused);
                }
                KeyCode::Space => backdrop.request_ambient_burst(rand::random::<u32>() % 20 + 5),
                KeyCode::KeyD => backdrop.log_diagnostics(),
                _ => {}
            },
            WindowEvent::CursorMoved { position, .. } => {
                cursor_px = (position.x as f32, position.y as f32);
                backdrop.pointer_move(PointerId::Primary, cursor_px.0, cursor_px.1);
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => match state {
                ElementState::Pressed => backdrop.pointer_down(PointerId::Primary, cursor_px.0, cursor_px.1),
                ElementState::Released => backdrop.pointer_up(PointerId::Primary),
            },
            WindowEvent::Touch(Touch { phase, location, id, .. }) => {
                let pointer = PointerId::Touch(*id);
                let (x, y) = (location.x as f32, location.y as f32);
                match phase {
                    TouchPhase::Started => backdrop.pointer_down(pointer, x, y),
                    TouchPhase::Moved => backdrop.pointer_move(pointer, x, y),
                    TouchPhase::Ended | TouchPhase::Cancelled => backdrop.pointer_up(pointer),
                }
            }
            WindowEvent::Resized(size) => backdrop.resize(size.width, size.height),
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                if let Err(err) = backdrop.frame(now) {
                    log::debug!("Frame skipped: {err}");
                }
                if !fallback_active && backdrop.state() == EngineState::Degraded {
                    log::warn!("Fluid engine degraded; switching to static backdrop");
                    let size = window.inner_size();
                    let mut fallback = StaticBackdrop::new(&config);
                    fallback.resize(size.width, size.height);
                    backdrop = Box::new(fallback);
                    fallback_active = true;
                }
                if let Some(fps) = fps.tick(now) {
                    let mode = if fallback_active { "static" } else if paused { "paused" } else { "live" };
                    window.set_title(&format!("{WINDOW_TITLE} | {mode} | {fps:.0} FPS"));
                }
            }
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;
    Ok(())
}
