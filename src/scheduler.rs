//! Engine lifecycle and the per-frame loop.
//!
//! The host owns exactly one [`Backdrop`] and drives it from its redraw
//! callback. [`create_backdrop`] picks the GPU engine when a context can be
//! brought up and the static fallback otherwise; that choice is made once.

use std::sync::Arc;
use std::time::Instant;

use winit::window::Window;

use crate::backend::gpu::WgpuBackend;
use crate::backend::Backend;
use crate::capability::{self, FormatDescriptor};
use crate::config::{SimulationConfig, MAX_TIME_STEP};
use crate::error::EngineError;
use crate::input::{InputAdapter, PointerId};
use crate::programs::{Program, ShaderLibrary};
use crate::solver::SolverPipeline;
use crate::targets::TargetPool;

/// Frames between two debug-level statistics lines.
const STATS_INTERVAL: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Probing,
    Ready,
    /// A fatal error occurred. Nothing is retried; the host should present
    /// the static fallback instead.
    Degraded,
    Disposed,
}

/// Simulation fields that can be read back for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Velocity,
    Dye,
    Pressure,
    Divergence,
    Curl,
}

impl Field {
    pub const ALL: [Field; 5] = [Field::Velocity, Field::Dye, Field::Pressure, Field::Divergence, Field::Curl];
}

/// Mean squared magnitude of the first three channels.
pub fn field_energy(texels: &[[f32; 4]]) -> f32 {
    if texels.is_empty() {
        return 0.0;
    }
    let sum: f64 = texels
        .iter()
        .map(|t| (t[0] * t[0] + t[1] * t[1] + t[2] * t[2]) as f64)
        .sum();
    (sum / texels.len() as f64) as f32
}

/// Wall-clock to simulated time. Long frames are clamped, not sub-stepped.
#[derive(Debug, Default)]
pub struct FrameClock {
    last: Option<Instant>,
}

impl FrameClock {
    /// Seconds since the previous tick, at most [`MAX_TIME_STEP`]. The first
    /// tick after a reset returns 0.
    pub fn tick(&mut self, now: Instant) -> f32 {
        let dt = self
            .last
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f32());
        self.last = Some(now);
        dt.min(MAX_TIME_STEP)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Presentation strategy chosen once at start-up.
///
/// `frame` draws only for the fluid engine. A [`StaticBackdrop`] draws
/// nothing; the host paints its [`gradient`](StaticBackdrop::gradient).
pub trait Backdrop {
    fn state(&self) -> EngineState;
    fn resize(&mut self, width: u32, height: u32);
    fn pointer_down(&mut self, id: PointerId, x: f32, y: f32);
    fn pointer_move(&mut self, id: PointerId, x: f32, y: f32);
    fn pointer_up(&mut self, id: PointerId);
    fn request_ambient_burst(&mut self, count: u32);
    fn set_paused(&mut self, paused: bool);
    fn frame(&mut self, now: Instant) -> Result<(), EngineError>;
    /// Logs whatever the backdrop can report about its current contents.
    fn log_diagnostics(&mut self);
    fn dispose(&mut self);
}

pub struct FluidEngine<B: Backend> {
    backend: B,
    config: SimulationConfig,
    state: EngineState,
    paused: bool,
    descriptor: Option<FormatDescriptor>,
    library: ShaderLibrary<B::Program>,
    pool: Option<TargetPool<B::Target>>,
    solver: SolverPipeline,
    input: InputAdapter,
    clock: FrameClock,
    pending_resize: Option<(u32, u32)>,
    degraded_reason: Option<String>,
    frames: u64,
    last_stats: Option<Instant>,
}

impl<B: Backend> FluidEngine<B> {
    pub fn new(backend: B, config: SimulationConfig) -> Self {
        let (width, height) = backend.surface_size();
        let input = InputAdapter::new(width, height);
        Self::with_input(backend, config, input)
    }

    /// Same as [`FluidEngine::new`] with a deterministic random source.
    pub fn with_seed(backend: B, config: SimulationConfig, seed: u64) -> Self {
        use rand::SeedableRng;
        let (width, height) = backend.surface_size();
        let input = InputAdapter::with_rng(width, height, rand::rngs::StdRng::seed_from_u64(seed));
        Self::with_input(backend, config, input)
    }

    fn with_input(backend: B, config: SimulationConfig, input: InputAdapter) -> Self {
        Self {
            backend,
            paused: config.paused,
            config,
            state: EngineState::Uninitialized,
            descriptor: None,
            library: ShaderLibrary::default(),
            pool: None,
            solver: SolverPipeline::new(),
            input,
            clock: FrameClock::default(),
            pending_resize: None,
            degraded_reason: None,
            frames: 0,
            last_stats: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Why the engine went to [`EngineState::Degraded`], if it did.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded_reason.as_deref()
    }

    /// The format the negotiator picked. The pool may since have dropped to 8-bit.
    pub fn negotiated_format(&self) -> Option<FormatDescriptor> {
        self.descriptor
    }

    pub fn pool(&self) -> Option<&TargetPool<B::Target>> {
        self.pool.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn input(&self) -> &InputAdapter {
        &self.input
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            log::info!("Engine state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Negotiates a field format, compiles every program and allocates the
    /// fields. Any failure lands in [`EngineState::Degraded`] for good.
    pub fn initialize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        match self.state {
            EngineState::Uninitialized | EngineState::Disposed => {}
            state => {
                log::warn!("initialize ignored in state {state:?}");
                return Ok(());
            }
        }

        self.set_state(EngineState::Probing);
        match self.bring_up(width, height) {
            Ok(()) => {
                self.set_state(EngineState::Ready);
                if self.config.initial_burst > 0 {
                    self.input.request_ambient_burst(self.config.initial_burst);
                } else {
                    self.input.request_random_burst();
                }
                Ok(())
            }
            Err(err) => {
                self.degrade(&err);
                Err(err)
            }
        }
    }

    fn bring_up(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        self.config.validate()?;
        self.backend.resize_surface(width, height);
        self.input.set_surface(width, height);

        let descriptor = capability::negotiate(&self.backend);
        self.descriptor = Some(descriptor);
        self.library.ensure(&mut self.backend, descriptor.format)?;

        let pool = TargetPool::new(&mut self.backend, &self.config, descriptor.format, width, height)?;
        let format = pool.format();
        self.pool = Some(pool);
        if format != descriptor.format {
            log::warn!("Fields downgraded from {:?} to {:?}", descriptor.format, format);
            self.library.ensure(&mut self.backend, format)?;
        }
        self.clock.reset();
        Ok(())
    }

    fn degrade(&mut self, err: &EngineError) {
        log::error!("Fluid engine unavailable, falling back to static presentation: {err}");
        self.release_resources();
        self.degraded_reason = Some(err.to_string());
        self.set_state(EngineState::Degraded);
    }

    fn release_resources(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(&mut self.backend);
        }
        self.library.clear();
        self.backend.flush();
        self.pending_resize = None;
    }

    /// Takes effect at the next frame boundary. Zero-sized surfaces
    /// (minimised windows) are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.pending_resize = Some((width, height));
    }

    fn apply_resize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        if self.backend.surface_size() == (width, height) && self.pool.is_some() {
            return Ok(());
        }
        self.backend.resize_surface(width, height);
        self.input.set_surface(width, height);

        let pool = self
            .pool
            .take()
            .ok_or_else(|| EngineError::UnsupportedContext("no render targets to resize".into()))?;
        let pool = pool.resize(&mut self.backend, &self.config, width, height)?;
        let format = pool.format();
        self.pool = Some(pool);
        self.library.ensure(&mut self.backend, format)?;
        Ok(())
    }

    pub fn pointer_down(&mut self, id: PointerId, x: f32, y: f32) {
        self.input.pointer_down(id, x, y);
    }

    pub fn pointer_move(&mut self, id: PointerId, x: f32, y: f32) {
        self.input.pointer_move(id, x, y);
    }

    pub fn pointer_up(&mut self, id: PointerId) {
        self.input.pointer_up(id);
    }

    pub fn request_ambient_burst(&mut self, count: u32) {
        self.input.request_ambient_burst(count);
    }

    /// While paused nothing is simulated and queued splats wait; the last
    /// dye field keeps being presented.
    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            log::info!("Simulation {}", if paused { "paused" } else { "resumed" });
        }
        self.paused = paused;
    }

    /// Runs one frame: pending resize, splats and one solver step (unless
    /// paused), then the display pass. Does nothing outside `Ready`.
    ///
    /// `Surface` errors are returned but leave the engine running; every
    /// other error degrades it.
    pub fn frame(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.state != EngineState::Ready {
            return Ok(());
        }
        match self.run_frame(now) {
            Ok(()) => {
                self.frames += 1;
                self.log_stats(now);
                Ok(())
            }
            Err(err) if !err.is_fatal() => {
                log::warn!("{err}");
                Err(err)
            }
            Err(err) => {
                self.degrade(&err);
                Err(err)
            }
        }
    }

    fn run_frame(&mut self, now: Instant) -> Result<(), EngineError> {
        if let Some((width, height)) = self.pending_resize.take() {
            self.apply_resize(width, height)?;
        }

        let dt = self.clock.tick(now);
        self.input.update_colors(dt, &self.config);

        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| EngineError::UnsupportedContext("render targets missing".into()))?;
        let programs = self
            .library
            .set(pool.format())
            .ok_or_else(|| EngineError::UnsupportedContext(format!("no programs for {:?}", pool.format())))?;

        if !self.paused {
            self.input.tick_idle(dt, &self.config);
            let aspect = self.input.surface_aspect();
            for request in self.input.take_splats(&self.config) {
                self.solver
                    .splat(&mut self.backend, pool, programs, &self.config, &request, aspect);
            }
            self.solver.step(&mut self.backend, pool, programs, &self.config, dt);
        }

        let uniforms = self.solver.display_uniforms(pool, &self.config);
        self.backend.present(
            programs.get(Program::Display),
            &uniforms,
            &pool.dye.read().handle,
            self.config.background(),
        )
    }

    fn log_stats(&mut self, now: Instant) {
        let Some(since) = self.last_stats else {
            self.last_stats = Some(now);
            return;
        };
        if self.frames % STATS_INTERVAL == 0 {
            let elapsed = now.saturating_duration_since(since).as_secs_f32();
            if elapsed > 0.0 {
                log::debug!(
                    "{:.1} fps over the last {} frames, {} steps total",
                    STATS_INTERVAL as f32 / elapsed,
                    STATS_INTERVAL,
                    self.solver.steps()
                );
            }
            self.last_stats = Some(now);
        }
    }

    /// Copies a field back to host memory. Blocks on the GPU; diagnostics only.
    pub fn read_field(&mut self, field: Field) -> Result<Vec<[f32; 4]>, EngineError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| EngineError::UnsupportedContext("no fields allocated".into()))?;
        let target = match field {
            Field::Velocity => &pool.velocity.read().handle,
            Field::Dye => &pool.dye.read().handle,
            Field::Pressure => &pool.pressure.read().handle,
            Field::Divergence => &pool.divergence.handle,
            Field::Curl => &pool.curl.handle,
        };
        self.backend.flush();
        self.backend.read(target)
    }

    /// Releases every target and compiled program. `initialize` may be called
    /// again afterwards and starts from scratch.
    pub fn dispose(&mut self) {
        if self.state == EngineState::Disposed {
            return;
        }
        self.release_resources();
        self.descriptor = None;
        self.clock.reset();
        self.set_state(EngineState::Disposed);
    }
}

impl<B: Backend> Backdrop for FluidEngine<B> {
    fn state(&self) -> EngineState {
        self.state
    }

    fn resize(&mut self, width: u32, height: u32) {
        FluidEngine::resize(self, width, height);
    }

    fn pointer_down(&mut self, id: PointerId, x: f32, y: f32) {
        FluidEngine::pointer_down(self, id, x, y);
    }

    fn pointer_move(&mut self, id: PointerId, x: f32, y: f32) {
        FluidEngine::pointer_move(self, id, x, y);
    }

    fn pointer_up(&mut self, id: PointerId) {
        FluidEngine::pointer_up(self, id);
    }

    fn request_ambient_burst(&mut self, count: u32) {
        FluidEngine::request_ambient_burst(self, count);
    }

    fn set_paused(&mut self, paused: bool) {
        FluidEngine::set_paused(self, paused);
    }

    fn frame(&mut self, now: Instant) -> Result<(), EngineError> {
        FluidEngine::frame(self, now)
    }

    fn log_diagnostics(&mut self) {
        for field in Field::ALL {
            match self.read_field(field) {
                Ok(texels) => log::info!("{:?} energy: {:.6}", field, field_energy(&texels)),
                Err(err) => log::warn!("Could not read {field:?}: {err}"),
            }
        }
    }

    fn dispose(&mut self) {
        FluidEngine::dispose(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientStop {
    pub offset: f32,
    pub color: [f32; 4],
}

/// Non-GPU presentation: a fixed vertical gradient around the background
/// colour for the host to paint however it can.
#[derive(Debug, Clone)]
pub struct StaticBackdrop {
    stops: [GradientStop; 2],
    size: (u32, u32),
    disposed: bool,
}

impl StaticBackdrop {
    /// How far the lower stop is lifted towards white.
    const LIFT: f32 = 0.12;

    pub fn new(config: &SimulationConfig) -> Self {
        let top = config.background();
        let bottom = [
            top[0] + (1.0 - top[0]) * Self::LIFT,
            top[1] + (1.0 - top[1]) * Self::LIFT,
            top[2] + (1.0 - top[2]) * Self::LIFT,
            top[3],
        ];
        Self {
            stops: [
                GradientStop { offset: 0.0, color: top },
                GradientStop { offset: 1.0, color: bottom },
            ],
            size: (0, 0),
            disposed: false,
        }
    }

    pub fn gradient(&self) -> &[GradientStop; 2] {
        &self.stops
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

impl Backdrop for StaticBackdrop {
    fn state(&self) -> EngineState {
        if self.disposed {
            EngineState::Disposed
        } else {
            EngineState::Degraded
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn pointer_down(&mut self, _id: PointerId, _x: f32, _y: f32) {}

    fn pointer_move(&mut self, _id: PointerId, _x: f32, _y: f32) {}

    fn pointer_up(&mut self, _id: PointerId) {}

    fn request_ambient_burst(&mut self, _count: u32) {}

    fn set_paused(&mut self, _paused: bool) {}

    /// No-op; the host owns the surface and paints [`Self::gradient`].
    fn frame(&mut self, _now: Instant) -> Result<(), EngineError> {
        Ok(())
    }

    fn log_diagnostics(&mut self) {
        log::info!("Static backdrop {:?}: {:?}", self.size, self.stops);
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }
}

/// Brings up the GPU engine for `window`, or the static backdrop when no
/// context, format or program set can be had.
pub fn create_backdrop(window: Arc<Window>, config: SimulationConfig) -> Box<dyn Backdrop> {
    let size = window.inner_size();
    let backend = match pollster::block_on(WgpuBackend::new(window, config.transparent)) {
        Ok(backend) => backend,
        Err(err) => {
            log::error!("{err}; using static backdrop");
            let mut fallback = StaticBackdrop::new(&config);
            fallback.resize(size.width, size.height);
            return Box::new(fallback);
        }
    };

    let mut engine = FluidEngine::new(backend, config);
    match engine.initialize(size.width, size.height) {
        Ok(()) => Box::new(engine),
        Err(_) => {
            let mut fallback = StaticBackdrop::new(engine.config());
            fallback.resize(size.width, size.height);
            Box::new(fallback)
        }
    }
}
