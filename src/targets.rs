//! Offscreen field storage: target descriptors, double buffering and the pool
//! that (re)allocates every field when the surface changes size.

use crate::backend::Backend;
use crate::capability::FieldFormat;
use crate::config::SimulationConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Linear,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    ClampToEdge,
    Repeat,
}

impl Wrap {
    pub(crate) fn as_uniform(self) -> u32 {
        match self {
            Wrap::ClampToEdge => 0,
            Wrap::Repeat => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: FieldFormat,
    pub filter: Filter,
    pub wrap: Wrap,
}

impl TargetDescriptor {
    pub fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.width as f32, 1.0 / self.height as f32]
    }
}

/// A backend target plus the descriptor it was created from.
pub struct RenderTarget<T> {
    pub desc: TargetDescriptor,
    pub handle: T,
}

impl<T> RenderTarget<T> {
    pub fn texel_size(&self) -> [f32; 2] {
        self.desc.texel_size()
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }
}

/// Two physical targets with a logical read/write split. Swapping flips an
/// index; the targets themselves never move.
pub struct DoubleTarget<T> {
    targets: [RenderTarget<T>; 2],
    read: usize,
}

impl<T> DoubleTarget<T> {
    pub fn new(first: RenderTarget<T>, second: RenderTarget<T>) -> Self {
        Self {
            targets: [first, second],
            read: 0,
        }
    }

    pub fn read(&self) -> &RenderTarget<T> {
        &self.targets[self.read]
    }

    pub fn write(&self) -> &RenderTarget<T> {
        &self.targets[self.read ^ 1]
    }

    pub fn swap(&mut self) {
        self.read ^= 1;
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.targets[0].texel_size()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.targets[0].resolution()
    }

    pub(crate) fn into_targets(self) -> [RenderTarget<T>; 2] {
        self.targets
    }
}

/// Assigns `resolution` to the shorter surface axis and scales the longer one
/// by the aspect ratio, so detail stays consistent in either orientation.
pub fn scaled_resolution(resolution: u32, surface_width: u32, surface_height: u32) -> (u32, u32) {
    let width = surface_width.max(1) as f64;
    let height = surface_height.max(1) as f64;
    let mut aspect = width / height;
    if aspect < 1.0 {
        aspect = 1.0 / aspect;
    }

    let min = resolution;
    let max = (resolution as f64 * aspect).round() as u32;
    if surface_width > surface_height {
        (max, min)
    } else {
        (min, max)
    }
}

/// Owns every simulation field. Velocity, dye and pressure are double
/// buffered; divergence and curl are recomputed each step.
pub struct TargetPool<T> {
    format: FieldFormat,
    pub velocity: DoubleTarget<T>,
    pub dye: DoubleTarget<T>,
    pub pressure: DoubleTarget<T>,
    pub divergence: RenderTarget<T>,
    pub curl: RenderTarget<T>,
}

impl<T> TargetPool<T> {
    pub fn new<B>(
        backend: &mut B,
        config: &SimulationConfig,
        format: FieldFormat,
        surface_width: u32,
        surface_height: u32,
    ) -> Result<Self, EngineError>
    where
        B: Backend<Target = T>,
    {
        let mut format = format;
        let (sim_w, sim_h) = scaled_resolution(config.sim_resolution, surface_width, surface_height);
        let (dye_w, dye_h) = scaled_resolution(config.dye_resolution, surface_width, surface_height);
        log::info!(
            "Allocating fields for {}x{} surface: velocity {}x{}, dye {}x{}",
            surface_width,
            surface_height,
            sim_w,
            sim_h,
            dye_w,
            dye_h
        );

        let velocity = allocate_double(backend, &mut format, sim_w, sim_h, Filter::Linear, [0.0; 4])?;
        let dye = allocate_double(backend, &mut format, dye_w, dye_h, Filter::Linear, [0.0; 4])?;
        let pressure = allocate_double(backend, &mut format, sim_w, sim_h, Filter::Nearest, [0.0; 4])?;
        let divergence = allocate(backend, &mut format, sim_w, sim_h, Filter::Nearest, Wrap::ClampToEdge, [0.0; 4])?;
        let curl = allocate(backend, &mut format, sim_w, sim_h, Filter::Nearest, Wrap::ClampToEdge, [0.0; 4])?;

        let pool = Self {
            format,
            velocity,
            dye,
            pressure,
            divergence,
            curl,
        };
        if pool.is_mixed_format() {
            // A downgrade happened part way through; bring the early fields down too.
            let format = pool.format;
            pool.release(backend);
            return Self::new(backend, config, format, surface_width, surface_height);
        }
        Ok(pool)
    }

    /// Destroys every field and allocates fresh ones for the new surface size.
    /// Field contents are not carried over.
    pub fn resize<B>(
        self,
        backend: &mut B,
        config: &SimulationConfig,
        surface_width: u32,
        surface_height: u32,
    ) -> Result<Self, EngineError>
    where
        B: Backend<Target = T>,
    {
        let format = self.format;
        self.release(backend);
        Self::new(backend, config, format, surface_width, surface_height)
    }

    pub fn format(&self) -> FieldFormat {
        self.format
    }

    pub fn release<B>(self, backend: &mut B)
    where
        B: Backend<Target = T>,
    {
        for field in [self.velocity, self.dye, self.pressure] {
            for target in field.into_targets() {
                backend.release(target.handle);
            }
        }
        backend.release(self.divergence.handle);
        backend.release(self.curl.handle);
    }

    fn is_mixed_format(&self) -> bool {
        let format = self.format;
        [
            self.velocity.read().desc.format,
            self.velocity.write().desc.format,
            self.dye.read().desc.format,
            self.dye.write().desc.format,
            self.pressure.read().desc.format,
            self.pressure.write().desc.format,
            self.divergence.desc.format,
            self.curl.desc.format,
        ]
        .iter()
        .any(|f| *f != format)
    }
}

/// Creates a target and clears it. An incomplete framebuffer is retried once
/// at the 8-bit fallback format, which then sticks for the rest of the pool.
pub fn allocate<B: Backend>(
    backend: &mut B,
    format: &mut FieldFormat,
    width: u32,
    height: u32,
    filter: Filter,
    wrap: Wrap,
    clear_color: [f32; 4],
) -> Result<RenderTarget<B::Target>, EngineError> {
    let mut desc = TargetDescriptor {
        width,
        height,
        format: *format,
        filter,
        wrap,
    };
    let handle = match backend.create_target(&desc) {
        Ok(handle) => handle,
        Err(err @ EngineError::FramebufferIncomplete { .. }) if *format != FieldFormat::FALLBACK => {
            log::warn!("{err}; retrying with {:?}", FieldFormat::FALLBACK);
            *format = FieldFormat::FALLBACK;
            desc.format = FieldFormat::FALLBACK;
            backend.create_target(&desc).map_err(|err| match err {
                EngineError::FramebufferIncomplete { reason, .. } => EngineError::UnsupportedContext(format!(
                    "render target allocation failed after format downgrade: {reason}"
                )),
                other => other,
            })?
        }
        Err(EngineError::FramebufferIncomplete { reason, .. }) => {
            return Err(EngineError::UnsupportedContext(format!(
                "render target allocation failed at the fallback format: {reason}"
            )))
        }
        Err(err) => return Err(err),
    };
    backend.clear(&handle, clear_color);
    Ok(RenderTarget { desc, handle })
}

fn allocate_double<B: Backend>(
    backend: &mut B,
    format: &mut FieldFormat,
    width: u32,
    height: u32,
    filter: Filter,
    clear_color: [f32; 4],
) -> Result<DoubleTarget<B::Target>, EngineError> {
    let first = allocate(backend, format, width, height, filter, Wrap::ClampToEdge, clear_color)?;
    let second = allocate(backend, format, width, height, filter, Wrap::ClampToEdge, clear_color)?;
    Ok(DoubleTarget::new(first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;

    #[test]
    fn landscape_assigns_resolution_to_height() {
        assert_eq!(scaled_resolution(128, 1920, 1080), (228, 128));
        assert_eq!(scaled_resolution(512, 1920, 1080), (910, 512));
    }

    #[test]
    fn portrait_assigns_resolution_to_width() {
        assert_eq!(scaled_resolution(128, 1080, 1920), (128, 228));
    }

    #[test]
    fn square_surface_is_square() {
        assert_eq!(scaled_resolution(256, 800, 800), (256, 256));
    }

    #[test]
    fn swap_flips_read_and_write() {
        let mut backend = CpuBackend::new(8, 8);
        let mut format = FieldFormat::Rgba32Float;
        let mut field = allocate_double(&mut backend, &mut format, 4, 2, Filter::Linear, [0.0; 4]).unwrap();
        backend.clear(&field.write().handle, [1.0, 0.0, 0.0, 0.0]);

        assert_eq!(backend.texel(&field.read().handle, 0, 0)[0], 0.0);
        field.swap();
        assert_eq!(backend.texel(&field.read().handle, 0, 0)[0], 1.0);
        assert_eq!(backend.texel(&field.write().handle, 0, 0)[0], 0.0);
        field.swap();
        assert_eq!(backend.texel(&field.read().handle, 0, 0)[0], 0.0);
        assert_eq!(field.texel_size(), [0.25, 0.5]);
    }

    #[test]
    fn pool_uses_decoupled_resolutions() {
        let config = SimulationConfig {
            sim_resolution: 128,
            dye_resolution: 512,
            ..Default::default()
        };
        let mut backend = CpuBackend::new(1920, 1080);
        let pool = TargetPool::new(&mut backend, &config, FieldFormat::Rgba32Float, 1920, 1080).unwrap();
        assert_eq!(pool.velocity.resolution(), (228, 128));
        assert_eq!(pool.pressure.resolution(), (228, 128));
        assert_eq!(pool.divergence.resolution(), (228, 128));
        assert_eq!(pool.curl.resolution(), (228, 128));
        assert_eq!(pool.dye.resolution(), (910, 512));
        assert_eq!(pool.velocity.read().desc.filter, Filter::Linear);
        assert_eq!(pool.pressure.read().desc.filter, Filter::Nearest);
    }

    #[test]
    fn resize_round_trip_reproduces_resolutions() {
        let config = SimulationConfig {
            sim_resolution: 32,
            dye_resolution: 64,
            ..Default::default()
        };
        let mut backend = CpuBackend::new(300, 200);
        let pool = TargetPool::new(&mut backend, &config, FieldFormat::Rgba32Float, 300, 200).unwrap();
        let before = (pool.velocity.resolution(), pool.dye.resolution());

        let pool = pool.resize(&mut backend, &config, 200, 500).unwrap();
        assert_eq!(pool.velocity.resolution(), (32, 80));
        let pool = pool.resize(&mut backend, &config, 300, 200).unwrap();
        assert_eq!((pool.velocity.resolution(), pool.dye.resolution()), before);
        assert_eq!(backend.live_targets(), 8);
    }

    #[test]
    fn fields_start_empty_whatever_the_background() {
        let config = SimulationConfig {
            sim_resolution: 8,
            dye_resolution: 8,
            back_color: [0.1, 0.2, 0.3],
            ..Default::default()
        };
        let mut backend = CpuBackend::new(8, 8);
        let pool = TargetPool::new(&mut backend, &config, FieldFormat::Rgba32Float, 8, 8).unwrap();
        assert_eq!(backend.texel(&pool.dye.read().handle, 3, 3), [0.0; 4]);
        assert_eq!(backend.texel(&pool.velocity.read().handle, 3, 3), [0.0; 4]);
    }

    #[test]
    fn incomplete_framebuffer_retries_at_8_bit() {
        let config = SimulationConfig {
            sim_resolution: 8,
            dye_resolution: 16,
            ..Default::default()
        };
        let mut backend = CpuBackend::new(8, 8);
        backend.reject_allocations(FieldFormat::Rgba16Float);
        let pool = TargetPool::new(&mut backend, &config, FieldFormat::Rgba16Float, 8, 8).unwrap();
        assert_eq!(pool.format(), FieldFormat::Rgba8Unorm);
        assert_eq!(pool.dye.read().desc.format, FieldFormat::Rgba8Unorm);
        assert_eq!(pool.curl.desc.format, FieldFormat::Rgba8Unorm);
    }

    #[test]
    fn second_incomplete_framebuffer_escalates() {
        let config = SimulationConfig::default();
        let mut backend = CpuBackend::new(8, 8);
        backend.reject_allocations(FieldFormat::Rgba16Float);
        backend.reject_allocations(FieldFormat::Rgba8Unorm);
        let err = TargetPool::new(&mut backend, &config, FieldFormat::Rgba16Float, 8, 8).err().unwrap();
        assert!(matches!(err, EngineError::UnsupportedContext(_)));
    }
}
