//! The per-step pass sequence.
//!
//! One simulated step is curl, vorticity confinement, divergence, pressure
//! solve, gradient subtraction, velocity self-advection and dye advection, in
//! that order. Every pass reads the logical read side of its inputs, writes a
//! different physical target and swaps afterwards when the output is double
//! buffered.

use crate::backend::Backend;
use crate::config::SimulationConfig;
use crate::input::{self, SplatRequest};
use crate::programs::{PassUniforms, Program, ProgramSet};
use crate::targets::{Filter, RenderTarget, TargetPool};

fn wrap_of<T>(inputs: &[&RenderTarget<T>]) -> [u32; 2] {
    let first = inputs.first().map_or(0, |t| t.desc.wrap.as_uniform());
    let second = inputs.get(1).map_or(first, |t| t.desc.wrap.as_uniform());
    [first, second]
}

fn run<B: Backend>(
    backend: &mut B,
    programs: &ProgramSet<B::Program>,
    program: Program,
    mut uniforms: PassUniforms,
    inputs: &[&RenderTarget<B::Target>],
    output: &RenderTarget<B::Target>,
) {
    debug_assert_eq!(inputs.len(), program.inputs());
    uniforms.wrap = wrap_of(inputs);
    let handles: Vec<&B::Target> = inputs.iter().map(|t| &t.handle).collect();
    backend.draw(programs.get(program), &uniforms, &handles, &output.handle);
}

#[derive(Debug, Default)]
pub struct SolverPipeline {
    steps: u64,
}

impl SolverPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated steps run so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Advances the fields by one step of `dt` seconds. The caller clamps `dt`.
    pub fn step<B: Backend>(
        &mut self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
        config: &SimulationConfig,
        dt: f32,
    ) {
        self.curl(backend, pool, programs);
        self.vorticity(backend, pool, programs, config, dt);
        self.divergence(backend, pool, programs);
        self.pressure_solve(backend, pool, programs, config);
        self.subtract_gradient(backend, pool, programs);
        self.advect_velocity(backend, pool, programs, config, dt);
        self.advect_dye(backend, pool, programs, config, dt);
        self.steps += 1;
    }

    pub fn curl<B: Backend>(&self, backend: &mut B, pool: &mut TargetPool<B::Target>, programs: &ProgramSet<B::Program>) {
        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            ..Default::default()
        };
        run(backend, programs, Program::Curl, uniforms, &[pool.velocity.read()], &pool.curl);
    }

    pub fn vorticity<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
        config: &SimulationConfig,
        dt: f32,
    ) {
        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            curl: config.curl,
            dt,
            ..Default::default()
        };
        run(
            backend,
            programs,
            Program::Vorticity,
            uniforms,
            &[pool.velocity.read(), &pool.curl],
            pool.velocity.write(),
        );
        pool.velocity.swap();
    }

    pub fn divergence<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
    ) {
        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            ..Default::default()
        };
        run(backend, programs, Program::Divergence, uniforms, &[pool.velocity.read()], &pool.divergence);
    }

    /// Resets pressure (zero, or scaled when warm starting) and then runs the
    /// configured number of Jacobi iterations. No convergence check.
    pub fn pressure_solve<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
        config: &SimulationConfig,
    ) {
        let reset = PassUniforms {
            value: config.pressure_reset_factor(),
            ..Default::default()
        };
        run(backend, programs, Program::Clear, reset, &[pool.pressure.read()], pool.pressure.write());
        pool.pressure.swap();

        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            ..Default::default()
        };
        for _ in 0..config.pressure_iterations {
            run(
                backend,
                programs,
                Program::Pressure,
                uniforms,
                &[pool.pressure.read(), &pool.divergence],
                pool.pressure.write(),
            );
            pool.pressure.swap();
        }
    }

    pub fn subtract_gradient<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
    ) {
        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            ..Default::default()
        };
        run(
            backend,
            programs,
            Program::GradientSubtract,
            uniforms,
            &[pool.pressure.read(), pool.velocity.read()],
            pool.velocity.write(),
        );
        pool.velocity.swap();
    }

    pub fn advect_velocity<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
        config: &SimulationConfig,
        dt: f32,
    ) {
        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            source_texel_size: pool.velocity.texel_size(),
            dt,
            dissipation: config.velocity_dissipation,
            ..Default::default()
        };
        run(
            backend,
            programs,
            Program::Advection,
            uniforms,
            &[pool.velocity.read(), pool.velocity.read()],
            pool.velocity.write(),
        );
        pool.velocity.swap();
    }

    /// Dye is traced through the already advected velocity, at its own resolution.
    pub fn advect_dye<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
        config: &SimulationConfig,
        dt: f32,
    ) {
        let uniforms = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            source_texel_size: pool.dye.texel_size(),
            dt,
            dissipation: config.density_dissipation,
            ..Default::default()
        };
        run(
            backend,
            programs,
            Program::Advection,
            uniforms,
            &[pool.velocity.read(), pool.dye.read()],
            pool.dye.write(),
        );
        pool.dye.swap();
    }

    /// Writes the same Gaussian kernel into velocity (force `dx`, `dy`) and
    /// then into dye (`color`). `aspect` is the surface width over height.
    pub fn splat<B: Backend>(
        &self,
        backend: &mut B,
        pool: &mut TargetPool<B::Target>,
        programs: &ProgramSet<B::Program>,
        config: &SimulationConfig,
        request: &SplatRequest,
        aspect: f32,
    ) {
        let kernel = PassUniforms {
            point: [request.x, request.y],
            aspect_ratio: aspect,
            radius: input::correct_radius(config.splat_radius / 100.0, aspect),
            ..Default::default()
        };

        let force = PassUniforms {
            texel_size: pool.velocity.texel_size(),
            color: [request.dx, request.dy, 0.0, 1.0],
            ..kernel
        };
        run(backend, programs, Program::Splat, force, &[pool.velocity.read()], pool.velocity.write());
        pool.velocity.swap();

        let [r, g, b] = request.color;
        let dye = PassUniforms {
            texel_size: pool.dye.texel_size(),
            color: [r, g, b, 1.0],
            ..kernel
        };
        run(backend, programs, Program::Splat, dye, &[pool.dye.read()], pool.dye.write());
        pool.dye.swap();
    }

    /// Uniforms for drawing the current dye field to the surface.
    pub fn display_uniforms<T>(&self, pool: &TargetPool<T>, config: &SimulationConfig) -> PassUniforms {
        let dye = pool.dye.read();
        PassUniforms {
            texel_size: dye.texel_size(),
            wrap: [dye.desc.wrap.as_uniform(); 2],
            shading: config.shading as u32,
            linear_filter: (dye.desc.filter == Filter::Linear) as u32,
            ..Default::default()
        }
    }
}
