//! Execution back ends for the fluid programs.
//!
//! `gpu` drives wgpu render passes; `cpu` runs the same programs on host
//! memory texel by texel and is what the test suite exercises.

pub mod cpu;
pub mod gpu;

use crate::capability::{FieldFormat, FormatProbe};
use crate::error::EngineError;
use crate::programs::{PassUniforms, Program};
use crate::targets::TargetDescriptor;

pub trait Backend: FormatProbe {
    type Target;
    type Program;

    /// Surface size in physical pixels.
    fn surface_size(&self) -> (u32, u32);

    fn resize_surface(&mut self, width: u32, height: u32);

    /// Fails with `FramebufferIncomplete` when the target cannot be used as a
    /// render attachment.
    fn create_target(&mut self, desc: &TargetDescriptor) -> Result<Self::Target, EngineError>;

    fn clear(&mut self, target: &Self::Target, color: [f32; 4]);

    fn release(&mut self, target: Self::Target);

    fn compile(&mut self, program: Program, format: FieldFormat) -> Result<Self::Program, EngineError>;

    /// Runs one full-target pass. `output` must not be one of `inputs`.
    fn draw(
        &mut self,
        program: &Self::Program,
        uniforms: &PassUniforms,
        inputs: &[&Self::Target],
        output: &Self::Target,
    );

    /// Composites `source` over `background` onto the presentation surface.
    fn present(
        &mut self,
        program: &Self::Program,
        uniforms: &PassUniforms,
        source: &Self::Target,
        background: [f32; 4],
    ) -> Result<(), EngineError>;

    /// Submits any recorded passes.
    fn flush(&mut self);

    /// Reads a target back to host memory, row-major from the top-left texel.
    fn read(&mut self, target: &Self::Target) -> Result<Vec<[f32; 4]>, EngineError>;
}
