//! The fixed set of GPU programs and the uniform block they share.

use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;

use crate::backend::Backend;
use crate::capability::FieldFormat;
use crate::error::EngineError;

pub const SHADER_SOURCE: &str = include_str!("../shaders/fluid.wgsl");
pub const VERTEX_ENTRY_POINT: &str = "vs_fullscreen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    /// `target + exp(-|p|^2 / radius) * color`, `p.x` scaled by `aspect_ratio`.
    /// Uniforms: `point`, `color`, `radius`, `aspect_ratio`, `wrap.x`.
    Splat,
    /// Uniforms: `texel_size`.
    Curl,
    /// Inputs: velocity, curl. Uniforms: `texel_size`, `curl`, `dt`.
    Vorticity,
    /// Uniforms: `texel_size`.
    Divergence,
    /// Scales its input by `value`.
    Clear,
    /// One Jacobi iteration. Inputs: pressure, divergence. Uniforms: `texel_size`.
    Pressure,
    /// Inputs: pressure, velocity. Uniforms: `texel_size`.
    GradientSubtract,
    /// Inputs: velocity, source. Uniforms: `texel_size` (velocity),
    /// `source_texel_size`, `dt`, `dissipation`.
    Advection,
    /// Draws the dye field to the surface. Uniforms: `texel_size`, `shading`,
    /// `linear_filter`.
    Display,
}

impl Program {
    pub const ALL: [Program; 9] = [
        Program::Splat,
        Program::Curl,
        Program::Vorticity,
        Program::Divergence,
        Program::Clear,
        Program::Pressure,
        Program::GradientSubtract,
        Program::Advection,
        Program::Display,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            Program::Splat => "fs_splat",
            Program::Curl => "fs_curl",
            Program::Vorticity => "fs_vorticity",
            Program::Divergence => "fs_divergence",
            Program::Clear => "fs_clear",
            Program::Pressure => "fs_pressure",
            Program::GradientSubtract => "fs_gradient_subtract",
            Program::Advection => "fs_advection",
            Program::Display => "fs_display",
        }
    }

    pub fn inputs(self) -> usize {
        match self {
            Program::Vorticity
            | Program::Pressure
            | Program::GradientSubtract
            | Program::Advection => 2,
            _ => 1,
        }
    }

    /// Display renders to the presentation surface rather than a field target.
    pub fn targets_surface(self) -> bool {
        matches!(self, Program::Display)
    }
}

/// Uniform block shared by every program. Must match `PassUniforms` in
/// `shaders/fluid.wgsl` field for field.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct PassUniforms {
    pub texel_size: [f32; 2],
    pub source_texel_size: [f32; 2],
    pub point: [f32; 2],
    pub aspect_ratio: f32,
    pub dt: f32,
    pub color: [f32; 4],
    pub dissipation: f32,
    pub curl: f32,
    pub radius: f32,
    pub value: f32,
    pub wrap: [u32; 2],
    pub shading: u32,
    pub linear_filter: u32,
}

const _: [(); 80] = [(); std::mem::size_of::<PassUniforms>()];

/// Every program compiled for one field format.
pub struct ProgramSet<P> {
    format: FieldFormat,
    compiled: HashMap<Program, P>,
}

impl<P> ProgramSet<P> {
    pub fn format(&self) -> FieldFormat {
        self.format
    }

    pub fn get(&self, program: Program) -> &P {
        // A set is only constructed once all of `Program::ALL` compiled.
        &self.compiled[&program]
    }
}

/// Compiled programs, cached per field format. Nothing is ever recompiled.
pub struct ShaderLibrary<P> {
    sets: HashMap<FieldFormat, ProgramSet<P>>,
}

impl<P> Default for ShaderLibrary<P> {
    fn default() -> Self {
        Self { sets: HashMap::new() }
    }
}

impl<P> ShaderLibrary<P> {
    /// Compiles the full set for `format` unless it is already cached. A
    /// single failing program fails the whole set; no partial set is kept.
    pub fn ensure<B>(&mut self, backend: &mut B, format: FieldFormat) -> Result<&ProgramSet<P>, EngineError>
    where
        B: Backend<Program = P>,
    {
        if !self.sets.contains_key(&format) {
            let mut compiled = HashMap::with_capacity(Program::ALL.len());
            for program in Program::ALL {
                compiled.insert(program, backend.compile(program, format)?);
            }
            log::info!("Compiled {} programs for {:?} fields", compiled.len(), format);
            self.sets.insert(format, ProgramSet { format, compiled });
        }
        self.sets
            .get(&format)
            .ok_or_else(|| EngineError::Config(format!("no programs for {format:?}")))
    }

    pub fn set(&self, format: FieldFormat) -> Option<&ProgramSet<P>> {
        self.sets.get(&format)
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;

    #[test]
    fn every_entry_point_exists_in_shader_source() {
        assert!(SHADER_SOURCE.contains(VERTEX_ENTRY_POINT));
        for program in Program::ALL {
            let needle = format!("fn {}(", program.entry_point());
            assert!(SHADER_SOURCE.contains(&needle), "missing {needle}");
        }
    }

    #[test]
    fn programs_compile_once_per_format() {
        let mut backend = CpuBackend::new(64, 64);
        let mut library = ShaderLibrary::default();
        library.ensure(&mut backend, FieldFormat::Rgba32Float).unwrap();
        library.ensure(&mut backend, FieldFormat::Rgba32Float).unwrap();
        assert_eq!(backend.compile_count(), Program::ALL.len());

        library.ensure(&mut backend, FieldFormat::Rgba8Unorm).unwrap();
        assert_eq!(backend.compile_count(), 2 * Program::ALL.len());
    }

    #[test]
    fn one_failing_program_fails_the_set() {
        let mut backend = CpuBackend::new(64, 64);
        backend.reject_program(Program::Pressure);
        let mut library = ShaderLibrary::default();
        let err = library.ensure(&mut backend, FieldFormat::Rgba32Float).err().unwrap();
        assert!(matches!(err, EngineError::ProgramCompile { program: Program::Pressure, .. }));
        assert!(library.is_empty());
    }
}
