//! Host-memory implementation of every fluid program.
//!
//! Each program mirrors its entry point in `shaders/fluid.wgsl`: same uniform
//! fields, same texel addressing, same half-texel bilinear fetch. Targets are
//! `RefCell`s so a pass that tries to write a target it is also reading
//! panics instead of silently aliasing.

use std::cell::RefCell;
use std::collections::HashSet;

use super::Backend;
use crate::capability::{FieldFormat, FormatProbe};
use crate::error::EngineError;
use crate::programs::{PassUniforms, Program};
use crate::targets::{TargetDescriptor, Wrap};

pub struct CpuTarget {
    width: u32,
    height: u32,
    format: FieldFormat,
    texels: RefCell<Vec<[f32; 4]>>,
}

impl CpuTarget {
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fetch(&self, texels: &[[f32; 4]], x: i32, y: i32, wrap: Wrap) -> [f32; 4] {
        let (w, h) = (self.width as i32, self.height as i32);
        let (x, y) = match wrap {
            Wrap::ClampToEdge => (x.clamp(0, w - 1), y.clamp(0, h - 1)),
            Wrap::Repeat => (x.rem_euclid(w), y.rem_euclid(h)),
        };
        texels[(y * w + x) as usize]
    }
}

/// Read-only view of an input target for the duration of one pass.
struct Sampler<'a> {
    target: &'a CpuTarget,
    texels: std::cell::Ref<'a, Vec<[f32; 4]>>,
    wrap: Wrap,
}

impl<'a> Sampler<'a> {
    fn new(target: &'a CpuTarget, wrap: u32) -> Self {
        Self {
            target,
            texels: target.texels.borrow(),
            wrap: if wrap == 0 { Wrap::ClampToEdge } else { Wrap::Repeat },
        }
    }

    fn fetch(&self, x: i32, y: i32) -> [f32; 4] {
        self.target.fetch(&self.texels, x, y, self.wrap)
    }

    fn nearest(&self, uv: [f32; 2]) -> [f32; 4] {
        let x = (uv[0] * self.target.width as f32).floor() as i32;
        let y = (uv[1] * self.target.height as f32).floor() as i32;
        self.fetch(x, y)
    }

    fn bilerp(&self, uv: [f32; 2], texel: [f32; 2]) -> [f32; 4] {
        let st = [uv[0] / texel[0] - 0.5, uv[1] / texel[1] - 0.5];
        let i = [st[0].floor(), st[1].floor()];
        let f = [st[0] - i[0], st[1] - i[1]];
        let (x, y) = (i[0] as i32, i[1] as i32);
        let a = self.fetch(x, y);
        let b = self.fetch(x + 1, y);
        let c = self.fetch(x, y + 1);
        let d = self.fetch(x + 1, y + 1);
        mix(mix(a, b, f[0]), mix(c, d, f[0]), f[1])
    }
}

fn mix(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    std::array::from_fn(|i| a[i] + (b[i] - a[i]) * t)
}

fn length3(v: [f32; 4]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn quantize(format: FieldFormat, value: [f32; 4]) -> [f32; 4] {
    match format {
        FieldFormat::Rgba8Unorm => value.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() / 255.0),
        FieldFormat::Rgba32Float | FieldFormat::Rgba16Float => value,
    }
}

/// Evaluates `program` for one fragment at texture coordinate `uv`.
fn shade(program: Program, u: &PassUniforms, inputs: &[Sampler], uv: [f32; 2]) -> [f32; 4] {
    let [tx, ty] = u.texel_size;
    let left = [uv[0] - tx, uv[1]];
    let right = [uv[0] + tx, uv[1]];
    let top = [uv[0], uv[1] + ty];
    let bottom = [uv[0], uv[1] - ty];

    match program {
        Program::Splat => {
            let mut p = [uv[0] - u.point[0], uv[1] - u.point[1]];
            p[0] *= u.aspect_ratio;
            let falloff = (-(p[0] * p[0] + p[1] * p[1]) / u.radius).exp();
            let base = inputs[0].nearest(uv);
            [
                base[0] + falloff * u.color[0],
                base[1] + falloff * u.color[1],
                base[2] + falloff * u.color[2],
                1.0,
            ]
        }
        Program::Curl => {
            let l = inputs[0].nearest(left)[1];
            let r = inputs[0].nearest(right)[1];
            let t = inputs[0].nearest(top)[0];
            let b = inputs[0].nearest(bottom)[0];
            [0.5 * (r - l - t + b), 0.0, 0.0, 1.0]
        }
        Program::Vorticity => {
            let (velocity, curl) = (&inputs[0], &inputs[1]);
            let l = curl.nearest(left)[0];
            let r = curl.nearest(right)[0];
            let t = curl.nearest(top)[0];
            let b = curl.nearest(bottom)[0];
            let c = curl.nearest(uv)[0];

            let mut force = [0.5 * (t.abs() - b.abs()), 0.5 * (r.abs() - l.abs())];
            let len = (force[0] * force[0] + force[1] * force[1]).sqrt() + 1e-4;
            force = [force[0] / len * u.curl * c, -force[1] / len * u.curl * c];

            let v = velocity.nearest(uv);
            [v[0] + force[0] * u.dt, v[1] + force[1] * u.dt, 0.0, 1.0]
        }
        Program::Divergence => {
            let v = &inputs[0];
            let c = v.nearest(uv);
            let mut l = v.nearest(left)[0];
            let mut r = v.nearest(right)[0];
            let mut t = v.nearest(top)[1];
            let mut b = v.nearest(bottom)[1];
            if left[0] < 0.0 {
                l = -c[0];
            }
            if right[0] > 1.0 {
                r = -c[0];
            }
            if top[1] > 1.0 {
                t = -c[1];
            }
            if bottom[1] < 0.0 {
                b = -c[1];
            }
            [0.5 * (r - l + t - b), 0.0, 0.0, 1.0]
        }
        Program::Clear => inputs[0].nearest(uv).map(|v| v * u.value),
        Program::Pressure => {
            let (pressure, divergence) = (&inputs[0], &inputs[1]);
            let l = pressure.nearest(left)[0];
            let r = pressure.nearest(right)[0];
            let t = pressure.nearest(top)[0];
            let b = pressure.nearest(bottom)[0];
            let div = divergence.nearest(uv)[0];
            [(l + r + b + t - div) * 0.25, 0.0, 0.0, 1.0]
        }
        Program::GradientSubtract => {
            let (pressure, velocity) = (&inputs[0], &inputs[1]);
            let l = pressure.nearest(left)[0];
            let r = pressure.nearest(right)[0];
            let t = pressure.nearest(top)[0];
            let b = pressure.nearest(bottom)[0];
            let v = velocity.nearest(uv);
            [v[0] - 0.5 * (r - l), v[1] - 0.5 * (t - b), 0.0, 1.0]
        }
        Program::Advection => {
            let (velocity, source) = (&inputs[0], &inputs[1]);
            let vel = velocity.bilerp(uv, u.texel_size);
            let coord = [
                uv[0] - u.dt * vel[0] * u.texel_size[0],
                uv[1] - u.dt * vel[1] * u.texel_size[1],
            ];
            source.bilerp(coord, u.source_texel_size).map(|v| v * u.dissipation)
        }
        Program::Display => {
            let dye = &inputs[0];
            let mut c = if u.linear_filter != 0 {
                dye.bilerp(uv, u.texel_size)
            } else {
                dye.nearest(uv)
            };
            if u.shading != 0 {
                let dx = length3(dye.nearest(right)) - length3(dye.nearest(left));
                let dy = length3(dye.nearest(top)) - length3(dye.nearest(bottom));
                let nz = (tx * tx + ty * ty).sqrt();
                let n_len = (dx * dx + dy * dy + nz * nz).sqrt();
                let diffuse = (nz / n_len + 0.7).clamp(0.7, 1.0);
                c = [c[0] * diffuse, c[1] * diffuse, c[2] * diffuse, c[3]];
            }
            let a = c[0].max(c[1]).max(c[2]);
            [c[0], c[1], c[2], a]
        }
    }
}

/// Reference back end running on host memory.
pub struct CpuBackend {
    surface: (u32, u32),
    live: usize,
    compiles: usize,
    unsupported_formats: HashSet<FieldFormat>,
    rejected_allocations: HashSet<FieldFormat>,
    rejected_programs: HashSet<Program>,
    pass_log: Vec<Program>,
    frame: Vec<[f32; 4]>,
    presents: usize,
}

impl CpuBackend {
    pub fn new(surface_width: u32, surface_height: u32) -> Self {
        Self {
            surface: (surface_width, surface_height),
            live: 0,
            compiles: 0,
            unsupported_formats: HashSet::new(),
            rejected_allocations: HashSet::new(),
            rejected_programs: HashSet::new(),
            pass_log: Vec::new(),
            frame: Vec::new(),
            presents: 0,
        }
    }

    /// Makes the format probe report `format` as unusable.
    pub fn unsupported_format(&mut self, format: FieldFormat) -> &mut Self {
        self.unsupported_formats.insert(format);
        self
    }

    /// Makes target creation in `format` fail as an incomplete framebuffer.
    pub fn reject_allocations(&mut self, format: FieldFormat) -> &mut Self {
        self.rejected_allocations.insert(format);
        self
    }

    /// Makes compilation of `program` fail.
    pub fn reject_program(&mut self, program: Program) -> &mut Self {
        self.rejected_programs.insert(program);
        self
    }

    pub fn compile_count(&self) -> usize {
        self.compiles
    }

    pub fn live_targets(&self) -> usize {
        self.live
    }

    pub fn present_count(&self) -> usize {
        self.presents
    }

    /// Programs drawn since the last call, in submission order.
    pub fn take_pass_log(&mut self) -> Vec<Program> {
        std::mem::take(&mut self.pass_log)
    }

    /// Last presented surface image, row-major from the top-left pixel.
    pub fn frame(&self) -> &[[f32; 4]] {
        &self.frame
    }

    pub fn texel(&self, target: &CpuTarget, x: u32, y: u32) -> [f32; 4] {
        target.texels.borrow()[(y * target.width + x) as usize]
    }

    /// Writes raw texel data, bypassing the programs. Used to seed fields.
    pub fn upload(&mut self, target: &CpuTarget, data: &[[f32; 4]]) {
        let mut texels = target.texels.borrow_mut();
        for (dst, src) in texels.iter_mut().zip(data) {
            *dst = quantize(target.format, *src);
        }
    }
}

impl FormatProbe for CpuBackend {
    fn probe(&self, format: FieldFormat) -> Result<(), EngineError> {
        if self.unsupported_formats.contains(&format) {
            Err(EngineError::FormatUnavailable(format))
        } else {
            Ok(())
        }
    }
}

impl Backend for CpuBackend {
    type Target = CpuTarget;
    type Program = Program;

    fn surface_size(&self) -> (u32, u32) {
        self.surface
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface = (width, height);
    }

    fn create_target(&mut self, desc: &TargetDescriptor) -> Result<CpuTarget, EngineError> {
        if self.rejected_allocations.contains(&desc.format) || desc.width == 0 || desc.height == 0 {
            return Err(EngineError::FramebufferIncomplete {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                reason: "format rejected as a render attachment".into(),
            });
        }
        self.live += 1;
        Ok(CpuTarget {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            texels: RefCell::new(vec![[0.0; 4]; (desc.width * desc.height) as usize]),
        })
    }

    fn clear(&mut self, target: &CpuTarget, color: [f32; 4]) {
        let value = quantize(target.format, color);
        target.texels.borrow_mut().fill(value);
    }

    fn release(&mut self, target: CpuTarget) {
        self.live = self.live.saturating_sub(1);
        drop(target);
    }

    fn compile(&mut self, program: Program, _format: FieldFormat) -> Result<Program, EngineError> {
        self.compiles += 1;
        if self.rejected_programs.contains(&program) {
            return Err(EngineError::ProgramCompile {
                program,
                reason: "rejected by back end".into(),
            });
        }
        Ok(program)
    }

    fn draw(&mut self, program: &Program, uniforms: &PassUniforms, inputs: &[&CpuTarget], output: &CpuTarget) {
        let samplers: Vec<Sampler> = inputs
            .iter()
            .enumerate()
            .map(|(i, target)| Sampler::new(target, uniforms.wrap[i.min(1)]))
            .collect();
        let mut texels = output.texels.borrow_mut();
        let (w, h) = (output.width, output.height);
        for y in 0..h {
            for x in 0..w {
                let uv = [(x as f32 + 0.5) / w as f32, (y as f32 + 0.5) / h as f32];
                let value = shade(*program, uniforms, &samplers, uv);
                texels[(y * w + x) as usize] = quantize(output.format, value);
            }
        }
        self.pass_log.push(*program);
    }

    fn present(
        &mut self,
        program: &Program,
        uniforms: &PassUniforms,
        source: &CpuTarget,
        background: [f32; 4],
    ) -> Result<(), EngineError> {
        let (w, h) = self.surface;
        if w == 0 || h == 0 {
            return Err(EngineError::Surface("zero-sized surface".into()));
        }
        let samplers = [Sampler::new(source, uniforms.wrap[0])];
        let mut frame = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let uv = [(x as f32 + 0.5) / w as f32, (y as f32 + 0.5) / h as f32];
                let c = shade(*program, uniforms, &samplers, uv);
                // Premultiplied "over".
                frame.push(std::array::from_fn(|i| c[i] + background[i] * (1.0 - c[3])));
            }
        }
        self.frame = frame;
        self.presents += 1;
        self.pass_log.push(*program);
        Ok(())
    }

    fn flush(&mut self) {}

    fn read(&mut self, target: &CpuTarget) -> Result<Vec<[f32; 4]>, EngineError> {
        Ok(target.texels.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Filter;

    fn target(backend: &mut CpuBackend, width: u32, height: u32, wrap: Wrap) -> CpuTarget {
        backend
            .create_target(&TargetDescriptor {
                width,
                height,
                format: FieldFormat::Rgba32Float,
                filter: Filter::Linear,
                wrap,
            })
            .unwrap()
    }

    #[test]
    fn bilerp_at_texel_centres_is_exact() {
        let mut backend = CpuBackend::new(4, 4);
        let t = target(&mut backend, 4, 1, Wrap::ClampToEdge);
        backend.upload(&t, &[[0.0; 4], [1.0; 4], [2.0; 4], [3.0; 4]]);
        let s = Sampler::new(&t, 0);
        let texel = [0.25, 1.0];
        assert_eq!(s.bilerp([0.375, 0.5], texel)[0], 1.0);
        // Half way between texel 1 and 2 centres.
        assert!((s.bilerp([0.5, 0.5], texel)[0] - 1.5).abs() < 1e-6);
        // A quarter texel past texel 0's centre; no half-pixel bias.
        assert!((s.bilerp([0.1875, 0.5], texel)[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn clamp_and_repeat_addressing() {
        let mut backend = CpuBackend::new(4, 4);
        let clamp = target(&mut backend, 4, 1, Wrap::ClampToEdge);
        backend.upload(&clamp, &[[0.0; 4], [1.0; 4], [2.0; 4], [3.0; 4]]);
        let data = clamp.texels.borrow().clone();
        assert_eq!(clamp.fetch(&data, -1, 0, Wrap::ClampToEdge)[0], 0.0);
        assert_eq!(clamp.fetch(&data, 5, 0, Wrap::ClampToEdge)[0], 3.0);
        assert_eq!(clamp.fetch(&data, -1, 0, Wrap::Repeat)[0], 3.0);
        assert_eq!(clamp.fetch(&data, 4, 0, Wrap::Repeat)[0], 0.0);
    }

    #[test]
    fn byte_targets_clamp_and_quantize() {
        let mut backend = CpuBackend::new(4, 4);
        let t = backend
            .create_target(&TargetDescriptor {
                width: 1,
                height: 1,
                format: FieldFormat::Rgba8Unorm,
                filter: Filter::Nearest,
                wrap: Wrap::ClampToEdge,
            })
            .unwrap();
        backend.clear(&t, [-0.5, 0.5, 2.0, 0.1]);
        let texel = backend.texel(&t, 0, 0);
        assert_eq!(texel[0], 0.0);
        assert_eq!(texel[2], 1.0);
        assert!((texel[1] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    #[should_panic]
    fn reading_the_output_target_panics() {
        let mut backend = CpuBackend::new(4, 4);
        let t = target(&mut backend, 4, 4, Wrap::ClampToEdge);
        let uniforms = PassUniforms {
            value: 1.0,
            ..Default::default()
        };
        backend.draw(&Program::Clear, &uniforms, &[&t], &t);
    }

    #[test]
    fn display_darkens_steep_dye_and_keeps_flat_dye() {
        let mut backend = CpuBackend::new(16, 16);
        let ramp = target(&mut backend, 16, 16, Wrap::ClampToEdge);
        let flat = target(&mut backend, 16, 16, Wrap::ClampToEdge);
        let out = target(&mut backend, 16, 16, Wrap::ClampToEdge);
        let data: Vec<[f32; 4]> = (0..256).map(|i| [0.5 * (i % 16) as f32, 0.0, 0.0, 0.0]).collect();
        backend.upload(&ramp, &data);
        backend.clear(&flat, [0.2, 0.6, 0.4, 0.0]);

        let uniforms = PassUniforms {
            texel_size: [1.0 / 16.0; 2],
            shading: 1,
            linear_filter: 0,
            ..Default::default()
        };

        // Neighbours differ by 1.0 across x and not at all across y.
        backend.draw(&Program::Display, &uniforms, &[&ramp], &out);
        let nz = (2.0f32 / 256.0).sqrt();
        let diffuse = nz / (1.0 + nz * nz).sqrt() + 0.7;
        assert!(diffuse > 0.7 && diffuse < 1.0);
        let shaded = backend.texel(&out, 5, 8);
        assert!((shaded[0] - 2.5 * diffuse).abs() < 1e-5, "{shaded:?}");
        assert_eq!((shaded[1], shaded[2]), (0.0, 0.0));
        assert_eq!(shaded[3], shaded[0]);

        backend.draw(&Program::Display, &uniforms, &[&flat], &out);
        assert_eq!(backend.texel(&out, 5, 8), [0.2, 0.6, 0.4, 0.6]);

        let unshaded = PassUniforms { shading: 0, ..uniforms };
        backend.draw(&Program::Display, &unshaded, &[&ramp], &out);
        assert_eq!(backend.texel(&out, 5, 8), [2.5, 0.0, 0.0, 2.5]);
    }

    #[test]
    fn clear_program_scales_input() {
        let mut backend = CpuBackend::new(4, 4);
        let src = target(&mut backend, 2, 2, Wrap::ClampToEdge);
        let dst = target(&mut backend, 2, 2, Wrap::ClampToEdge);
        backend.clear(&src, [2.0, 4.0, 0.0, 1.0]);
        let uniforms = PassUniforms {
            value: 0.5,
            ..Default::default()
        };
        backend.draw(&Program::Clear, &uniforms, &[&src], &dst);
        assert_eq!(backend.texel(&dst, 1, 1), [1.0, 2.0, 0.0, 0.5]);
        assert_eq!(backend.take_pass_log(), vec![Program::Clear]);
    }
}
