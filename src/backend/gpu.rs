//! wgpu back end: one render pass per program draw, batched into a single
//! command encoder per frame.

use std::num::NonZeroU64;
use std::sync::Arc;

use winit::window::Window;

use super::Backend;
use crate::capability::{FieldFormat, FormatProbe};
use crate::error::EngineError;
use crate::programs::{PassUniforms, Program, SHADER_SOURCE, VERTEX_ENTRY_POINT};
use crate::targets::TargetDescriptor;

const UNIFORM_SIZE: u64 = std::mem::size_of::<PassUniforms>() as u64;
// Enough for a frame with ~40 pressure iterations and a burst of splats
// before the arena has to submit early.
const UNIFORM_SLOTS: u64 = 128;

pub struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: FieldFormat,
}

pub struct GpuProgram {
    program: Program,
    pipeline: wgpu::RenderPipeline,
}

/// Per-frame uniform storage addressed with dynamic offsets. Uniforms are
/// staged on the host and uploaded in one write before each submit.
struct UniformArena {
    buffer: wgpu::Buffer,
    staging: Vec<u8>,
    stride: u64,
}

impl UniformArena {
    fn new(device: &wgpu::Device) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let stride = UNIFORM_SIZE.div_ceil(alignment) * alignment;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pass Uniforms"),
            size: stride * UNIFORM_SLOTS,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            staging: Vec::with_capacity((stride * UNIFORM_SLOTS) as usize),
            stride,
        }
    }

    fn is_full(&self) -> bool {
        self.staging.len() as u64 >= self.stride * UNIFORM_SLOTS
    }

    fn push(&mut self, uniforms: &PassUniforms) -> u32 {
        let offset = self.staging.len();
        self.staging.extend_from_slice(bytemuck::bytes_of(uniforms));
        self.staging.resize(offset + self.stride as usize, 0);
        offset as u32
    }

    fn upload(&mut self, queue: &wgpu::Queue) {
        if !self.staging.is_empty() {
            queue.write_buffer(&self.buffer, 0, &self.staging);
            self.staging.clear();
        }
    }
}

pub struct WgpuBackend {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    shader: Option<wgpu::ShaderModule>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniforms: UniformArena,
    encoder: Option<wgpu::CommandEncoder>,
}

impl WgpuBackend {
    /// Acquires adapter, device and surface for `window`. Any failure here is
    /// `UnsupportedContext`; the caller should fall back to a static backdrop.
    pub async fn new(window: Arc<Window>, transparent: bool) -> Result<Self, EngineError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|err| EngineError::UnsupportedContext(err.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                ..Default::default()
            })
            .await
            .ok_or_else(|| EngineError::UnsupportedContext("no compatible adapter".into()))?;
        log::info!("Using adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Backdrop Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_webgl2_defaults()
                        .using_resolution(adapter.limits()),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|err| EngineError::UnsupportedContext(err.to_string()))?;

        // Validation errors outside an error scope are logged instead of
        // tearing down the host.
        device.on_uncaptured_error(Box::new(|err| log::error!("wgpu error: {err}")));

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| EngineError::UnsupportedContext("surface reports no formats".into()))?;
        let alpha_mode = if transparent
            && surface_caps
                .alpha_modes
                .contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto)
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Fluid Pass Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: NonZeroU64::new(UNIFORM_SIZE),
                    },
                    count: None,
                },
                texture_entry(1),
                texture_entry(2),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fluid Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let uniforms = UniformArena::new(&device);

        Ok(Self {
            adapter,
            device,
            queue,
            surface,
            surface_config,
            shader: None,
            bind_group_layout,
            pipeline_layout,
            uniforms,
            encoder: None,
        })
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Fluid Frame"),
            })
        })
    }

    fn push_uniforms(&mut self, uniforms: &PassUniforms) -> u32 {
        if self.uniforms.is_full() {
            self.flush();
        }
        self.uniforms.push(uniforms)
    }

    fn bind_group(&self, inputs: &[&wgpu::TextureView]) -> wgpu::BindGroup {
        let first = inputs[0];
        let second = inputs.get(1).copied().unwrap_or(first);
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Fluid Pass Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniforms.buffer,
                        offset: 0,
                        size: NonZeroU64::new(UNIFORM_SIZE),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(first),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(second),
                },
            ],
        })
    }

    fn record_pass(
        &mut self,
        label: &str,
        pipeline: &wgpu::RenderPipeline,
        bind_group: &wgpu::BindGroup,
        offset: u32,
        view: &wgpu::TextureView,
        load: wgpu::LoadOp<wgpu::Color>,
    ) {
        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[offset]);
        pass.draw(0..3, 0..1); // Full-screen triangle
    }

    fn shader_module(&mut self) -> &wgpu::ShaderModule {
        let device = &self.device;
        self.shader.get_or_insert_with(|| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Fluid Shader"),
                source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
            })
        })
    }
}

fn to_color(c: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: c[0] as f64,
        g: c[1] as f64,
        b: c[2] as f64,
        a: c[3] as f64,
    }
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f32;
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        31 if mantissa == 0.0 => sign * f32::INFINITY,
        31 => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

fn decode_texel(format: FieldFormat, bytes: &[u8]) -> [f32; 4] {
    match format {
        FieldFormat::Rgba32Float => {
            std::array::from_fn(|i| f32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]))
        }
        FieldFormat::Rgba16Float => {
            std::array::from_fn(|i| f16_to_f32(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]])))
        }
        FieldFormat::Rgba8Unorm => std::array::from_fn(|i| bytes[i] as f32 / 255.0),
    }
}

impl FormatProbe for WgpuBackend {
    fn probe(&self, format: FieldFormat) -> Result<(), EngineError> {
        let features = self.adapter.get_texture_format_features(format.to_wgpu());
        let required = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        if features.allowed_usages.contains(required) {
            Ok(())
        } else {
            Err(EngineError::FormatUnavailable(format))
        }
    }
}

impl Backend for WgpuBackend {
    type Target = GpuTarget;
    type Program = GpuProgram;

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    fn create_target(&mut self, desc: &TargetDescriptor) -> Result<GpuTarget, EngineError> {
        let incomplete = |reason: String| EngineError::FramebufferIncomplete {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            reason,
        };
        self.probe(desc.format).map_err(|err| incomplete(err.to_string()))?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Fluid Field"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.to_wgpu(),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        let invalid = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = out_of_memory.or(invalid) {
            return Err(incomplete(err.to_string()));
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuTarget {
            texture,
            view,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }

    fn clear(&mut self, target: &GpuTarget, color: [f32; 4]) {
        let encoder = self.encoder();
        let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear Field"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(to_color(color)),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
    }

    fn release(&mut self, target: GpuTarget) {
        // Recorded passes may still reference the texture.
        self.flush();
        target.texture.destroy();
    }

    fn compile(&mut self, program: Program, format: FieldFormat) -> Result<GpuProgram, EngineError> {
        let (target_format, blend) = if program.targets_surface() {
            (self.surface_config.format, Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING))
        } else {
            (format.to_wgpu(), None)
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.shader_module();
        let Some(module) = self.shader.as_ref() else {
            return Err(EngineError::ProgramCompile {
                program,
                reason: "shader module missing".into(),
            });
        };
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.entry_point()),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: VERTEX_ENTRY_POINT,
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: program.entry_point(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(EngineError::ProgramCompile {
                program,
                reason: err.to_string(),
            });
        }
        log::debug!("Compiled {:?} for {:?}", program, target_format);
        Ok(GpuProgram { program, pipeline })
    }

    fn draw(&mut self, program: &GpuProgram, uniforms: &PassUniforms, inputs: &[&GpuTarget], output: &GpuTarget) {
        debug_assert!(inputs.iter().all(|input| input.texture.global_id() != output.texture.global_id()));
        let offset = self.push_uniforms(uniforms);
        let views: Vec<&wgpu::TextureView> = inputs.iter().map(|t| &t.view).collect();
        let bind_group = self.bind_group(&views);
        self.record_pass(
            program.program.entry_point(),
            &program.pipeline,
            &bind_group,
            offset,
            &output.view,
            wgpu::LoadOp::Load,
        );
    }

    fn present(
        &mut self,
        program: &GpuProgram,
        uniforms: &PassUniforms,
        source: &GpuTarget,
        background: [f32; 4],
    ) -> Result<(), EngineError> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.surface_config);
                return Err(EngineError::Surface("surface lost, reconfigured".into()));
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(EngineError::UnsupportedContext("out of memory acquiring surface".into()));
            }
            Err(err) => return Err(EngineError::Surface(err.to_string())),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let offset = self.push_uniforms(uniforms);
        let bind_group = self.bind_group(&[&source.view]);
        self.record_pass(
            "Display",
            &program.pipeline,
            &bind_group,
            offset,
            &view,
            wgpu::LoadOp::Clear(to_color(background)),
        );
        self.flush();
        output.present();
        Ok(())
    }

    fn flush(&mut self) {
        self.uniforms.upload(&self.queue);
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn read(&mut self, target: &GpuTarget) -> Result<Vec<[f32; 4]>, EngineError> {
        self.flush();

        let texel_bytes = target.format.bytes_per_texel();
        let unpadded = target.width * texel_bytes;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;
        let size = (padded * target.height) as u64;

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Field Readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Read"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(target.height),
                },
            },
            wgpu::Extent3d {
                width: target.width,
                height: target.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(EngineError::Readback(err.to_string())),
            None => return Err(EngineError::Readback("map channel closed".into())),
        }

        let data = buffer_slice.get_mapped_range();
        let mut texels = Vec::with_capacity((target.width * target.height) as usize);
        for row in data.chunks(padded as usize) {
            texels.extend(
                row[..unpadded as usize]
                    .chunks(texel_bytes as usize)
                    .map(|bytes| decode_texel(target.format, bytes)),
            );
        }
        drop(data);
        staging_buffer.unmap();
        Ok(texels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_floats_decode() {
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x3800), 0.5);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert!(f16_to_f32(0x7c00).is_infinite());
    }

    #[test]
    fn texels_decode_per_format() {
        let bytes: Vec<u8> = [1.0f32, -0.5, 0.25, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(decode_texel(FieldFormat::Rgba32Float, &bytes), [1.0, -0.5, 0.25, 2.0]);
        assert_eq!(decode_texel(FieldFormat::Rgba8Unorm, &[0, 255, 51, 255]), [0.0, 1.0, 0.2, 1.0]);
    }
}
