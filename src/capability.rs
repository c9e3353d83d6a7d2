//! Precision tier selection for the simulation fields.

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrecisionTier {
    Full,
    Half,
    Byte,
}

/// Storage formats the simulation fields can live in, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldFormat {
    Rgba32Float,
    Rgba16Float,
    Rgba8Unorm,
}

impl FieldFormat {
    pub const PREFERENCE: [FieldFormat; 3] = [
        FieldFormat::Rgba32Float,
        FieldFormat::Rgba16Float,
        FieldFormat::Rgba8Unorm,
    ];

    /// The format every back end must be able to render to.
    pub const FALLBACK: FieldFormat = FieldFormat::Rgba8Unorm;

    pub fn tier(self) -> PrecisionTier {
        match self {
            FieldFormat::Rgba32Float => PrecisionTier::Full,
            FieldFormat::Rgba16Float => PrecisionTier::Half,
            FieldFormat::Rgba8Unorm => PrecisionTier::Byte,
        }
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            FieldFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            FieldFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            FieldFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            FieldFormat::Rgba32Float => 16,
            FieldFormat::Rgba16Float => 8,
            FieldFormat::Rgba8Unorm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub format: FieldFormat,
    pub tier: PrecisionTier,
}

impl From<FieldFormat> for FormatDescriptor {
    fn from(format: FieldFormat) -> Self {
        Self {
            format,
            tier: format.tier(),
        }
    }
}

/// Something that can tell whether a field format is usable as both a
/// render attachment and a sampled texture.
pub trait FormatProbe {
    fn probe(&self, format: FieldFormat) -> Result<(), EngineError>;
}

/// Picks the best usable format. Never fails: when neither float tier is
/// available the 8-bit tier is returned, even if its own probe complains.
pub fn negotiate(probe: &impl FormatProbe) -> FormatDescriptor {
    for format in FieldFormat::PREFERENCE {
        match probe.probe(format) {
            Ok(()) => {
                log::info!("Field format: {:?} ({:?} precision)", format, format.tier());
                return format.into();
            }
            Err(err) => log::warn!("{err}; trying a lower precision tier"),
        }
    }
    log::warn!("No probed format usable, forcing {:?}", FieldFormat::FALLBACK);
    FieldFormat::FALLBACK.into()
}
