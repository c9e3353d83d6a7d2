use crate::capability::FieldFormat;
use crate::programs::Program;

/// Failures raised while bringing up or running the fluid engine.
///
/// `FormatUnavailable` is recovered by the capability negotiator and
/// `FramebufferIncomplete` by the render target pool (one retry at 8-bit).
/// `Surface` and `Readback` leave the engine running. Everything else that
/// reaches the scheduler moves it to
/// [`EngineState::Degraded`](crate::scheduler::EngineState::Degraded).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no graphics context available: {0}")]
    UnsupportedContext(String),

    #[error("texture format {0:?} cannot be rendered to and sampled")]
    FormatUnavailable(FieldFormat),

    #[error("render target {width}x{height} ({format:?}) rejected: {reason}")]
    FramebufferIncomplete {
        width: u32,
        height: u32,
        format: FieldFormat,
        reason: String,
    },

    #[error("program {program:?} failed to compile: {reason}")]
    ProgramCompile { program: Program, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("surface unavailable this frame: {0}")]
    Surface(String),

    #[error("field readback failed: {0}")]
    Readback(String),
}

impl EngineError {
    /// Fatal errors send the engine to the degraded state. A lost frame or a
    /// failed diagnostic read is not one of them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Surface(_) | EngineError::Readback(_))
    }
}
