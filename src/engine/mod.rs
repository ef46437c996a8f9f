pub mod cli;
pub mod frames;
pub mod gpu;
pub mod scene;
pub mod vr;
pub mod windowing;


pub use windowing::Windowing;

use thiserror::Error;

/// Engine-level error type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Vr(#[from] vr::VrError),
    #[error(transparent)]
    Frame(#[from] frames::FrameError),
    #[error(transparent)]
    Gpu(#[from] gpu::GpuError),
    #[error("windowing error: {0}")]
    Windowing(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
