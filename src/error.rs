use thiserror::Error;

/// Failure kinds surfaced by every device-call wrapper in the renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    /// No usable adapter, device request rejected, or missing downlevel support
    #[error("GPU environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("device allocation of {size} bytes failed: {reason}")]
    AllocationFailure { size: u64, reason: String },

    /// Device program module failed to parse, validate or link
    #[error("device program compilation failed: {0}")]
    CompileFailure(String),

    #[error("entry point `{name}` for {kind} program group not found in module")]
    MissingEntryPoint { name: String, kind: &'static str },

    #[error("invalid build input: {0}")]
    InvalidBuildInput(String),

    #[error("launch failed: {0}")]
    LaunchFailure(String),
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    pub(crate) fn allocation(size: u64, reason: impl Into<String>) -> Self {
        RenderError::AllocationFailure { size, reason: reason.into() }
    }

    /// Map an error captured by a wgpu error scope onto the allocation kind
    pub(crate) fn from_wgpu_allocation(size: u64, error: wgpu::Error) -> Self {
        match error {
            wgpu::Error::OutOfMemory { .. } => Self::allocation(size, "device out of memory"),
            wgpu::Error::Validation { description, .. } => Self::allocation(size, description),
        }
    }

    /// Map an error captured while writing an acceleration structure. Running
    /// out of device memory stays an allocation failure; anything else means
    /// the build input was rejected.
    pub(crate) fn from_wgpu_build(size: u64, error: wgpu::Error) -> Self {
        match error {
            oom @ wgpu::Error::OutOfMemory { .. } => Self::from_wgpu_allocation(size, oom),
            wgpu::Error::Validation { description, .. } => {
                Self::InvalidBuildInput(format!("acceleration structure build failed: {description}"))
            }
        }
    }
}
