#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unit creation failed: {0}")]
    CreationFailed(String),

    #[error("unit start failed: {0}")]
    StartFailed(String),

    #[error("attach failed: {0}")]
    AttachFailed(String),

    #[error("output stream failed: {0}")]
    StreamFailed(String),

    #[error("unit stop failed: {0}")]
    StopFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
