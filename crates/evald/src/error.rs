#[derive(Debug, thiserror::Error)]
pub enum EvaldError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EvaldResult<T> = Result<T, EvaldError>;
