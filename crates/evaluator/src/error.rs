use sandbox::SandboxError;

use crate::environment::EnvState;

/// Why an environment could not be handed to the caller. No environment
/// exists after any of these.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid environment: {0}")]
    UnknownEnvironment(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(&'static str),
}

impl From<SandboxError> for ProvisionError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::ResourceExhausted(detail) => Self::ResourceExhausted(detail),
            other => Self::ProviderUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("environment already used (state: {state})")]
    AlreadyUsed { state: EnvState },

    #[error("error writing program to unit: {0}")]
    WriteFailed(String),

    #[error("error reading unit output: {0}")]
    DrainFailed(String),
}

/// Coarse classification handed to the transport layer, which owns the
/// mapping to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownEnvironment,
    ProviderUnavailable,
    ResourceExhausted,
    WriteFailed,
    RunFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provision(ProvisionError::UnknownEnvironment(_)) => ErrorKind::UnknownEnvironment,
            Self::Provision(ProvisionError::ResourceExhausted(_)) => ErrorKind::ResourceExhausted,
            Self::Provision(
                ProvisionError::ProviderUnavailable(_) | ProvisionError::DeadlineExceeded(_),
            ) => ErrorKind::ProviderUnavailable,
            Self::Run(RunError::WriteFailed(_)) => ErrorKind::WriteFailed,
            Self::Run(RunError::DrainFailed(_) | RunError::AlreadyUsed { .. }) => {
                ErrorKind::RunFailed
            }
        }
    }
}
