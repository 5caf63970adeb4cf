use std::fmt;

use bollard::errors::Error as DockerError;
use sandbox::SandboxError;

/// Daemon messages that mean the host ran out of something, not that the
/// request was wrong.
const EXHAUSTION_MARKERS: &[&str] = &[
    "no space left on device",
    "cannot allocate memory",
    "resource temporarily unavailable",
    "too many",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Create,
    Start,
    Attach,
    Stop,
    Remove,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Start => f.write_str("start"),
            Self::Attach => f.write_str("attach"),
            Self::Stop => f.write_str("stop"),
            Self::Remove => f.write_str("remove"),
        }
    }
}

impl Stage {
    fn failure(self, detail: String) -> SandboxError {
        match self {
            Self::Create => SandboxError::CreationFailed(detail),
            Self::Start => SandboxError::StartFailed(detail),
            Self::Attach => SandboxError::AttachFailed(detail),
            Self::Stop | Self::Remove => SandboxError::StopFailed(detail),
        }
    }
}

/// Map an Engine API error to the provider contract's taxonomy.
pub(crate) fn classify(stage: Stage, err: DockerError) -> SandboxError {
    match &err {
        DockerError::DockerResponseServerError { message, .. } if is_exhaustion(message) => {
            SandboxError::ResourceExhausted(format!("{stage}: {message}"))
        }
        DockerError::RequestTimeoutError | DockerError::IOError { .. } => {
            SandboxError::BackendNotAvailable(format!("{stage}: {err}"))
        }
        _ => stage.failure(format!("{stage}: {err}")),
    }
}

/// `true` if the daemon answered with `status`.
pub(crate) fn has_status(err: &DockerError, status: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == status)
}

fn is_exhaustion(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    EXHAUSTION_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
