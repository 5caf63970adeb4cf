mod attach;
mod config;
mod error;
mod handle;
mod provider;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use attach::{Attachment, InputStream, OutputChunk, OutputStream};
pub use config::{NetworkPolicy, ResourceLimits, UnitConfig};
pub use error::{Result, SandboxError};
pub use handle::UnitHandle;
pub use provider::IsolationProvider;
