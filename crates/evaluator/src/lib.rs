mod capture;
mod context;
mod environment;
mod error;
mod registry;
mod response;
mod runner;
mod service;

pub use capture::DEFAULT_CAPTURE_LIMIT;
pub use context::RequestContext;
pub use environment::{EnvState, Environment, EnvironmentOptions};
pub use error::{ErrorKind, EvalError, ProvisionError, RunError};
pub use registry::{EnvironmentSpec, ImageProvisioner, Provisioner, Registry};
pub use response::RunResponse;
pub use service::{DEFAULT_REQUEST_TIMEOUT, Evaluator};
