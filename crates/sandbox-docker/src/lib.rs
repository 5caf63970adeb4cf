mod config;
mod error;
mod limits;
mod prerequisites;
mod provider;

pub use config::DockerConfig;
pub use prerequisites::check_prerequisites;
pub use provider::DockerProvider;
