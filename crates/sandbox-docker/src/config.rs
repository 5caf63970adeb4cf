pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Daemon address (`unix:///var/run/docker.sock`, `tcp://host:2375`).
    /// Local defaults (`DOCKER_HOST` or the platform socket) when unset.
    pub host: Option<String>,
    /// Per-request timeout of the Engine API client.
    pub timeout_secs: u64,
    /// Force-remove the container after it has been stopped.
    pub remove_on_stop: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            remove_on_stop: true,
        }
    }
}
