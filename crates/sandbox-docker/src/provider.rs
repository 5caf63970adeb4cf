use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use sandbox::{
    Attachment, IsolationProvider, OutputChunk, SandboxError, UnitConfig, UnitHandle,
};
use tracing::{debug, info, warn};

use crate::config::DockerConfig;
use crate::error::{Stage, classify, has_status};
use crate::limits::{container_config, container_name};

/// Isolation provider running each unit as a resource-limited container.
///
/// Holds one Engine API client for the whole process. `Docker` is a cheap
/// handle over a shared connection pool, so concurrent environments reuse it.
pub struct DockerProvider {
    docker: Docker,
    remove_on_stop: bool,
}

impl DockerProvider {
    /// Connect to the daemon and negotiate the API version once.
    pub async fn connect(config: &DockerConfig) -> sandbox::Result<Self> {
        let docker = match config.host.as_deref() {
            None => Docker::connect_with_local_defaults()
                .map(|d| d.with_timeout(Duration::from_secs(config.timeout_secs))),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, config.timeout_secs, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, config.timeout_secs, API_DEFAULT_VERSION),
        }
        .map_err(|e| SandboxError::BackendNotAvailable(format!("docker client: {e}")))?;

        let docker = docker
            .negotiate_version()
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("negotiate api version: {e}")))?;

        info!(
            host = config.host.as_deref().unwrap_or("local"),
            api_version = %docker.client_version(),
            "docker provider connected"
        );

        Ok(Self {
            docker,
            remove_on_stop: config.remove_on_stop,
        })
    }

    pub(crate) fn client(&self) -> &Docker {
        &self.docker
    }

    async fn remove(&self, handle: &UnitHandle) -> sandbox::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(handle.as_str(), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if has_status(&e, 404) => Ok(()),
            Err(e) => Err(classify(Stage::Remove, e)),
        }
    }
}

#[async_trait]
impl IsolationProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, config: &UnitConfig) -> sandbox::Result<UnitHandle> {
        let options = CreateContainerOptions {
            name: container_name(&config.id),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(config))
            .await
            .map_err(|e| classify(Stage::Create, e))?;

        for warning in &response.warnings {
            warn!(unit = %response.id, "create: {warning}");
        }
        info!(unit = %response.id, image = %config.image, "container created");
        Ok(UnitHandle::new(response.id))
    }

    async fn start(&self, handle: &UnitHandle) -> sandbox::Result<()> {
        self.docker
            .start_container(handle.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(Stage::Start, e))?;
        info!(unit = %handle, "container started");
        Ok(())
    }

    async fn attach(&self, handle: &UnitHandle) -> sandbox::Result<Attachment> {
        // `logs` replays anything written between start and attach.
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(handle.as_str(), Some(options))
            .await
            .map_err(|e| classify(Stage::Attach, e))?;

        debug!(unit = %handle, "attached");
        let output = output
            .filter_map(|frame| std::future::ready(demux(frame)))
            .boxed();
        Ok(Attachment { input, output })
    }

    async fn stop(&self, handle: &UnitHandle, grace: Duration) -> sandbox::Result<()> {
        let options = StopContainerOptions {
            t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
        };
        match self
            .docker
            .stop_container(handle.as_str(), Some(options))
            .await
        {
            Ok(()) => info!(unit = %handle, "container stopped"),
            Err(e) if has_status(&e, 304) => debug!(unit = %handle, "container already stopped"),
            Err(e) if has_status(&e, 404) => {
                debug!(unit = %handle, "container already gone");
                return Ok(());
            }
            Err(e) => return Err(classify(Stage::Stop, e)),
        }

        if self.remove_on_stop {
            self.remove(handle).await?;
            debug!(unit = %handle, "container removed");
        }
        Ok(())
    }
}

/// Split one frame of Docker's multiplexed attach stream. Stdin echoes carry
/// nothing the caller asked for and are dropped.
fn demux(frame: Result<LogOutput, DockerError>) -> Option<sandbox::Result<OutputChunk>> {
    match frame {
        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
            Some(Ok(OutputChunk::Stdout(message)))
        }
        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
        Ok(LogOutput::StdIn { .. }) => None,
        Err(e) => Some(Err(SandboxError::StreamFailed(e.to_string()))),
    }
}
