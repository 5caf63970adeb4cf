use sandbox::SandboxError;

use crate::provider::DockerProvider;

/// Verify the daemon answers and every image the registry may ask for is
/// present locally.
///
/// Collects all failures and returns them in a single `BackendNotAvailable`
/// error.
pub async fn check_prerequisites(
    provider: &DockerProvider,
    images: &[String],
) -> Result<(), SandboxError> {
    let docker = provider.client();

    if let Err(e) = docker.ping().await {
        return Err(SandboxError::BackendNotAvailable(format!(
            "docker daemon not reachable: {e}"
        )));
    }

    let mut errors = Vec::new();
    for image in images {
        if let Err(e) = docker.inspect_image(image).await {
            errors.push(format!("image {image} not available: {e}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}
