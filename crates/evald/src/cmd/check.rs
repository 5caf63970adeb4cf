use std::path::PathBuf;

use clap::Args;
use sandbox_docker::{DockerConfig, DockerProvider, check_prerequisites};
use tracing::info;

use crate::config;
use crate::error::EvaldResult;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to evald.yaml (built-in defaults when omitted)
    #[arg(long, short, env = "EVALD_CONFIG")]
    config: Option<PathBuf>,
}

/// Verify the daemon answers and every configured image is present.
pub async fn run_check(args: CheckArgs) -> EvaldResult<()> {
    let config = config::load_or_default(args.config.as_deref()).await?;
    let provider = DockerProvider::connect(&DockerConfig::from(&config.docker)).await?;
    let images = config.images();
    check_prerequisites(&provider, &images).await?;
    info!(images = ?images, "prerequisites satisfied");
    Ok(())
}
