use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use sandbox::IsolationProvider;
use sandbox_docker::{DockerConfig, DockerProvider, check_prerequisites};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::app::build_evaluator;
use crate::config;
use crate::error::{EvaldError, EvaldResult};
use crate::http::{self, AppState};

#[derive(Args)]
pub struct ServeArgs {
    /// Path to evald.yaml (built-in defaults when omitted)
    #[arg(long, short, env = "EVALD_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address (overrides config)
    #[arg(long, env = "EVALD_LISTEN")]
    listen: Option<String>,
    /// Preshared key every request must carry
    #[arg(long, env = "EVAL_PSK", hide_env_values = true)]
    psk: Option<String>,
}

/// Load config, connect to the daemon, and serve until SIGINT or SIGTERM.
pub async fn run_serve(args: ServeArgs) -> EvaldResult<()> {
    let mut config = config::load_or_default(args.config.as_deref()).await?;
    if let Some(listen) = args.listen {
        config.listen = listen;
        config.validate()?;
    }
    let psk = args.psk.unwrap_or_default();
    if psk.is_empty() {
        return Err(EvaldError::Config(
            "preshared key must be set (EVAL_PSK or --psk)".into(),
        ));
    }

    let docker = DockerProvider::connect(&DockerConfig::from(&config.docker)).await?;
    // Missing images are pulled by nobody; requests for them fail at create.
    if let Err(e) = check_prerequisites(&docker, &config.images()).await {
        warn!(error = %e, "prerequisite check failed; continuing");
    }
    let provider: Arc<dyn IsolationProvider> = Arc::new(docker);
    let evaluator = Arc::new(build_evaluator(&config, provider));

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");

    let app = http::router(
        AppState::new(Arc::clone(&evaluator), &psk),
        config.max_body_bytes,
    );
    http::serve(listener, app, shutdown_signal()).await?;

    let abandoned = evaluator
        .shutdown(config.environment_options().teardown_bound())
        .await;
    if abandoned > 0 {
        error!(abandoned, "server stopped with units still running");
    } else {
        info!("server stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        () = recv_signal(&mut sigterm) => info!("received SIGTERM, draining"),
        () = recv_signal(&mut sigint) => info!("received SIGINT, draining"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
