use std::time::Duration;

use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::error::EvalError;
use crate::registry::Registry;
use crate::response::RunResponse;

/// Ceiling applied to every request, whatever deadline the caller brings.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Provision, run once, release. One environment per call.
pub struct Evaluator {
    registry: Registry,
    ceiling: Duration,
    teardowns: TaskTracker,
}

impl Evaluator {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            ceiling: DEFAULT_REQUEST_TIMEOUT,
            teardowns: TaskTracker::new(),
        }
    }

    /// The tracker the registry's environments spawn their teardowns on,
    /// i.e. `EnvironmentOptions::teardowns`. Drained by [`Evaluator::shutdown`].
    pub fn with_teardowns(mut self, teardowns: TaskTracker) -> Self {
        self.teardowns = teardowns;
        self
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Wait up to `bound` for every detached teardown to finish. Call once no
    /// more requests can arrive. Returns how many were still running when the
    /// bound elapsed; their units are abandoned.
    pub async fn shutdown(&self, bound: Duration) -> usize {
        self.teardowns.close();
        let pending = self.teardowns.len();
        if pending > 0 {
            info!(pending, "waiting for teardowns");
        }
        if tokio::time::timeout(bound, self.teardowns.wait()).await.is_ok() {
            return 0;
        }
        let left = self.teardowns.len();
        error!(
            pending = left,
            timeout_secs = bound.as_secs(),
            "teardowns still running at shutdown; units abandoned"
        );
        left
    }

    /// Evaluate `body` in a fresh environment named `env_name`.
    ///
    /// Teardown of the environment is started before this returns but never
    /// awaited, so the caller's latency excludes it.
    pub async fn handle(
        &self,
        env_name: &str,
        body: &str,
        ctx: &RequestContext,
    ) -> Result<RunResponse, EvalError> {
        let started = Instant::now();
        let ctx = ctx.bounded(self.ceiling);

        let env = match self.registry.provision(&ctx, env_name).await {
            Ok(env) => env,
            Err(e) => {
                warn!(env = %env_name, error = %e, "provisioning failed");
                return Err(e.into());
            }
        };

        let result = env.run(&ctx, body).await;
        let unit = env.handle().clone();
        env.release();

        match result {
            Ok(resp) => {
                info!(
                    env = %env_name,
                    unit = %unit,
                    timeout = resp.timeout,
                    truncated = resp.truncated,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "evaluation finished"
                );
                Ok(resp)
            }
            Err(e) => {
                warn!(env = %env_name, unit = %unit, error = %e, "evaluation failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sandbox::IsolationProvider;
    use sandbox::testing::{Behavior, FakeProvider, Stage, stdout};

    use super::*;
    use crate::environment::EnvironmentOptions;
    use crate::registry::{EnvironmentSpec, ImageProvisioner};

    fn evaluator(provider: &Arc<FakeProvider>) -> Evaluator {
        let provider: Arc<dyn IsolationProvider> = Arc::clone(provider) as _;
        let options = EnvironmentOptions::default();
        let teardowns = options.teardowns.clone();
        let mut registry = Registry::new();
        registry.register(
            "python",
            Arc::new(ImageProvisioner::new(
                EnvironmentSpec {
                    image: "euank/python:3.6".into(),
                    limits: sandbox::ResourceLimits::default(),
                },
                provider,
                options,
            )),
        );
        Evaluator::new(registry).with_teardowns(teardowns)
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_bounds_generous_caller_deadline() {
        let provider = Arc::new(FakeProvider::new(Behavior::Hang(vec![stdout("spin")])));
        let evaluator = evaluator(&provider).with_ceiling(Duration::from_secs(3));
        let ctx = RequestContext::with_timeout(Duration::from_secs(600));

        let resp = evaluator
            .handle("python", "while True: pass", &ctx)
            .await
            .unwrap();
        assert!(resp.timeout);
        assert_eq!(resp.stdout, "spin");
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn default_ceiling_is_twenty_seconds() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        assert_eq!(evaluator(&provider).ceiling(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_released_units() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Script(vec![stdout("hi\n")]))
                .with_delay(Stage::Stop, Duration::from_secs(4)),
        );
        let evaluator = evaluator(&provider);
        let ctx = RequestContext::with_timeout(Duration::from_secs(20));

        let resp = evaluator.handle("python", "print('hi')", &ctx).await.unwrap();
        assert_eq!(resp.stdout, "hi\n");
        let unit = provider.created()[0].clone();
        assert_eq!(provider.stop_count(&unit), 0);

        assert_eq!(evaluator.shutdown(Duration::from_secs(10)).await, 0);
        assert_eq!(provider.stop_count(&unit), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_bound() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo).with_delay(Stage::Stop, Duration::from_secs(60)),
        );
        let evaluator = evaluator(&provider);
        let ctx = RequestContext::with_timeout(Duration::from_secs(20));
        evaluator.handle("python", "", &ctx).await.unwrap();

        assert_eq!(evaluator.shutdown(Duration::from_secs(1)).await, 1);
    }
}
