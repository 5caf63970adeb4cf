use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use sandbox::{IsolationProvider, UnitConfig, UnitHandle};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::DEFAULT_CAPTURE_LIMIT;
use crate::context::RequestContext;
use crate::error::{ProvisionError, RunError};
use crate::registry::EnvironmentSpec;
use crate::response::RunResponse;
use crate::runner;

/// Grace period handed to the provider when stopping a unit.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Extra time allowed on top of the stop grace before teardown gives up.
const STOP_SLACK: Duration = Duration::from_secs(5);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Provisioning = 0,
    Idle = 1,
    Running = 2,
    Completed = 3,
    TimedOut = 4,
    Failed = 5,
    Cleaning = 6,
    Gone = 7,
}

impl EnvState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 7, "invalid EnvState: {v}");
        match v {
            0 => Self::Provisioning,
            1 => Self::Idle,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::TimedOut,
            5 => Self::Failed,
            6 => Self::Cleaning,
            _ => Self::Gone,
        }
    }
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Idle => f.write_str("idle"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Failed => f.write_str("failed"),
            Self::Cleaning => f.write_str("cleaning"),
            Self::Gone => f.write_str("gone"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    /// Per-stream capture limit in bytes; `None` captures without bound.
    pub capture_limit: Option<usize>,
    pub stop_grace: Duration,
    /// Detached teardowns are spawned here so shutdown can wait for them.
    pub teardowns: TaskTracker,
}

impl EnvironmentOptions {
    /// Longest a single teardown may take before its unit is abandoned.
    pub fn teardown_bound(&self) -> Duration {
        self.stop_grace + STOP_SLACK
    }
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            capture_limit: Some(DEFAULT_CAPTURE_LIMIT),
            stop_grace: DEFAULT_STOP_GRACE,
            teardowns: TaskTracker::new(),
        }
    }
}

/// Everything needed to stop a unit after its environment is gone.
struct Teardown {
    handle: UnitHandle,
    provider: Arc<dyn IsolationProvider>,
    grace: Duration,
    /// Capacity slot, freed once the unit is stopped (or abandoned).
    _permit: Option<OwnedSemaphorePermit>,
    tracker: TaskTracker,
}

impl Teardown {
    fn new(
        handle: UnitHandle,
        provider: Arc<dyn IsolationProvider>,
        permit: Option<OwnedSemaphorePermit>,
        options: &EnvironmentOptions,
    ) -> Self {
        Self {
            handle,
            provider,
            grace: options.stop_grace,
            _permit: permit,
            tracker: options.teardowns.clone(),
        }
    }

    async fn run(self) {
        let bound = self.grace + STOP_SLACK;
        match tokio::time::timeout(bound, self.provider.stop(&self.handle, self.grace)).await {
            Ok(Ok(())) => info!(unit = %self.handle, "environment cleaned up"),
            Ok(Err(e)) => {
                error!(unit = %self.handle, error = %e, "cleanup failed; unit abandoned");
            }
            Err(_) => error!(
                unit = %self.handle,
                timeout_secs = bound.as_secs(),
                "cleanup timed out; unit abandoned"
            ),
        }
    }

    /// Fire-and-forget on the shared tracker. Failures end up in the log only.
    fn spawn(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let tracker = self.tracker.clone();
                tracker.spawn_on(self.run(), &rt);
            }
            Err(_) => error!(unit = %self.handle, "no runtime for cleanup; unit abandoned"),
        }
    }
}

/// One isolated unit bound to one request.
///
/// Single use: exactly one [`Environment::run`] is accepted. Teardown happens
/// exactly once, through [`Environment::cleanup`], [`Environment::release`],
/// or, if neither was called, when the environment is dropped.
pub struct Environment {
    name: String,
    handle: UnitHandle,
    provider: Arc<dyn IsolationProvider>,
    options: EnvironmentOptions,
    state: AtomicU8,
    teardown: Option<Teardown>,
}

impl Environment {
    /// Create and start a unit for `spec`. Both steps race the context's
    /// deadline. A unit that was created but never reached `Idle` is torn
    /// down before the error is returned to the caller.
    pub(crate) async fn provision(
        name: &str,
        spec: &EnvironmentSpec,
        provider: Arc<dyn IsolationProvider>,
        permit: Option<OwnedSemaphorePermit>,
        options: EnvironmentOptions,
        ctx: &RequestContext,
    ) -> Result<Self, ProvisionError> {
        let config = UnitConfig {
            id: Uuid::new_v4(),
            image: spec.image.clone(),
            limits: spec.limits.clone(),
        };

        // Create runs in its own task so a unit the daemon creates after the
        // deadline still gets a handle, and with it a teardown.
        let mut create = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.create(&config).await })
        };
        let created = tokio::select! {
            joined = &mut create => Some(joined),
            () = ctx.done() => None,
        };
        let handle = match created {
            Some(Ok(Ok(handle))) => handle,
            Some(Ok(Err(e))) => {
                warn!(env = %name, error = %e, "unit creation failed");
                return Err(e.into());
            }
            Some(Err(join)) => {
                return Err(ProvisionError::ProviderUnavailable(format!(
                    "create task: {join}"
                )));
            }
            None => {
                reap_late_unit(create, provider, permit, &options);
                return Err(ProvisionError::DeadlineExceeded("creating unit"));
            }
        };

        let env = Self {
            name: name.to_string(),
            handle: handle.clone(),
            provider: Arc::clone(&provider),
            teardown: Some(Teardown::new(handle, provider, permit, &options)),
            options,
            state: AtomicU8::new(EnvState::Provisioning as u8),
        };

        let started = tokio::select! {
            res = env.provider.start(&env.handle) => Some(res),
            () = ctx.done() => None,
        };
        match started {
            Some(Ok(())) => {
                env.set_state(EnvState::Idle);
                info!(env = %env.name, unit = %env.handle, "environment ready");
                Ok(env)
            }
            Some(Err(e)) => {
                warn!(env = %env.name, unit = %env.handle, error = %e, "unit start failed");
                Err(e.into())
            }
            None => Err(ProvisionError::DeadlineExceeded("starting unit")),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &UnitHandle {
        &self.handle
    }

    pub fn state(&self) -> EnvState {
        EnvState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EnvState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically transition between states using CAS. On mismatch returns
    /// the state that was actually found.
    fn transition(&self, from: EnvState, to: EnvState) -> Result<(), EnvState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(EnvState::from_u8)
    }

    /// Run `body` in the unit. A second call, concurrent or not, is rejected
    /// with [`RunError::AlreadyUsed`] without touching the unit.
    ///
    /// An elapsed deadline is not an error: the response carries
    /// `timeout = true` and whatever output arrived before the cut.
    pub async fn run(&self, ctx: &RequestContext, body: &str) -> Result<RunResponse, RunError> {
        if let Err(state) = self.transition(EnvState::Idle, EnvState::Running) {
            warn!(env = %self.name, unit = %self.handle, %state, "run rejected");
            return Err(RunError::AlreadyUsed { state });
        }

        let result = self.run_once(ctx, body).await;
        self.set_state(match &result {
            Ok(resp) if resp.timeout => EnvState::TimedOut,
            Ok(_) => EnvState::Completed,
            Err(_) => EnvState::Failed,
        });
        result
    }

    async fn run_once(&self, ctx: &RequestContext, body: &str) -> Result<RunResponse, RunError> {
        let attached = tokio::select! {
            res = self.provider.attach(&self.handle) => Some(res),
            () = ctx.done() => None,
        };
        let attachment = match attached {
            Some(Ok(attachment)) => attachment,
            Some(Err(e)) => return Err(RunError::WriteFailed(format!("attach: {e}"))),
            None => {
                debug!(unit = %self.handle, "deadline elapsed before attach");
                return Ok(RunResponse {
                    timeout: true,
                    ..RunResponse::default()
                });
            }
        };

        runner::run_attached(
            &self.handle,
            attachment,
            body.as_bytes(),
            ctx,
            self.options.capture_limit,
        )
        .await
    }

    /// Stop the unit and wait for it. Errors are logged, never returned.
    pub async fn cleanup(mut self) {
        if let Some(teardown) = self.teardown.take() {
            self.set_state(EnvState::Cleaning);
            teardown.run().await;
            self.set_state(EnvState::Gone);
        }
    }

    /// Stop the unit in the background and return immediately.
    pub fn release(mut self) {
        if let Some(teardown) = self.teardown.take() {
            self.set_state(EnvState::Cleaning);
            teardown.spawn();
        }
    }
}

/// Wait out a create that lost the race against the deadline and tear down
/// whatever unit it produced. Holds the capacity slot until then.
fn reap_late_unit(
    create: JoinHandle<sandbox::Result<UnitHandle>>,
    provider: Arc<dyn IsolationProvider>,
    permit: Option<OwnedSemaphorePermit>,
    options: &EnvironmentOptions,
) {
    let options = options.clone();
    options.teardowns.clone().spawn(async move {
        match create.await {
            Ok(Ok(handle)) => {
                warn!(unit = %handle, "unit created after deadline; tearing down");
                Teardown::new(handle, provider, permit, &options).run().await;
            }
            Ok(Err(e)) => debug!(error = %e, "late unit creation failed"),
            Err(e) => warn!(error = %e, "create task failed"),
        }
    });
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            debug!(unit = %self.handle, state = %self.state(), "environment dropped; cleaning up");
            teardown.spawn();
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use sandbox::SandboxError;
    use sandbox::testing::{Behavior, FakeProvider, Stage, stdout};

    use super::*;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            image: "euank/python:3.6".into(),
            limits: sandbox::ResourceLimits::default(),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::with_timeout(Duration::from_secs(20))
    }

    async fn provision(provider: &Arc<FakeProvider>) -> Result<Environment, ProvisionError> {
        let provider: Arc<dyn IsolationProvider> = Arc::clone(provider) as _;
        Environment::provision(
            "python",
            &spec(),
            provider,
            None,
            EnvironmentOptions::default(),
            &ctx(),
        )
        .await
    }

    /// Let detached teardown tasks run to completion.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn provision_reaches_idle() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let env = provision(&provider).await.unwrap();
        assert_eq!(env.state(), EnvState::Idle);
        assert_eq!(env.name(), "python");
        assert_eq!(provider.started(), vec![env.handle().clone()]);

        let (image, limits) = provider.created_with(env.handle()).unwrap();
        assert_eq!(image, "euank/python:3.6");
        assert_eq!(limits, sandbox::ResourceLimits::default());
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let provider = Arc::new(FakeProvider::new(Behavior::Script(vec![stdout("hi\n")])));
        let env = provision(&provider).await.unwrap();

        let first = env.run(&ctx(), "print('hi')").await.unwrap();
        assert_eq!(first.stdout, "hi\n");
        assert_eq!(env.state(), EnvState::Completed);

        let err = env.run(&ctx(), "print('again')").await.unwrap_err();
        assert!(matches!(
            err,
            RunError::AlreadyUsed {
                state: EnvState::Completed
            }
        ));
        assert_eq!(provider.attached().len(), 1);
        env.cleanup().await;
    }

    #[tokio::test]
    async fn run_failure_marks_failed() {
        let provider = Arc::new(FakeProvider::new(Behavior::BrokenInput));
        let env = provision(&provider).await.unwrap();
        let err = env.run(&ctx(), "print(1)").await.unwrap_err();
        assert!(matches!(err, RunError::WriteFailed(_)));
        assert_eq!(env.state(), EnvState::Failed);
    }

    #[tokio::test]
    async fn attach_failure_is_write_failure() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo)
                .failing(Stage::Attach, || SandboxError::AttachFailed("gone".into())),
        );
        let env = provision(&provider).await.unwrap();
        let err = env.run(&ctx(), "").await.unwrap_err();
        match err {
            RunError::WriteFailed(detail) => assert!(detail.contains("attach"), "{detail}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_marks_timed_out() {
        let provider = Arc::new(FakeProvider::new(Behavior::Hang(vec![])));
        let env = provision(&provider).await.unwrap();
        let short = RequestContext::with_timeout(Duration::from_secs(2));
        let resp = env.run(&short, "while True: pass").await.unwrap();
        assert!(resp.timeout);
        assert_eq!(env.state(), EnvState::TimedOut);
    }

    #[tokio::test]
    async fn cleanup_stops_unit_once() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let env = provision(&provider).await.unwrap();
        let handle = env.handle().clone();
        env.cleanup().await;
        settle().await;
        assert_eq!(provider.stop_count(&handle), 1);
    }

    #[tokio::test]
    async fn release_stops_unit_in_background() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let env = provision(&provider).await.unwrap();
        let handle = env.handle().clone();
        env.release();
        settle().await;
        assert_eq!(provider.stop_count(&handle), 1);
    }

    #[tokio::test]
    async fn dropping_environment_still_cleans_up() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let env = provision(&provider).await.unwrap();
        let handle = env.handle().clone();
        drop(env);
        settle().await;
        assert_eq!(provider.stop_count(&handle), 1);
    }

    #[tokio::test]
    async fn cleanup_failure_is_swallowed() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo)
                .failing(Stage::Stop, || SandboxError::StopFailed("daemon gone".into())),
        );
        let env = provision(&provider).await.unwrap();
        let handle = env.handle().clone();
        env.cleanup().await;
        assert_eq!(provider.stop_count(&handle), 1);
    }

    #[tokio::test]
    async fn start_failure_cleans_up_created_unit() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo)
                .failing(Stage::Start, || SandboxError::StartFailed("oci runtime".into())),
        );
        let err = provision(&provider).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ProviderUnavailable(_)));
        settle().await;

        let created = provider.created();
        assert_eq!(created.len(), 1);
        assert_eq!(provider.stop_count(&created[0]), 1);
    }

    #[tokio::test]
    async fn create_failure_leaves_nothing_to_clean() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo).failing(Stage::Create, || {
            SandboxError::ResourceExhausted("cannot allocate memory".into())
        }));
        let err = provision(&provider).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceExhausted(_)));
        settle().await;
        assert!(provider.created().is_empty());
        assert!(provider.stopped().is_empty());
    }

    /// Close the tracker and wait until every detached teardown has finished.
    async fn drain(options: &EnvironmentOptions) {
        options.teardowns.close();
        options.teardowns.wait().await;
    }

    async fn provision_with(
        provider: &Arc<FakeProvider>,
        options: &EnvironmentOptions,
        ctx: &RequestContext,
    ) -> Result<Environment, ProvisionError> {
        let provider: Arc<dyn IsolationProvider> = Arc::clone(provider) as _;
        Environment::provision("python", &spec(), provider, None, options.clone(), ctx).await
    }

    #[tokio::test(start_paused = true)]
    async fn slow_start_hits_provisioning_deadline() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo).with_delay(Stage::Start, Duration::from_secs(30)),
        );
        let options = EnvironmentOptions::default();
        let short = RequestContext::with_timeout(Duration::from_secs(2));

        let err = provision_with(&provider, &options, &short).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DeadlineExceeded("starting unit")));
        drain(&options).await;

        let created = provider.created();
        assert_eq!(created.len(), 1);
        assert_eq!(provider.stop_count(&created[0]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_created_after_deadline_is_torn_down() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo).with_delay(Stage::Create, Duration::from_secs(5)),
        );
        let options = EnvironmentOptions::default();
        let short = RequestContext::with_timeout(Duration::from_secs(2));

        let err = provision_with(&provider, &options, &short).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DeadlineExceeded("creating unit")));
        assert!(provider.created().is_empty());

        drain(&options).await;
        let created = provider.created();
        assert_eq!(created.len(), 1);
        assert_eq!(provider.stop_count(&created[0]), 1);
        assert!(provider.started().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_unit_keeps_its_slot_until_stopped() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo).with_delay(Stage::Create, Duration::from_secs(5)),
        );
        let provider_dyn: Arc<dyn IsolationProvider> = Arc::clone(&provider) as _;
        let options = EnvironmentOptions::default();
        let slots = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = Arc::clone(&slots).try_acquire_owned().unwrap();
        let short = RequestContext::with_timeout(Duration::from_secs(2));

        let err = Environment::provision(
            "python",
            &spec(),
            provider_dyn,
            Some(permit),
            options.clone(),
            &short,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::DeadlineExceeded(_)));
        assert_eq!(slots.available_permits(), 0);

        drain(&options).await;
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn released_teardown_is_awaited_by_tracker() {
        let provider = Arc::new(
            FakeProvider::new(Behavior::Echo).with_delay(Stage::Stop, Duration::from_secs(3)),
        );
        let options = EnvironmentOptions::default();
        let env = provision_with(&provider, &options, &ctx()).await.unwrap();
        let handle = env.handle().clone();

        env.release();
        assert_eq!(provider.stop_count(&handle), 0);
        assert_eq!(options.teardowns.len(), 1);

        drain(&options).await;
        assert_eq!(provider.stop_count(&handle), 1);
        assert!(options.teardowns.is_empty());
    }

    #[test]
    fn teardown_bound_adds_slack_to_grace() {
        let options = EnvironmentOptions {
            stop_grace: Duration::from_secs(2),
            ..EnvironmentOptions::default()
        };
        assert_eq!(options.teardown_bound(), Duration::from_secs(7));
    }
}
