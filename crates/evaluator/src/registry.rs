use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{IsolationProvider, ResourceLimits};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::environment::{Environment, EnvironmentOptions};
use crate::error::ProvisionError;

/// Image plus limits for one named environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub image: String,
    pub limits: ResourceLimits,
}

/// Produces a fresh, started, idle environment per call.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        name: &str,
        ctx: &RequestContext,
    ) -> Result<Environment, ProvisionError>;
}

/// Provisions units of one image through an isolation provider, optionally
/// bounded by a shared pool of slots.
pub struct ImageProvisioner {
    spec: EnvironmentSpec,
    provider: Arc<dyn IsolationProvider>,
    options: EnvironmentOptions,
    capacity: Option<Arc<Semaphore>>,
}

impl ImageProvisioner {
    pub fn new(
        spec: EnvironmentSpec,
        provider: Arc<dyn IsolationProvider>,
        options: EnvironmentOptions,
    ) -> Self {
        Self {
            spec,
            provider,
            options,
            capacity: None,
        }
    }

    /// Share `slots` with other provisioners. A slot is held from creation
    /// until the unit has been stopped.
    pub fn with_capacity(mut self, slots: Arc<Semaphore>) -> Self {
        self.capacity = Some(slots);
        self
    }

    pub fn spec(&self) -> &EnvironmentSpec {
        &self.spec
    }
}

#[async_trait]
impl Provisioner for ImageProvisioner {
    async fn provision(
        &self,
        name: &str,
        ctx: &RequestContext,
    ) -> Result<Environment, ProvisionError> {
        let permit = match &self.capacity {
            Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(env = %name, "no free sandbox slot");
                    return Err(ProvisionError::ResourceExhausted(
                        "all sandbox slots busy".into(),
                    ));
                }
            },
            None => None,
        };

        debug!(env = %name, image = %self.spec.image, provider = self.provider.name(), "provisioning");
        Environment::provision(
            name,
            &self.spec,
            Arc::clone(&self.provider),
            permit,
            self.options.clone(),
            ctx,
        )
        .await
    }
}

/// Name to provisioner mapping, fixed at startup. Lookups are exact and
/// case-sensitive.
#[derive(Default)]
pub struct Registry {
    provisioners: HashMap<String, Arc<dyn Provisioner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provisioner` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.insert(name.into(), provisioner);
    }

    /// Make `alias` resolve to whatever `target` resolves to. Returns false
    /// when `target` is not registered.
    pub fn alias(&mut self, alias: impl Into<String>, target: &str) -> bool {
        let Some(provisioner) = self.provisioners.get(target).cloned() else {
            return false;
        };
        self.provisioners.insert(alias.into(), provisioner);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.provisioners.contains_key(name)
    }

    /// Registered names, aliases included, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.provisioners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up `name` and provision one environment from it. Unknown names
    /// fail before any unit is created.
    pub async fn provision(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Environment, ProvisionError> {
        let Some(provisioner) = self.provisioners.get(name) else {
            return Err(ProvisionError::UnknownEnvironment(name.to_string()));
        };
        provisioner.provision(name, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sandbox::testing::{Behavior, FakeProvider};

    use super::*;

    fn python(provider: &Arc<FakeProvider>) -> Arc<dyn Provisioner> {
        let provider: Arc<dyn IsolationProvider> = Arc::clone(provider) as _;
        Arc::new(ImageProvisioner::new(
            EnvironmentSpec {
                image: "euank/python:3.6".into(),
                limits: ResourceLimits::default(),
            },
            provider,
            EnvironmentOptions::default(),
        ))
    }

    fn ctx() -> RequestContext {
        RequestContext::with_timeout(Duration::from_secs(20))
    }

    #[tokio::test]
    async fn unknown_name_creates_nothing() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let mut registry = Registry::new();
        registry.register("python", python(&provider));

        let err = registry.provision(&ctx(), "ruby").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownEnvironment(ref n) if n == "ruby"));
        assert!(provider.created().is_empty());
    }

    #[tokio::test]
    async fn lookup_is_case_sensitive() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let mut registry = Registry::new();
        registry.register("python", python(&provider));

        let err = registry.provision(&ctx(), "Python").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownEnvironment(_)));
    }

    #[tokio::test]
    async fn alias_resolves_to_target() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let mut registry = Registry::new();
        registry.register("python", python(&provider));
        assert!(registry.alias("py", "python"));
        assert!(!registry.alias("rb", "ruby"));

        assert_eq!(registry.names(), vec!["py", "python"]);
        let env = registry.provision(&ctx(), "py").await.unwrap();
        assert_eq!(env.name(), "py");
        env.cleanup().await;
        assert_eq!(provider.created().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_slots_reject_without_creating() {
        let provider = Arc::new(FakeProvider::new(Behavior::Echo));
        let provider_dyn: Arc<dyn IsolationProvider> = Arc::clone(&provider) as _;
        let slots = Arc::new(Semaphore::new(1));
        let provisioner = ImageProvisioner::new(
            EnvironmentSpec {
                image: "euank/python:3.6".into(),
                limits: ResourceLimits::default(),
            },
            provider_dyn,
            EnvironmentOptions::default(),
        )
        .with_capacity(Arc::clone(&slots));

        let held = provisioner.provision("python", &ctx()).await.unwrap();
        let err = provisioner.provision("python", &ctx()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceExhausted(_)));
        assert_eq!(provider.created().len(), 1);

        held.cleanup().await;
        assert_eq!(slots.available_permits(), 1);
        let again = provisioner.provision("python", &ctx()).await.unwrap();
        again.cleanup().await;
    }
}
