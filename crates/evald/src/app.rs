use std::sync::Arc;

use evaluator::{EnvironmentSpec, Evaluator, ImageProvisioner, Registry};
use sandbox::{IsolationProvider, ResourceLimits};
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::EvaldConfig;

/// Build the evaluator for `config` on top of `provider`. All environments
/// draw from one pool of `max_concurrent` slots and spawn their teardowns on
/// one tracker the evaluator drains at shutdown.
pub fn build_evaluator(config: &EvaldConfig, provider: Arc<dyn IsolationProvider>) -> Evaluator {
    let slots = Arc::new(Semaphore::new(config.max_concurrent));
    let options = config.environment_options();
    let mut registry = Registry::new();

    for (name, env) in &config.environments {
        let spec = EnvironmentSpec {
            image: env.image.clone(),
            limits: ResourceLimits::from(&env.limits),
        };
        let provisioner =
            ImageProvisioner::new(spec, Arc::clone(&provider), options.clone())
                .with_capacity(Arc::clone(&slots));
        registry.register(name.clone(), Arc::new(provisioner));
        for alias in &env.aliases {
            registry.alias(alias.clone(), name);
        }
    }

    info!(
        provider = provider.name(),
        environments = ?registry.names(),
        max_concurrent = config.max_concurrent,
        "registry ready"
    );
    Evaluator::new(registry)
        .with_ceiling(config.request_timeout())
        .with_teardowns(options.teardowns)
}
