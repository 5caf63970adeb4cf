use std::time::Duration;

use async_trait::async_trait;

use crate::attach::Attachment;
use crate::config::UnitConfig;
use crate::error::Result;
use crate::handle::UnitHandle;

/// Backend that hands out isolated, resource-bounded execution units.
///
/// Implementations are shared process-wide (`Arc<dyn IsolationProvider>`);
/// callers own only the handles they receive from `create`.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Human-readable backend name (e.g. "docker").
    fn name(&self) -> &str;
    /// Create a unit with the given image and limits. The unit is not running yet.
    async fn create(&self, config: &UnitConfig) -> Result<UnitHandle>;
    async fn start(&self, handle: &UnitHandle) -> Result<()>;
    /// Open the unit's stdin and combined output channel. Called once per run.
    async fn attach(&self, handle: &UnitHandle) -> Result<Attachment>;
    /// Stop the unit, allowing it `grace` to exit before it is killed, and
    /// release whatever the provider holds for it.
    async fn stop(&self, handle: &UnitHandle, grace: Duration) -> Result<()>;
}
