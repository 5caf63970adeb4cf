use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Far-future fallback for deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline and cancellation carried by one request.
///
/// Every step of provisioning and running waits on [`RequestContext::done`]
/// alongside its own work, so nothing outlives the request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self::with_deadline(deadline)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context that ends no later than `ceiling` from now. Cancelling
    /// the parent cancels the derived context; never the other way around.
    pub fn bounded(&self, ceiling: Duration) -> Self {
        let capped = Self::with_timeout(ceiling).deadline;
        Self {
            deadline: self.deadline.min(capped),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves once the deadline passes or the context is cancelled.
    pub async fn done(&self) {
        tokio::select! {
            () = tokio::time::sleep_until(self.deadline) => {}
            () = self.cancel.cancelled() => {}
        }
    }
}
