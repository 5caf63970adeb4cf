pub(crate) const DEFAULT_MEMORY_MB: u32 = 50;
pub(crate) const DEFAULT_CPU_PERCENT: u32 = 50;
pub(crate) const DEFAULT_PIDS_LIMIT: u32 = 100;
pub(crate) const DEFAULT_DNS: &str = "8.8.8.8";

/// Network access granted to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// No network interface besides loopback.
    None,
    /// Default bridge networking with name resolution pinned to `servers`.
    RestrictedDns { servers: Vec<String> },
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self::RestrictedDns {
            servers: vec![DEFAULT_DNS.to_string()],
        }
    }
}

/// Limits fixed at creation time. Providers never renegotiate them once the
/// unit has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB. Swap is not granted on top of it.
    pub memory_mb: u32,
    /// Share of one CPU, in percent (50 = half a core).
    pub cpu_percent: u32,
    /// Maximum number of processes inside the unit.
    pub pids_limit: u32,
    pub network: NetworkPolicy,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_percent: DEFAULT_CPU_PERCENT,
            pids_limit: DEFAULT_PIDS_LIMIT,
            network: NetworkPolicy::default(),
        }
    }
}

pub struct UnitConfig {
    pub id: uuid::Uuid,
    pub image: String,
    pub limits: ResourceLimits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_reference_deployment() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_mb, 50);
        assert_eq!(limits.cpu_percent, 50);
        assert_eq!(limits.pids_limit, 100);
        assert_eq!(
            limits.network,
            NetworkPolicy::RestrictedDns {
                servers: vec!["8.8.8.8".to_string()]
            }
        );
    }
}
