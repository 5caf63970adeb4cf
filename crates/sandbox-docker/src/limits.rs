use std::collections::HashMap;

use bollard::container::Config;
use bollard::models::HostConfig;
use sandbox::{NetworkPolicy, ResourceLimits, UnitConfig};

pub(crate) const NAME_PREFIX: &str = "sandbox-eval-";
/// Label set on every container this provider creates, for out-of-band reaping.
pub(crate) const MANAGED_LABEL: &str = "sandbox-eval.managed";
pub(crate) const UNIT_LABEL: &str = "sandbox-eval.unit";

/// CFS scheduling period; the quota is expressed as a share of it.
const CPU_PERIOD_US: i64 = 100_000;
const MIB: i64 = 1024 * 1024;

pub(crate) fn container_name(id: &uuid::Uuid) -> String {
    format!("{NAME_PREFIX}{id}")
}

pub(crate) fn host_config(limits: &ResourceLimits) -> HostConfig {
    let memory = i64::from(limits.memory_mb) * MIB;
    let (network_mode, dns) = match &limits.network {
        NetworkPolicy::None => (Some("none".to_string()), None),
        NetworkPolicy::RestrictedDns { servers } => (None, Some(servers.clone())),
    };

    HostConfig {
        memory: Some(memory),
        // Equal to memory: no swap on top of the ceiling.
        memory_swap: Some(memory),
        cpu_period: Some(CPU_PERIOD_US),
        cpu_quota: Some(CPU_PERIOD_US * i64::from(limits.cpu_percent) / 100),
        pids_limit: Some(i64::from(limits.pids_limit)),
        network_mode,
        dns,
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    }
}

/// Container definition for one unit: stdin held open until the single
/// attached client closes it, no TTY so stdout and stderr stay separate.
pub(crate) fn container_config(config: &UnitConfig) -> Config<String> {
    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (UNIT_LABEL.to_string(), config.id.to_string()),
    ]);

    Config {
        image: Some(config.image.clone()),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        network_disabled: Some(matches!(config.limits.network, NetworkPolicy::None)),
        labels: Some(labels),
        host_config: Some(host_config(&config.limits)),
        ..Default::default()
    }
}
