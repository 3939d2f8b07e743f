// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

/// The max time a proposed agreement may sit unfinalized before the
/// governor cancels it, unless configuration overrides it.
pub const MAX_AGREEMENT_UNCONFIGURED_TIME_M: u64 = 20;

/// The max time between acceptance and workload launch.
pub const MAX_AGREEMENT_PRELAUNCH_TIME_M: u64 = 10;

/// The max time a metered workload may run unpaid.
pub const MAX_MICROPAYMENT_UNPAID_RUN_DURATION_M: u64 = 60;

/// Enforced only after the workloads are running.
pub const MAX_AGREEMENT_ACCEPTANCE_WAIT_TIME_M: u64 = 20;

fn default_env_prefix() -> String {
    "AEGIS_".to_string()
}
fn default_agreement_timeout_s() -> u64 {
    MAX_AGREEMENT_UNCONFIGURED_TIME_M * 60
}
fn default_prelaunch_timeout_s() -> u64 {
    MAX_AGREEMENT_PRELAUNCH_TIME_M * 60
}
fn default_agreement_governor_interval_s() -> u64 {
    10
}
fn default_container_governor_interval_s() -> u64 {
    60
}
fn default_ledger_reporter_interval_s() -> u64 {
    60
}
fn default_registry_retry_delay_s() -> u64 {
    10
}

/// Governance configuration. Everything has a sensible default so an empty
/// document configures a working node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the registry/exchange, with trailing slash.
    pub registry_url: String,

    /// Prefix for every environment variable handed to a workload.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    #[serde(default = "default_agreement_timeout_s")]
    pub agreement_timeout_s: u64,

    #[serde(default = "default_prelaunch_timeout_s")]
    pub prelaunch_timeout_s: u64,

    #[serde(default = "default_agreement_governor_interval_s")]
    pub agreement_governor_interval_s: u64,

    #[serde(default = "default_container_governor_interval_s")]
    pub container_governor_interval_s: u64,

    #[serde(default = "default_ledger_reporter_interval_s")]
    pub ledger_reporter_interval_s: u64,

    /// Backoff between retries of transport failures talking to the
    /// registry.
    #[serde(default = "default_registry_retry_delay_s")]
    pub registry_retry_delay_s: u64,
}

impl AgentConfig {
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into(),
            env_prefix: default_env_prefix(),
            agreement_timeout_s: default_agreement_timeout_s(),
            prelaunch_timeout_s: default_prelaunch_timeout_s(),
            agreement_governor_interval_s: default_agreement_governor_interval_s(),
            container_governor_interval_s: default_container_governor_interval_s(),
            ledger_reporter_interval_s: default_ledger_reporter_interval_s(),
            registry_retry_delay_s: default_registry_retry_delay_s(),
        }
    }
}

/// Who this node is to the registry. Updated once registration completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub org: String,
    pub device_id: String,
    pub token: String,
    /// Pattern the node registered with, empty for policy-managed nodes.
    pub pattern: String,
}

impl DeviceIdentity {
    pub fn is_registered(&self) -> bool {
        !self.token.is_empty()
    }

    /// `org/id`, the qualified form registry paths use.
    pub fn qualified_id(&self) -> String {
        format!("{}/{}", self.org, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gets_defaults() {
        let cfg: AgentConfig =
            serde_json::from_str(r#"{"registry_url":"https://registry.example/v1/"}"#).unwrap();
        assert_eq!(cfg.agreement_timeout_s, 1200);
        assert_eq!(cfg.prelaunch_timeout_s, 600);
        assert_eq!(cfg.agreement_governor_interval_s, 10);
        assert_eq!(cfg.registry_retry_delay_s, 10);
        assert_eq!(cfg.env_prefix, "AEGIS_");
    }

    #[test]
    fn identity_qualification() {
        let id = DeviceIdentity {
            org: "myorg".to_string(),
            device_id: "node-1".to_string(),
            token: "t".to_string(),
            pattern: String::new(),
        };
        assert!(id.is_registered());
        assert_eq!(id.qualified_id(), "myorg/node-1");
    }
}
