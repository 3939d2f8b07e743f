// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Workload configuration rows and microservice instance records.
//
// Workload configs hold operator-supplied variable values keyed by
// (workload url, version expression); the newest config whose expression
// contains the running version wins. Microservice instances are owned by
// an external lifecycle manager; governance only forwards status updates
// and triggers cleanup through the coordinator trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::agreement::AgreementId;
use crate::domain::events::ServicePin;
use crate::domain::repository::StoreError;
use crate::domain::version::{Version, VersionRange};

/// Variable values for a workload, scoped to a version range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub workload_url: String,
    pub org: String,
    pub version_expression: String,
    pub variables: HashMap<String, String>,
}

#[async_trait]
pub trait WorkloadConfigStore: Send + Sync {
    async fn insert(&self, config: WorkloadConfig) -> Result<(), StoreError>;
    async fn find_for_url(&self, workload_url: &str) -> Result<Vec<WorkloadConfig>, StoreError>;
}

/// The newest config among those whose version expression contains
/// `version`. Malformed expressions are skipped rather than fatal; a bad
/// row must not block a launch.
pub fn select_workload_config(
    mut configs: Vec<WorkloadConfig>,
    version: &str,
) -> Option<WorkloadConfig> {
    let running = Version::parse(version).ok()?;
    configs.retain(|c| {
        VersionRange::parse(&c.version_expression)
            .map(|r| r.includes(&running))
            .unwrap_or(false)
    });
    configs.sort_by(|a, b| {
        let va = lower_bound(&a.version_expression);
        let vb = lower_bound(&b.version_expression);
        va.cmp(&vb)
    });
    configs.pop()
}

fn lower_bound(expression: &str) -> Version {
    let raw = expression
        .trim_start_matches(['[', '('])
        .split(',')
        .next()
        .unwrap_or("0")
        .trim()
        .to_string();
    Version::parse(&raw).unwrap_or_else(|_| Version::parse("0").expect("zero parses"))
}

/// Microservice container failure codes, mirrored from the lifecycle
/// manager's vocabulary.
pub const MS_EXEC_FAILED: u32 = 405;
pub const MS_IMAGE_LOAD_FAILED: u32 = 406;
pub const MS_IMAGE_FETCH_FAILED: u32 = 407;

pub fn decode_microservice_failure(code: u32) -> &'static str {
    match code {
        MS_EXEC_FAILED => "microservice containers failed to execute",
        MS_IMAGE_LOAD_FAILED => "microservice image could not be loaded",
        MS_IMAGE_FETCH_FAILED => "microservice image could not be fetched",
        _ => "unknown microservice failure",
    }
}

/// Point-in-time health of one microservice instance, for device status
/// reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroserviceStatus {
    pub instance_key: String,
    pub spec_url: String,
    pub version: String,
    pub started: bool,
    pub failure_code: u32,
    pub failure_description: String,
}

/// Point-in-time health of one governed workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub agreement_id: AgreementId,
    pub protocol: String,
    pub running: bool,
}

/// The node's health snapshot pushed to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    pub timestamp: u64,
    pub services: Vec<MicroserviceStatus>,
    pub workloads: Vec<WorkloadStatus>,
}

/// The external microservice lifecycle manager, seen through the narrow
/// surface governance needs.
#[async_trait]
pub trait MicroserviceCoordinator: Send + Sync {
    /// Record that an instance's containers started or failed.
    async fn update_execution_state(
        &self,
        instance_key: &str,
        started: bool,
        failure_code: u32,
        failure_description: &str,
    ) -> anyhow::Result<()>;

    /// The instance's containers are gone; archive the record.
    async fn archive_instance(&self, instance_key: &str) -> anyhow::Result<()>;

    /// An agreement ended; stop instances that only it depended on.
    async fn cleanup_for_agreement(&self, agreement_id: &AgreementId) -> anyhow::Result<()>;

    /// Pin a dependent service to a concrete local version inside `range`
    /// and start an instance of it for the agreement. `None` when no local
    /// definition matches.
    async fn resolve_and_start(
        &self,
        org: &str,
        url: &str,
        range: &VersionRange,
        agreement_id: &AgreementId,
        protocol: &str,
    ) -> anyhow::Result<Option<ServicePin>>;

    /// Current instance health, for device status reporting.
    async fn status_snapshot(&self) -> anyhow::Result<Vec<MicroserviceStatus>>;
}
