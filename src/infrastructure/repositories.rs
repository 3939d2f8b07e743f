// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-memory store implementations, used in development and tests and as
// the reference semantics for the durable stores.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::agreement::{
    matches_all, now_secs, Agreement, AgreementFilter, AgreementId, MeteringNotification,
};
use crate::domain::events::ServicePin;
use crate::domain::repository::{
    apply_transition, AgreementStore, LifecycleTransition, StoreError,
};
use crate::domain::version::VersionRange;
use crate::domain::workload::{
    MicroserviceCoordinator, MicroserviceStatus, WorkloadConfig, WorkloadConfigStore,
};

type Key = (String, String);

fn key(protocol: &str, id: &AgreementId) -> Key {
    (protocol.to_string(), id.as_str().to_string())
}

#[derive(Default)]
pub struct InMemoryAgreementStore {
    rows: Mutex<HashMap<Key, Agreement>>,
}

impl InMemoryAgreementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_row<T>(
        &self,
        protocol: &str,
        id: &AgreementId,
        f: impl FnOnce(&mut Agreement) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        match rows.get_mut(&key(protocol, id)) {
            Some(row) => f(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl AgreementStore for InMemoryAgreementStore {
    async fn insert(&self, agreement: Agreement) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        let k = key(&agreement.protocol, &agreement.id);
        if rows.get(&k).map(|a| !a.archived).unwrap_or(false) {
            return Err(StoreError::Duplicate(agreement.id.to_string()));
        }
        rows.insert(k, agreement);
        Ok(())
    }

    async fn find(
        &self,
        protocol: &str,
        id: &AgreementId,
    ) -> Result<Option<Agreement>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        Ok(rows.get(&key(protocol, id)).cloned())
    }

    async fn find_by_protocol(
        &self,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> Result<Vec<Agreement>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        Ok(rows
            .values()
            .filter(|a| a.protocol == protocol && matches_all(a, filters))
            .cloned()
            .collect())
    }

    async fn find_all_protocols(
        &self,
        protocols: &[String],
        filters: &[AgreementFilter],
    ) -> Result<Vec<Agreement>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        Ok(rows
            .values()
            .filter(|a| protocols.contains(&a.protocol) && matches_all(a, filters))
            .cloned()
            .collect())
    }

    async fn record(
        &self,
        protocol: &str,
        id: &AgreementId,
        transition: LifecycleTransition,
    ) -> Result<Agreement, StoreError> {
        self.with_row(protocol, id, |row| {
            apply_transition(row, &transition, now_secs())?;
            Ok(row.clone())
        })
    }

    async fn record_metering(
        &self,
        protocol: &str,
        id: &AgreementId,
        meter: MeteringNotification,
    ) -> Result<Agreement, StoreError> {
        self.with_row(protocol, id, |row| {
            if row.archived {
                return Err(StoreError::InvalidTransition(format!(
                    "agreement {} is archived",
                    row.id
                )));
            }
            row.metering = meter;
            Ok(row.clone())
        })
    }

    async fn record_deployment(
        &self,
        protocol: &str,
        id: &AgreementId,
        deployment: serde_json::Value,
    ) -> Result<Agreement, StoreError> {
        self.with_row(protocol, id, |row| {
            if row.archived {
                return Err(StoreError::InvalidTransition(format!(
                    "agreement {} is archived",
                    row.id
                )));
            }
            row.deployment = deployment;
            Ok(row.clone())
        })
    }

    async fn archive(&self, protocol: &str, id: &AgreementId) -> Result<Agreement, StoreError> {
        self.with_row(protocol, id, |row| {
            row.archived = true;
            Ok(row.clone())
        })
    }

    async fn delete(&self, protocol: &str, id: &AgreementId) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        rows.remove(&key(protocol, id))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryWorkloadConfigStore {
    configs: Mutex<Vec<WorkloadConfig>>,
}

impl InMemoryWorkloadConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkloadConfigStore for InMemoryWorkloadConfigStore {
    async fn insert(&self, config: WorkloadConfig) -> Result<(), StoreError> {
        self.configs
            .lock()
            .map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?
            .push(config);
        Ok(())
    }

    async fn find_for_url(&self, workload_url: &str) -> Result<Vec<WorkloadConfig>, StoreError> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| StoreError::Database("store mutex poisoned".to_string()))?;
        Ok(configs
            .iter()
            .filter(|c| c.workload_url == workload_url)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    status: MicroserviceStatus,
    agreements: Vec<AgreementId>,
    archived: bool,
}

/// Microservice coordination backed by local records only. The production
/// deployment substitutes the real lifecycle manager; this one is enough
/// for development, tests, and single-binary nodes without shared services.
#[derive(Default)]
pub struct LocalMicroserviceCoordinator {
    instances: Mutex<HashMap<String, InstanceRecord>>,
    /// Local service definitions available for pinning:
    /// (org, url) -> versions.
    definitions: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl LocalMicroserviceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_definition(&self, org: &str, url: &str, version: &str) {
        self.definitions
            .lock()
            .expect("coordinator mutex poisoned")
            .entry((org.to_string(), url.to_string()))
            .or_default()
            .push(version.to_string());
    }
}

#[async_trait]
impl MicroserviceCoordinator for LocalMicroserviceCoordinator {
    async fn update_execution_state(
        &self,
        instance_key: &str,
        started: bool,
        failure_code: u32,
        failure_description: &str,
    ) -> anyhow::Result<()> {
        let mut instances = self.instances.lock().map_err(|_| anyhow::anyhow!("coordinator mutex poisoned"))?;
        let record = instances
            .get_mut(instance_key)
            .ok_or_else(|| anyhow::anyhow!("unknown microservice instance {}", instance_key))?;
        record.status.started = started;
        record.status.failure_code = failure_code;
        record.status.failure_description = failure_description.to_string();
        Ok(())
    }

    async fn archive_instance(&self, instance_key: &str) -> anyhow::Result<()> {
        let mut instances = self.instances.lock().map_err(|_| anyhow::anyhow!("coordinator mutex poisoned"))?;
        if let Some(record) = instances.get_mut(instance_key) {
            record.archived = true;
            record.status.started = false;
        }
        Ok(())
    }

    async fn cleanup_for_agreement(&self, agreement_id: &AgreementId) -> anyhow::Result<()> {
        let mut instances = self.instances.lock().map_err(|_| anyhow::anyhow!("coordinator mutex poisoned"))?;
        for record in instances.values_mut() {
            record.agreements.retain(|a| a != agreement_id);
            if record.agreements.is_empty() {
                record.archived = true;
                record.status.started = false;
            }
        }
        Ok(())
    }

    async fn resolve_and_start(
        &self,
        org: &str,
        url: &str,
        range: &VersionRange,
        agreement_id: &AgreementId,
        _protocol: &str,
    ) -> anyhow::Result<Option<ServicePin>> {
        let definitions = self.definitions.lock().map_err(|_| anyhow::anyhow!("coordinator mutex poisoned"))?;
        let Some(versions) = definitions.get(&(org.to_string(), url.to_string())) else {
            return Ok(None);
        };
        let Some(version) = versions
            .iter()
            .find(|v| range.includes_str(v).unwrap_or(false))
            .cloned()
        else {
            anyhow::bail!(
                "no local definition of {}/{} satisfies version range {}",
                org,
                url,
                range
            );
        };
        drop(definitions);

        let instance_key = uuid::Uuid::new_v4().to_string();
        let def_id = format!("{}/{}_{}", org, url, version);
        let mut instances = self.instances.lock().map_err(|_| anyhow::anyhow!("coordinator mutex poisoned"))?;
        instances.insert(
            instance_key.clone(),
            InstanceRecord {
                status: MicroserviceStatus {
                    instance_key: instance_key.clone(),
                    spec_url: url.to_string(),
                    version: version.clone(),
                    started: false,
                    failure_code: 0,
                    failure_description: String::new(),
                },
                agreements: vec![agreement_id.clone()],
                archived: false,
            },
        );
        Ok(Some(ServicePin {
            org: org.to_string(),
            url: url.to_string(),
            version,
            def_id,
        }))
    }

    async fn status_snapshot(&self) -> anyhow::Result<Vec<MicroserviceStatus>> {
        let instances = self.instances.lock().map_err(|_| anyhow::anyhow!("coordinator mutex poisoned"))?;
        Ok(instances
            .values()
            .filter(|r| !r.archived)
            .map(|r| r.status.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agreement::{unarchived, with_id, LedgerRef};

    fn agreement(id: &str) -> Agreement {
        Agreement::new(
            "Basic",
            AgreementId::new(id),
            "{}",
            "broker",
            LedgerRef::default(),
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_unarchived() {
        let store = InMemoryAgreementStore::new();
        store.insert(agreement("a")).await.unwrap();
        assert!(matches!(
            store.insert(agreement("a")).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn filtered_scans() {
        let store = InMemoryAgreementStore::new();
        store.insert(agreement("a")).await.unwrap();
        store.insert(agreement("b")).await.unwrap();
        store
            .archive("Basic", &AgreementId::new("b"))
            .await
            .unwrap();

        let rows = store
            .find_by_protocol("Basic", &[unarchived()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, AgreementId::new("a"));

        let rows = store
            .find_by_protocol("Basic", &[unarchived(), with_id(AgreementId::new("b"))])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn record_enforces_lifecycle() {
        let store = InMemoryAgreementStore::new();
        store.insert(agreement("a")).await.unwrap();
        let id = AgreementId::new("a");

        store
            .record("Basic", &id, LifecycleTransition::Accepted)
            .await
            .unwrap();
        store
            .record(
                "Basic",
                &id,
                LifecycleTransition::Terminated {
                    reason: 7,
                    description: "test".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(store
            .record("Basic", &id, LifecycleTransition::Finalized)
            .await
            .is_err());

        let row = store.find("Basic", &id).await.unwrap().unwrap();
        assert_eq!(row.terminated_reason, 7);
    }

    #[tokio::test]
    async fn metering_blocked_after_archive() {
        let store = InMemoryAgreementStore::new();
        store.insert(agreement("a")).await.unwrap();
        let id = AgreementId::new("a");
        store.archive("Basic", &id).await.unwrap();
        let meter = MeteringNotification {
            amount: 5,
            ..Default::default()
        };
        assert!(store.record_metering("Basic", &id, meter).await.is_err());
    }

    #[tokio::test]
    async fn find_with_ids_skips_archived_and_unknown() {
        let store = InMemoryAgreementStore::new();
        store.insert(agreement("a")).await.unwrap();
        store.insert(agreement("b")).await.unwrap();
        store
            .archive("Basic", &AgreementId::new("b"))
            .await
            .unwrap();

        let rows = crate::domain::repository::find_with_ids(
            &store,
            &["Basic".to_string()],
            vec![
                AgreementId::new("a"),
                AgreementId::new("b"),
                AgreementId::new("missing"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, AgreementId::new("a"));

        assert!(crate::domain::repository::find_with_ids(
            &store,
            &["Basic".to_string()],
            vec![]
        )
        .await
        .unwrap()
        .is_empty());
    }

    #[tokio::test]
    async fn coordinator_pins_in_range_version() {
        let coordinator = LocalMicroserviceCoordinator::new();
        coordinator.register_definition("org", "gps", "2.0.1");
        let pin = coordinator
            .resolve_and_start(
                "org",
                "gps",
                &VersionRange::parse("[2.0,3.0)").unwrap(),
                &AgreementId::new("ag"),
                "Basic",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pin.version, "2.0.1");

        assert!(coordinator
            .resolve_and_start(
                "org",
                "gps",
                &VersionRange::parse("[3.0,4.0)").unwrap(),
                &AgreementId::new("ag"),
                "Basic",
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn coordinator_cleanup_archives_orphans() {
        let coordinator = LocalMicroserviceCoordinator::new();
        coordinator.register_definition("org", "gps", "1.0.0");
        coordinator
            .resolve_and_start(
                "org",
                "gps",
                &VersionRange::all(),
                &AgreementId::new("ag"),
                "Basic",
            )
            .await
            .unwrap();
        assert_eq!(coordinator.status_snapshot().await.unwrap().len(), 1);
        coordinator
            .cleanup_for_agreement(&AgreementId::new("ag"))
            .await
            .unwrap();
        assert!(coordinator.status_snapshot().await.unwrap().is_empty());
    }
}
