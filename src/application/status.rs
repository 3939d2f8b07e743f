// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Device status reporting: a snapshot of microservice and workload health
// pushed to the registry whenever container events change the picture.

use std::sync::Arc;
use tracing::error;

use crate::domain::agreement::{now_secs, running, unarchived};
use crate::domain::config::DeviceIdentity;
use crate::domain::protocol::ProtocolRegistry;
use crate::domain::repository::AgreementStore;
use crate::domain::workload::{DeviceStatusReport, MicroserviceCoordinator, WorkloadStatus};
use crate::infrastructure::registry::RegistryClient;

pub struct StatusReporter {
    store: Arc<dyn AgreementStore>,
    microservices: Arc<dyn MicroserviceCoordinator>,
    registry: Arc<ProtocolRegistry>,
    exchange: Arc<dyn RegistryClient>,
    identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
}

impl StatusReporter {
    pub fn new(
        store: Arc<dyn AgreementStore>,
        microservices: Arc<dyn MicroserviceCoordinator>,
        registry: Arc<ProtocolRegistry>,
        exchange: Arc<dyn RegistryClient>,
        identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
    ) -> Self {
        Self {
            store,
            microservices,
            registry,
            exchange,
            identity,
        }
    }

    /// Build and push the current snapshot. Failures are logged; the next
    /// container event will trigger another attempt.
    pub async fn report(&self) {
        let report = match self.snapshot().await {
            Ok(report) => report,
            Err(e) => {
                error!("unable to assemble device status: {}", e);
                return;
            }
        };
        let identity = self.identity.read().await.clone();
        if !identity.is_registered() {
            return;
        }
        if let Err(e) = self.exchange.put_node_status(&identity, &report).await {
            error!("unable to report device status: {}", e);
        }
    }

    async fn snapshot(&self) -> anyhow::Result<DeviceStatusReport> {
        let services = self.microservices.status_snapshot().await?;
        let agreements = self
            .store
            .find_all_protocols(&self.registry.names(), &[unarchived(), running()])
            .await?;
        Ok(DeviceStatusReport {
            timestamp: now_secs(),
            services,
            workloads: agreements
                .into_iter()
                .map(|a| WorkloadStatus {
                    agreement_id: a.id,
                    protocol: a.protocol,
                    running: true,
                })
                .collect(),
        })
    }
}
