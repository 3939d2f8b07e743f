// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Termination pipeline.
//
// Cancellation is asynchronous end to end: multiple cancels for the same
// agreement can arrive while workloads are still being torn down, so every
// step tolerates running again. The terminated mark lands in the store
// before anything slow starts, making the state visible immediately; the
// protocol-level cancel and the metering write run in detached tasks
// because a ledger write can take the better part of a minute.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::agreement::{Agreement, AgreementId};
use crate::domain::commands::{CleanupStatus, Command};
use crate::domain::config::DeviceIdentity;
use crate::domain::protocol::ProtocolHandler;
use crate::domain::repository::{AgreementStore, LifecycleTransition, StoreError};
use crate::infrastructure::registry::RegistryClient;

pub struct TerminationPipeline {
    store: Arc<dyn AgreementStore>,
    exchange: Arc<dyn RegistryClient>,
    commands: mpsc::Sender<Command>,
    identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
}

impl TerminationPipeline {
    pub fn new(
        store: Arc<dyn AgreementStore>,
        exchange: Arc<dyn RegistryClient>,
        commands: mpsc::Sender<Command>,
        identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
    ) -> Self {
        Self {
            store,
            exchange,
            commands,
            identity,
        }
    }

    /// Drive an agreement from "decided to cancel" through protocol cancel
    /// and metering. Workload teardown and microservice cleanup are the
    /// caller's business; it emits those events alongside this call.
    pub async fn cancel(
        &self,
        protocol: &str,
        agreement_id: &AgreementId,
        reason: u32,
        description: String,
        handler: &Arc<dyn ProtocolHandler>,
    ) {
        let agreement = match self
            .store
            .record(
                protocol,
                agreement_id,
                LifecycleTransition::Terminated {
                    reason,
                    description,
                },
            )
            .await
        {
            Ok(agreement) => agreement,
            Err(StoreError::NotFound(_)) => {
                debug!("cancel of unknown agreement {} ignored", agreement_id);
                return;
            }
            Err(e) => {
                error!("error marking agreement {} terminated: {}", agreement_id, e);
                return;
            }
        };

        info!(
            "terminating agreement {} with reason {}",
            agreement_id, reason
        );

        // Only accepted agreements ever reached the registry.
        if agreement.accepted_time != 0 {
            let identity = self.identity.read().await.clone();
            if let Err(e) = self.exchange.delete_agreement(&identity, agreement_id).await {
                error!(
                    "error deleting agreement {} in the registry: {}",
                    agreement_id, e
                );
            }
        }

        if handler.is_ledger_writable(&agreement) {
            self.external_termination(agreement, reason, handler.clone());
        } else {
            let command = Command::AsyncTermination {
                protocol: protocol.to_string(),
                agreement_id: agreement_id.clone(),
                reason,
            };
            if self.commands.send(command).await.is_err() {
                warn!("command processor is gone; deferred termination dropped");
            }
        }
    }

    /// The slow half of a cancel, detached from the command processor: the
    /// protocol-level cancel (which reports back through Cleanup-Status)
    /// and, independently, the best-effort metering write.
    pub fn external_termination(
        &self,
        agreement: Agreement,
        reason: u32,
        handler: Arc<dyn ProtocolHandler>,
    ) {
        let commands = self.commands.clone();
        let cancel_handler = handler.clone();
        let cancel_row = agreement.clone();
        tokio::spawn(async move {
            if let Err(e) = cancel_handler.terminate_agreement(&cancel_row, reason).await {
                error!(
                    "protocol-level cancel of {} failed: {}",
                    cancel_row.id, e
                );
            }
            let command = Command::CleanupStatus {
                protocol: cancel_row.protocol.clone(),
                agreement_id: cancel_row.id.clone(),
                status: CleanupStatus::ProtocolTerminated,
            };
            if commands.send(command).await.is_err() {
                warn!("command processor is gone; cleanup status dropped");
            }
        });

        // The meter record may complete after the agreement is archived
        // without side effects, so it gets its own task and no retry.
        if agreement.metering.is_set() && !agreement.archived {
            tokio::spawn(async move {
                debug!("writing metering notification for {}", agreement.id);
                if let Err(e) = handler.record_meter(&agreement, &agreement.metering).await {
                    error!(
                        "error writing meter for agreement {} on the ledger: {}",
                        agreement.id, e
                    );
                }
            });
        }
    }
}
