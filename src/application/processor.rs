// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// The command processor: sole writer to the agreement store.
//
// One task pulls commands off the queue and dispatches them one at a time,
// which is what makes per-agreement state transitions linearizable. A
// failure handling one command is logged and the next command runs; one
// poisoned agreement never halts the node. Slow ledger work never runs
// here; it is pushed into detached tasks by the termination pipeline.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::launch::LaunchService;
use crate::application::status::StatusReporter;
use crate::application::termination::TerminationPipeline;
use crate::domain::agreement::{now_secs, Agreement, AgreementId};
use crate::domain::commands::{CleanupStatus, Command};
use crate::domain::config::{AgentConfig, DeviceIdentity};
use crate::domain::events::{CollaboratorEvent, InboundMessage};
use crate::domain::protocol::{
    extract_protocol, ProtocolHandler, ProtocolRegistry, TerminationReason,
};
use crate::domain::repository::{AgreementStore, LifecycleTransition};
use crate::domain::workload::MicroserviceCoordinator;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::registry::RegistryClient;

pub struct CommandProcessor {
    config: Arc<AgentConfig>,
    store: Arc<dyn AgreementStore>,
    registry: Arc<ProtocolRegistry>,
    exchange: Arc<dyn RegistryClient>,
    microservices: Arc<dyn MicroserviceCoordinator>,
    bus: EventBus,
    launch: LaunchService,
    termination: TerminationPipeline,
    status: StatusReporter,
    commands: mpsc::Sender<Command>,
    identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
    shutdown: watch::Sender<bool>,
    /// Handles of the governance loops, awaited during shutdown.
    loop_handles: Vec<JoinHandle<()>>,
    /// Commands waiting for a ledger to become writable.
    deferred: Vec<Command>,
}

impl CommandProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<dyn AgreementStore>,
        registry: Arc<ProtocolRegistry>,
        exchange: Arc<dyn RegistryClient>,
        microservices: Arc<dyn MicroserviceCoordinator>,
        bus: EventBus,
        launch: LaunchService,
        termination: TerminationPipeline,
        status: StatusReporter,
        commands: mpsc::Sender<Command>,
        identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
        shutdown: watch::Sender<bool>,
        loop_handles: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            exchange,
            microservices,
            bus,
            launch,
            termination,
            status,
            commands,
            identity,
            shutdown,
            loop_handles,
            deferred: Vec::new(),
        }
    }

    pub async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        while let Some(command) = receiver.recv().await {
            debug!("processing command {}", command.tag());
            if !self.handle(command).await {
                break;
            }
        }
        info!("command processor terminated");
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Handle one command. Returns false when the processor should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::StartGovernExecution {
                protocol,
                agreement_id,
                deployment,
            } => {
                info!("starting governance of agreement {}", agreement_id);
                match self
                    .store
                    .record(&protocol, &agreement_id, LifecycleTransition::ExecutionStarted)
                    .await
                {
                    Ok(_) => {
                        if !deployment.is_null() {
                            if let Err(e) = self
                                .store
                                .record_deployment(&protocol, &agreement_id, deployment)
                                .await
                            {
                                error!(
                                    "failed to record deployment for {}: {}",
                                    agreement_id, e
                                );
                            }
                        }
                    }
                    Err(e) => error!(
                        "failed to mark execution started for {}: {}",
                        agreement_id, e
                    ),
                }
            }

            Command::CleanupExecution {
                protocol,
                agreement_id,
                reason,
                deployment,
            } => {
                let Some(handler) = self.handler_or_warn(&protocol) else {
                    return true;
                };
                match self.find_unarchived(&protocol, &agreement_id).await {
                    None => debug!(
                        "ignoring cleanup for unknown agreement {}",
                        agreement_id
                    ),
                    Some(agreement)
                        if agreement.is_terminating()
                            && agreement.force_terminated_time == 0 =>
                    {
                        debug!("agreement {} is already terminating", agreement_id)
                    }
                    Some(agreement) => {
                        info!("ending agreement {}", agreement_id);
                        let deployment = if deployment.is_null() {
                            agreement.deployment.clone()
                        } else {
                            deployment
                        };
                        self.cancel_agreement(&agreement, reason, &handler).await;
                        self.bus.publish(CollaboratorEvent::WorkloadCancel {
                            protocol,
                            agreement_id,
                            deployment,
                        });
                    }
                }
            }

            Command::CleanupStatus {
                protocol,
                agreement_id,
                status,
            } => self.handle_cleanup_status(&protocol, &agreement_id, status).await,

            Command::ExchangeMessage { message } => {
                self.handle_exchange_message(message).await
            }

            Command::LedgerEvent { event } => {
                let handlers: Vec<_> = self
                    .registry
                    .iter()
                    .map(|(name, handler)| (name.clone(), handler.clone()))
                    .collect();
                for (protocol, handler) in handlers {
                    if !handler.accepts_ledger_event(&event) {
                        continue;
                    }
                    let outcome = match handler.handle_ledger_event(&event).await {
                        Ok(Some(outcome)) => outcome,
                        Ok(None) => continue,
                        Err(e) => {
                            error!("error handling ledger event: {}", e);
                            continue;
                        }
                    };
                    let Some(agreement) =
                        self.find_unarchived(&protocol, &outcome.agreement_id).await
                    else {
                        debug!("ledger event is not about one of our agreements");
                        continue;
                    };
                    if agreement.is_terminating() {
                        debug!("agreement {} is already terminating", agreement.id);
                        continue;
                    }
                    if outcome.terminated {
                        info!(
                            "terminating agreement {}: cancelled on the ledger",
                            agreement.id
                        );
                        self.cancel_agreement(&agreement, outcome.reason, &handler)
                            .await;
                        self.bus.publish(CollaboratorEvent::WorkloadCancel {
                            protocol: agreement.protocol.clone(),
                            agreement_id: agreement.id.clone(),
                            deployment: agreement.deployment.clone(),
                        });
                    } else if outcome.created {
                        if let Err(e) = self.launch.finalize(&agreement, &handler).await {
                            error!("error finalizing agreement {}: {}", agreement.id, e);
                        }
                    }
                }
            }

            Command::AsyncTermination {
                protocol,
                agreement_id,
                reason,
            } => {
                let Some(handler) = self.handler_or_warn(&protocol) else {
                    return true;
                };
                match self.store.find(&protocol, &agreement_id).await {
                    Err(e) => error!("unable to retrieve agreement {}: {}", agreement_id, e),
                    Ok(None) => debug!("ignoring termination for unknown agreement"),
                    Ok(Some(agreement)) => {
                        if handler.is_ledger_writable(&agreement) {
                            info!(
                                "running deferred termination of {} reason {}",
                                agreement_id, reason
                            );
                            self.termination
                                .external_termination(agreement, reason, handler);
                        } else {
                            self.deferred.push(Command::AsyncTermination {
                                protocol,
                                agreement_id,
                                reason,
                            });
                        }
                    }
                }
            }

            Command::LedgerClientInitialized { ledger } => {
                for (_, handler) in self.registry.iter() {
                    handler.set_ledger_client_available(&ledger);
                }
            }

            Command::LedgerClientStopping { ledger } => {
                for (_, handler) in self.registry.iter() {
                    handler.set_ledger_client_stopped(&ledger);
                }
            }

            Command::LedgerWritable { ledger } => {
                let handlers: Vec<_> =
                    self.registry.iter().map(|(_, h)| h.clone()).collect();
                for handler in handlers {
                    handler.set_ledger_writable(&ledger);
                    handler.update_consumers().await;
                }
            }

            Command::UpdateMicroservice {
                instance_key,
                started,
                failure_code,
                failure_description,
            } => {
                let result = if !started && failure_code == 0 {
                    // Containers destroyed as part of cleanup.
                    self.microservices.archive_instance(&instance_key).await
                } else {
                    self.microservices
                        .update_execution_state(
                            &instance_key,
                            started,
                            failure_code,
                            &failure_description,
                        )
                        .await
                };
                if let Err(e) = result {
                    error!(
                        "error updating microservice instance {}: {}",
                        instance_key, e
                    );
                }
            }

            Command::ReportDeviceStatus => self.status.report().await,

            Command::GovernAgreements => {
                if !self.is_shutting_down() {
                    for command in std::mem::take(&mut self.deferred) {
                        if self.commands.send(command).await.is_err() {
                            return true;
                        }
                    }
                    self.govern_agreements().await;
                }
            }

            Command::NodeShutdown => {
                info!("node shutdown requested; draining governance loops");
                let _ = self.shutdown.send(true);
                let handles = std::mem::take(&mut self.loop_handles);
                let bus = self.bus.clone();
                // In-flight commands and detached terminations finish on
                // their own; unconfiguration starts once the loops confirm.
                tokio::spawn(async move {
                    for handle in handles {
                        let _ = handle.await;
                    }
                    debug!("governance loops drained");
                    bus.publish(CollaboratorEvent::UnconfigureNode);
                });
            }

            Command::NodeShutdownComplete => {
                if self.commands.send(Command::Terminate).await.is_err() {
                    return false;
                }
            }

            Command::Terminate => return false,
        }
        true
    }

    fn handler_or_warn(&self, protocol: &str) -> Option<Arc<dyn ProtocolHandler>> {
        let handler = self.registry.get(protocol);
        if handler.is_none() {
            warn!("no handler for protocol {}; dropping", protocol);
        }
        handler
    }

    async fn find_unarchived(
        &self,
        protocol: &str,
        agreement_id: &AgreementId,
    ) -> Option<Agreement> {
        match self.store.find(protocol, agreement_id).await {
            Ok(Some(agreement)) if !agreement.archived => Some(agreement),
            Ok(_) => None,
            Err(e) => {
                error!("unable to retrieve agreement {}: {}", agreement_id, e);
                None
            }
        }
    }

    /// Cancel + microservice cleanup; the workload-cancel event is the
    /// caller's, since the deployment context differs per entry point.
    async fn cancel_agreement(
        &self,
        agreement: &Agreement,
        reason: u32,
        handler: &Arc<dyn ProtocolHandler>,
    ) {
        let description = handler.termination_reason(reason);
        self.termination
            .cancel(
                &agreement.protocol,
                &agreement.id,
                reason,
                description,
                handler,
            )
            .await;
        if let Err(e) = self.microservices.cleanup_for_agreement(&agreement.id).await {
            error!(
                "error cleaning up microservices for {}: {}",
                agreement.id, e
            );
        }
    }

    async fn handle_cleanup_status(
        &self,
        protocol: &str,
        agreement_id: &AgreementId,
        status: CleanupStatus,
    ) {
        let Some(agreement) = self.find_unarchived(protocol, agreement_id).await else {
            debug!("ignoring cleanup status for unknown agreement");
            return;
        };

        // Never accepted means the row is the only place this agreement
        // exists; deleting beats archiving a contract that never was.
        if agreement.accepted_time == 0 {
            if let Err(e) = self.store.delete(protocol, agreement_id).await {
                error!("unable to delete record for {}: {}", agreement_id, e);
            }
            return;
        }

        let transition = match status {
            CleanupStatus::WorkloadDestroyed => LifecycleTransition::WorkloadTerminated,
            CleanupStatus::ProtocolTerminated => LifecycleTransition::ProtocolTerminated,
        };
        match self.store.record(protocol, agreement_id, transition).await {
            Err(e) => error!(
                "error marking cleanup progress for {}: {}",
                agreement_id, e
            ),
            Ok(updated) if updated.cleanup_complete() => {
                debug!("archiving agreement {}", agreement_id);
                if let Err(e) = self.store.archive(protocol, agreement_id).await {
                    error!("error archiving agreement {}: {}", agreement_id, e);
                }
            }
            Ok(_) => {}
        }
    }

    async fn handle_exchange_message(&mut self, message: InboundMessage) {
        // Drop anything already deleted from the inbox; a replay after
        // delete must not re-run its handler.
        let identity = self.identity.read().await.clone();
        match self.exchange.list_messages(&identity).await {
            Err(e) => {
                error!("unable to read the registry inbox: {}", e);
                return;
            }
            Ok(messages) => {
                if !messages.iter().any(|m| m.msg_id == message.msg_id) {
                    debug!(
                        "ignoring message {}, already deleted from the inbox",
                        message.msg_id
                    );
                    return;
                }
            }
        }

        let raw = message.protocol_message.clone();
        let mut delete = true;
        match extract_protocol(&raw) {
            None => warn!("message {} names no protocol; deleting", message.msg_id),
            Some(protocol) => match self.registry.get(&protocol) {
                None => info!(
                    "no handler for protocol {}; deleting message {}",
                    protocol, message.msg_id
                ),
                Some(handler) => {
                    delete = self
                        .dispatch_protocol_message(&protocol, &handler, &raw, &message)
                        .await;
                }
            },
        }

        if delete {
            let identity = self.identity.read().await.clone();
            if let Err(e) = self.exchange.delete_message(&identity, message.msg_id).await {
                error!("error deleting message {}: {}", message.msg_id, e);
            }
        }
    }

    /// Try the validators in order; the first one that recognizes the
    /// message handles it. Returns whether to delete the message from the
    /// inbox (handled, or terminally rejected).
    async fn dispatch_protocol_message(
        &mut self,
        protocol: &str,
        handler: &Arc<dyn ProtocolHandler>,
        raw: &str,
        message: &InboundMessage,
    ) -> bool {
        if let Some(ack) = handler.validate_reply_ack(raw) {
            return self.handle_reply_ack(protocol, handler, ack).await;
        }
        if let Some(received) = handler.validate_data_received(raw) {
            return self
                .handle_data_received(protocol, handler, received, message)
                .await;
        }
        if let Some(reading) = handler.validate_meter_notification(raw) {
            return self.handle_meter_notification(protocol, reading).await;
        }
        if let Some(cancel) = handler.validate_cancel(raw) {
            return self.handle_cancel(protocol, handler, cancel, message).await;
        }

        match handler.handle_extension_message(raw, message).await {
            Err(e) => {
                error!("error handling extension message: {}", e);
                false
            }
            Ok(outcome) => {
                if outcome.cancel {
                    if let Some(agreement_id) = &outcome.agreement_id {
                        if let Some(agreement) =
                            self.find_unarchived(protocol, agreement_id).await
                        {
                            let reason =
                                handler.termination_code(TerminationReason::ConsumerRequested);
                            self.cancel_agreement(&agreement, reason, handler).await;
                            self.bus.publish(CollaboratorEvent::WorkloadCancel {
                                protocol: agreement.protocol.clone(),
                                agreement_id: agreement.id.clone(),
                                deployment: agreement.deployment.clone(),
                            });
                        }
                    }
                }
                if !outcome.handled {
                    debug!("message {} matched no validator; deleting", message.msg_id);
                }
                true
            }
        }
    }

    async fn handle_reply_ack(
        &mut self,
        protocol: &str,
        handler: &Arc<dyn ProtocolHandler>,
        ack: crate::domain::protocol::ReplyAck,
    ) -> bool {
        let Some(agreement) = self.find_unarchived(protocol, &ack.agreement_id).await else {
            warn!("reply-ack for unknown agreement {}", ack.agreement_id);
            return true;
        };

        if !ack.still_valid {
            // The broker backed out; cancel our side.
            self.bus.publish(CollaboratorEvent::WorkloadCancel {
                protocol: agreement.protocol.clone(),
                agreement_id: agreement.id.clone(),
                deployment: agreement.deployment.clone(),
            });
            let reason = handler.termination_code(TerminationReason::ConsumerRequested);
            self.cancel_agreement(&agreement, reason, handler).await;
            return true;
        }

        if agreement.accepted_time != 0 || agreement.is_terminating() {
            debug!(
                "ignoring reply-ack for {}: already acknowledged or cancelling",
                ack.agreement_id
            );
            return true;
        }

        let proposal = match handler.demarshal_proposal(&agreement.proposal) {
            Ok(proposal) => proposal,
            Err(e) => {
                error!(
                    "unable to demarshal proposal for {}: {}",
                    ack.agreement_id, e
                );
                return false;
            }
        };
        match self.launch.record_reply(&proposal, protocol).await {
            Ok(_) => true,
            Err(e) => {
                error!("unable to record reply for {}: {}", ack.agreement_id, e);
                false
            }
        }
    }

    async fn handle_data_received(
        &self,
        protocol: &str,
        handler: &Arc<dyn ProtocolHandler>,
        received: crate::domain::protocol::DataReceived,
        message: &InboundMessage,
    ) -> bool {
        let Some(agreement) = self.find_unarchived(protocol, &received.agreement_id).await
        else {
            warn!(
                "data-received for unknown agreement {}",
                received.agreement_id
            );
            return true;
        };
        if let Err(e) = self
            .store
            .record(protocol, &agreement.id, LifecycleTransition::DataReceived)
            .await
        {
            error!(
                "unable to update data received time for {}: {}",
                agreement.id, e
            );
            return false;
        }
        if let Err(e) = handler.notify_data_receipt(&agreement, message).await {
            error!(
                "unable to send data received ack for {}: {}",
                agreement.id, e
            );
            return false;
        }
        true
    }

    async fn handle_meter_notification(
        &self,
        protocol: &str,
        reading: crate::domain::protocol::MeterReading,
    ) -> bool {
        let Some(agreement) = self.find_unarchived(protocol, &reading.agreement_id).await
        else {
            warn!(
                "meter notification for unknown agreement {}",
                reading.agreement_id
            );
            return true;
        };
        if agreement.is_terminating() {
            debug!(
                "ignoring metering notification, agreement {} is terminating",
                agreement.id
            );
            return true;
        }
        if let Err(e) = self
            .store
            .record_metering(protocol, &agreement.id, reading.meter)
            .await
        {
            error!(
                "unable to update metering notification for {}: {}",
                agreement.id, e
            );
        }
        true
    }

    async fn handle_cancel(
        &mut self,
        protocol: &str,
        handler: &Arc<dyn ProtocolHandler>,
        cancel: crate::domain::protocol::CancelRequest,
        message: &InboundMessage,
    ) -> bool {
        let Some(agreement) = self.find_unarchived(protocol, &cancel.agreement_id).await
        else {
            warn!("cancel for unknown agreement {}", cancel.agreement_id);
            return true;
        };
        // Only the consumer that holds the agreement may cancel it.
        if message.broker_id != agreement.consumer_id {
            warn!(
                "cancel ignored: message for {} came from {} but agreement is with {}",
                cancel.agreement_id, message.broker_id, agreement.consumer_id
            );
            return true;
        }
        if agreement.is_terminating() {
            debug!("ignoring cancel, agreement {} is terminating", agreement.id);
            return true;
        }
        self.cancel_agreement(&agreement, cancel.reason, handler).await;
        self.bus.publish(CollaboratorEvent::WorkloadCancel {
            protocol: agreement.protocol.clone(),
            agreement_id: agreement.id.clone(),
            deployment: agreement.deployment.clone(),
        });
        true
    }

    /// The agreement governor's scan: finalization polling and the two
    /// timeout rules.
    async fn govern_agreements(&mut self) {
        debug!("governing pending agreements");
        let agreements = match self
            .store
            .find_all_protocols(
                &self.registry.names(),
                &[
                    crate::domain::agreement::unarchived(),
                    crate::domain::agreement::not_yet_final(),
                ],
            )
            .await
        {
            Ok(agreements) => agreements,
            Err(e) => {
                error!("unable to retrieve pending agreements: {}", e);
                return;
            }
        };

        for agreement in agreements {
            let Some(handler) = self.registry.get(&agreement.protocol) else {
                continue;
            };
            let ledger = handler.known_ledger(&agreement);
            let now = now_secs();

            if agreement.finalized_time == 0 {
                let client_up = handler.is_ledger_client_available(&ledger);

                // Make sure the consumer has our ledger parameters.
                if client_up {
                    handler.update_consumer(&agreement).await;
                }

                // The node may have been down and missed events; poll the
                // witness directly when we can.
                if client_up && handler.is_agreement_verifiable(&agreement) {
                    match handler.verify_agreement(&agreement).await {
                        Err(e) => {
                            error!("error verifying agreement {}: {}", agreement.id, e)
                        }
                        Ok(true) => {
                            match self.launch.finalize(&agreement, &handler).await {
                                Ok(()) => continue,
                                Err(e) => error!(
                                    "error finalizing agreement {}: {}",
                                    agreement.id, e
                                ),
                            }
                        }
                        Ok(false) => {}
                    }
                }

                if agreement.creation_time + self.config.agreement_timeout_s < now {
                    info!("agreement {} timed out before finalization", agreement.id);
                    let tag = if agreement.accepted_time == 0 {
                        TerminationReason::NoReplyAck
                    } else {
                        TerminationReason::NotFinalizedTimeout
                    };
                    let reason = handler.termination_code(tag);
                    self.cancel_agreement(&agreement, reason, &handler).await;
                    self.bus.publish(CollaboratorEvent::WorkloadCancel {
                        protocol: agreement.protocol.clone(),
                        agreement_id: agreement.id.clone(),
                        deployment: agreement.deployment.clone(),
                    });
                }
            } else if agreement.execution_started_time == 0
                && agreement.accepted_time + self.config.prelaunch_timeout_s < now
            {
                // Finalized but never launched; usually a workload failure.
                info!(
                    "terminating agreement {}: not launched within the allowed time",
                    agreement.id
                );
                let reason = handler.termination_code(TerminationReason::NotExecutedTimeout);
                self.cancel_agreement(&agreement, reason, &handler).await;
                self.bus.publish(CollaboratorEvent::WorkloadCancel {
                    protocol: agreement.protocol.clone(),
                    agreement_id: agreement.id.clone(),
                    deployment: agreement.deployment.clone(),
                });
            }
        }
    }
}
