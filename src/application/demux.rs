// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event demultiplexer: the single ordered feed from every external
// collaborator, translated into commands for the processor. Each event
// yields its domain command plus, for the workload and container events,
// a trailing report-device-status command. No agreement state is read
// here; the registry is only consulted for termination code tables.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::commands::{CleanupStatus, Command};
use crate::domain::config::DeviceIdentity;
use crate::domain::events::{AgentEvent, FetchTarget, ImageFetchFailure};
use crate::domain::protocol::{ProtocolRegistry, TerminationReason};
use crate::domain::workload::{
    decode_microservice_failure, MS_EXEC_FAILED, MS_IMAGE_FETCH_FAILED, MS_IMAGE_LOAD_FAILED,
};

pub struct EventDemux {
    commands: mpsc::Sender<Command>,
    registry: Arc<ProtocolRegistry>,
    identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
}

impl EventDemux {
    pub fn new(
        commands: mpsc::Sender<Command>,
        registry: Arc<ProtocolRegistry>,
        identity: Arc<tokio::sync::RwLock<DeviceIdentity>>,
    ) -> Self {
        Self {
            commands,
            registry,
            identity,
        }
    }

    pub async fn handle(&self, event: AgentEvent) {
        // Registration is the one event that updates shared state instead
        // of producing a command: the identity must be visible to every
        // component before the next registry call.
        if let AgentEvent::RegistrationComplete {
            org,
            device_id,
            token,
            pattern,
        } = &event
        {
            let mut identity = self.identity.write().await;
            identity.org = org.clone();
            identity.device_id = device_id.clone();
            identity.token = token.clone();
            identity.pattern = pattern.clone();
            debug!("registered as {}", identity.qualified_id());
            return;
        }

        for command in self.commands_for(event) {
            if self.commands.send(command).await.is_err() {
                warn!("command processor is gone; dropping event-derived command");
                return;
            }
        }
    }

    fn termination_code(&self, protocol: &str, reason: TerminationReason) -> Option<u32> {
        match self.registry.get(protocol) {
            Some(handler) => Some(handler.termination_code(reason)),
            None => {
                warn!("dropping event for unknown protocol {}", protocol);
                None
            }
        }
    }

    fn commands_for(&self, event: AgentEvent) -> Vec<Command> {
        match event {
            AgentEvent::RegistrationComplete { .. } => Vec::new(),

            AgentEvent::WorkloadExecutionBegun {
                protocol,
                agreement_id,
                deployment,
            } => vec![
                Command::StartGovernExecution {
                    protocol,
                    agreement_id,
                    deployment,
                },
                Command::ReportDeviceStatus,
            ],

            AgentEvent::WorkloadExecutionFailed {
                protocol,
                agreement_id,
                deployment,
            } => {
                let Some(reason) =
                    self.termination_code(&protocol, TerminationReason::ContainerFailure)
                else {
                    return Vec::new();
                };
                vec![
                    Command::CleanupExecution {
                        protocol,
                        agreement_id,
                        reason,
                        deployment,
                    },
                    Command::ReportDeviceStatus,
                ]
            }

            AgentEvent::WorkloadImageLoadFailed {
                protocol,
                agreement_id,
                deployment,
            } => {
                let Some(reason) =
                    self.termination_code(&protocol, TerminationReason::ImageLoadFailure)
                else {
                    return Vec::new();
                };
                vec![
                    Command::CleanupExecution {
                        protocol,
                        agreement_id,
                        reason,
                        deployment,
                    },
                    Command::ReportDeviceStatus,
                ]
            }

            AgentEvent::WorkloadDestroyed {
                protocol,
                agreement_id,
            } => vec![
                Command::CleanupStatus {
                    protocol,
                    agreement_id,
                    status: CleanupStatus::WorkloadDestroyed,
                },
                Command::ReportDeviceStatus,
            ],

            AgentEvent::ImageFetchFailed { target, failure } => match target {
                FetchTarget::Agreement {
                    protocol,
                    agreement_id,
                } => {
                    let reason_tag = match failure {
                        ImageFetchFailure::DataError => TerminationReason::ImageDataError,
                        ImageFetchFailure::FetchError => TerminationReason::ImageFetchFailure,
                        ImageFetchFailure::AuthError => {
                            TerminationReason::ImageFetchAuthFailure
                        }
                        ImageFetchFailure::SignatureError => {
                            TerminationReason::ImageSigVerifFailure
                        }
                    };
                    let Some(reason) = self.termination_code(&protocol, reason_tag) else {
                        return Vec::new();
                    };
                    vec![Command::CleanupExecution {
                        protocol,
                        agreement_id,
                        reason,
                        deployment: serde_json::Value::Null,
                    }]
                }
                FetchTarget::Microservice { instance_key } => vec![Command::UpdateMicroservice {
                    instance_key,
                    started: false,
                    failure_code: MS_IMAGE_FETCH_FAILED,
                    failure_description: decode_microservice_failure(MS_IMAGE_FETCH_FAILED)
                        .to_string(),
                }],
            },

            AgentEvent::ContainerLaunchBegun { instance_key } => vec![
                Command::UpdateMicroservice {
                    instance_key,
                    started: true,
                    failure_code: 0,
                    failure_description: String::new(),
                },
                Command::ReportDeviceStatus,
            ],

            AgentEvent::ContainerLaunchFailed { instance_key } => vec![
                Command::UpdateMicroservice {
                    instance_key,
                    started: false,
                    failure_code: MS_EXEC_FAILED,
                    failure_description: decode_microservice_failure(MS_EXEC_FAILED).to_string(),
                },
                Command::ReportDeviceStatus,
            ],

            AgentEvent::ContainerImageLoadFailed { instance_key } => vec![
                Command::UpdateMicroservice {
                    instance_key,
                    started: false,
                    failure_code: MS_IMAGE_LOAD_FAILED,
                    failure_description: decode_microservice_failure(MS_IMAGE_LOAD_FAILED)
                        .to_string(),
                },
                Command::ReportDeviceStatus,
            ],

            AgentEvent::MicroserviceContainersDestroyed { instance_key } => vec![
                Command::UpdateMicroservice {
                    instance_key,
                    started: false,
                    failure_code: 0,
                    failure_description: String::new(),
                },
                Command::ReportDeviceStatus,
            ],

            AgentEvent::LedgerEventReceived { event } => vec![Command::LedgerEvent { event }],

            AgentEvent::LedgerClientInitialized { ledger } => {
                vec![Command::LedgerClientInitialized { ledger }]
            }
            AgentEvent::LedgerClientStopping { ledger } => {
                vec![Command::LedgerClientStopping { ledger }]
            }
            AgentEvent::LedgerClientFunded { ledger } => {
                vec![Command::LedgerWritable { ledger }]
            }

            AgentEvent::ExchangeMessageReceived { message } => {
                vec![Command::ExchangeMessage { message }]
            }

            AgentEvent::NodeShutdownRequested => vec![Command::NodeShutdown],
            AgentEvent::NodeShutdownComplete => vec![Command::NodeShutdownComplete],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agreement::AgreementId;
    use crate::infrastructure::protocols::BasicProtocolHandler;
    use std::sync::Arc;

    fn demux() -> (EventDemux, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(16);
        let registry = Arc::new(ProtocolRegistry::new(vec![Arc::new(
            BasicProtocolHandler::new(),
        )]));
        let identity = Arc::new(tokio::sync::RwLock::new(DeviceIdentity::default()));
        (EventDemux::new(tx, registry, identity), rx)
    }

    #[tokio::test]
    async fn execution_begun_yields_start_and_status() {
        let (demux, mut rx) = demux();
        demux
            .handle(AgentEvent::WorkloadExecutionBegun {
                protocol: "Basic".to_string(),
                agreement_id: AgreementId::new("ag"),
                deployment: serde_json::Value::Null,
            })
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            Command::StartGovernExecution { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Command::ReportDeviceStatus
        ));
    }

    #[tokio::test]
    async fn unknown_protocol_is_dropped() {
        let (demux, mut rx) = demux();
        demux
            .handle(AgentEvent::WorkloadExecutionFailed {
                protocol: "NoSuchProtocol".to_string(),
                agreement_id: AgreementId::new("ag"),
                deployment: serde_json::Value::Null,
            })
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn registration_updates_identity_without_commands() {
        let (demux, mut rx) = demux();
        let identity = demux.identity.clone();
        demux
            .handle(AgentEvent::RegistrationComplete {
                org: "myorg".to_string(),
                device_id: "node".to_string(),
                token: "tok".to_string(),
                pattern: "pat".to_string(),
            })
            .await;
        assert_eq!(identity.read().await.qualified_id(), "myorg/node");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_maps_sub_reason() {
        let (demux, mut rx) = demux();
        demux
            .handle(AgentEvent::ImageFetchFailed {
                target: FetchTarget::Agreement {
                    protocol: "Basic".to_string(),
                    agreement_id: AgreementId::new("ag"),
                },
                failure: ImageFetchFailure::AuthError,
            })
            .await;
        let handler = BasicProtocolHandler::new();
        use crate::domain::protocol::ProtocolHandler as _;
        match rx.recv().await.unwrap() {
            Command::CleanupExecution { reason, .. } => assert_eq!(
                reason,
                handler.termination_code(TerminationReason::ImageFetchAuthFailure)
            ),
            other => panic!("unexpected command {:?}", other.tag()),
        }
    }
}
