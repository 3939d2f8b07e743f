// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Assembly of the governance core: wires the stores, registry client,
// protocol registry, and bus into the command processor, spawns the
// governance loops, and hands back the channels the embedding process
// feeds events through.
//
// Shutdown is cooperative. A node-shutdown event flips the watch flag,
// the loops exit at their next iteration, unconfiguration is requested
// once they have, and the node-shutdown-complete event terminates the
// processor.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::application::demux::EventDemux;
use crate::application::governors::{
    spawn_agreement_governor, spawn_container_governor, spawn_ledger_reporter,
};
use crate::application::launch::LaunchService;
use crate::application::processor::CommandProcessor;
use crate::application::status::StatusReporter;
use crate::application::termination::TerminationPipeline;
use crate::domain::commands::Command;
use crate::domain::config::{AgentConfig, DeviceIdentity};
use crate::domain::events::AgentEvent;
use crate::domain::protocol::ProtocolRegistry;
use crate::domain::repository::AgreementStore;
use crate::domain::workload::{MicroserviceCoordinator, WorkloadConfigStore};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::registry::RegistryClient;

const COMMAND_QUEUE_DEPTH: usize = 256;
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct GovernanceEngine {
    pub config: Arc<AgentConfig>,
    pub store: Arc<dyn AgreementStore>,
    pub workload_configs: Arc<dyn WorkloadConfigStore>,
    pub microservices: Arc<dyn MicroserviceCoordinator>,
    pub exchange: Arc<dyn RegistryClient>,
    pub registry: Arc<ProtocolRegistry>,
    pub identity: DeviceIdentity,
}

/// A running governance core.
pub struct EngineHandle {
    pub bus: EventBus,
    events: mpsc::Sender<AgentEvent>,
    commands: mpsc::Sender<Command>,
    processor: JoinHandle<()>,
    shutdown: watch::Receiver<bool>,
}

impl GovernanceEngine {
    pub fn start(self) -> EngineHandle {
        let bus = EventBus::with_default_capacity();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, mut events_rx) = mpsc::channel::<AgentEvent>(EVENT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let identity = Arc::new(tokio::sync::RwLock::new(self.identity));

        let launch = LaunchService::new(
            self.config.clone(),
            self.store.clone(),
            self.workload_configs.clone(),
            self.microservices.clone(),
            self.exchange.clone(),
            bus.clone(),
            identity.clone(),
        );
        let termination = TerminationPipeline::new(
            self.store.clone(),
            self.exchange.clone(),
            commands_tx.clone(),
            identity.clone(),
        );
        let status = StatusReporter::new(
            self.store.clone(),
            self.microservices.clone(),
            self.registry.clone(),
            self.exchange.clone(),
            identity.clone(),
        );

        let loop_handles = vec![
            spawn_agreement_governor(
                commands_tx.clone(),
                shutdown_rx.clone(),
                Duration::from_secs(self.config.agreement_governor_interval_s),
            ),
            spawn_container_governor(
                self.store.clone(),
                self.registry.clone(),
                bus.clone(),
                shutdown_rx.clone(),
                Duration::from_secs(self.config.container_governor_interval_s),
            ),
            spawn_ledger_reporter(
                self.store.clone(),
                self.registry.clone(),
                bus.clone(),
                shutdown_rx.clone(),
                Duration::from_secs(self.config.ledger_reporter_interval_s),
            ),
        ];

        let processor = CommandProcessor::new(
            self.config,
            self.store,
            self.registry.clone(),
            self.exchange,
            self.microservices,
            bus.clone(),
            launch,
            termination,
            status,
            commands_tx.clone(),
            identity.clone(),
            shutdown_tx,
            loop_handles,
        );
        let processor_handle = tokio::spawn(processor.run(commands_rx));

        let demux = EventDemux::new(commands_tx.clone(), self.registry, identity);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                demux.handle(event).await;
            }
        });

        EngineHandle {
            bus,
            events: events_tx,
            commands: commands_tx,
            processor: processor_handle,
            shutdown: shutdown_rx,
        }
    }
}

impl EngineHandle {
    /// Deliver one external event into the core.
    pub async fn dispatch(&self, event: AgentEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("governance core has terminated"))
    }

    /// Enqueue a command directly, bypassing the demux. Front-ends use
    /// this for operator-initiated cancels.
    pub async fn enqueue(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("governance core has terminated"))
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait for the processor to terminate (after node shutdown).
    pub async fn join(self) {
        let _ = self.processor.await;
    }
}
