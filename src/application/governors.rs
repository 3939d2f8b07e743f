// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Governance loops.
//
// Three periodic tasks, each checking the shutdown flag at the top of
// every iteration and exiting cleanly. The agreement governor's scan
// mutates state, so it runs as a tick command on the command processor;
// the container governor and the ledger reporter only read the store and
// talk to collaborators over the bus.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::domain::agreement::{running, unarchived};
use crate::domain::commands::Command;
use crate::domain::events::CollaboratorEvent;
use crate::domain::protocol::ProtocolRegistry;
use crate::domain::repository::AgreementStore;
use crate::infrastructure::event_bus::EventBus;

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Ticks the command queue so the agreement scan serializes with every
/// other state transition.
pub fn spawn_agreement_governor(
    commands: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if stopping(&shutdown) {
                        break;
                    }
                    if commands.send(Command::GovernAgreements).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if stopping(&shutdown) {
                        break;
                    }
                }
            }
        }
        debug!("agreement governor stopped");
    })
}

/// Fans a container-maintain event out for every running agreement. The
/// container collaborator reports failures back through the event feed on
/// its own time; no reply is awaited here.
pub fn spawn_container_governor(
    store: Arc<dyn AgreementStore>,
    registry: Arc<ProtocolRegistry>,
    bus: EventBus,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if stopping(&shutdown) {
                        break;
                    }
                    govern_containers(&store, &registry, &bus).await;
                }
                _ = shutdown.changed() => {
                    if stopping(&shutdown) {
                        break;
                    }
                }
            }
        }
        debug!("container governor stopped");
    })
}

async fn govern_containers(
    store: &Arc<dyn AgreementStore>,
    registry: &Arc<ProtocolRegistry>,
    bus: &EventBus,
) {
    let agreements = match store
        .find_all_protocols(&registry.names(), &[unarchived(), running()])
        .await
    {
        Ok(agreements) => agreements,
        Err(e) => {
            error!("unable to retrieve running agreements: {}", e);
            return;
        }
    };
    for agreement in agreements {
        debug!(
            "verifying containers are still up for agreement {}",
            agreement.id
        );
        bus.publish(CollaboratorEvent::ContainerMaintain {
            protocol: agreement.protocol.clone(),
            agreement_id: agreement.id.clone(),
            deployment: agreement.deployment.clone(),
        });
    }
}

/// Advertises the set of ledgers current agreements require so the ledger
/// collaborator keeps the right clients running.
pub fn spawn_ledger_reporter(
    store: Arc<dyn AgreementStore>,
    registry: Arc<ProtocolRegistry>,
    bus: EventBus,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if stopping(&shutdown) {
                        break;
                    }
                    report_ledgers(&store, &registry, &bus).await;
                }
                _ = shutdown.changed() => {
                    if stopping(&shutdown) {
                        break;
                    }
                }
            }
        }
        debug!("ledger reporter stopped");
    })
}

async fn report_ledgers(
    store: &Arc<dyn AgreementStore>,
    registry: &Arc<ProtocolRegistry>,
    bus: &EventBus,
) {
    for (protocol, handler) in registry.iter() {
        let Some(ledger_type) = handler.ledger_type() else {
            continue;
        };
        let agreements = match store.find_by_protocol(protocol, &[unarchived()]).await {
            Ok(agreements) => agreements,
            Err(e) => {
                error!(
                    "unable to read agreements for protocol {}: {}",
                    protocol, e
                );
                continue;
            }
        };
        let mut needed: HashMap<String, HashSet<String>> = HashMap::new();
        for agreement in &agreements {
            let ledger = handler.known_ledger(agreement);
            if !ledger.name.is_empty() {
                needed.entry(ledger.org).or_default().insert(ledger.name);
            }
        }
        if !needed.is_empty() {
            bus.publish(CollaboratorEvent::NeededLedgers {
                ledger_type: ledger_type.to_string(),
                needed,
            });
        }
    }
}
