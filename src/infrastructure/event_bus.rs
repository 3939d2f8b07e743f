// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Collaborator Event Bus - Pub/Sub toward external subsystems
//
// In-memory event streaming using tokio broadcast channels. The container
// collaborator, ledger collaborator, and microservice manager each
// subscribe and pick out the events addressed to them.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::agreement::AgreementId;
use crate::domain::events::CollaboratorEvent;

/// Event bus for publishing collaborator events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CollaboratorEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given buffered capacity; old events
    /// drop once the buffer fills for a lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish to all subscribers. Delivery is best effort; with no
    /// subscribers the event is dropped.
    pub fn publish(&self, event: CollaboratorEvent) {
        let _receiver_count = self.sender.send(event).unwrap_or(0);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for events about a single agreement.
    pub fn subscribe_agreement(&self, agreement_id: AgreementId) -> AgreementEventReceiver {
        AgreementEventReceiver {
            receiver: self.sender.subscribe(),
            agreement_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all collaborator events
pub struct EventReceiver {
    receiver: broadcast::Receiver<CollaboratorEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<CollaboratorEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<CollaboratorEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for agreement-specific events (filtered)
pub struct AgreementEventReceiver {
    receiver: broadcast::Receiver<CollaboratorEvent>,
    agreement_id: AgreementId,
}

impl AgreementEventReceiver {
    pub async fn recv(&mut self) -> Result<CollaboratorEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &CollaboratorEvent) -> bool {
        match event {
            CollaboratorEvent::AgreementReached { launch } => {
                launch.agreement_id == self.agreement_id
            }
            CollaboratorEvent::WorkloadCancel { agreement_id, .. } => {
                agreement_id == &self.agreement_id
            }
            CollaboratorEvent::ContainerMaintain { agreement_id, .. } => {
                agreement_id == &self.agreement_id
            }
            CollaboratorEvent::NeededLedgers { .. } => false,
            CollaboratorEvent::NewLedgerClient { .. } => false,
            CollaboratorEvent::UnconfigureNode => false,
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
