// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// End-to-end agreement lifecycle scenarios, driven through a running
// engine against the in-memory store and a recording registry client.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aegis_edge::application::engine::{EngineHandle, GovernanceEngine};
use aegis_edge::domain::agreement::{Agreement, AgreementId, LedgerRef, MeteringNotification};
use aegis_edge::domain::commands::{CleanupStatus, Command};
use aegis_edge::domain::config::{AgentConfig, DeviceIdentity};
use aegis_edge::domain::events::{AgentEvent, CollaboratorEvent, InboundMessage};
use aegis_edge::domain::protocol::{
    LedgerEvent, Proposal, ProposalWorkload, ProtocolError, ProtocolRegistry,
};
use aegis_edge::domain::repository::{AgreementStore, LifecycleTransition};
use aegis_edge::infrastructure::protocols::{
    BasicProtocolHandler, LedgerConnector, LedgerProtocolHandler,
};
use aegis_edge::infrastructure::registry::{
    AgreementStateRecord, RegistryClient, RegistryError,
};
use aegis_edge::infrastructure::repositories::{
    InMemoryAgreementStore, InMemoryWorkloadConfigStore, LocalMicroserviceCoordinator,
};

#[derive(Default)]
struct RecordingRegistry {
    inbox: Mutex<Vec<InboundMessage>>,
    states: Mutex<Vec<(String, String)>>,
    deleted_agreements: Mutex<Vec<String>>,
    deleted_messages: Mutex<Vec<u64>>,
}

impl RecordingRegistry {
    fn put_inbox(&self, message: InboundMessage) {
        self.inbox.lock().unwrap().push(message);
    }

    fn states_for(&self, agreement_id: &str) -> Vec<String> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agreement_id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    fn deleted_message_count(&self) -> usize {
        self.deleted_messages.lock().unwrap().len()
    }
}

#[async_trait]
impl RegistryClient for RecordingRegistry {
    async fn put_agreement_state(
        &self,
        _identity: &DeviceIdentity,
        agreement_id: &AgreementId,
        record: &AgreementStateRecord,
    ) -> Result<(), RegistryError> {
        self.states
            .lock()
            .unwrap()
            .push((agreement_id.to_string(), record.state.clone()));
        Ok(())
    }

    async fn delete_agreement(
        &self,
        _identity: &DeviceIdentity,
        agreement_id: &AgreementId,
    ) -> Result<(), RegistryError> {
        self.deleted_agreements
            .lock()
            .unwrap()
            .push(agreement_id.to_string());
        Ok(())
    }

    async fn list_messages(
        &self,
        _identity: &DeviceIdentity,
    ) -> Result<Vec<InboundMessage>, RegistryError> {
        Ok(self.inbox.lock().unwrap().clone())
    }

    async fn delete_message(
        &self,
        _identity: &DeviceIdentity,
        msg_id: u64,
    ) -> Result<(), RegistryError> {
        self.deleted_messages.lock().unwrap().push(msg_id);
        Ok(())
    }

    async fn fetch_service(
        &self,
        _identity: &DeviceIdentity,
        _org: &str,
        _url: &str,
        _version: &str,
        _arch: &str,
    ) -> Result<Option<aegis_edge::domain::deployment::ServiceDefinition>, RegistryError> {
        Ok(None)
    }

    async fn put_node_status(
        &self,
        _identity: &DeviceIdentity,
        _report: &aegis_edge::domain::workload::DeviceStatusReport,
    ) -> Result<(), RegistryError> {
        Ok(())
    }
}

struct StubConnector;

#[async_trait]
impl LedgerConnector for StubConnector {
    async fn verify(
        &self,
        _ledger: &LedgerRef,
        _agreement_id: &AgreementId,
    ) -> Result<bool, ProtocolError> {
        Ok(false)
    }
    async fn cancel(
        &self,
        _ledger: &LedgerRef,
        _agreement_id: &AgreementId,
        _reason: u32,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
    async fn record_meter(
        &self,
        _ledger: &LedgerRef,
        _agreement_id: &AgreementId,
        _meter: &MeteringNotification,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
    async fn send_consumer_update(
        &self,
        _ledger: &LedgerRef,
        _agreement_id: &AgreementId,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemoryAgreementStore>,
    registry: Arc<RecordingRegistry>,
    handle: EngineHandle,
}

fn start_engine() -> Harness {
    let mut config = AgentConfig::new("https://registry.example/v1/");
    // Keep the loops quiet; scenarios drive the governor tick themselves.
    config.agreement_governor_interval_s = 3600;
    config.container_governor_interval_s = 3600;
    config.ledger_reporter_interval_s = 3600;

    let store = Arc::new(InMemoryAgreementStore::new());
    let registry = Arc::new(RecordingRegistry::default());
    let protocols = Arc::new(ProtocolRegistry::new(vec![
        Arc::new(BasicProtocolHandler::new()),
        Arc::new(LedgerProtocolHandler::new(
            "ethereum",
            Arc::new(StubConnector),
        )),
    ]));

    let handle = GovernanceEngine {
        config: Arc::new(config),
        store: store.clone(),
        workload_configs: Arc::new(InMemoryWorkloadConfigStore::new()),
        microservices: Arc::new(LocalMicroserviceCoordinator::new()),
        exchange: registry.clone(),
        registry: protocols,
        identity: DeviceIdentity {
            org: "myorg".to_string(),
            device_id: "node-1".to_string(),
            token: "secret".to_string(),
            pattern: String::new(),
        },
    }
    .start();

    Harness {
        store,
        registry,
        handle,
    }
}

fn proposal_blob(agreement_id: &str, consumer: &str) -> String {
    serde_json::to_string(&Proposal {
        agreement_id: AgreementId::new(agreement_id),
        consumer_id: consumer.to_string(),
        workload: ProposalWorkload {
            org: "myorg".to_string(),
            url: "web-workload".to_string(),
            version: "1.0.0".to_string(),
            arch: "amd64".to_string(),
            deployment: serde_json::json!({"services": {"web": {}}}),
            password: "hash".to_string(),
        },
        services: vec![],
    })
    .unwrap()
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn find(store: &InMemoryAgreementStore, protocol: &str, id: &str) -> Option<Agreement> {
    store.find(protocol, &AgreementId::new(id)).await.unwrap()
}

async fn expect_workload_cancel(
    events: &mut aegis_edge::infrastructure::event_bus::EventReceiver,
    expected: &str,
) {
    let id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let CollaboratorEvent::WorkloadCancel { agreement_id, .. } =
                events.recv().await.unwrap()
            {
                break agreement_id;
            }
        }
    })
    .await
    .expect("no workload cancel emitted");
    assert_eq!(id, AgreementId::new(expected));
}

#[tokio::test]
async fn happy_finalize_on_ledger_creation_event() {
    let h = start_engine();

    let a1 = Agreement::new(
        "Ledger",
        AgreementId::new("A1"),
        proposal_blob("A1", "broker-1"),
        "broker-1",
        LedgerRef::new("ethereum", "mainnet", "chainorg"),
    );
    h.store.insert(a1).await.unwrap();
    h.store
        .record("Ledger", &AgreementId::new("A1"), LifecycleTransition::Accepted)
        .await
        .unwrap();

    h.handle
        .dispatch(AgentEvent::LedgerEventReceived {
            event: LedgerEvent {
                ledger_type: "ethereum".to_string(),
                name: "mainnet".to_string(),
                org: "chainorg".to_string(),
                payload: serde_json::json!({"agreementId": "A1", "kind": "created"}),
            },
        })
        .await
        .unwrap();

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            find(&store, "Ledger", "A1")
                .await
                .map(|a| a.finalized_time != 0)
                .unwrap_or(false)
        }
    })
    .await;

    let states = h.registry.states_for("A1");
    assert!(
        states.contains(&"Finalized Agreement".to_string()),
        "states recorded: {:?}",
        states
    );
}

#[tokio::test]
async fn never_acknowledged_agreement_times_out_with_no_reply_ack() {
    let h = start_engine();
    let mut events = h.handle.bus.subscribe();

    // Created long ago, never accepted.
    let mut a2 = Agreement::new(
        "Basic",
        AgreementId::new("A2"),
        "{}",
        "broker-1",
        LedgerRef::default(),
    );
    a2.creation_time = 1;
    h.store.insert(a2).await.unwrap();

    h.handle.enqueue(Command::GovernAgreements).await.unwrap();

    expect_workload_cancel(&mut events, "A2").await;

    // Never accepted, so cleanup deletes the row instead of archiving.
    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { find(&store, "Basic", "A2").await.is_none() }
    })
    .await;

    // Nothing was ever written to the registry for it either.
    assert!(h.registry.deleted_agreements.lock().unwrap().is_empty());
}

fn cancel_message(msg_id: u64, broker: &str) -> InboundMessage {
    InboundMessage {
        msg_id,
        broker_id: broker.to_string(),
        broker_pub_key: String::new(),
        protocol_message:
            r#"{"protocol":"Basic","type":"cancel","agreementId":"A3","reason":17}"#.to_string(),
    }
}

#[tokio::test]
async fn broker_cancel_terminates_and_deletes_message() {
    let h = start_engine();
    let mut events = h.handle.bus.subscribe();

    let a3 = Agreement::new(
        "Basic",
        AgreementId::new("A3"),
        "{}",
        "broker-1",
        LedgerRef::default(),
    );
    h.store.insert(a3).await.unwrap();
    h.store
        .record("Basic", &AgreementId::new("A3"), LifecycleTransition::Accepted)
        .await
        .unwrap();

    let message = cancel_message(77, "broker-1");
    h.registry.put_inbox(message.clone());
    h.handle
        .dispatch(AgentEvent::ExchangeMessageReceived { message })
        .await
        .unwrap();

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            find(&store, "Basic", "A3")
                .await
                .map(|a| a.terminated_time != 0)
                .unwrap_or(false)
        }
    })
    .await;

    let row = find(&h.store, "Basic", "A3").await.unwrap();
    assert_eq!(row.terminated_reason, 17);
    let terminated_at = row.terminated_time;

    expect_workload_cancel(&mut events, "A3").await;

    // Accepted agreements are withdrawn from the registry on cancel.
    let registry = h.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move {
            registry
                .deleted_agreements
                .lock()
                .unwrap()
                .contains(&"A3".to_string())
        }
    })
    .await;
    let registry = h.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { registry.deleted_messages.lock().unwrap().contains(&77) }
    })
    .await;

    // Redelivery is a no-op: state unchanged, message deleted again.
    let replay = cancel_message(77, "broker-1");
    h.handle
        .dispatch(AgentEvent::ExchangeMessageReceived { message: replay })
        .await
        .unwrap();
    let registry = h.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { registry.deleted_message_count() >= 2 }
    })
    .await;

    let row = find(&h.store, "Basic", "A3").await.unwrap();
    assert_eq!(row.terminated_time, terminated_at);
    assert_eq!(row.terminated_reason, 17);
}

#[tokio::test]
async fn spoofed_cancel_changes_nothing_but_is_deleted() {
    let h = start_engine();

    let a3 = Agreement::new(
        "Basic",
        AgreementId::new("A3"),
        "{}",
        "broker-1",
        LedgerRef::default(),
    );
    h.store.insert(a3).await.unwrap();
    h.store
        .record("Basic", &AgreementId::new("A3"), LifecycleTransition::Accepted)
        .await
        .unwrap();

    let spoofed = cancel_message(99, "impostor");
    h.registry.put_inbox(spoofed.clone());
    h.handle
        .dispatch(AgentEvent::ExchangeMessageReceived { message: spoofed })
        .await
        .unwrap();

    let registry = h.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { registry.deleted_messages.lock().unwrap().contains(&99) }
    })
    .await;

    let row = find(&h.store, "Basic", "A3").await.unwrap();
    assert_eq!(row.terminated_time, 0);
    assert!(h.registry.deleted_agreements.lock().unwrap().is_empty());
}

async fn terminated_agreement(h: &Harness, id: &str) {
    let ag = Agreement::new(
        "Basic",
        AgreementId::new(id),
        "{}",
        "broker-1",
        LedgerRef::default(),
    );
    h.store.insert(ag).await.unwrap();
    h.store
        .record("Basic", &AgreementId::new(id), LifecycleTransition::Accepted)
        .await
        .unwrap();
    h.store
        .record(
            "Basic",
            &AgreementId::new(id),
            LifecycleTransition::Terminated {
                reason: 1,
                description: "test".to_string(),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn archival_requires_both_cleanup_confirmations() {
    let h = start_engine();
    terminated_agreement(&h, "A4").await;

    h.handle
        .enqueue(Command::CleanupStatus {
            protocol: "Basic".to_string(),
            agreement_id: AgreementId::new("A4"),
            status: CleanupStatus::WorkloadDestroyed,
        })
        .await
        .unwrap();

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            find(&store, "Basic", "A4")
                .await
                .map(|a| a.workload_terminated_time != 0)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(!find(&h.store, "Basic", "A4").await.unwrap().archived);

    h.handle
        .enqueue(Command::CleanupStatus {
            protocol: "Basic".to_string(),
            agreement_id: AgreementId::new("A4"),
            status: CleanupStatus::ProtocolTerminated,
        })
        .await
        .unwrap();

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            find(&store, "Basic", "A4")
                .await
                .map(|a| a.archived)
                .unwrap_or(false)
        }
    })
    .await;
}

#[tokio::test]
async fn shutdown_drains_loops_then_terminates() {
    let h = start_engine();
    let mut events = h.handle.bus.subscribe();

    h.handle
        .dispatch(AgentEvent::NodeShutdownRequested)
        .await
        .unwrap();

    // Once every loop has confirmed, unconfiguration is requested.
    let unconfigure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let CollaboratorEvent::UnconfigureNode = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await;
    assert!(unconfigure.is_ok(), "unconfigure was never requested");
    assert!(h.handle.is_shutting_down());

    // Unconfiguration finished; the processor terminates.
    h.handle
        .dispatch(AgentEvent::NodeShutdownComplete)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.handle.join())
        .await
        .expect("processor did not terminate");
}

#[tokio::test]
async fn archival_order_is_symmetric() {
    let h = start_engine();
    terminated_agreement(&h, "A5").await;

    h.handle
        .enqueue(Command::CleanupStatus {
            protocol: "Basic".to_string(),
            agreement_id: AgreementId::new("A5"),
            status: CleanupStatus::ProtocolTerminated,
        })
        .await
        .unwrap();
    h.handle
        .enqueue(Command::CleanupStatus {
            protocol: "Basic".to_string(),
            agreement_id: AgreementId::new("A5"),
            status: CleanupStatus::WorkloadDestroyed,
        })
        .await
        .unwrap();

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            find(&store, "Basic", "A5")
                .await
                .map(|a| a.archived)
                .unwrap_or(false)
        }
    })
    .await;
}
