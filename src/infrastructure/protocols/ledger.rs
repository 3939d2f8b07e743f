// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// The Ledger agreement protocol: agreements are witnessed on an external
// append-only ledger. The handler owns the per-ledger client state
// (available, writable) and talks to the chain through the narrow
// `LedgerConnector` surface; a cancel can block for the better part of a
// minute while the write lands.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::domain::agreement::{Agreement, AgreementId, LedgerRef, MeteringNotification};
use crate::domain::events::InboundMessage;
use crate::domain::protocol::{
    CancelRequest, DataReceived, ExtensionOutcome, LedgerEvent, LedgerEventOutcome, MeterReading,
    Proposal, ProtocolError, ProtocolHandler, ReplyAck, TerminationReason,
};

use super::{
    parse_wire, KIND_CANCEL, KIND_DATA_RECEIVED, KIND_METER_NOTIFICATION, KIND_REPLY_ACK,
};

pub const PROTOCOL_NAME: &str = "Ledger";

/// The ledger client, as far as this protocol needs one.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn verify(
        &self,
        ledger: &LedgerRef,
        agreement_id: &AgreementId,
    ) -> Result<bool, ProtocolError>;

    /// Cancel on chain. May take 30-90 seconds.
    async fn cancel(
        &self,
        ledger: &LedgerRef,
        agreement_id: &AgreementId,
        reason: u32,
    ) -> Result<(), ProtocolError>;

    async fn record_meter(
        &self,
        ledger: &LedgerRef,
        agreement_id: &AgreementId,
        meter: &MeteringNotification,
    ) -> Result<(), ProtocolError>;

    /// Push our chain-specific agreement parameters to the consumer.
    async fn send_consumer_update(
        &self,
        ledger: &LedgerRef,
        agreement_id: &AgreementId,
    ) -> Result<(), ProtocolError>;
}

#[derive(Debug, Default, Clone, Copy)]
struct LedgerState {
    available: bool,
    writable: bool,
}

pub struct LedgerProtocolHandler {
    ledger_type: String,
    connector: Arc<dyn LedgerConnector>,
    state: Mutex<HashMap<(String, String), LedgerState>>,
    /// Agreements whose consumer has acked our ledger parameters.
    consumer_acked: Mutex<HashSet<AgreementId>>,
    /// Updates that failed and should retry once the ledger is writable.
    pending_updates: Mutex<HashMap<AgreementId, LedgerRef>>,
}

impl LedgerProtocolHandler {
    pub fn new(ledger_type: impl Into<String>, connector: Arc<dyn LedgerConnector>) -> Self {
        Self {
            ledger_type: ledger_type.into(),
            connector,
            state: Mutex::new(HashMap::new()),
            consumer_acked: Mutex::new(HashSet::new()),
            pending_updates: Mutex::new(HashMap::new()),
        }
    }

    fn ledger_state(&self, ledger: &LedgerRef) -> LedgerState {
        self.state
            .lock()
            .expect("ledger state mutex poisoned")
            .get(&(ledger.org.clone(), ledger.name.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn set_state(&self, ledger: &LedgerRef, f: impl FnOnce(&mut LedgerState)) {
        if ledger.ledger_type != self.ledger_type {
            return;
        }
        let mut state = self.state.lock().expect("ledger state mutex poisoned");
        f(state
            .entry((ledger.org.clone(), ledger.name.clone()))
            .or_default());
    }
}

#[async_trait]
impl ProtocolHandler for LedgerProtocolHandler {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn ledger_type(&self) -> Option<&str> {
        Some(&self.ledger_type)
    }

    fn termination_code(&self, reason: TerminationReason) -> u32 {
        match reason {
            TerminationReason::PolicyChanged => 1,
            TerminationReason::ConsumerRequested => 2,
            TerminationReason::UserRequested => 3,
            TerminationReason::ContainerFailure => 4,
            TerminationReason::ImageLoadFailure => 5,
            TerminationReason::ImageDataError => 6,
            TerminationReason::ImageFetchFailure => 7,
            TerminationReason::ImageFetchAuthFailure => 8,
            TerminationReason::ImageSigVerifFailure => 9,
            TerminationReason::NotFinalizedTimeout => 10,
            TerminationReason::NoReplyAck => 11,
            TerminationReason::NotExecutedTimeout => 12,
            TerminationReason::MicroserviceFailure => 13,
            TerminationReason::NodeShutdown => 14,
        }
    }

    fn termination_reason(&self, code: u32) -> String {
        let reason = match code {
            1 => TerminationReason::PolicyChanged,
            2 => TerminationReason::ConsumerRequested,
            3 => TerminationReason::UserRequested,
            4 => TerminationReason::ContainerFailure,
            5 => TerminationReason::ImageLoadFailure,
            6 => TerminationReason::ImageDataError,
            7 => TerminationReason::ImageFetchFailure,
            8 => TerminationReason::ImageFetchAuthFailure,
            9 => TerminationReason::ImageSigVerifFailure,
            10 => TerminationReason::NotFinalizedTimeout,
            11 => TerminationReason::NoReplyAck,
            12 => TerminationReason::NotExecutedTimeout,
            13 => TerminationReason::MicroserviceFailure,
            14 => TerminationReason::NodeShutdown,
            other => return format!("unknown termination reason ({})", other),
        };
        reason.describe().to_string()
    }

    fn validate_reply_ack(&self, msg: &str) -> Option<ReplyAck> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_REPLY_ACK)?;
        Some(ReplyAck {
            agreement_id: AgreementId::new(wire.agreement_id),
            still_valid: wire.decision.unwrap_or(false),
        })
    }

    fn validate_data_received(&self, msg: &str) -> Option<DataReceived> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_DATA_RECEIVED)?;
        Some(DataReceived {
            agreement_id: AgreementId::new(wire.agreement_id),
        })
    }

    fn validate_meter_notification(&self, msg: &str) -> Option<MeterReading> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_METER_NOTIFICATION)?;
        Some(MeterReading {
            agreement_id: AgreementId::new(wire.agreement_id),
            meter: wire.meter?,
        })
    }

    fn validate_cancel(&self, msg: &str) -> Option<CancelRequest> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_CANCEL)?;
        Some(CancelRequest {
            agreement_id: AgreementId::new(wire.agreement_id),
            reason: wire.reason.unwrap_or(0),
        })
    }

    async fn handle_extension_message(
        &self,
        msg: &str,
        _envelope: &InboundMessage,
    ) -> Result<ExtensionOutcome, ProtocolError> {
        // Chain parameter exchange: the consumer acknowledges our ledger
        // parameters with an extension message.
        #[derive(serde::Deserialize)]
        struct ParamsAck {
            protocol: String,
            #[serde(rename = "type")]
            kind: String,
            #[serde(rename = "agreementId")]
            agreement_id: String,
        }
        let Ok(ack) = serde_json::from_str::<ParamsAck>(msg) else {
            return Ok(ExtensionOutcome::default());
        };
        if ack.protocol != PROTOCOL_NAME || ack.kind != "paramsack" {
            return Ok(ExtensionOutcome::default());
        }
        let id = AgreementId::new(ack.agreement_id);
        self.consumer_acked
            .lock()
            .expect("ack mutex poisoned")
            .insert(id.clone());
        self.pending_updates
            .lock()
            .expect("pending mutex poisoned")
            .remove(&id);
        Ok(ExtensionOutcome {
            handled: true,
            cancel: false,
            agreement_id: Some(id),
        })
    }

    fn demarshal_proposal(&self, raw: &str) -> Result<Proposal, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    async fn notify_data_receipt(
        &self,
        agreement: &Agreement,
        envelope: &InboundMessage,
    ) -> Result<(), ProtocolError> {
        debug!(
            "data receipt for {} acknowledged toward broker {}",
            agreement.id, envelope.broker_id
        );
        Ok(())
    }

    fn accepts_ledger_event(&self, event: &LedgerEvent) -> bool {
        event.ledger_type == self.ledger_type
    }

    async fn handle_ledger_event(
        &self,
        event: &LedgerEvent,
    ) -> Result<Option<LedgerEventOutcome>, ProtocolError> {
        #[derive(serde::Deserialize)]
        struct ChainRecord {
            #[serde(rename = "agreementId")]
            agreement_id: String,
            kind: String,
            #[serde(default)]
            reason: u32,
        }
        let record: ChainRecord = serde_json::from_value(event.payload.clone())
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        let outcome = match record.kind.as_str() {
            "created" => LedgerEventOutcome {
                agreement_id: AgreementId::new(record.agreement_id),
                terminated: false,
                reason: 0,
                created: true,
            },
            "terminated" => LedgerEventOutcome {
                agreement_id: AgreementId::new(record.agreement_id),
                terminated: true,
                reason: record.reason,
                created: false,
            },
            _ => return Ok(None),
        };
        Ok(Some(outcome))
    }

    fn known_ledger(&self, agreement: &Agreement) -> LedgerRef {
        agreement.ledger.clone()
    }

    fn is_ledger_writable(&self, agreement: &Agreement) -> bool {
        let state = self.ledger_state(&agreement.ledger);
        state.available && state.writable
    }

    fn is_ledger_client_available(&self, ledger: &LedgerRef) -> bool {
        self.ledger_state(ledger).available
    }

    fn is_agreement_verifiable(&self, agreement: &Agreement) -> bool {
        self.ledger_state(&agreement.ledger).available
    }

    async fn verify_agreement(&self, agreement: &Agreement) -> Result<bool, ProtocolError> {
        if !self.is_agreement_verifiable(agreement) {
            return Err(ProtocolError::Unavailable(format!(
                "ledger {}/{} has no running client",
                agreement.ledger.org, agreement.ledger.name
            )));
        }
        self.connector.verify(&agreement.ledger, &agreement.id).await
    }

    async fn terminate_agreement(
        &self,
        agreement: &Agreement,
        reason: u32,
    ) -> Result<(), ProtocolError> {
        self.connector
            .cancel(&agreement.ledger, &agreement.id, reason)
            .await
    }

    async fn record_meter(
        &self,
        agreement: &Agreement,
        meter: &MeteringNotification,
    ) -> Result<(), ProtocolError> {
        self.connector
            .record_meter(&agreement.ledger, &agreement.id, meter)
            .await
    }

    async fn update_consumer(&self, agreement: &Agreement) {
        if self
            .consumer_acked
            .lock()
            .expect("ack mutex poisoned")
            .contains(&agreement.id)
        {
            return;
        }
        match self
            .connector
            .send_consumer_update(&agreement.ledger, &agreement.id)
            .await
        {
            Ok(()) => {
                self.pending_updates
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(&agreement.id);
            }
            Err(e) => {
                warn!("consumer update for {} failed: {}", agreement.id, e);
                self.pending_updates
                    .lock()
                    .expect("pending mutex poisoned")
                    .insert(agreement.id.clone(), agreement.ledger.clone());
            }
        }
    }

    async fn update_consumers(&self) {
        let pending: Vec<(AgreementId, LedgerRef)> = self
            .pending_updates
            .lock()
            .expect("pending mutex poisoned")
            .iter()
            .map(|(id, ledger)| (id.clone(), ledger.clone()))
            .collect();
        for (id, ledger) in pending {
            match self.connector.send_consumer_update(&ledger, &id).await {
                Ok(()) => {
                    self.pending_updates
                        .lock()
                        .expect("pending mutex poisoned")
                        .remove(&id);
                }
                Err(e) => warn!("consumer update retry for {} failed: {}", id, e),
            }
        }
    }

    fn set_ledger_client_available(&self, ledger: &LedgerRef) {
        self.set_state(ledger, |s| s.available = true);
    }

    fn set_ledger_client_stopped(&self, ledger: &LedgerRef) {
        self.set_state(ledger, |s| {
            s.available = false;
            s.writable = false;
        });
    }

    fn set_ledger_writable(&self, ledger: &LedgerRef) {
        self.set_state(ledger, |s| {
            s.available = true;
            s.writable = true;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubConnector;

    #[async_trait]
    impl LedgerConnector for StubConnector {
        async fn verify(
            &self,
            _ledger: &LedgerRef,
            _agreement_id: &AgreementId,
        ) -> Result<bool, ProtocolError> {
            Ok(true)
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

    fn handler() -> LedgerProtocolHandler {
        LedgerProtocolHandler::new("ethereum", Arc::new(StubConnector))
    }

    fn agreement(ledger: LedgerRef) -> Agreement {
        Agreement::new(
            PROTOCOL_NAME,
            AgreementId::new("ag-1"),
            "{}",
            "broker",
            ledger,
        )
    }

    #[test]
    fn writability_tracks_client_state() {
        let h = handler();
        let ledger = LedgerRef::new("ethereum", "mainnet", "org");
        let ag = agreement(ledger.clone());

        assert!(!h.is_ledger_writable(&ag));
        h.set_ledger_client_available(&ledger);
        assert!(h.is_ledger_client_available(&ledger));
        assert!(!h.is_ledger_writable(&ag));
        h.set_ledger_writable(&ledger);
        assert!(h.is_ledger_writable(&ag));
        h.set_ledger_client_stopped(&ledger);
        assert!(!h.is_ledger_writable(&ag));
        assert!(!h.is_ledger_client_available(&ledger));
    }

    #[test]
    fn foreign_ledger_types_ignored() {
        let h = handler();
        let foreign = LedgerRef::new("other-chain", "net", "org");
        h.set_ledger_writable(&foreign);
        assert!(!h.is_ledger_client_available(&foreign));
    }

    #[tokio::test]
    async fn chain_events_decode_to_outcomes() {
        let h = handler();
        let event = LedgerEvent {
            ledger_type: "ethereum".to_string(),
            name: "mainnet".to_string(),
            org: "org".to_string(),
            payload: serde_json::json!({"agreementId": "ag-9", "kind": "terminated", "reason": 4}),
        };
        assert!(h.accepts_ledger_event(&event));
        let outcome = h.handle_ledger_event(&event).await.unwrap().unwrap();
        assert!(outcome.terminated);
        assert_eq!(outcome.reason, 4);
        assert_eq!(outcome.agreement_id, AgreementId::new("ag-9"));

        let created = LedgerEvent {
            payload: serde_json::json!({"agreementId": "ag-9", "kind": "created"}),
            ..event
        };
        let outcome = h.handle_ledger_event(&created).await.unwrap().unwrap();
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn verify_requires_running_client() {
        let h = handler();
        let ledger = LedgerRef::new("ethereum", "mainnet", "org");
        let ag = agreement(ledger.clone());
        assert!(h.verify_agreement(&ag).await.is_err());
        h.set_ledger_client_available(&ledger);
        assert!(h.verify_agreement(&ag).await.unwrap());
    }

    #[tokio::test]
    async fn params_ack_marks_consumer_updated() {
        let h = handler();
        let msg = r#"{"protocol":"Ledger","type":"paramsack","agreementId":"ag-1"}"#;
        let envelope = InboundMessage {
            msg_id: 1,
            broker_id: "broker".to_string(),
            broker_pub_key: String::new(),
            protocol_message: msg.to_string(),
        };
        let outcome = h.handle_extension_message(msg, &envelope).await.unwrap();
        assert!(outcome.handled);
        assert_eq!(outcome.agreement_id, Some(AgreementId::new("ag-1")));
    }
}
