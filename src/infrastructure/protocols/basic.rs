// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// The Basic agreement protocol: no ledger, the broker's reply-ack is the
// only witness an agreement gets. Termination is therefore always
// immediately possible and verification reduces to "has the broker
// acknowledged".

use async_trait::async_trait;
use tracing::debug;

use crate::domain::agreement::{Agreement, LedgerRef, MeteringNotification};
use crate::domain::events::InboundMessage;
use crate::domain::protocol::{
    CancelRequest, DataReceived, ExtensionOutcome, LedgerEvent, LedgerEventOutcome, MeterReading,
    Proposal, ProtocolError, ProtocolHandler, ReplyAck, TerminationReason,
};

use super::{
    parse_wire, KIND_CANCEL, KIND_DATA_RECEIVED, KIND_METER_NOTIFICATION, KIND_REPLY_ACK,
};

pub const PROTOCOL_NAME: &str = "Basic";

#[derive(Default)]
pub struct BasicProtocolHandler;

impl BasicProtocolHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProtocolHandler for BasicProtocolHandler {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn ledger_type(&self) -> Option<&str> {
        None
    }

    fn termination_code(&self, reason: TerminationReason) -> u32 {
        match reason {
            TerminationReason::PolicyChanged => 101,
            TerminationReason::ConsumerRequested => 102,
            TerminationReason::UserRequested => 103,
            TerminationReason::ContainerFailure => 104,
            TerminationReason::ImageLoadFailure => 105,
            TerminationReason::ImageDataError => 106,
            TerminationReason::ImageFetchFailure => 107,
            TerminationReason::ImageFetchAuthFailure => 108,
            TerminationReason::ImageSigVerifFailure => 109,
            TerminationReason::NotFinalizedTimeout => 110,
            TerminationReason::NoReplyAck => 111,
            TerminationReason::NotExecutedTimeout => 112,
            TerminationReason::MicroserviceFailure => 113,
            TerminationReason::NodeShutdown => 114,
        }
    }

    fn termination_reason(&self, code: u32) -> String {
        let reason = match code {
            101 => TerminationReason::PolicyChanged,
            102 => TerminationReason::ConsumerRequested,
            103 => TerminationReason::UserRequested,
            104 => TerminationReason::ContainerFailure,
            105 => TerminationReason::ImageLoadFailure,
            106 => TerminationReason::ImageDataError,
            107 => TerminationReason::ImageFetchFailure,
            108 => TerminationReason::ImageFetchAuthFailure,
            109 => TerminationReason::ImageSigVerifFailure,
            110 => TerminationReason::NotFinalizedTimeout,
            111 => TerminationReason::NoReplyAck,
            112 => TerminationReason::NotExecutedTimeout,
            113 => TerminationReason::MicroserviceFailure,
            114 => TerminationReason::NodeShutdown,
            other => return format!("unknown termination reason ({})", other),
        };
        reason.describe().to_string()
    }

    fn validate_reply_ack(&self, msg: &str) -> Option<ReplyAck> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_REPLY_ACK)?;
        Some(ReplyAck {
            agreement_id: crate::domain::agreement::AgreementId::new(wire.agreement_id),
            still_valid: wire.decision.unwrap_or(false),
        })
    }

    fn validate_data_received(&self, msg: &str) -> Option<DataReceived> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_DATA_RECEIVED)?;
        Some(DataReceived {
            agreement_id: crate::domain::agreement::AgreementId::new(wire.agreement_id),
        })
    }

    fn validate_meter_notification(&self, msg: &str) -> Option<MeterReading> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_METER_NOTIFICATION)?;
        Some(MeterReading {
            agreement_id: crate::domain::agreement::AgreementId::new(wire.agreement_id),
            meter: wire.meter?,
        })
    }

    fn validate_cancel(&self, msg: &str) -> Option<CancelRequest> {
        let wire = parse_wire(msg, PROTOCOL_NAME, KIND_CANCEL)?;
        Some(CancelRequest {
            agreement_id: crate::domain::agreement::AgreementId::new(wire.agreement_id),
            reason: wire.reason.unwrap_or(0),
        })
    }

    async fn handle_extension_message(
        &self,
        _msg: &str,
        _envelope: &InboundMessage,
    ) -> Result<ExtensionOutcome, ProtocolError> {
        // Basic has no extension messages.
        Ok(ExtensionOutcome::default())
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

    fn accepts_ledger_event(&self, _event: &LedgerEvent) -> bool {
        false
    }

    async fn handle_ledger_event(
        &self,
        _event: &LedgerEvent,
    ) -> Result<Option<LedgerEventOutcome>, ProtocolError> {
        Ok(None)
    }

    fn known_ledger(&self, _agreement: &Agreement) -> LedgerRef {
        LedgerRef::default()
    }

    fn is_ledger_writable(&self, _agreement: &Agreement) -> bool {
        // No ledger to wait for; termination can always run immediately.
        true
    }

    fn is_ledger_client_available(&self, _ledger: &LedgerRef) -> bool {
        true
    }

    fn is_agreement_verifiable(&self, agreement: &Agreement) -> bool {
        agreement.accepted_time != 0
    }

    async fn verify_agreement(&self, agreement: &Agreement) -> Result<bool, ProtocolError> {
        // The broker's reply-ack is the agreement's only witness.
        Ok(agreement.accepted_time != 0)
    }

    async fn terminate_agreement(
        &self,
        agreement: &Agreement,
        reason: u32,
    ) -> Result<(), ProtocolError> {
        debug!(
            "protocol-level cancel of {} with reason {}",
            agreement.id, reason
        );
        Ok(())
    }

    async fn record_meter(
        &self,
        agreement: &Agreement,
        _meter: &MeteringNotification,
    ) -> Result<(), ProtocolError> {
        debug!("no ledger to record meter on for {}", agreement.id);
        Ok(())
    }

    async fn update_consumer(&self, _agreement: &Agreement) {}

    async fn update_consumers(&self) {}

    fn set_ledger_client_available(&self, _ledger: &LedgerRef) {}
    fn set_ledger_client_stopped(&self, _ledger: &LedgerRef) {}
    fn set_ledger_writable(&self, _ledger: &LedgerRef) {}
}
