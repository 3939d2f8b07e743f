// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agreement protocol contracts.
//
// Every supported agreement protocol contributes one handler implementing
// the capability set below: the wire codec for inbound broker messages,
// the termination reason vocabulary, and whatever ledger the protocol
// witnesses agreements on. Handlers are registered once at startup and
// looked up by protocol name for the rest of the process lifetime; nothing
// holds a handler pointer inside an agreement row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::agreement::{Agreement, AgreementId, LedgerRef, MeteringNotification};
use crate::domain::events::InboundMessage;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message codec error: {0}")]
    Codec(String),
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("ledger client not available: {0}")]
    Unavailable(String),
}

/// Why an agreement ended, independent of any protocol's numeric coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    PolicyChanged,
    ConsumerRequested,
    UserRequested,
    ContainerFailure,
    ImageLoadFailure,
    ImageDataError,
    ImageFetchFailure,
    ImageFetchAuthFailure,
    ImageSigVerifFailure,
    NotFinalizedTimeout,
    NoReplyAck,
    NotExecutedTimeout,
    MicroserviceFailure,
    NodeShutdown,
}

impl TerminationReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::PolicyChanged => "the node policy changed",
            Self::ConsumerRequested => "the consumer cancelled the agreement",
            Self::UserRequested => "the node operator cancelled the agreement",
            Self::ContainerFailure => "workload containers failed",
            Self::ImageLoadFailure => "workload image could not be loaded",
            Self::ImageDataError => "workload image data was corrupt",
            Self::ImageFetchFailure => "workload image could not be fetched",
            Self::ImageFetchAuthFailure => "authorization failed fetching the workload image",
            Self::ImageSigVerifFailure => "workload image signature verification failed",
            Self::NotFinalizedTimeout => "agreement was not finalized in time",
            Self::NoReplyAck => "no reply acknowledgement was received",
            Self::NotExecutedTimeout => "workload was not started in time",
            Self::MicroserviceFailure => "a dependent service failed",
            Self::NodeShutdown => "the node is shutting down",
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed inbound messages
// ---------------------------------------------------------------------------

/// Broker response to our proposal acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAck {
    pub agreement_id: AgreementId,
    /// False when the broker decided not to pursue the agreement after all.
    pub still_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReceived {
    pub agreement_id: AgreementId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub agreement_id: AgreementId,
    pub meter: MeteringNotification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub agreement_id: AgreementId,
    pub reason: u32,
}

/// Result of offering a message to a protocol's extension handler.
#[derive(Debug, Clone, Default)]
pub struct ExtensionOutcome {
    pub handled: bool,
    pub cancel: bool,
    pub agreement_id: Option<AgreementId>,
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// The workload half of a proposal: what to launch once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalWorkload {
    pub org: String,
    pub url: String,
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub deployment: serde_json::Value,
    /// Workload password, surfaced to the container as its HASH.
    #[serde(default)]
    pub password: String,
}

/// A dependent-service requirement carried in the proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalService {
    pub org: String,
    pub url: String,
    /// Version range the workload accepts.
    pub version_range: String,
}

/// The demarshalled content of an agreement proposal. The raw blob stays in
/// the agreement row; handlers produce this view on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub agreement_id: AgreementId,
    pub consumer_id: String,
    pub workload: ProposalWorkload,
    #[serde(default)]
    pub services: Vec<ProposalService>,
}

// ---------------------------------------------------------------------------
// Ledger events
// ---------------------------------------------------------------------------

/// A raw event observed by the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub ledger_type: String,
    pub name: String,
    pub org: String,
    pub payload: serde_json::Value,
}

/// What a ledger event meant for one of our agreements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEventOutcome {
    pub agreement_id: AgreementId,
    pub terminated: bool,
    pub reason: u32,
    pub created: bool,
}

// ---------------------------------------------------------------------------
// Handler capability set
// ---------------------------------------------------------------------------

/// One agreement protocol's behavior. Implementations own their per-ledger
/// connection state; agreement rows are always passed in by the caller.
///
/// `terminate_agreement` may block for tens of seconds on a ledger write
/// and must never be called from the command processor task directly.
/// `verify_agreement` is expected to be fast while the ledger client is
/// connected.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &str;

    /// The ledger type this protocol requires, if any.
    fn ledger_type(&self) -> Option<&str>;

    fn termination_code(&self, reason: TerminationReason) -> u32;

    /// Human-readable description for a code; unknown codes get a generic
    /// description rather than an error, since brokers may be newer than us.
    fn termination_reason(&self, code: u32) -> String;

    fn validate_reply_ack(&self, msg: &str) -> Option<ReplyAck>;
    fn validate_data_received(&self, msg: &str) -> Option<DataReceived>;
    fn validate_meter_notification(&self, msg: &str) -> Option<MeterReading>;
    fn validate_cancel(&self, msg: &str) -> Option<CancelRequest>;

    /// Offer a message that matched no standard validator to the protocol's
    /// extension handling.
    async fn handle_extension_message(
        &self,
        msg: &str,
        envelope: &InboundMessage,
    ) -> Result<ExtensionOutcome, ProtocolError>;

    fn demarshal_proposal(&self, raw: &str) -> Result<Proposal, ProtocolError>;

    /// Acknowledge a data-received notification back to the broker.
    async fn notify_data_receipt(
        &self,
        agreement: &Agreement,
        envelope: &InboundMessage,
    ) -> Result<(), ProtocolError>;

    /// Whether this protocol wants to look at the given ledger event.
    fn accepts_ledger_event(&self, event: &LedgerEvent) -> bool;

    async fn handle_ledger_event(
        &self,
        event: &LedgerEvent,
    ) -> Result<Option<LedgerEventOutcome>, ProtocolError>;

    /// The ledger this agreement is witnessed on, empty when ledger-less.
    fn known_ledger(&self, agreement: &Agreement) -> LedgerRef;

    fn is_ledger_writable(&self, agreement: &Agreement) -> bool;
    fn is_ledger_client_available(&self, ledger: &LedgerRef) -> bool;
    fn is_agreement_verifiable(&self, agreement: &Agreement) -> bool;

    /// Check whether the agreement is recorded on its ledger.
    async fn verify_agreement(&self, agreement: &Agreement) -> Result<bool, ProtocolError>;

    /// Cancel the agreement at the protocol level. Blocking; run detached.
    async fn terminate_agreement(
        &self,
        agreement: &Agreement,
        reason: u32,
    ) -> Result<(), ProtocolError>;

    /// Record a metering notification on the ledger. Best effort.
    async fn record_meter(
        &self,
        agreement: &Agreement,
        meter: &MeteringNotification,
    ) -> Result<(), ProtocolError>;

    /// Push our ledger-specific agreement parameters to the consumer if it
    /// has not acknowledged them yet.
    async fn update_consumer(&self, agreement: &Agreement);

    /// Re-send pending consumer updates, typically after the ledger became
    /// writable.
    async fn update_consumers(&self);

    fn set_ledger_client_available(&self, ledger: &LedgerRef);
    fn set_ledger_client_stopped(&self, ledger: &LedgerRef);
    fn set_ledger_writable(&self, ledger: &LedgerRef);
}

/// Pull the protocol name out of a raw broker message without dispatching
/// to any handler.
pub fn extract_protocol(msg: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Header {
        protocol: String,
    }
    serde_json::from_str::<Header>(msg).ok().map(|h| h.protocol)
}

/// Name-to-handler map, initialized once at startup and read-only after.
pub struct ProtocolRegistry {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new(handlers: Vec<Arc<dyn ProtocolHandler>>) -> Self {
        Self {
            handlers: handlers
                .into_iter()
                .map(|h| (h.name().to_string(), h))
                .collect(),
        }
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(protocol).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ProtocolHandler>)> {
        self.handlers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_protocol_reads_header() {
        assert_eq!(
            extract_protocol(r#"{"protocol":"Basic","type":"cancel"}"#),
            Some("Basic".to_string())
        );
        assert_eq!(extract_protocol(r#"{"type":"cancel"}"#), None);
        assert_eq!(extract_protocol("not json"), None);
    }
}
