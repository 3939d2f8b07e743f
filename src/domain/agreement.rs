// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Opaque agreement identifier assigned by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgreementId(String);

impl AgreementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgreementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ledger an agreement is witnessed on. All fields empty for ledger-less
/// protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerRef {
    pub ledger_type: String,
    pub name: String,
    pub org: String,
}

impl LedgerRef {
    pub fn new(
        ledger_type: impl Into<String>,
        name: impl Into<String>,
        org: impl Into<String>,
    ) -> Self {
        Self {
            ledger_type: ledger_type.into(),
            name: name.into(),
            org: org.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// Latest metering notification received from the broker for an agreement.
/// The all-zero default means "never received".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeteringNotification {
    pub amount: u64,
    pub start_time: u64,
    pub current_time: u64,
    pub missed_time: u64,
    pub consumer_signature: String,
    pub agreement_hash: String,
}

impl MeteringNotification {
    pub fn is_set(&self) -> bool {
        *self != Self::default()
    }
}

/// One agreement the node has entered (or is entering) with a broker.
///
/// Identity is `(protocol, id)`. The lifecycle timestamps are seconds since
/// the epoch with 0 meaning "not reached"; they only ever move from zero to
/// a value, in the order
///
/// ```text
/// created -> accepted -> finalized -> execution_started
///                                        -> data_received
///                                        -> metering (latest value kept)
/// terminated -> workload_terminated && protocol_terminated -> archived
/// ```
///
/// `force_terminated_time` is set independently when a local operator
/// overrides a cancellation already in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agreement {
    pub protocol: String,
    pub id: AgreementId,
    /// Marshalled proposal exactly as received; demarshalled on demand by
    /// the protocol handler.
    pub proposal: String,
    pub consumer_id: String,
    pub ledger: LedgerRef,
    /// Deployment description handed to the container collaborator; opaque
    /// to governance.
    pub deployment: serde_json::Value,
    pub creation_time: u64,
    pub accepted_time: u64,
    pub finalized_time: u64,
    pub execution_started_time: u64,
    pub data_received_time: u64,
    pub metering: MeteringNotification,
    pub terminated_time: u64,
    pub terminated_reason: u32,
    pub terminated_description: String,
    pub workload_terminated_time: u64,
    pub protocol_terminated_time: u64,
    pub force_terminated_time: u64,
    pub archived: bool,
}

impl Agreement {
    pub fn new(
        protocol: impl Into<String>,
        id: AgreementId,
        proposal: impl Into<String>,
        consumer_id: impl Into<String>,
        ledger: LedgerRef,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            id,
            proposal: proposal.into(),
            consumer_id: consumer_id.into(),
            ledger,
            deployment: serde_json::Value::Null,
            creation_time: now_secs(),
            accepted_time: 0,
            finalized_time: 0,
            execution_started_time: 0,
            data_received_time: 0,
            metering: MeteringNotification::default(),
            terminated_time: 0,
            terminated_reason: 0,
            terminated_description: String::new(),
            workload_terminated_time: 0,
            protocol_terminated_time: 0,
            force_terminated_time: 0,
            archived: false,
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminated_time != 0
    }

    /// Both cleanup confirmations are in, so the row can be archived.
    pub fn cleanup_complete(&self) -> bool {
        self.workload_terminated_time != 0 && self.protocol_terminated_time != 0
    }
}

/// Composable predicate over agreement rows. A store scan returns rows
/// matching every filter in the list.
pub type AgreementFilter = Box<dyn Fn(&Agreement) -> bool + Send + Sync>;

pub fn unarchived() -> AgreementFilter {
    Box::new(|a| !a.archived)
}

pub fn with_id(id: AgreementId) -> AgreementFilter {
    Box::new(move |a| a.id == id)
}

pub fn with_any_id(ids: Vec<AgreementId>) -> AgreementFilter {
    Box::new(move |a| ids.contains(&a.id))
}

/// Created but neither finalized-and-done nor terminating; the agreement
/// governor's working set.
pub fn not_yet_final() -> AgreementFilter {
    Box::new(|a| a.creation_time != 0 && a.terminated_time == 0)
}

/// Workload containers are (supposed to be) up.
pub fn running() -> AgreementFilter {
    Box::new(|a| a.execution_started_time != 0 && a.terminated_time == 0)
}

pub fn matches_all(agreement: &Agreement, filters: &[AgreementFilter]) -> bool {
    filters.iter().all(|f| f(agreement))
}

/// Current wall clock in whole seconds, the resolution of the lifecycle
/// timestamps.
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreement() -> Agreement {
        Agreement::new(
            "Basic",
            AgreementId::new("ag-1"),
            "{}",
            "broker-1",
            LedgerRef::default(),
        )
    }

    #[test]
    fn metering_sentinel_distinguishes_unset() {
        let mut m = MeteringNotification::default();
        assert!(!m.is_set());
        m.amount = 1;
        assert!(m.is_set());
    }

    #[test]
    fn filters_compose() {
        let mut a = agreement();
        assert!(matches_all(&a, &[unarchived(), not_yet_final()]));
        a.terminated_time = now_secs();
        assert!(!matches_all(&a, &[unarchived(), not_yet_final()]));
        assert!(matches_all(&a, &[unarchived(), with_id(AgreementId::new("ag-1"))]));
        a.archived = true;
        assert!(!matches_all(&a, &[unarchived()]));
    }

    #[test]
    fn running_filter_requires_execution() {
        let mut a = agreement();
        assert!(!matches_all(&a, &[running()]));
        a.execution_started_time = now_secs();
        assert!(matches_all(&a, &[running()]));
        a.terminated_time = now_secs();
        assert!(!matches_all(&a, &[running()]));
    }

    #[test]
    fn cleanup_complete_needs_both_confirmations() {
        let mut a = agreement();
        a.terminated_time = now_secs();
        a.workload_terminated_time = now_secs();
        assert!(!a.cleanup_complete());
        a.protocol_terminated_time = now_secs();
        assert!(a.cleanup_complete());
    }
}
