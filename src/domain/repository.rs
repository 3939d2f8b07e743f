// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agreement store contract.
//
// The store keeps exactly one unarchived row per (protocol, agreement id).
// Updates are strictly additive single-timestamp writes or the archived
// flip; each lifecycle transition names the one field it sets. Stores
// enforce the lifecycle rules so no caller can corrupt a row:
//
// - archived rows are immutable
// - once terminated, forward-progress timestamps can no longer be set
// - re-recording an already-set timestamp is a no-op

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::agreement::{Agreement, AgreementFilter, AgreementId, MeteringNotification};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("agreement not found: {0}")]
    NotFound(String),
    #[error("duplicate unarchived agreement: {0}")]
    Duplicate(String),
    #[error("invalid lifecycle transition: {0}")]
    InvalidTransition(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A lifecycle transition. Each variant writes exactly one timestamp field
/// (plus the reason pair for `Terminated`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleTransition {
    Accepted,
    Finalized,
    ExecutionStarted,
    DataReceived,
    Terminated { reason: u32, description: String },
    WorkloadTerminated,
    ProtocolTerminated,
    ForceTerminated,
}

impl LifecycleTransition {
    /// True for transitions that move the agreement forward; these are the
    /// ones a termination blocks.
    pub fn is_forward_progress(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Finalized | Self::ExecutionStarted | Self::DataReceived
        )
    }
}

/// Durable, queryable record of every agreement, partitioned by protocol.
///
/// One task (the command processor) is the sole writer; reads may happen
/// concurrently from the governance loops.
#[async_trait]
pub trait AgreementStore: Send + Sync {
    async fn insert(&self, agreement: Agreement) -> Result<(), StoreError>;

    /// The unarchived row for `(protocol, id)`, if any.
    async fn find(
        &self,
        protocol: &str,
        id: &AgreementId,
    ) -> Result<Option<Agreement>, StoreError>;

    /// Rows of one protocol matching every filter.
    async fn find_by_protocol(
        &self,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> Result<Vec<Agreement>, StoreError>;

    /// Rows across the given protocols matching every filter.
    async fn find_all_protocols(
        &self,
        protocols: &[String],
        filters: &[AgreementFilter],
    ) -> Result<Vec<Agreement>, StoreError>;

    /// Apply one lifecycle transition and return the updated row.
    async fn record(
        &self,
        protocol: &str,
        id: &AgreementId,
        transition: LifecycleTransition,
    ) -> Result<Agreement, StoreError>;

    /// Replace the latest metering notification.
    async fn record_metering(
        &self,
        protocol: &str,
        id: &AgreementId,
        meter: MeteringNotification,
    ) -> Result<Agreement, StoreError>;

    /// Record the deployment description once execution is being governed.
    async fn record_deployment(
        &self,
        protocol: &str,
        id: &AgreementId,
        deployment: serde_json::Value,
    ) -> Result<Agreement, StoreError>;

    /// Mark the row immutable history.
    async fn archive(&self, protocol: &str, id: &AgreementId) -> Result<Agreement, StoreError>;

    /// Remove the row entirely. Used when the agreement was never accepted,
    /// so there is nothing to audit.
    async fn delete(&self, protocol: &str, id: &AgreementId) -> Result<(), StoreError>;
}

/// The unarchived rows matching any of `ids`, across all protocols. The
/// front-end uses this to answer agreement queries by id.
pub async fn find_with_ids(
    store: &dyn AgreementStore,
    protocols: &[String],
    ids: Vec<AgreementId>,
) -> Result<Vec<Agreement>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    store
        .find_all_protocols(
            protocols,
            &[
                crate::domain::agreement::unarchived(),
                crate::domain::agreement::with_any_id(ids),
            ],
        )
        .await
}

/// Apply one transition to a row in place, enforcing the lifecycle rules.
/// Store implementations share this so the rules cannot drift.
pub fn apply_transition(
    agreement: &mut Agreement,
    transition: &LifecycleTransition,
    now: u64,
) -> Result<(), StoreError> {
    if agreement.archived {
        return Err(StoreError::InvalidTransition(format!(
            "agreement {} is archived",
            agreement.id
        )));
    }
    if transition.is_forward_progress() && agreement.is_terminating() {
        return Err(StoreError::InvalidTransition(format!(
            "agreement {} is terminating",
            agreement.id
        )));
    }

    fn set_if_zero(field: &mut u64, now: u64) {
        if *field == 0 {
            *field = now;
        }
    }

    match transition {
        LifecycleTransition::Accepted => set_if_zero(&mut agreement.accepted_time, now),
        LifecycleTransition::Finalized => set_if_zero(&mut agreement.finalized_time, now),
        LifecycleTransition::ExecutionStarted => {
            set_if_zero(&mut agreement.execution_started_time, now)
        }
        LifecycleTransition::DataReceived => set_if_zero(&mut agreement.data_received_time, now),
        LifecycleTransition::Terminated {
            reason,
            description,
        } => {
            if agreement.terminated_time == 0 {
                agreement.terminated_time = now;
                agreement.terminated_reason = *reason;
                agreement.terminated_description = description.clone();
            }
        }
        LifecycleTransition::WorkloadTerminated => {
            set_if_zero(&mut agreement.workload_terminated_time, now)
        }
        LifecycleTransition::ProtocolTerminated => {
            set_if_zero(&mut agreement.protocol_terminated_time, now)
        }
        LifecycleTransition::ForceTerminated => {
            set_if_zero(&mut agreement.force_terminated_time, now)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agreement::LedgerRef;

    fn agreement() -> Agreement {
        Agreement::new(
            "Basic",
            AgreementId::new("ag"),
            "{}",
            "broker",
            LedgerRef::default(),
        )
    }

    #[test]
    fn forward_progress_follows_lifecycle_order() {
        let mut ag = agreement();
        let order = [
            LifecycleTransition::Accepted,
            LifecycleTransition::Finalized,
            LifecycleTransition::ExecutionStarted,
            LifecycleTransition::DataReceived,
        ];
        for (i, t) in order.iter().enumerate() {
            apply_transition(&mut ag, t, 100 + i as u64).unwrap();
        }
        assert_eq!(ag.accepted_time, 100);
        assert_eq!(ag.finalized_time, 101);
        assert_eq!(ag.execution_started_time, 102);
        assert_eq!(ag.data_received_time, 103);
    }

    #[test]
    fn repeat_transition_is_noop() {
        let mut ag = agreement();
        apply_transition(&mut ag, &LifecycleTransition::Accepted, 100).unwrap();
        apply_transition(&mut ag, &LifecycleTransition::Accepted, 200).unwrap();
        assert_eq!(ag.accepted_time, 100);

        let term = LifecycleTransition::Terminated {
            reason: 1,
            description: "first".to_string(),
        };
        apply_transition(&mut ag, &term, 300).unwrap();
        let term2 = LifecycleTransition::Terminated {
            reason: 2,
            description: "second".to_string(),
        };
        apply_transition(&mut ag, &term2, 400).unwrap();
        assert_eq!(ag.terminated_time, 300);
        assert_eq!(ag.terminated_reason, 1);
    }

    #[test]
    fn termination_blocks_forward_progress() {
        let mut ag = agreement();
        apply_transition(
            &mut ag,
            &LifecycleTransition::Terminated {
                reason: 1,
                description: String::new(),
            },
            100,
        )
        .unwrap();
        assert!(apply_transition(&mut ag, &LifecycleTransition::Accepted, 200).is_err());
        assert!(apply_transition(&mut ag, &LifecycleTransition::Finalized, 200).is_err());
        // Cleanup timestamps still land.
        apply_transition(&mut ag, &LifecycleTransition::WorkloadTerminated, 200).unwrap();
        apply_transition(&mut ag, &LifecycleTransition::ProtocolTerminated, 201).unwrap();
        assert!(ag.cleanup_complete());
    }

    #[test]
    fn archived_rows_are_immutable() {
        let mut ag = agreement();
        ag.archived = true;
        assert!(apply_transition(&mut ag, &LifecycleTransition::Accepted, 100).is_err());
        assert!(
            apply_transition(&mut ag, &LifecycleTransition::WorkloadTerminated, 100).is_err()
        );
    }

    #[test]
    fn force_termination_is_independent() {
        let mut ag = agreement();
        apply_transition(&mut ag, &LifecycleTransition::ForceTerminated, 100).unwrap();
        assert_eq!(ag.force_terminated_time, 100);
        assert_eq!(ag.terminated_time, 0);
    }
}
