// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// The closed command set of the command processor. Every state transition
// in the agreement store happens while one of these is being handled.

use crate::domain::agreement::{AgreementId, LedgerRef};
use crate::domain::events::InboundMessage;
use crate::domain::protocol::LedgerEvent;

/// Which cleanup confirmation a `CleanupStatus` command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    WorkloadDestroyed,
    ProtocolTerminated,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Workload containers are up; start governing the execution.
    StartGovernExecution {
        protocol: String,
        agreement_id: AgreementId,
        deployment: serde_json::Value,
    },
    /// End the agreement for `reason`. Idempotent: unknown or
    /// already-terminating agreements are ignored.
    CleanupExecution {
        protocol: String,
        agreement_id: AgreementId,
        reason: u32,
        deployment: serde_json::Value,
    },
    /// One half of termination cleanup finished.
    CleanupStatus {
        protocol: String,
        agreement_id: AgreementId,
        status: CleanupStatus,
    },
    /// A message arrived in the registry inbox.
    ExchangeMessage { message: InboundMessage },
    /// The ledger collaborator observed an event.
    LedgerEvent { event: LedgerEvent },
    /// Protocol-level termination that could not run when the agreement was
    /// cancelled because the ledger was not writable.
    AsyncTermination {
        protocol: String,
        agreement_id: AgreementId,
        reason: u32,
    },
    LedgerClientInitialized { ledger: LedgerRef },
    LedgerClientStopping { ledger: LedgerRef },
    LedgerWritable { ledger: LedgerRef },
    /// Forwarded microservice container status.
    UpdateMicroservice {
        instance_key: String,
        started: bool,
        failure_code: u32,
        failure_description: String,
    },
    ReportDeviceStatus,
    /// Periodic tick from the agreement governor; the scan runs on the
    /// command processor so its writes serialize with everything else.
    GovernAgreements,
    NodeShutdown,
    NodeShutdownComplete,
    /// End the command processor.
    Terminate,
}

impl Command {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StartGovernExecution { .. } => "start-govern-execution",
            Self::CleanupExecution { .. } => "cleanup-execution",
            Self::CleanupStatus { .. } => "cleanup-status",
            Self::ExchangeMessage { .. } => "exchange-message",
            Self::LedgerEvent { .. } => "ledger-event",
            Self::AsyncTermination { .. } => "async-termination",
            Self::LedgerClientInitialized { .. } => "ledger-client-initialized",
            Self::LedgerClientStopping { .. } => "ledger-client-stopping",
            Self::LedgerWritable { .. } => "ledger-writable",
            Self::UpdateMicroservice { .. } => "update-microservice",
            Self::ReportDeviceStatus => "report-device-status",
            Self::GovernAgreements => "govern-agreements",
            Self::NodeShutdown => "node-shutdown",
            Self::NodeShutdownComplete => "node-shutdown-complete",
            Self::Terminate => "terminate",
        }
    }
}
