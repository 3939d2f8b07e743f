// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Events crossing the governance boundary.
//
// `AgentEvent` is the single ordered input feed: every external collaborator
// (container worker, image fetcher, ledger client, registry poller, node
// lifecycle) reports through it. `CollaboratorEvent` is the outbound side,
// published on the broadcast bus for whichever collaborator cares.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::domain::agreement::{AgreementId, LedgerRef};
use crate::domain::protocol::LedgerEvent;

/// A decoded message pulled from the node's registry inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub msg_id: u64,
    /// Identity of the sending broker.
    pub broker_id: String,
    pub broker_pub_key: String,
    /// The protocol-level payload; handlers decode it further.
    pub protocol_message: String,
}

/// Which launch an image-fetch failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchTarget {
    Agreement {
        protocol: String,
        agreement_id: AgreementId,
    },
    Microservice {
        instance_key: String,
    },
}

/// Why an image fetch failed, reported by the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFetchFailure {
    DataError,
    FetchError,
    AuthError,
    SignatureError,
}

/// Everything the outside world can tell the governance core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    /// The node completed registration with the registry.
    RegistrationComplete {
        org: String,
        device_id: String,
        token: String,
        pattern: String,
    },
    WorkloadExecutionBegun {
        protocol: String,
        agreement_id: AgreementId,
        deployment: serde_json::Value,
    },
    WorkloadExecutionFailed {
        protocol: String,
        agreement_id: AgreementId,
        deployment: serde_json::Value,
    },
    WorkloadImageLoadFailed {
        protocol: String,
        agreement_id: AgreementId,
        deployment: serde_json::Value,
    },
    WorkloadDestroyed {
        protocol: String,
        agreement_id: AgreementId,
    },
    ImageFetchFailed {
        target: FetchTarget,
        failure: ImageFetchFailure,
    },
    /// Microservice container lifecycle, keyed by opaque instance key.
    ContainerLaunchBegun {
        instance_key: String,
    },
    ContainerLaunchFailed {
        instance_key: String,
    },
    ContainerImageLoadFailed {
        instance_key: String,
    },
    MicroserviceContainersDestroyed {
        instance_key: String,
    },
    LedgerEventReceived {
        event: LedgerEvent,
    },
    LedgerClientInitialized {
        ledger: LedgerRef,
    },
    LedgerClientStopping {
        ledger: LedgerRef,
    },
    /// The ledger account is funded, so the client can write.
    LedgerClientFunded {
        ledger: LedgerRef,
    },
    ExchangeMessageReceived {
        message: InboundMessage,
    },
    NodeShutdownRequested,
    NodeShutdownComplete,
}

/// Everything the node launches a workload with: identity variables plus
/// the merged user-input environment, and the services pinned for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchContext {
    pub protocol: String,
    pub agreement_id: AgreementId,
    pub deployment: serde_json::Value,
    pub environment: HashMap<String, String>,
    pub services: Vec<ServicePin>,
}

/// A dependent service resolved to one concrete version for a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePin {
    pub org: String,
    pub url: String,
    pub version: String,
    /// Local definition record backing this pin.
    pub def_id: String,
}

/// Outbound notifications to external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollaboratorEvent {
    /// Agreement accepted; the container collaborator may start fetching
    /// and launching.
    AgreementReached { launch: LaunchContext },
    /// Tear the workload down.
    WorkloadCancel {
        protocol: String,
        agreement_id: AgreementId,
        deployment: serde_json::Value,
    },
    /// Verify the workload containers are still up; failures come back as
    /// `AgentEvent`s.
    ContainerMaintain {
        protocol: String,
        agreement_id: AgreementId,
        deployment: serde_json::Value,
    },
    /// The set of ledgers current agreements need, per ledger type:
    /// org -> names.
    NeededLedgers {
        ledger_type: String,
        needed: HashMap<String, HashSet<String>>,
    },
    /// Start a ledger client for an agreement that names one.
    NewLedgerClient { ledger: LedgerRef },
    /// Node shutdown has drained the loops; unconfigure the node.
    UnconfigureNode,
}
