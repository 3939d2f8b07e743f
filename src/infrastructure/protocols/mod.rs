// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Concrete agreement protocol handlers.
//
// Both handlers share one JSON wire envelope; they differ in whether a
// ledger witnesses the agreement and in their termination code tables.

pub mod basic;
pub mod ledger;

pub use basic::BasicProtocolHandler;
pub use ledger::{LedgerConnector, LedgerProtocolHandler};

use serde::{Deserialize, Serialize};

use crate::domain::agreement::MeteringNotification;

/// The JSON envelope every broker message of these protocols uses.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub protocol: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
    /// Reply-ack: whether the broker still wants the agreement.
    #[serde(default)]
    pub decision: Option<bool>,
    /// Cancel: the broker's termination code.
    #[serde(default)]
    pub reason: Option<u32>,
    /// Meter notification payload.
    #[serde(default)]
    pub meter: Option<MeteringNotification>,
}

pub(crate) const KIND_REPLY_ACK: &str = "replyack";
pub(crate) const KIND_DATA_RECEIVED: &str = "datareceived";
pub(crate) const KIND_METER_NOTIFICATION: &str = "meternotification";
pub(crate) const KIND_CANCEL: &str = "cancel";

/// Parse `msg` as a wire envelope of `protocol` and `kind`; None when it is
/// anything else (callers try validators in order).
pub(crate) fn parse_wire(msg: &str, protocol: &str, kind: &str) -> Option<WireMessage> {
    let wire: WireMessage = serde_json::from_str(msg).ok()?;
    if wire.protocol == protocol && wire.kind == kind {
        Some(wire)
    } else {
        None
    }
}
