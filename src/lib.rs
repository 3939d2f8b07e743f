// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Edge agreement governance core.
//!
//! The library that keeps an edge node honest about the workloads it has
//! agreed to run. Brokers offer workload agreements over one of several
//! agreement protocols; once a proposal is accepted this crate tracks the
//! agreement through finalization, execution, metering, and termination,
//! drives the timeout rules, and coordinates cleanup across the container,
//! microservice, and ledger collaborators.
//!
//! # Architecture
//!
//! - **domain:** agreement rows and lifecycle, protocol handler contracts,
//!   deployment directives and user-input schemas, collaborator traits
//! - **application:** the single-writer command processor, governance
//!   loops, termination pipeline, and the user-input compatibility evaluator
//! - **infrastructure:** event bus, agreement stores, registry HTTP client,
//!   concrete protocol handlers

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
