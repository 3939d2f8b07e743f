// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agreement;
pub mod commands;
pub mod config;
pub mod deployment;
pub mod events;
pub mod protocol;
pub mod repository;
pub mod version;
pub mod workload;
