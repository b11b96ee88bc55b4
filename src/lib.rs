// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod http;
pub mod messages;
pub mod metrics;
pub mod observer;
pub mod registry;
pub mod shutdown;
pub mod transport;
