// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Invalid value for {field}: {value:?}")]
    InvalidParam { field: String, value: String },
    #[error("No command set. Try /serverinfo")]
    NoCommand,
    #[error("Unknown command '{0}'. Try /serverinfo or /ping")]
    UnknownCommand(String),
    #[error("downstream send failed: {0}")]
    Downstream(String),
    #[error("request id {0} is already pending")]
    DuplicateRequest(u64),
    #[error("shutdown in progress")]
    ShuttingDown,
    #[error("http bind error: {0}")]
    Bind(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn invalid(field: &str, value: &str) -> Self {
        BridgeError::InvalidParam {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}
