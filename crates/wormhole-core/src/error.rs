// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the bridge.

use thiserror::Error;

use crate::types::{CallbackSlot, OperationClass, SessionPhase};

/// Top-level error type for all bridge operations.
///
/// Transfer failures are not errors at this level: they travel to the caller
/// as terminal result envelopes. These variants cover what must be reported
/// synchronously instead.
#[derive(Debug, Error)]
pub enum BridgeError {
    // -- Configuration errors --
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("callback table is missing `{slot}`, required for {operation}")]
    IncompleteCallbacks {
        operation: OperationClass,
        slot: CallbackSlot,
    },

    #[error("invalid invitation code {0:?}")]
    InvalidCode(String),

    // -- Usage errors --
    #[error("session state is already attached")]
    AlreadyAttached,

    #[error("no session state attached")]
    NotAttached,

    #[error("{operation} is not allowed while the session is {phase}")]
    InvalidPhase {
        operation: OperationClass,
        phase: SessionPhase,
    },

    #[error("session was created for {expected}, not {requested}")]
    OperationMismatch {
        expected: OperationClass,
        requested: OperationClass,
    },

    #[error("envelope delivered out of order: {0}")]
    OutOfOrder(String),

    // -- Boundary errors --
    #[error("null pointer passed for `{0}`")]
    NullArgument(&'static str),

    #[error("`{0}` is not valid UTF-8")]
    InvalidString(&'static str),

    #[error("unknown or already destroyed session handle")]
    UnknownSession,

    #[error("session handle used from inside one of its own callbacks")]
    ReentrantCall,

    // -- Engine --
    #[error("engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by a caller's `read`, `seek` or `write` callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StreamError(pub String);

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        std::io::Error::other(err.0)
    }
}
