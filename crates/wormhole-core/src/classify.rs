// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Failure classification for engine error text.
//
// Engines report failures as human-readable strings. Some of those strings
// mean the peer went away or said no, which the caller should see as a
// cancellation or rejection rather than a generic I/O failure.

use crate::types::{OperationClass, TransferFailure, TransferOutcome};

pub const ERR_CONTEXT_CANCELLED: &str = "context canceled";
pub const ERR_BROKEN_PIPE: &str = "write: broken pipe";
pub const ERR_UNEXPECTED_EOF: &str = "unexpected EOF";
pub const ERR_TRANSFER_REJECTED: &str = "transfer rejected";
pub const ERR_FAILED_TO_GET_READER: &str = "failed to get reader";

/// Pick the failure kind for `message`, starting from `fallback`.
pub fn classify_failure(fallback: TransferFailure, message: &str) -> TransferFailure {
    let cancelled = match fallback {
        TransferFailure::SendFile => {
            message.contains(ERR_BROKEN_PIPE) || message.contains(ERR_CONTEXT_CANCELLED)
        }
        TransferFailure::ReceiveFile => {
            message.contains(ERR_UNEXPECTED_EOF)
                || message.contains(ERR_CONTEXT_CANCELLED)
                || message.contains(ERR_FAILED_TO_GET_READER)
        }
        _ => false,
    };
    if cancelled {
        return TransferFailure::Cancelled;
    }

    if message.contains(ERR_TRANSFER_REJECTED) {
        return TransferFailure::Rejected;
    }

    fallback
}

/// Build a failed outcome for `operation`, classifying `message`.
///
/// Code generation has no transfer failure kinds; callers building a
/// codegen outcome should not route through here, and get a plain
/// `SendText` failure if they do.
pub fn failure_outcome(operation: OperationClass, message: impl Into<String>) -> TransferOutcome {
    let message = message.into();
    let fallback = operation
        .fallback_failure()
        .unwrap_or(TransferFailure::SendText);
    TransferOutcome::failed(classify_failure(fallback, &message), message)
}
