// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trait seams between the bridge, the caller's callback table and the engine.
//
// `SessionCallbacks` is what the caller registers once per session. The C
// surface in `ffi` implements it over a table of nullable function pointers;
// Rust callers implement it directly. `EngineClient` is the external transfer
// engine as seen by the bridge.

use std::fmt;
use std::sync::Arc;

use wormhole_core::error::{Result, StreamError};
use wormhole_core::types::{
    CodegenOutcome, FileMetadata, OfferDecision, Progress, SlotSet, TransferOutcome,
    TransferRequest, Whence,
};

use crate::transfer::Transfer;

/// The caller's callback table.
///
/// Every method is invoked on the engine worker that runs the session's
/// operation, never concurrently for one session. Stream callbacks are only
/// reached for slots reported by [`registered`](Self::registered).
pub trait SessionCallbacks: Send + Sync {
    /// Slots this table actually provides. Defaults to all nine.
    fn registered(&self) -> SlotSet {
        SlotSet::all()
    }

    /// Fill `buffer` from the caller's source. `Ok(0)` is end of stream.
    ///
    /// A file source must yield as many bytes as seeking to its end reports.
    /// Ending early fails the send, and the receiver sees a cancellation.
    fn read(&self, buffer: &mut [u8]) -> std::result::Result<usize, StreamError>;

    /// Reposition the caller's source and return the new absolute offset.
    fn seek(&self, offset: i64, whence: Whence) -> std::result::Result<u64, StreamError>;

    /// Consume all of `buffer` into the caller's sink.
    fn write(&self, buffer: &[u8]) -> std::result::Result<(), StreamError>;

    /// Borrowed view of the session's progress slot, valid for this call only.
    fn on_progress(&self, progress: &Progress);

    /// Terminal envelope of a send or receive. Ownership moves to the caller.
    fn on_result(&self, result: TransferOutcome);

    /// Terminal envelope of a code-generation session.
    fn on_codegen_result(&self, result: CodegenOutcome);

    /// Inbound file offer. The answer decides whether the transfer proceeds.
    fn on_metadata(&self, metadata: FileMetadata) -> OfferDecision;

    fn log(&self, message: &str);

    /// Hand the engine's session state back to the caller, exactly once.
    fn release_session_state(&self, state: Box<SessionState>);
}

// ---------------------------------------------------------------------------
// Engine side
// ---------------------------------------------------------------------------

/// Work the bridge hands to an engine worker: drive one operation to its
/// terminal envelope and return the transfer (and its scratch) to the session.
pub type Job = Box<dyn FnOnce() -> Transfer + Send + 'static>;

/// A transfer engine client bound to one session's configuration.
pub trait EngineClient: Send + Sync {
    /// Drive `request` to completion, calling back through `transfer`.
    ///
    /// Runs on the worker started by [`spawn`](Self::spawn). Returning without
    /// a terminal envelope is allowed; the bridge then synthesizes a failure.
    fn run(&self, request: &TransferRequest, transfer: &mut Transfer);

    /// Start `job` on one of the engine's workers.
    fn spawn(&self, job: Job) -> Result<InFlight>;
}

/// Handle on an operation running on an engine worker.
pub struct InFlight {
    join: Box<dyn FnOnce() -> Option<Transfer> + Send>,
}

impl InFlight {
    /// `join` blocks until the worker returns the transfer, or yields `None`
    /// if the worker died without returning it.
    pub fn new(join: impl FnOnce() -> Option<Transfer> + Send + 'static) -> Self {
        Self {
            join: Box::new(join),
        }
    }

    pub fn join(self) -> Option<Transfer> {
        (self.join)()
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InFlight")
    }
}

/// Engine-side state attached to a session after creation.
///
/// Owned by the session once attached; given back to the caller through
/// `release_session_state` at teardown.
pub struct SessionState {
    client: Arc<dyn EngineClient>,
}

impl SessionState {
    pub fn new(client: Arc<dyn EngineClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Arc<dyn EngineClient> {
        Arc::clone(&self.client)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState").finish_non_exhaustive()
    }
}
