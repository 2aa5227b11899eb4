// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trampolines: the entry points an engine calls to reach the caller's
// callbacks.
//
// A `Transfer` is created when a session starts its operation, moves onto the
// engine worker, and comes back to the session when the worker finishes. It
// enforces the delivery rules on the way through: progress never goes
// backwards, metadata precedes any progress, exactly one terminal envelope is
// delivered, and nothing reaches the caller after it.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use tracing::{debug, info, warn};
use wormhole_core::error::{BridgeError, Result, StreamError};
use wormhole_core::types::{
    CallbackSlot, CodegenOutcome, FileMetadata, OfferDecision, OperationClass, Progress,
    SessionId, SessionPhase, SlotSet, TransferFailure, TransferId, TransferOutcome, Whence,
};

use crate::scratch::Scratch;
use crate::session::PhaseCell;
use crate::traits::SessionCallbacks;

/// Largest buffer handed to the caller's `read` in one call.
pub const MAX_READ_CHUNK: usize = 64 * 1024;

/// Failure message used when an engine returns without a terminal envelope.
pub const ENGINE_GAVE_NO_RESULT: &str = "engine finished without a result";

pub struct Transfer {
    session: SessionId,
    operation: OperationClass,
    callbacks: Arc<dyn SessionCallbacks>,
    registered: SlotSet,
    phase: PhaseCell,
    scratch: Scratch,
    worker: Arc<OnceLock<ThreadId>>,
    metadata_seen: bool,
    progress_seen: bool,
    terminal: bool,
}

impl Transfer {
    pub(crate) fn new(
        session: SessionId,
        operation: OperationClass,
        callbacks: Arc<dyn SessionCallbacks>,
        phase: PhaseCell,
        scratch: Scratch,
        worker: Arc<OnceLock<ThreadId>>,
    ) -> Self {
        let registered = callbacks.registered();
        Self {
            session,
            operation,
            callbacks,
            registered,
            phase,
            scratch,
            worker,
            metadata_seen: false,
            progress_seen: false,
            terminal: false,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn operation(&self) -> OperationClass {
        self.operation
    }

    /// Whether the terminal envelope has been delivered.
    pub fn is_finished(&self) -> bool {
        self.terminal
    }

    /// Last progress reported, or the unknown-total default.
    pub fn progress(&self) -> Progress {
        self.scratch.progress.unwrap_or_default()
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    pub(crate) fn into_scratch(self) -> Scratch {
        self.scratch
    }

    /// Std I/O adaptor over the caller's `read`/`seek`/`write` slots.
    pub fn stream(&mut self) -> TransferStream<'_> {
        TransferStream { transfer: self }
    }

    /// Every trampoline for one session must run on the same worker thread.
    /// A second thread means the engine broke its contract; that is fatal.
    fn claim_thread(&self) {
        let current = thread::current().id();
        let owner = *self.worker.get_or_init(|| current);
        assert!(
            owner == current,
            "session {} was called back from a second engine thread",
            self.session
        );
    }

    fn stream_guard(&self, slot: CallbackSlot) -> std::result::Result<(), StreamError> {
        if self.terminal {
            return Err(StreamError::new(format!(
                "{slot} after the session delivered its result"
            )));
        }
        if !self.registered.contains(slot) {
            return Err(StreamError::new(format!("no `{slot}` callback registered")));
        }
        Ok(())
    }

    // -- Stream trampolines --

    pub fn read(&mut self, buffer: &mut [u8]) -> std::result::Result<usize, StreamError> {
        self.claim_thread();
        self.stream_guard(CallbackSlot::Read)?;
        let limit = buffer.len().min(MAX_READ_CHUNK);
        let read = self.callbacks.read(&mut buffer[..limit])?;
        if read > limit {
            return Err(StreamError::new(format!(
                "read callback reported {read} bytes for a {limit} byte buffer"
            )));
        }
        Ok(read)
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> std::result::Result<u64, StreamError> {
        self.claim_thread();
        self.stream_guard(CallbackSlot::Seek)?;
        self.callbacks.seek(offset, whence)
    }

    pub fn write(&mut self, buffer: &[u8]) -> std::result::Result<(), StreamError> {
        self.claim_thread();
        self.stream_guard(CallbackSlot::Write)?;
        self.callbacks.write(buffer)
    }

    /// Length of the caller's source, found by seeking to its end. The source
    /// is rewound to the start afterwards.
    pub fn source_len(&mut self) -> std::result::Result<u64, StreamError> {
        let length = self.seek(0, Whence::End)?;
        self.seek(0, Whence::Start)?;
        Ok(length)
    }

    // -- Envelope trampolines --

    /// Record progress and show it to the caller.
    ///
    /// `transferred` never decreases within a session and is clamped to the
    /// total; the first known total sticks.
    pub fn update_progress(&mut self, transferred: i64, total: i64) {
        self.claim_thread();
        if self.terminal {
            warn!(session = %self.session, "progress after the terminal result dropped");
            return;
        }

        let previous = self.scratch.progress.unwrap_or_default();
        let total = if previous.total_known() {
            previous.total_bytes
        } else {
            total.max(Progress::UNKNOWN_TOTAL)
        };
        let mut transferred = transferred.max(previous.transferred_bytes);
        if total >= 0 {
            transferred = transferred.min(total);
        }

        self.progress_seen = true;
        let progress = self
            .scratch
            .progress
            .insert(Progress::new(transferred, total));
        if self.registered.contains(CallbackSlot::Progress) {
            self.callbacks.on_progress(progress);
        }
    }

    /// Present an inbound file offer to the caller and return their answer.
    ///
    /// Without a metadata callback the offer is accepted and the envelope
    /// stays in scratch until teardown.
    pub fn offer_metadata(
        &mut self,
        length: i64,
        file_name: &str,
        transfer_id: TransferId,
    ) -> Result<OfferDecision> {
        self.claim_thread();
        if self.terminal {
            return Err(BridgeError::OutOfOrder(
                "metadata after the terminal result".into(),
            ));
        }
        if self.metadata_seen {
            return Err(BridgeError::OutOfOrder("second metadata envelope".into()));
        }
        if self.progress_seen {
            return Err(BridgeError::OutOfOrder("metadata after progress".into()));
        }
        self.metadata_seen = true;

        let metadata = FileMetadata {
            length,
            file_name: file_name.to_owned(),
            transfer_id,
            session: self.session,
        };
        if !self.registered.contains(CallbackSlot::Metadata) {
            debug!(session = %self.session, file = %file_name, "no metadata callback, accepting offer");
            self.scratch.metadata = Some(metadata);
            return Ok(OfferDecision::Accept);
        }

        let decision = self.callbacks.on_metadata(metadata);
        debug!(session = %self.session, file = %file_name, ?decision, "offer answered");
        Ok(decision)
    }

    /// Deliver the terminal envelope of a send or receive.
    pub fn deliver_result(&mut self, outcome: TransferOutcome) {
        self.claim_thread();
        if self.terminal {
            warn!(session = %self.session, kind = ?outcome.kind(), "second terminal result dropped");
            return;
        }
        if self.operation == OperationClass::GenerateCode {
            warn!(session = %self.session, "transfer result on a code-generation session dropped");
            return;
        }

        self.terminal = true;
        let phase = match &outcome {
            TransferOutcome::Success { .. } => SessionPhase::Resulted,
            TransferOutcome::Failed {
                failure: TransferFailure::Cancelled | TransferFailure::Rejected,
                ..
            } => SessionPhase::Cancelled,
            TransferOutcome::Failed { .. } => SessionPhase::Errored,
        };
        self.phase.set(phase);
        info!(session = %self.session, kind = ?outcome.kind(), "transfer finished");

        if self.registered.contains(CallbackSlot::Result) {
            self.callbacks.on_result(outcome);
        } else {
            self.scratch.result = Some(outcome);
        }
    }

    /// Deliver the terminal envelope of a code-generation session.
    pub fn deliver_codegen(&mut self, outcome: CodegenOutcome) {
        self.claim_thread();
        if self.terminal {
            warn!(session = %self.session, kind = ?outcome.kind(), "second codegen result dropped");
            return;
        }
        if self.operation != OperationClass::GenerateCode {
            warn!(session = %self.session, "codegen result on a transfer session dropped");
            return;
        }

        self.terminal = true;
        self.phase.set(if outcome.is_success() {
            SessionPhase::Resulted
        } else {
            SessionPhase::Errored
        });
        info!(session = %self.session, kind = ?outcome.kind(), "code generation finished");

        if self.registered.contains(CallbackSlot::CodegenResult) {
            self.callbacks.on_codegen_result(outcome);
        } else {
            self.scratch.codegen = Some(outcome);
        }
    }

    /// Forward an engine diagnostic. Mirrored into `tracing` either way.
    pub fn log(&mut self, message: &str) {
        self.claim_thread();
        debug!(session = %self.session, "engine: {message}");
        if !self.terminal && self.registered.contains(CallbackSlot::Log) {
            self.callbacks.log(message);
        }
    }

    /// Close out the operation. If the engine never delivered a terminal
    /// envelope, a failure of the operation's fallback kind is delivered.
    pub(crate) fn finish(&mut self) {
        self.fail_unfinished(ENGINE_GAVE_NO_RESULT);
    }

    /// Deliver the operation's fallback failure carrying `reason`, unless a
    /// terminal envelope already went out.
    pub(crate) fn fail_unfinished(&mut self, reason: &str) {
        if self.terminal {
            return;
        }
        warn!(
            session = %self.session,
            operation = %self.operation,
            reason,
            "no terminal envelope from engine"
        );
        match self.operation.fallback_failure() {
            Some(failure) => self.deliver_result(TransferOutcome::failed(failure, reason)),
            None => self.deliver_codegen(CodegenOutcome::CodeGenerationFailed(reason.into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Std I/O adaptor
// ---------------------------------------------------------------------------

/// `Read + Write + Seek` over a transfer's stream trampolines, for engines
/// written against std I/O.
pub struct TransferStream<'a> {
    transfer: &'a mut Transfer,
}

impl Read for TransferStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.transfer.read(buf)?)
    }
}

impl Write for TransferStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transfer.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for TransferStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = Whence::split(pos);
        Ok(self.transfer.seek(offset, whence)?)
    }
}
