// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session context: one caller-owned handle per transfer operation.
//
// A session aggregates the registered callback table, the engine state
// attached after creation, and the scratch slots for in-flight envelopes.
// Every owned resource sits in an `Option` and is taken exactly once during
// teardown, whether the caller destroys the session or simply drops it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};
use wormhole_core::config::ClientConfig;
use wormhole_core::error::{BridgeError, Result};
use wormhole_core::types::{
    CallbackSlot, EnvelopeKind, OperationClass, SessionId, SessionPhase, TransferRequest,
};

use crate::scratch::Scratch;
use crate::traits::{InFlight, Job, SessionCallbacks, SessionState};
use crate::transfer::Transfer;

/// Prefix of the failure delivered when the engine panics mid-operation.
pub(crate) const ENGINE_PANICKED: &str = "engine panicked";

/// Lifecycle phase shared between a session and its in-flight transfer.
#[derive(Debug, Clone)]
pub(crate) struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub(crate) fn new(phase: SessionPhase) -> Self {
        Self(Arc::new(AtomicU8::new(phase as u8)))
    }

    pub(crate) fn get(&self) -> SessionPhase {
        SessionPhase::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(SessionPhase::Errored)
    }

    pub(crate) fn set(&self, phase: SessionPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|reason| (*reason).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// What a teardown released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// The attached session state was handed back to the caller.
    pub released_state: bool,
    /// Scratch envelopes the caller never took.
    pub released_envelopes: Vec<EnvelopeKind>,
}

pub struct SessionContext {
    id: SessionId,
    operation: OperationClass,
    config: ClientConfig,
    created_at: DateTime<Utc>,
    callbacks: Arc<dyn SessionCallbacks>,
    phase: PhaseCell,
    worker: Arc<OnceLock<ThreadId>>,
    state: Option<Box<SessionState>>,
    /// `None` while the in-flight transfer holds it.
    scratch: Option<Scratch>,
    in_flight: Option<InFlight>,
    torn_down: bool,
}

impl SessionContext {
    /// Create a session for `operation`.
    ///
    /// Fails before any engine is involved if the table lacks a slot the
    /// operation needs or the configuration is unusable.
    #[instrument(skip(callbacks, config))]
    pub fn create(
        callbacks: Arc<dyn SessionCallbacks>,
        config: ClientConfig,
        operation: OperationClass,
    ) -> Result<Self> {
        if let Some(slot) = callbacks
            .registered()
            .first_missing(operation.required_slots())
        {
            return Err(BridgeError::IncompleteCallbacks { operation, slot });
        }
        config.validate(operation)?;

        let id = SessionId::new();
        info!(session = %id, app_id = %config.app_id, "session created");
        Ok(Self {
            id,
            operation,
            config,
            created_at: Utc::now(),
            callbacks,
            phase: PhaseCell::new(SessionPhase::AwaitingAttach),
            worker: Arc::new(OnceLock::new()),
            state: None,
            scratch: Some(Scratch::default()),
            in_flight: None,
            torn_down: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn operation(&self) -> OperationClass {
        self.operation
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.get()
    }

    pub fn is_attached(&self) -> bool {
        self.state.is_some()
    }

    /// Scratch slots, available whenever no operation is in flight.
    pub fn scratch(&self) -> Option<&Scratch> {
        self.scratch.as_ref()
    }

    pub(crate) fn phase_cell(&self) -> PhaseCell {
        self.phase.clone()
    }

    /// Hand engine state to the session. Allowed once.
    pub fn attach_session_state(&mut self, state: Box<SessionState>) -> Result<()> {
        if self.state.is_some() {
            return Err(BridgeError::AlreadyAttached);
        }
        self.state = Some(state);
        self.phase.set(SessionPhase::Active);
        debug!(session = %self.id, "session state attached");
        Ok(())
    }

    // -- Operations --

    pub fn send_file(&mut self, file_name: &str) -> Result<()> {
        self.ensure_ready(OperationClass::SendFile)?;
        self.launch(TransferRequest::SendFile {
            code: self.code(),
            file_name: file_name.to_owned(),
        })
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.ensure_ready(OperationClass::SendText)?;
        self.launch(TransferRequest::SendText {
            code: self.code(),
            text: text.to_owned(),
        })
    }

    pub fn receive(&mut self) -> Result<()> {
        self.ensure_ready(OperationClass::Receive)?;
        self.launch(TransferRequest::Receive { code: self.code() })
    }

    pub fn generate_code(&mut self) -> Result<()> {
        self.ensure_ready(OperationClass::GenerateCode)?;
        self.launch(TransferRequest::GenerateCode)
    }

    fn code(&self) -> String {
        self.config.code.clone().unwrap_or_default()
    }

    fn ensure_ready(&self, requested: OperationClass) -> Result<()> {
        if requested != self.operation {
            return Err(BridgeError::OperationMismatch {
                expected: self.operation,
                requested,
            });
        }
        match self.phase.get() {
            SessionPhase::Active => Ok(()),
            SessionPhase::Created | SessionPhase::AwaitingAttach => Err(BridgeError::NotAttached),
            phase => Err(BridgeError::InvalidPhase {
                operation: requested,
                phase,
            }),
        }
    }

    fn launch(&mut self, request: TransferRequest) -> Result<()> {
        let client = self
            .state
            .as_ref()
            .ok_or(BridgeError::NotAttached)?
            .client();

        let mut transfer = Transfer::new(
            self.id,
            self.operation,
            Arc::clone(&self.callbacks),
            self.phase.clone(),
            self.scratch.take().unwrap_or_default(),
            Arc::clone(&self.worker),
        );

        // Set before spawning: a fast worker may reach its terminal phase
        // before `spawn` returns.
        self.phase.set(SessionPhase::Running);

        let engine = Arc::clone(&client);
        let session = self.id;
        let job: Job = Box::new(move || {
            let run = panic::catch_unwind(AssertUnwindSafe(|| {
                engine.run(&request, &mut transfer);
            }));
            match run {
                Ok(()) => transfer.finish(),
                Err(payload) => {
                    let reason = panic_reason(payload.as_ref());
                    error!(%session, %reason, "engine panicked during the operation");
                    transfer.fail_unfinished(&format!("{ENGINE_PANICKED}: {reason}"));
                }
            }
            transfer
        });

        match client.spawn(job) {
            Ok(in_flight) => {
                info!(session = %self.id, operation = %self.operation, "operation started");
                self.in_flight = Some(in_flight);
                Ok(())
            }
            Err(err) => {
                error!(session = %self.id, error = %err, "engine refused the operation");
                self.scratch = Some(Scratch::default());
                self.phase.set(SessionPhase::Active);
                Err(err)
            }
        }
    }

    /// Block until the in-flight operation, if any, returns from the engine.
    ///
    /// Must not be called from inside one of this session's callbacks.
    pub fn wait(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        match in_flight.join() {
            Some(transfer) => self.scratch = Some(transfer.into_scratch()),
            None => error!(session = %self.id, "engine worker ended without returning the transfer"),
        }
    }

    /// Tear the session down: wait for the engine, hand the session state
    /// back through `release_session_state`, then release scratch envelopes.
    pub fn destroy(mut self) -> TeardownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;

        self.wait();

        let released_state = match self.state.take() {
            Some(state) => {
                if self
                    .callbacks
                    .registered()
                    .contains(CallbackSlot::ReleaseSessionState)
                {
                    self.callbacks.release_session_state(state);
                }
                true
            }
            None => false,
        };

        let released_envelopes = self
            .scratch
            .take()
            .map(|mut scratch| scratch.release(self.id))
            .unwrap_or_default();

        self.phase.set(SessionPhase::Destroyed);
        info!(
            session = %self.id,
            released_state,
            envelopes = released_envelopes.len(),
            "session destroyed"
        );
        TeardownReport {
            released_state,
            released_envelopes,
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("phase", &self.phase.get())
            .field("attached", &self.state.is_some())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingCallbacks, ScriptedEngine};
    use wormhole_core::types::{CodegenOutcome, TransferId, TransferOutcome, TransferResultKind};

    fn send_text_session(callbacks: &Arc<RecordingCallbacks>) -> SessionContext {
        SessionContext::create(
            callbacks.clone(),
            ClientConfig::with_code("4-purple-sausages"),
            OperationClass::SendText,
        )
        .expect("create session")
    }

    #[test]
    fn create_checks_required_slots() {
        let callbacks = Arc::new(RecordingCallbacks::new().without(CallbackSlot::Write));
        let err = SessionContext::create(
            callbacks.clone(),
            ClientConfig::with_code("4-purple-sausages"),
            OperationClass::SendFile,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            BridgeError::IncompleteCallbacks {
                slot: CallbackSlot::Write,
                ..
            }
        ));
        assert!(callbacks.events().is_empty());
    }

    #[test]
    fn send_text_does_not_need_stream_slots() {
        let callbacks = Arc::new(
            RecordingCallbacks::new()
                .without(CallbackSlot::Read)
                .without(CallbackSlot::Seek)
                .without(CallbackSlot::Write),
        );
        let session = send_text_session(&callbacks);
        assert_eq!(session.phase(), SessionPhase::AwaitingAttach);
    }

    #[test]
    fn create_validates_config() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let err = SessionContext::create(
            callbacks,
            ClientConfig::with_code("not a code"),
            OperationClass::Receive,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCode(_)));
    }

    #[test]
    fn operations_need_attached_state() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        assert!(matches!(
            session.send_text("hi"),
            Err(BridgeError::NotAttached)
        ));
    }

    #[test]
    fn second_attach_is_rejected() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        let engine = ScriptedEngine::silent();

        session
            .attach_session_state(engine.session_state())
            .expect("first attach");
        assert!(matches!(
            session.attach_session_state(engine.session_state()),
            Err(BridgeError::AlreadyAttached)
        ));
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn operation_must_match_session_class() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        session
            .attach_session_state(ScriptedEngine::silent().session_state())
            .expect("attach");

        assert!(matches!(
            session.receive(),
            Err(BridgeError::OperationMismatch {
                expected: OperationClass::SendText,
                requested: OperationClass::Receive,
            })
        ));
    }

    #[test]
    fn one_operation_per_session() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        session
            .attach_session_state(ScriptedEngine::sending().session_state())
            .expect("attach");

        session.send_text("first").expect("start send");
        session.wait();
        assert_eq!(session.phase(), SessionPhase::Resulted);
        assert!(matches!(
            session.send_text("second"),
            Err(BridgeError::InvalidPhase {
                phase: SessionPhase::Resulted,
                ..
            })
        ));
        assert_eq!(callbacks.results(), vec![TransferOutcome::sent()]);
    }

    #[test]
    fn silent_engine_gets_fallback_failure() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        session
            .attach_session_state(ScriptedEngine::silent().session_state())
            .expect("attach");
        session.send_text("into the void").expect("start send");

        let report = session.destroy();
        assert!(report.released_state);
        let results = callbacks.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_success());
    }

    #[test]
    fn panicking_engine_still_delivers_one_failure() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        let engine = ScriptedEngine::new(|_, _| panic!("relay handshake bug"));
        session
            .attach_session_state(engine.session_state())
            .expect("attach");
        session.send_text("lost in transit").expect("start send");
        session.wait();

        assert_eq!(session.phase(), SessionPhase::Errored);
        let results = callbacks.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind(), TransferResultKind::SendTextError);
        let message = results[0].error_message().unwrap_or_default();
        assert!(message.starts_with(ENGINE_PANICKED), "{message}");
        assert!(message.contains("relay handshake bug"), "{message}");

        let report = session.destroy();
        assert!(report.released_state);
        assert_eq!(callbacks.released_states(), 1);
    }

    #[test]
    fn destroy_releases_state_once_after_the_result() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        session
            .attach_session_state(ScriptedEngine::sending().session_state())
            .expect("attach");
        session.send_text("hello").expect("start send");

        let report = session.destroy();
        assert!(report.released_state);
        assert!(report.released_envelopes.is_empty());
        assert_eq!(callbacks.released_states(), 1);
        assert!(callbacks.result_then_release());
    }

    #[test]
    fn dropping_unattached_session_releases_nothing() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        drop(send_text_session(&callbacks));
        assert_eq!(callbacks.released_states(), 0);
    }

    #[test]
    fn dropping_attached_session_releases_state() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = send_text_session(&callbacks);
        session
            .attach_session_state(ScriptedEngine::silent().session_state())
            .expect("attach");
        drop(session);
        assert_eq!(callbacks.released_states(), 1);
    }

    #[test]
    fn codegen_needs_codegen_slot() {
        let callbacks = Arc::new(RecordingCallbacks::new().without(CallbackSlot::CodegenResult));
        let err = SessionContext::create(
            callbacks,
            ClientConfig::default(),
            OperationClass::GenerateCode,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::IncompleteCallbacks {
                slot: CallbackSlot::CodegenResult,
                ..
            }
        ));
    }

    #[test]
    fn codegen_session_delivers_generated_code() {
        let callbacks = Arc::new(RecordingCallbacks::new());
        let mut session = SessionContext::create(
            callbacks.clone(),
            ClientConfig::default(),
            OperationClass::GenerateCode,
        )
        .expect("create codegen session");
        let engine = ScriptedEngine::new(|_, transfer| {
            transfer.deliver_codegen(CodegenOutcome::Generated {
                code: "3-tango-echo".into(),
                transfer_id: TransferId(3),
            })
        });
        session
            .attach_session_state(engine.session_state())
            .expect("attach");
        session.generate_code().expect("start codegen");
        session.wait();

        assert_eq!(session.phase(), SessionPhase::Resulted);
        assert_eq!(callbacks.codegen_results()[0].code(), Some("3-tango-echo"));
        let report = session.destroy();
        assert!(report.released_state);
        assert!(report.released_envelopes.is_empty());
    }
}
