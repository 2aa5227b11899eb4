// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Recording callback table and scripted engine shared by the unit tests.

use std::io::{Cursor, Read, Seek, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use wormhole_core::error::{BridgeError, Result, StreamError};
use wormhole_core::types::{
    CallbackSlot, CodegenOutcome, FileMetadata, OfferDecision, Progress, SlotSet,
    TransferOutcome, TransferRequest, Whence,
};

use crate::traits::{EngineClient, InFlight, Job, SessionCallbacks, SessionState};
use crate::transfer::Transfer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Progress(Progress),
    Result(TransferOutcome),
    Codegen(CodegenOutcome),
    Metadata(FileMetadata),
    Log(String),
    ReleasedState,
}

/// Callback table over an in-memory source and sink that records every
/// envelope it is shown.
pub struct RecordingCallbacks {
    slots: SlotSet,
    decision: OfferDecision,
    read_error: Option<String>,
    /// Reads report end of stream even though seeking sees the full source.
    starved: bool,
    write_error: Option<String>,
    source: Mutex<Cursor<Vec<u8>>>,
    sink: Mutex<Vec<u8>>,
    events: Mutex<Vec<Event>>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::with_source(Vec::new())
    }

    pub fn with_source(bytes: Vec<u8>) -> Self {
        Self {
            slots: SlotSet::all(),
            decision: OfferDecision::Accept,
            read_error: None,
            starved: false,
            write_error: None,
            source: Mutex::new(Cursor::new(bytes)),
            sink: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn without(mut self, slot: CallbackSlot) -> Self {
        self.slots = self.slots.without(slot);
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.decision = OfferDecision::Reject;
        self
    }

    pub fn failing_reads(mut self, message: &str) -> Self {
        self.read_error = Some(message.to_owned());
        self
    }

    pub fn starving_reads(mut self) -> Self {
        self.starved = true;
        self
    }

    pub fn failing_writes(mut self, message: &str) -> Self {
        self.write_error = Some(message.to_owned());
        self
    }

    fn record(&self, event: Event) {
        self.events.lock().expect("events lock").push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn progress_events(&self) -> Vec<Progress> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Progress(progress) => Some(progress),
                _ => None,
            })
            .collect()
    }

    pub fn results(&self) -> Vec<TransferOutcome> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Result(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn codegen_results(&self) -> Vec<CodegenOutcome> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Codegen(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn metadata(&self) -> Vec<FileMetadata> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Metadata(metadata) => Some(metadata),
                _ => None,
            })
            .collect()
    }

    pub fn released_states(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == Event::ReleasedState)
            .count()
    }

    /// Whether the terminal envelope arrived before the state was released.
    pub fn result_then_release(&self) -> bool {
        let events = self.events();
        let terminal = events
            .iter()
            .position(|event| matches!(event, Event::Result(_) | Event::Codegen(_)));
        let released = events
            .iter()
            .position(|event| *event == Event::ReleasedState);
        matches!((terminal, released), (Some(t), Some(r)) if t < r)
    }

    pub fn sink(&self) -> Vec<u8> {
        self.sink.lock().expect("sink lock").clone()
    }
}

impl SessionCallbacks for RecordingCallbacks {
    fn registered(&self) -> SlotSet {
        self.slots
    }

    fn read(&self, buffer: &mut [u8]) -> std::result::Result<usize, StreamError> {
        if let Some(message) = &self.read_error {
            return Err(StreamError::new(message.clone()));
        }
        if self.starved {
            return Ok(0);
        }
        let mut source = self.source.lock().expect("source lock");
        source
            .read(buffer)
            .map_err(|e| StreamError::new(e.to_string()))
    }

    fn seek(&self, offset: i64, whence: Whence) -> std::result::Result<u64, StreamError> {
        let pos = whence
            .to_seek_from(offset)
            .ok_or_else(|| StreamError::new("negative offset"))?;
        let mut source = self.source.lock().expect("source lock");
        source
            .seek(pos)
            .map_err(|e| StreamError::new(e.to_string()))
    }

    fn write(&self, buffer: &[u8]) -> std::result::Result<(), StreamError> {
        if let Some(message) = &self.write_error {
            return Err(StreamError::new(message.clone()));
        }
        let mut sink = self.sink.lock().expect("sink lock");
        sink.write_all(buffer)
            .map_err(|e| StreamError::new(e.to_string()))
    }

    fn on_progress(&self, progress: &Progress) {
        self.record(Event::Progress(*progress));
    }

    fn on_result(&self, result: TransferOutcome) {
        self.record(Event::Result(result));
    }

    fn on_codegen_result(&self, result: CodegenOutcome) {
        self.record(Event::Codegen(result));
    }

    fn on_metadata(&self, metadata: FileMetadata) -> OfferDecision {
        self.record(Event::Metadata(metadata));
        self.decision
    }

    fn log(&self, message: &str) {
        self.record(Event::Log(message.to_owned()));
    }

    fn release_session_state(&self, state: Box<SessionState>) {
        drop(state);
        self.record(Event::ReleasedState);
    }
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

type Script = dyn Fn(&TransferRequest, &mut Transfer) + Send + Sync;

struct ScriptedClient {
    script: Box<Script>,
}

impl EngineClient for ScriptedClient {
    fn run(&self, request: &TransferRequest, transfer: &mut Transfer) {
        (self.script)(request, transfer);
    }

    fn spawn(&self, job: Job) -> Result<InFlight> {
        let handle = thread::Builder::new()
            .name("scripted-engine".into())
            .spawn(job)
            .map_err(BridgeError::Io)?;
        Ok(InFlight::new(move || handle.join().ok()))
    }
}

/// Engine that runs a fixed script on a fresh thread per operation.
pub struct ScriptedEngine {
    client: Arc<ScriptedClient>,
}

impl ScriptedEngine {
    pub fn new(script: impl Fn(&TransferRequest, &mut Transfer) + Send + Sync + 'static) -> Self {
        Self {
            client: Arc::new(ScriptedClient {
                script: Box::new(script),
            }),
        }
    }

    /// Returns without delivering anything.
    pub fn silent() -> Self {
        Self::new(|_, _| {})
    }

    /// Reports a successful send.
    pub fn sending() -> Self {
        Self::new(|_, transfer| transfer.deliver_result(TransferOutcome::sent()))
    }

    pub fn session_state(&self) -> Box<SessionState> {
        Box::new(SessionState::new(self.client.clone()))
    }
}
