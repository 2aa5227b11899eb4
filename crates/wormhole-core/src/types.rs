// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Envelope family and session vocabulary.
//
// Every envelope is a plain owned value. Kind-specific payloads live inside
// enum variants, so a field that does not belong to the envelope's kind cannot
// be read at all.

use std::fmt;
use std::io::SeekFrom;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-assigned identifier of one transfer on the rendezvous server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub u32);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Operations and callback slots
// ---------------------------------------------------------------------------

/// The request shapes a session can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationClass {
    SendFile,
    SendText,
    Receive,
    GenerateCode,
}

impl OperationClass {
    /// Callback slots that must be registered before a session of this class
    /// may be created.
    pub fn required_slots(&self) -> SlotSet {
        use CallbackSlot::*;
        match self {
            Self::SendFile | Self::Receive => {
                SlotSet::of(&[Read, Seek, Write, Result, ReleaseSessionState])
            }
            Self::SendText => SlotSet::of(&[Result, ReleaseSessionState]),
            Self::GenerateCode => SlotSet::of(&[CodegenResult, ReleaseSessionState]),
        }
    }

    /// Whether the session config must carry an invitation code.
    pub fn needs_code(&self) -> bool {
        !matches!(self, Self::GenerateCode)
    }

    /// Failure kind used when an error cannot be classified more precisely.
    /// `None` for code generation, which has its own result family.
    pub fn fallback_failure(&self) -> Option<TransferFailure> {
        match self {
            Self::SendFile => Some(TransferFailure::SendFile),
            Self::SendText => Some(TransferFailure::SendText),
            Self::Receive => Some(TransferFailure::ReceiveFile),
            Self::GenerateCode => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SendFile => "send-file",
            Self::SendText => "send-text",
            Self::Receive => "receive",
            Self::GenerateCode => "generate-code",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The nine function slots of a callback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
    Read,
    Seek,
    Write,
    Progress,
    Result,
    CodegenResult,
    Metadata,
    Log,
    ReleaseSessionState,
}

impl CallbackSlot {
    pub const ALL: [CallbackSlot; 9] = [
        Self::Read,
        Self::Seek,
        Self::Write,
        Self::Progress,
        Self::Result,
        Self::CodegenResult,
        Self::Metadata,
        Self::Log,
        Self::ReleaseSessionState,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Slot name as it appears in the C callback table.
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Seek => "seek",
            Self::Write => "write",
            Self::Progress => "on_progress",
            Self::Result => "on_result",
            Self::CodegenResult => "on_codegen_result",
            Self::Metadata => "on_metadata",
            Self::Log => "log",
            Self::ReleaseSessionState => "release_session_state",
        }
    }
}

impl fmt::Display for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of callback slots, used to describe which slots a table registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotSet(u16);

impl SlotSet {
    pub const EMPTY: SlotSet = SlotSet(0);

    pub fn all() -> Self {
        Self::of(&CallbackSlot::ALL)
    }

    pub fn of(slots: &[CallbackSlot]) -> Self {
        slots.iter().fold(Self::EMPTY, |set, slot| set.with(*slot))
    }

    pub fn with(self, slot: CallbackSlot) -> Self {
        Self(self.0 | slot.bit())
    }

    pub fn without(self, slot: CallbackSlot) -> Self {
        Self(self.0 & !slot.bit())
    }

    pub fn contains(self, slot: CallbackSlot) -> bool {
        self.0 & slot.bit() != 0
    }

    /// First slot of `required` (in table order) that this set lacks.
    pub fn first_missing(self, required: SlotSet) -> Option<CallbackSlot> {
        CallbackSlot::ALL
            .into_iter()
            .find(|slot| required.contains(*slot) && !self.contains(*slot))
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Caller-visible lifecycle of a session.
///
/// `Running` marks the window between an operation call and its terminal
/// envelope; the session is still logically `Active` there but accepts no
/// second operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionPhase {
    Created = 0,
    AwaitingAttach = 1,
    Active = 2,
    Running = 3,
    Resulted = 4,
    Cancelled = 5,
    Errored = 6,
    Destroyed = 7,
}

impl SessionPhase {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Created,
            1 => Self::AwaitingAttach,
            2 => Self::Active,
            3 => Self::Running,
            4 => Self::Resulted,
            5 => Self::Cancelled,
            6 => Self::Errored,
            7 => Self::Destroyed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resulted | Self::Cancelled | Self::Errored)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One operation handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    /// Offer the caller's `read`/`seek` stream under `file_name`.
    SendFile { code: String, file_name: String },
    SendText { code: String, text: String },
    /// Accept whatever the peer offers, writing files through `write`.
    Receive { code: String },
    GenerateCode,
}

impl TransferRequest {
    pub fn operation(&self) -> OperationClass {
        match self {
            Self::SendFile { .. } => OperationClass::SendFile,
            Self::SendText { .. } => OperationClass::SendText,
            Self::Receive { .. } => OperationClass::Receive,
            Self::GenerateCode => OperationClass::GenerateCode,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::SendFile { code, .. } | Self::SendText { code, .. } | Self::Receive { code } => {
                Some(code)
            }
            Self::GenerateCode => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer results
// ---------------------------------------------------------------------------

/// Result discriminant as seen at the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransferResultKind {
    Success = 0,
    SendFileError = 1,
    ReceiveFileError = 2,
    SendTextError = 3,
    ReceiveTextError = 4,
    TransferRejected = 5,
    TransferCancelled = 6,
    WrongCode = 7,
}

/// Every way a transfer can end without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferFailure {
    SendFile,
    ReceiveFile,
    SendText,
    ReceiveText,
    Rejected,
    Cancelled,
    WrongCode,
}

impl TransferFailure {
    pub fn kind(self) -> TransferResultKind {
        match self {
            Self::SendFile => TransferResultKind::SendFileError,
            Self::ReceiveFile => TransferResultKind::ReceiveFileError,
            Self::SendText => TransferResultKind::SendTextError,
            Self::ReceiveText => TransferResultKind::ReceiveTextError,
            Self::Rejected => TransferResultKind::TransferRejected,
            Self::Cancelled => TransferResultKind::TransferCancelled,
            Self::WrongCode => TransferResultKind::WrongCode,
        }
    }
}

/// Terminal envelope of a send or receive session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// `received_text` is only populated for a receive that got a text offer.
    Success { received_text: Option<String> },
    Failed {
        failure: TransferFailure,
        message: String,
    },
}

impl TransferOutcome {
    pub fn sent() -> Self {
        Self::Success {
            received_text: None,
        }
    }

    pub fn text_received(text: impl Into<String>) -> Self {
        Self::Success {
            received_text: Some(text.into()),
        }
    }

    pub fn failed(failure: TransferFailure, message: impl Into<String>) -> Self {
        Self::Failed {
            failure,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TransferResultKind {
        match self {
            Self::Success { .. } => TransferResultKind::Success,
            Self::Failed { failure, .. } => failure.kind(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message),
            Self::Success { .. } => None,
        }
    }

    pub fn received_text(&self) -> Option<&str> {
        match self {
            Self::Success { received_text } => received_text.as_deref(),
            Self::Failed { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Code generation results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum CodegenResultKind {
    Successful = 0,
    FailedToGetClient = 1,
    CodeGenerationFailed = 2,
}

/// Terminal envelope of a code-generation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodegenOutcome {
    Generated { code: String, transfer_id: TransferId },
    FailedToGetClient(String),
    CodeGenerationFailed(String),
}

impl CodegenOutcome {
    pub fn kind(&self) -> CodegenResultKind {
        match self {
            Self::Generated { .. } => CodegenResultKind::Successful,
            Self::FailedToGetClient(_) => CodegenResultKind::FailedToGetClient,
            Self::CodeGenerationFailed(_) => CodegenResultKind::CodeGenerationFailed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Generated { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Generated { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Self::Generated { transfer_id, .. } => Some(*transfer_id),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::FailedToGetClient(message) | Self::CodeGenerationFailed(message) => {
                Some(message)
            }
            Self::Generated { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress and metadata
// ---------------------------------------------------------------------------

/// Byte counters for one in-flight transfer.
///
/// Laid out for C so the bridge can lend a pointer to its scratch copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct Progress {
    pub transferred_bytes: i64,
    /// `UNKNOWN_TOTAL` until the size has been negotiated.
    pub total_bytes: i64,
}

impl Progress {
    pub const UNKNOWN_TOTAL: i64 = -1;

    pub fn new(transferred_bytes: i64, total_bytes: i64) -> Self {
        Self {
            transferred_bytes,
            total_bytes,
        }
    }

    pub fn total_known(&self) -> bool {
        self.total_bytes >= 0
    }

    pub fn is_complete(&self) -> bool {
        self.total_known() && self.transferred_bytes >= self.total_bytes
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(0, Self::UNKNOWN_TOTAL)
    }
}

/// Description of an inbound file offer, delivered before it is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub length: i64,
    pub file_name: String,
    pub transfer_id: TransferId,
    pub session: SessionId,
}

/// The caller's answer to an inbound file offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferDecision {
    Accept,
    Reject,
}

/// Scratch slot kinds, reported when a session releases its envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Progress,
    Result,
    CodegenResult,
    Metadata,
}

// ---------------------------------------------------------------------------
// Stream positioning
// ---------------------------------------------------------------------------

/// Seek origin, numbered like `SEEK_SET`/`SEEK_CUR`/`SEEK_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Whence {
    Start = 0,
    Current = 1,
    End = 2,
}

impl Whence {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Start),
            1 => Some(Self::Current),
            2 => Some(Self::End),
            _ => None,
        }
    }

    /// Split a `SeekFrom` into the offset/whence pair a C seek expects.
    pub fn split(pos: SeekFrom) -> (i64, Self) {
        match pos {
            // Offsets past i64::MAX cannot be expressed to a C seek anyway.
            SeekFrom::Start(offset) => (i64::try_from(offset).unwrap_or(i64::MAX), Self::Start),
            SeekFrom::Current(offset) => (offset, Self::Current),
            SeekFrom::End(offset) => (offset, Self::End),
        }
    }

    /// Rebuild a `SeekFrom`; a negative absolute offset has no meaning.
    pub fn to_seek_from(self, offset: i64) -> Option<SeekFrom> {
        match self {
            Self::Start => u64::try_from(offset).ok().map(SeekFrom::Start),
            Self::Current => Some(SeekFrom::Current(offset)),
            Self::End => Some(SeekFrom::End(offset)),
        }
    }
}
