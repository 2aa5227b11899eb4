// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// C ABI surface.
//
// Ownership rules at this boundary:
//
// - `wormhole_session_create` returns an opaque session handle owned by the
//   caller until `wormhole_session_destroy`. Handles are registry keys that
//   are never reused, so a stale or repeated handle is reported as unknown
//   and can never reach another session.
// - Session state from `wormhole_engine_open_session_state` is owned by the
//   caller until `wormhole_session_attach` succeeds, then by the session until
//   it comes back through the `release_session_state` callback. The caller
//   frees it with `wormhole_session_state_free`.
// - Result, codegen and metadata envelopes passed to callbacks are owned by
//   the caller and freed with the matching `wormhole_free_*` function. The
//   progress pointer is borrowed for the duration of the callback only.
// - Entry points for one session must not be called concurrently, and none
//   may be called with a session from inside that session's own callbacks.
//
// Unsafe code here falls into three groups:
//
// 1. Calls through caller-supplied function pointers. The caller guarantees
//    each non-null slot is a valid function for the lifetime of the session.
// 2. Reading caller-supplied strings and structs. Pointers are either null or
//    valid for the duration of the call.
// 3. Reclaiming boxes handed out by this module. Each `Box::into_raw` here has
//    exactly one matching `Box::from_raw`, in the caller's single call to the
//    matching free function or in a successful attach.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, error, warn};
use wormhole_core::config::ClientConfig;
use wormhole_core::error::{BridgeError, Result, StreamError};
use wormhole_core::types::{
    CallbackSlot, CodegenOutcome, CodegenResultKind, FileMetadata, OfferDecision, OperationClass,
    Progress, SessionPhase, SlotSet, TransferOutcome, TransferResultKind, Whence,
};

use crate::loopback::LoopbackEngine;
use crate::session::{PhaseCell, SessionContext};
use crate::traits::{SessionCallbacks, SessionState};

/// Opaque session handle. Never reused within a process; 0 is never issued.
pub type WormholeSession = u64;

// ---------------------------------------------------------------------------
// Callback table
// ---------------------------------------------------------------------------

/// Outcome of a stream callback. A non-null `error_message` means failure and
/// must stay valid until the callback returns; otherwise `value` is the byte
/// count (read, write) or new offset (seek).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiIoResult {
    pub value: i64,
    pub error_message: *const c_char,
}

impl FfiIoResult {
    pub const fn ok(value: i64) -> Self {
        Self {
            value,
            error_message: ptr::null(),
        }
    }

    pub const fn error(message: &'static CStr) -> Self {
        Self {
            value: -1,
            error_message: message.as_ptr(),
        }
    }
}

pub type ReadFn =
    unsafe extern "C" fn(user_data: *mut c_void, buffer: *mut u8, capacity: usize) -> FfiIoResult;
pub type SeekFn =
    unsafe extern "C" fn(user_data: *mut c_void, offset: i64, whence: i32) -> FfiIoResult;
pub type WriteFn =
    unsafe extern "C" fn(user_data: *mut c_void, buffer: *const u8, len: usize) -> FfiIoResult;
pub type ProgressFn = unsafe extern "C" fn(user_data: *mut c_void, progress: *const Progress);
pub type ResultFn = unsafe extern "C" fn(user_data: *mut c_void, result: *mut FfiTransferResult);
pub type CodegenResultFn =
    unsafe extern "C" fn(user_data: *mut c_void, result: *mut FfiCodegenResult);
/// Returns [`WORMHOLE_OFFER_ACCEPT`] or [`WORMHOLE_OFFER_REJECT`].
pub type MetadataFn =
    unsafe extern "C" fn(user_data: *mut c_void, metadata: *mut FfiFileMetadata) -> i32;
pub type LogFn = unsafe extern "C" fn(user_data: *mut c_void, message: *const c_char);
pub type ReleaseSessionStateFn =
    unsafe extern "C" fn(user_data: *mut c_void, state: *mut SessionState);

pub const WORMHOLE_OFFER_ACCEPT: i32 = 0;
pub const WORMHOLE_OFFER_REJECT: i32 = 1;

pub const WORMHOLE_OP_SEND_FILE: i32 = 0;
pub const WORMHOLE_OP_SEND_TEXT: i32 = 1;
pub const WORMHOLE_OP_RECEIVE: i32 = 2;
pub const WORMHOLE_OP_GENERATE_CODE: i32 = 3;

/// The caller's callback table. Null slots are unregistered.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiCallbacks {
    /// Passed back unchanged as the first argument of every callback.
    pub user_data: *mut c_void,
    pub read: Option<ReadFn>,
    pub seek: Option<SeekFn>,
    pub write: Option<WriteFn>,
    pub on_progress: Option<ProgressFn>,
    pub on_result: Option<ResultFn>,
    pub on_codegen_result: Option<CodegenResultFn>,
    pub on_metadata: Option<MetadataFn>,
    pub log: Option<LogFn>,
    pub release_session_state: Option<ReleaseSessionStateFn>,
}

/// Client settings. Null strings and a non-positive `passphrase_length` keep
/// the defaults (after `WORMHOLE_*` environment overrides).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiConfig {
    pub app_id: *const c_char,
    pub rendezvous_url: *const c_char,
    pub transit_relay_url: *const c_char,
    pub passphrase_length: i32,
    pub code: *const c_char,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Terminal envelope of a send or receive. Free with [`wormhole_free_result`].
///
/// `error_message` is set only for failure kinds; `received_text` only for a
/// successful receive of a text offer. The struct must not be modified.
#[repr(C)]
#[derive(Debug)]
pub struct FfiTransferResult {
    pub kind: TransferResultKind,
    pub error_message: *mut c_char,
    pub received_text: *mut c_char,
}

impl From<TransferOutcome> for FfiTransferResult {
    fn from(outcome: TransferOutcome) -> Self {
        match outcome {
            TransferOutcome::Success { received_text } => Self {
                kind: TransferResultKind::Success,
                error_message: ptr::null_mut(),
                received_text: received_text.map_or(ptr::null_mut(), into_c_string),
            },
            TransferOutcome::Failed { failure, message } => Self {
                kind: failure.kind(),
                error_message: into_c_string(message),
                received_text: ptr::null_mut(),
            },
        }
    }
}

/// Terminal envelope of a code-generation session. Free with
/// [`wormhole_free_codegen_result`].
#[repr(C)]
#[derive(Debug)]
pub struct FfiCodegenResult {
    pub kind: CodegenResultKind,
    pub code: *mut c_char,
    pub transfer_id: u32,
    pub error_message: *mut c_char,
}

impl From<CodegenOutcome> for FfiCodegenResult {
    fn from(outcome: CodegenOutcome) -> Self {
        let kind = outcome.kind();
        match outcome {
            CodegenOutcome::Generated { code, transfer_id } => Self {
                kind,
                code: into_c_string(code),
                transfer_id: transfer_id.0,
                error_message: ptr::null_mut(),
            },
            CodegenOutcome::FailedToGetClient(message)
            | CodegenOutcome::CodeGenerationFailed(message) => Self {
                kind,
                code: ptr::null_mut(),
                transfer_id: 0,
                error_message: into_c_string(message),
            },
        }
    }
}

/// Inbound file offer. Free with [`wormhole_free_file_metadata`].
#[repr(C)]
#[derive(Debug)]
pub struct FfiFileMetadata {
    pub length: i64,
    pub file_name: *mut c_char,
    pub transfer_id: u32,
    /// Handle of the receiving session.
    pub session: WormholeSession,
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Synchronous outcome of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FfiStatus {
    Ok = 0,
    NullArgument = 1,
    InvalidString = 2,
    InvalidConfig = 3,
    IncompleteCallbacks = 4,
    InvalidCode = 5,
    AlreadyAttached = 6,
    NotAttached = 7,
    InvalidPhase = 8,
    OperationMismatch = 9,
    UnknownSession = 10,
    ReentrantCall = 11,
    Engine = 12,
}

impl From<&BridgeError> for FfiStatus {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::InvalidConfig(_) | BridgeError::Serialization(_) => Self::InvalidConfig,
            BridgeError::IncompleteCallbacks { .. } => Self::IncompleteCallbacks,
            BridgeError::InvalidCode(_) => Self::InvalidCode,
            BridgeError::AlreadyAttached => Self::AlreadyAttached,
            BridgeError::NotAttached => Self::NotAttached,
            BridgeError::InvalidPhase { .. } => Self::InvalidPhase,
            BridgeError::OperationMismatch { .. } => Self::OperationMismatch,
            BridgeError::NullArgument(_) => Self::NullArgument,
            BridgeError::InvalidString(_) => Self::InvalidString,
            BridgeError::UnknownSession => Self::UnknownSession,
            BridgeError::ReentrantCall => Self::ReentrantCall,
            BridgeError::OutOfOrder(_) | BridgeError::Engine(_) | BridgeError::Io(_) => {
                Self::Engine
            }
        }
    }
}

fn status(entry: &'static str, result: Result<()>) -> FfiStatus {
    match result {
        Ok(()) => FfiStatus::Ok,
        Err(err) => {
            warn!(entry, error = %err, "bridge call failed");
            FfiStatus::from(&err)
        }
    }
}

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

struct LiveSession {
    phase: PhaseCell,
    context: Arc<Mutex<SessionContext>>,
}

/// Live sessions by handle.
#[derive(Default)]
struct Registry {
    last_handle: WormholeSession,
    sessions: HashMap<WormholeSession, LiveSession>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::default()));

thread_local! {
    /// Session whose callback this thread is currently inside, or 0.
    static ACTIVE_CALLBACK: Cell<WormholeSession> = const { Cell::new(0) };
}

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn register(context: SessionContext) -> WormholeSession {
    let phase = context.phase_cell();
    let mut registry = registry();
    registry.last_handle += 1;
    let handle = registry.last_handle;
    registry.sessions.insert(
        handle,
        LiveSession {
            phase,
            context: Arc::new(Mutex::new(context)),
        },
    );
    handle
}

fn check_handle(session: WormholeSession) -> Result<()> {
    if session == 0 {
        return Err(BridgeError::NullArgument("session"));
    }
    if ACTIVE_CALLBACK.get() == session {
        return Err(BridgeError::ReentrantCall);
    }
    Ok(())
}

/// Run `op` on a live session. The registry lock is released first, so the
/// session's callbacks may query phases while `op` blocks.
fn with_session<T>(
    session: WormholeSession,
    op: impl FnOnce(&mut SessionContext) -> Result<T>,
) -> Result<T> {
    check_handle(session)?;
    let context = registry()
        .sessions
        .get(&session)
        .map(|live| Arc::clone(&live.context))
        .ok_or(BridgeError::UnknownSession)?;
    let mut context = context.lock().unwrap_or_else(PoisonError::into_inner);
    op(&mut context)
}

// ---------------------------------------------------------------------------
// Callback adapter
// ---------------------------------------------------------------------------

/// `SessionCallbacks` over a C callback table.
struct FfiCallbackTable {
    table: FfiCallbacks,
    /// Handle of the owning session, bound right after creation.
    session: OnceLock<WormholeSession>,
}

// SAFETY: the caller guarantees the table's functions and `user_data` may be
// used from the engine worker thread. The bridge never invokes them
// concurrently for one session.
unsafe impl Send for FfiCallbackTable {}
unsafe impl Sync for FfiCallbackTable {}

impl FfiCallbackTable {
    fn new(table: FfiCallbacks) -> Self {
        Self {
            table,
            session: OnceLock::new(),
        }
    }

    fn bind(&self, session: WormholeSession) {
        let _ = self.session.set(session);
    }

    fn handle(&self) -> WormholeSession {
        self.session.get().copied().unwrap_or(0)
    }

    /// Run a C callback with this session marked active on the current thread.
    fn enter<R>(&self, call: impl FnOnce() -> R) -> R {
        let previous = ACTIVE_CALLBACK.replace(self.handle());
        let out = call();
        ACTIVE_CALLBACK.set(previous);
        out
    }
}

fn missing(slot: CallbackSlot) -> StreamError {
    StreamError::new(format!("no `{slot}` callback registered"))
}

/// Split a stream callback's result into a value or an error.
fn io_value(result: FfiIoResult) -> std::result::Result<i64, StreamError> {
    if !result.error_message.is_null() {
        // SAFETY: a non-null error message is NUL-terminated and valid until
        // the callback returned, which is now.
        let message = unsafe { CStr::from_ptr(result.error_message) };
        return Err(StreamError::new(message.to_string_lossy()));
    }
    if result.value < 0 {
        return Err(StreamError::new(format!(
            "callback returned {} without an error message",
            result.value
        )));
    }
    Ok(result.value)
}

impl SessionCallbacks for FfiCallbackTable {
    fn registered(&self) -> SlotSet {
        let t = &self.table;
        [
            (CallbackSlot::Read, t.read.is_some()),
            (CallbackSlot::Seek, t.seek.is_some()),
            (CallbackSlot::Write, t.write.is_some()),
            (CallbackSlot::Progress, t.on_progress.is_some()),
            (CallbackSlot::Result, t.on_result.is_some()),
            (CallbackSlot::CodegenResult, t.on_codegen_result.is_some()),
            (CallbackSlot::Metadata, t.on_metadata.is_some()),
            (CallbackSlot::Log, t.log.is_some()),
            (
                CallbackSlot::ReleaseSessionState,
                t.release_session_state.is_some(),
            ),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .fold(SlotSet::EMPTY, |set, (slot, _)| set.with(slot))
    }

    fn read(&self, buffer: &mut [u8]) -> std::result::Result<usize, StreamError> {
        let read = self.table.read.ok_or_else(|| missing(CallbackSlot::Read))?;
        // SAFETY: `buffer` is valid for writes of `buffer.len()` bytes for the
        // duration of the call.
        let result = self.enter(|| unsafe {
            read(self.table.user_data, buffer.as_mut_ptr(), buffer.len())
        });
        let value = io_value(result)?;
        usize::try_from(value).map_err(|_| StreamError::new("read count out of range"))
    }

    fn seek(&self, offset: i64, whence: Whence) -> std::result::Result<u64, StreamError> {
        let seek = self.table.seek.ok_or_else(|| missing(CallbackSlot::Seek))?;
        // SAFETY: plain values only.
        let result = self.enter(|| unsafe { seek(self.table.user_data, offset, whence as i32) });
        let value = io_value(result)?;
        u64::try_from(value).map_err(|_| StreamError::new("seek offset out of range"))
    }

    fn write(&self, buffer: &[u8]) -> std::result::Result<(), StreamError> {
        let write = self
            .table
            .write
            .ok_or_else(|| missing(CallbackSlot::Write))?;
        // SAFETY: `buffer` is valid for reads of `buffer.len()` bytes for the
        // duration of the call.
        let result =
            self.enter(|| unsafe { write(self.table.user_data, buffer.as_ptr(), buffer.len()) });
        let written = io_value(result)?;
        if written as u64 != buffer.len() as u64 {
            return Err(StreamError::new(format!(
                "short write: {written} of {} bytes",
                buffer.len()
            )));
        }
        Ok(())
    }

    fn on_progress(&self, progress: &Progress) {
        if let Some(on_progress) = self.table.on_progress {
            // SAFETY: `progress` points into the session's scratch slot and
            // outlives the call.
            self.enter(|| unsafe { on_progress(self.table.user_data, progress) });
        }
    }

    fn on_result(&self, result: TransferOutcome) {
        if let Some(on_result) = self.table.on_result {
            let envelope = Box::into_raw(Box::new(FfiTransferResult::from(result)));
            // SAFETY: ownership of `envelope` moves to the caller.
            self.enter(|| unsafe { on_result(self.table.user_data, envelope) });
        }
    }

    fn on_codegen_result(&self, result: CodegenOutcome) {
        if let Some(on_codegen_result) = self.table.on_codegen_result {
            let envelope = Box::into_raw(Box::new(FfiCodegenResult::from(result)));
            // SAFETY: ownership of `envelope` moves to the caller.
            self.enter(|| unsafe { on_codegen_result(self.table.user_data, envelope) });
        }
    }

    fn on_metadata(&self, metadata: FileMetadata) -> OfferDecision {
        let Some(on_metadata) = self.table.on_metadata else {
            return OfferDecision::Accept;
        };
        let envelope = Box::into_raw(Box::new(FfiFileMetadata {
            length: metadata.length,
            file_name: into_c_string(metadata.file_name),
            transfer_id: metadata.transfer_id.0,
            session: self.handle(),
        }));
        // SAFETY: ownership of `envelope` moves to the caller.
        let answer = self.enter(|| unsafe { on_metadata(self.table.user_data, envelope) });
        if answer == WORMHOLE_OFFER_ACCEPT {
            OfferDecision::Accept
        } else {
            OfferDecision::Reject
        }
    }

    fn log(&self, message: &str) {
        if let Some(log) = self.table.log {
            let message = c_string(message);
            // SAFETY: `message` outlives the call.
            self.enter(|| unsafe { log(self.table.user_data, message.as_ptr()) });
        }
    }

    fn release_session_state(&self, state: Box<SessionState>) {
        match self.table.release_session_state {
            // SAFETY: ownership of the state moves to the caller, who frees it
            // with `wormhole_session_state_free`.
            Some(release) => {
                let state = Box::into_raw(state);
                self.enter(|| unsafe { release(self.table.user_data, state) });
            }
            None => drop(state),
        }
    }
}

// ---------------------------------------------------------------------------
// String and config conversion
// ---------------------------------------------------------------------------

/// Interior NULs cannot cross the boundary and are dropped.
fn c_string(text: impl Into<Vec<u8>>) -> CString {
    let mut bytes = text.into();
    bytes.retain(|b| *b != 0);
    CString::new(bytes).unwrap_or_default()
}

fn into_c_string(text: String) -> *mut c_char {
    c_string(text).into_raw()
}

/// # Safety
///
/// `text` must be null or come from [`into_c_string`] and not be freed since.
unsafe fn free_c_string(text: *mut c_char) {
    if !text.is_null() {
        // SAFETY: see the function contract.
        drop(unsafe { CString::from_raw(text) });
    }
}

/// # Safety
///
/// `text` must be null or a valid NUL-terminated string.
unsafe fn optional_str(text: *const c_char, name: &'static str) -> Result<Option<String>> {
    if text.is_null() {
        return Ok(None);
    }
    // SAFETY: see the function contract.
    let text = unsafe { CStr::from_ptr(text) }
        .to_str()
        .map_err(|_| BridgeError::InvalidString(name))?;
    Ok(Some(text.to_owned()))
}

/// # Safety
///
/// As [`optional_str`].
unsafe fn required_str(text: *const c_char, name: &'static str) -> Result<String> {
    // SAFETY: forwarded contract.
    unsafe { optional_str(text, name) }?.ok_or(BridgeError::NullArgument(name))
}

/// # Safety
///
/// `config` must be null or point to a valid `FfiConfig` whose strings are
/// null or NUL-terminated.
unsafe fn config_from_ffi(config: *const FfiConfig) -> Result<ClientConfig> {
    let mut merged = ClientConfig::from_env();
    // SAFETY: see the function contract.
    let Some(config) = (unsafe { config.as_ref() }) else {
        return Ok(merged);
    };
    // SAFETY: see the function contract.
    unsafe {
        if let Some(app_id) = optional_str(config.app_id, "app_id")? {
            merged.app_id = app_id;
        }
        if let Some(url) = optional_str(config.rendezvous_url, "rendezvous_url")? {
            merged.rendezvous_url = url;
        }
        if let Some(url) = optional_str(config.transit_relay_url, "transit_relay_url")? {
            merged.transit_relay_url = url;
        }
        if let Some(code) = optional_str(config.code, "code")? {
            merged.code = Some(code);
        }
    }
    if let Some(length) = u32::try_from(config.passphrase_length)
        .ok()
        .filter(|length| *length > 0)
    {
        merged.passphrase_length = length;
    }
    Ok(merged)
}

fn operation_from_raw(raw: i32) -> Result<OperationClass> {
    match raw {
        WORMHOLE_OP_SEND_FILE => Ok(OperationClass::SendFile),
        WORMHOLE_OP_SEND_TEXT => Ok(OperationClass::SendText),
        WORMHOLE_OP_RECEIVE => Ok(OperationClass::Receive),
        WORMHOLE_OP_GENERATE_CODE => Ok(OperationClass::GenerateCode),
        other => Err(BridgeError::InvalidConfig(format!(
            "unknown operation {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Session entry points
// ---------------------------------------------------------------------------

/// Create a session for one operation. On success `*out_session` receives the
/// handle; on failure it is set to 0 and no engine is involved.
///
/// # Safety
///
/// `callbacks` must point to a valid table, `config` must be null or valid,
/// and `out_session` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_session_create(
    callbacks: *const FfiCallbacks,
    config: *const FfiConfig,
    operation: i32,
    out_session: *mut WormholeSession,
) -> FfiStatus {
    let result = (|| {
        if out_session.is_null() {
            return Err(BridgeError::NullArgument("out_session"));
        }
        // SAFETY: checked non-null; the caller guarantees it is writable.
        unsafe { out_session.write(0) };

        // SAFETY: the caller passes null or a valid table.
        let table = unsafe { callbacks.as_ref() }.ok_or(BridgeError::NullArgument("callbacks"))?;
        let operation = operation_from_raw(operation)?;
        // SAFETY: forwarded contract.
        let config = unsafe { config_from_ffi(config) }?;

        let adapter = Arc::new(FfiCallbackTable::new(*table));
        let context = SessionContext::create(adapter.clone(), config, operation)?;
        let handle = register(context);
        adapter.bind(handle);

        // SAFETY: as above.
        unsafe { out_session.write(handle) };
        Ok(())
    })();
    status("wormhole_session_create", result)
}

/// Attach engine state. On success the session owns `state`; on failure the
/// caller still does.
///
/// # Safety
///
/// `state` must be null or come from `wormhole_engine_open_session_state` and
/// not be attached or freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_session_attach(
    session: WormholeSession,
    state: *mut SessionState,
) -> FfiStatus {
    let result = with_session(session, |context| {
        if state.is_null() {
            return Err(BridgeError::NullArgument("state"));
        }
        if context.is_attached() {
            return Err(BridgeError::AlreadyAttached);
        }
        // SAFETY: `state` came from `Box::into_raw`; ownership moves here.
        context.attach_session_state(unsafe { Box::from_raw(state) })
    });
    status("wormhole_session_attach", result)
}

/// Current lifecycle phase. Unknown or destroyed handles read as `Destroyed`.
/// Safe to call from inside the session's own callbacks.
#[unsafe(no_mangle)]
pub extern "C" fn wormhole_session_phase(session: WormholeSession) -> SessionPhase {
    registry()
        .sessions
        .get(&session)
        .map_or(SessionPhase::Destroyed, |live| live.phase.get())
}

/// # Safety
///
/// `file_name` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_send_file(
    session: WormholeSession,
    file_name: *const c_char,
) -> FfiStatus {
    let result = with_session(session, |context| {
        // SAFETY: forwarded contract.
        let file_name = unsafe { required_str(file_name, "file_name") }?;
        context.send_file(&file_name)
    });
    status("wormhole_send_file", result)
}

/// # Safety
///
/// `text` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_send_text(
    session: WormholeSession,
    text: *const c_char,
) -> FfiStatus {
    let result = with_session(session, |context| {
        // SAFETY: forwarded contract.
        let text = unsafe { required_str(text, "text") }?;
        context.send_text(&text)
    });
    status("wormhole_send_text", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn wormhole_receive(session: WormholeSession) -> FfiStatus {
    status(
        "wormhole_receive",
        with_session(session, SessionContext::receive),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn wormhole_generate_code(session: WormholeSession) -> FfiStatus {
    status(
        "wormhole_generate_code",
        with_session(session, SessionContext::generate_code),
    )
}

/// Block until the session's operation has returned from the engine.
#[unsafe(no_mangle)]
pub extern "C" fn wormhole_session_wait(session: WormholeSession) -> FfiStatus {
    let result = with_session(session, |context| {
        context.wait();
        Ok(())
    });
    status("wormhole_session_wait", result)
}

/// Destroy a session: wait for its operation, release its state through
/// `release_session_state`, free its scratch envelopes. 0 is a no-op; a
/// handle that is unknown or already destroyed is reported.
#[unsafe(no_mangle)]
pub extern "C" fn wormhole_session_destroy(session: WormholeSession) -> FfiStatus {
    if session == 0 {
        return FfiStatus::Ok;
    }
    let result = (|| {
        check_handle(session)?;
        let live = registry()
            .sessions
            .remove(&session)
            .ok_or(BridgeError::UnknownSession)?;
        match Arc::try_unwrap(live.context) {
            Ok(context) => {
                let context = context.into_inner().unwrap_or_else(PoisonError::into_inner);
                let report = context.destroy();
                debug!(handle = session, ?report, "session handle released");
            }
            // Another thread is still inside an entry point for this handle;
            // teardown runs when that call drops the last reference.
            Err(_) => warn!(handle = session, "session destroyed while in use"),
        }
        Ok(())
    })();
    status("wormhole_session_destroy", result)
}

// ---------------------------------------------------------------------------
// Engine entry points
// ---------------------------------------------------------------------------

/// Start an in-process engine. Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn wormhole_loopback_engine_new() -> *mut LoopbackEngine {
    match LoopbackEngine::new() {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(err) => {
            error!(error = %err, "failed to start loopback engine");
            ptr::null_mut()
        }
    }
}

/// Stop an engine. Operations still waiting for a peer are cancelled.
///
/// # Safety
///
/// `engine` must be null or come from `wormhole_loopback_engine_new`, freed
/// at most once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_loopback_engine_free(engine: *mut LoopbackEngine) {
    if !engine.is_null() {
        // SAFETY: see the function contract.
        drop(unsafe { Box::from_raw(engine) });
    }
}

/// Engine state for `session`, configured from the session's settings.
/// Returns null on failure. Owned by the caller until attached.
///
/// # Safety
///
/// `engine` must be null or come from `wormhole_loopback_engine_new` and not
/// be freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_engine_open_session_state(
    engine: *const LoopbackEngine,
    session: WormholeSession,
) -> *mut SessionState {
    let result = (|| {
        // SAFETY: see the function contract.
        let engine = unsafe { engine.as_ref() }.ok_or(BridgeError::NullArgument("engine"))?;
        with_session(session, |context| engine.open(context.config()))
    })();
    match result {
        Ok(state) => Box::into_raw(state),
        Err(err) => {
            warn!(error = %err, "could not open session state");
            ptr::null_mut()
        }
    }
}

/// Free session state handed back through `release_session_state`, or never
/// attached.
///
/// # Safety
///
/// `state` must be null or an unattached state pointer, freed at most once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_session_state_free(state: *mut SessionState) {
    if !state.is_null() {
        // SAFETY: see the function contract.
        drop(unsafe { Box::from_raw(state) });
    }
}

// ---------------------------------------------------------------------------
// Envelope destructors
// ---------------------------------------------------------------------------

/// # Safety
///
/// `result` must be null or an envelope passed to `on_result`, freed at most
/// once and not modified.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_free_result(result: *mut FfiTransferResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: see the function contract.
    let result = unsafe { Box::from_raw(result) };
    // SAFETY: each payload pointer is null or came from `into_c_string`.
    unsafe {
        match result.kind {
            TransferResultKind::Success => free_c_string(result.received_text),
            _ => free_c_string(result.error_message),
        }
    }
}

/// # Safety
///
/// `result` must be null or an envelope passed to `on_codegen_result`, freed
/// at most once and not modified.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_free_codegen_result(result: *mut FfiCodegenResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: see the function contract.
    let result = unsafe { Box::from_raw(result) };
    // SAFETY: each payload pointer is null or came from `into_c_string`.
    unsafe {
        match result.kind {
            CodegenResultKind::Successful => free_c_string(result.code),
            CodegenResultKind::FailedToGetClient | CodegenResultKind::CodeGenerationFailed => {
                free_c_string(result.error_message)
            }
        }
    }
}

/// # Safety
///
/// `metadata` must be null or an envelope passed to `on_metadata`, freed at
/// most once and not modified.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_free_file_metadata(metadata: *mut FfiFileMetadata) {
    if metadata.is_null() {
        return;
    }
    // SAFETY: see the function contract.
    let metadata = unsafe { Box::from_raw(metadata) };
    // SAFETY: `file_name` came from `into_c_string`.
    unsafe { free_c_string(metadata.file_name) };
}

/// Install the `tracing` subscriber. `filter` is an `EnvFilter` directive
/// string; null falls back to `RUST_LOG`, then `info`.
///
/// # Safety
///
/// `filter` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wormhole_init_logging(filter: *const c_char) -> FfiStatus {
    // SAFETY: forwarded contract.
    let result = unsafe { optional_str(filter, "filter") }
        .map(|filter| crate::init_logging(filter.as_deref()));
    status("wormhole_init_logging", result)
}
