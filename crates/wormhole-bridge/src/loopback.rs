// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-process transfer engine.
//
// Peers rendezvous through an in-memory relay instead of a mailbox server:
// both sides of a code meet on the same nameplate, the sender posts an offer,
// the receiver answers it, and file bytes flow over a bounded channel. Each
// operation runs on a tokio blocking worker, so every callback for a session
// arrives on one thread.
//
// Used by desktop and CI builds and by the tests; a networked engine plugs in
// through the same `EngineClient` trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument};
use wormhole_core::classify::{
    ERR_BROKEN_PIPE, ERR_CONTEXT_CANCELLED, ERR_TRANSFER_REJECTED, ERR_UNEXPECTED_EOF,
    failure_outcome,
};
use wormhole_core::config::{ClientConfig, nameplate};
use wormhole_core::error::{BridgeError, Result};
use wormhole_core::types::{
    CodegenOutcome, OfferDecision, TransferFailure, TransferId, TransferOutcome, TransferRequest,
};

use crate::traits::{EngineClient, InFlight, Job, SessionState};
use crate::transfer::{MAX_READ_CHUNK, Transfer};

const ERR_WRONG_CODE: &str = "peer used a different invitation code";
const ERR_ENGINE_SHUT_DOWN: &str = "loopback engine has shut down";
const ERR_TEXT_UNCONFIRMED: &str = "text sender left before receipt was confirmed";

/// Chunks buffered between sender and receiver before the sender blocks.
const CHUNK_QUEUE_DEPTH: usize = 8;

const WORDS: [&str; 64] = [
    "acrobat", "almanac", "amulet", "apollo", "beehive", "blackjack", "bookshelf", "breakup",
    "caravan", "cellulose", "chatter", "clockwork", "cobra", "concert", "crowfoot", "cubic",
    "dashboard", "deckhand", "dinosaur", "dragnet", "eating", "embezzle", "enlist", "equipment",
    "facial", "fallout", "flagpole", "framework", "gazelle", "glitter", "goldfish", "guitarist",
    "hamlet", "headwaters", "hockey", "hydraulic", "impetus", "indulge", "inverse", "island",
    "jawbone", "jupiter", "keyboard", "kickoff", "lockup", "locale", "merit", "molasses",
    "nebula", "newborn", "obtuse", "offload", "paragon", "pheasant", "quiver", "revenge",
    "sausages", "scavenger", "tempest", "tracker", "uproot", "vapor", "wallet", "yucca",
];

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

enum Payload {
    Text(String),
    File {
        name: String,
        length: u64,
        chunks: mpsc::Receiver<Vec<u8>>,
    },
}

struct Offer {
    code: String,
    payload: Payload,
}

enum Verdict {
    Accept,
    Reject,
    WrongCode,
}

enum Ack {
    Received { sha256: String },
    Failed(String),
}

struct SenderEnd {
    offers: oneshot::Sender<Offer>,
    verdicts: oneshot::Receiver<Verdict>,
    acks: oneshot::Receiver<Ack>,
}

struct ReceiverEnd {
    offers: oneshot::Receiver<Offer>,
    verdicts: oneshot::Sender<Verdict>,
    acks: oneshot::Sender<Ack>,
}

/// One nameplate's meeting point. Removed once both sides have claimed it.
struct Mailbox {
    transfer_id: TransferId,
    sender: Option<SenderEnd>,
    receiver: Option<ReceiverEnd>,
}

impl Mailbox {
    fn new(transfer_id: TransferId) -> Self {
        let (offer_tx, offer_rx) = oneshot::channel();
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        Self {
            transfer_id,
            sender: Some(SenderEnd {
                offers: offer_tx,
                verdicts: verdict_rx,
                acks: ack_rx,
            }),
            receiver: Some(ReceiverEnd {
                offers: offer_rx,
                verdicts: verdict_tx,
                acks: ack_tx,
            }),
        }
    }
}

/// Mailboxes keyed by `(app_id, nameplate)`.
#[derive(Default)]
struct Relay {
    closed: AtomicBool,
    next_transfer: AtomicU32,
    mailboxes: Mutex<HashMap<(String, String), Mailbox>>,
}

impl Relay {
    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_transfer_id(&self) -> TransferId {
        TransferId(self.next_transfer.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Drop every mailbox; parties still waiting on one see their peer vanish.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
    }

    /// Drop a generated mailbox neither party has claimed. A mailbox that has
    /// since been recycled under a new transfer is left alone.
    fn release_unclaimed(&self, key: &(String, String), transfer_id: TransferId) -> bool {
        let mut mailboxes = self.lock();
        let unclaimed = mailboxes.get(key).is_some_and(|mailbox| {
            mailbox.transfer_id == transfer_id
                && mailbox.sender.is_some()
                && mailbox.receiver.is_some()
        });
        if unclaimed {
            mailboxes.remove(key);
        }
        unclaimed
    }

    /// Reserve the lowest free nameplate for `app_id`.
    fn allocate(&self, app_id: &str) -> std::result::Result<(String, TransferId), String> {
        if self.is_closed() {
            return Err(ERR_ENGINE_SHUT_DOWN.into());
        }
        let mut mailboxes = self.lock();
        let nameplate = (1u32..)
            .map(|n| n.to_string())
            .find(|n| !mailboxes.contains_key(&(app_id.to_owned(), n.clone())))
            .ok_or_else(|| "no free nameplate".to_owned())?;
        let transfer_id = self.next_transfer_id();
        mailboxes.insert(
            (app_id.to_owned(), nameplate.clone()),
            Mailbox::new(transfer_id),
        );
        Ok((nameplate, transfer_id))
    }

    fn claim<T>(
        &self,
        app_id: &str,
        code: &str,
        take: impl FnOnce(&mut Mailbox) -> Option<T>,
    ) -> std::result::Result<(T, TransferId), String> {
        if self.is_closed() {
            return Err(ERR_CONTEXT_CANCELLED.into());
        }
        let key = (app_id.to_owned(), nameplate(code).to_owned());
        let mut mailboxes = self.lock();
        let mailbox = mailboxes
            .entry(key.clone())
            .or_insert_with(|| Mailbox::new(self.next_transfer_id()));
        let transfer_id = mailbox.transfer_id;
        let end = take(mailbox)
            .ok_or_else(|| format!("nameplate {} is already claimed", key.1))?;
        if mailbox.sender.is_none() && mailbox.receiver.is_none() {
            mailboxes.remove(&key);
        }
        Ok((end, transfer_id))
    }

    fn claim_sender(
        &self,
        app_id: &str,
        code: &str,
    ) -> std::result::Result<(SenderEnd, TransferId), String> {
        self.claim(app_id, code, |mailbox| mailbox.sender.take())
    }

    fn claim_receiver(
        &self,
        app_id: &str,
        code: &str,
    ) -> std::result::Result<(ReceiverEnd, TransferId), String> {
        self.claim(app_id, code, |mailbox| mailbox.receiver.take())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the worker runtime and the relay shared by every session opened on it.
///
/// Dropping the engine closes the relay: operations still waiting for a peer
/// finish with a cancellation.
pub struct LoopbackEngine {
    runtime: Option<Runtime>,
    relay: Arc<Relay>,
}

impl LoopbackEngine {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("wormhole-loopback")
            .enable_all()
            .build()?;
        info!("loopback engine started");
        Ok(Self {
            runtime: Some(runtime),
            relay: Arc::new(Relay::default()),
        })
    }

    /// Engine state for one session, bound to that session's configuration.
    pub fn open(&self, config: &ClientConfig) -> Result<Box<SessionState>> {
        let handle = self
            .runtime
            .as_ref()
            .filter(|_| !self.relay.is_closed())
            .map(|runtime| runtime.handle().clone())
            .ok_or_else(|| BridgeError::Engine(ERR_ENGINE_SHUT_DOWN.into()))?;
        let client = LoopbackClient {
            config: config.clone(),
            relay: Arc::clone(&self.relay),
            handle,
            generated: Mutex::new(Vec::new()),
        };
        Ok(Box::new(SessionState::new(Arc::new(client))))
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.relay.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("loopback engine stopped");
    }
}

struct LoopbackClient {
    config: ClientConfig,
    relay: Arc<Relay>,
    handle: Handle,
    /// Mailboxes reserved by `generate_code`, held until the state is dropped.
    generated: Mutex<Vec<((String, String), TransferId)>>,
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        let generated = self
            .generated
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (key, transfer_id) in generated.drain(..) {
            if self.relay.release_unclaimed(&key, transfer_id) {
                debug!(app_id = %key.0, nameplate = %key.1, "released unused nameplate");
            }
        }
    }
}

impl EngineClient for LoopbackClient {
    fn run(&self, request: &TransferRequest, transfer: &mut Transfer) {
        let outcome = match request {
            TransferRequest::GenerateCode => return self.generate_code(transfer),
            TransferRequest::SendText { code, text } => self.send_text(transfer, code, text),
            TransferRequest::SendFile { code, file_name } => {
                self.send_file(transfer, code, file_name)
            }
            TransferRequest::Receive { code } => self.receive(transfer, code),
        };
        match outcome {
            Ok(outcome) => transfer.deliver_result(outcome),
            Err(message) => {
                transfer.log(&message);
                transfer.deliver_result(failure_outcome(request.operation(), message));
            }
        }
    }

    fn spawn(&self, job: Job) -> Result<InFlight> {
        if self.relay.is_closed() {
            return Err(BridgeError::Engine(ERR_ENGINE_SHUT_DOWN.into()));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.handle.spawn_blocking(move || {
            let _ = done_tx.send(job());
        });
        Ok(InFlight::new(move || done_rx.blocking_recv().ok()))
    }
}

type Step<T> = std::result::Result<T, String>;

impl LoopbackClient {
    #[instrument(skip_all)]
    fn generate_code(&self, transfer: &mut Transfer) {
        let outcome = match random_words(self.config.passphrase_length) {
            Err(message) => CodegenOutcome::CodeGenerationFailed(message),
            Ok(words) => match self.relay.allocate(&self.config.app_id) {
                Ok((nameplate, transfer_id)) => {
                    let code = format!("{nameplate}-{words}");
                    self.generated
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(((self.config.app_id.clone(), nameplate), transfer_id));
                    CodegenOutcome::Generated { code, transfer_id }
                }
                Err(message) => CodegenOutcome::FailedToGetClient(message),
            },
        };
        transfer.deliver_codegen(outcome);
    }

    #[instrument(skip_all, fields(code = %code))]
    fn send_text(&self, transfer: &mut Transfer, code: &str, text: &str) -> Step<TransferOutcome> {
        let (end, transfer_id) = self.relay.claim_sender(&self.config.app_id, code)?;
        transfer.log(&format!("offering text on transfer {transfer_id}"));
        let length = i64::try_from(text.len()).unwrap_or(i64::MAX);
        transfer.update_progress(0, length);

        end.offers
            .send(Offer {
                code: code.to_owned(),
                payload: Payload::Text(text.to_owned()),
            })
            .map_err(|_| ERR_CONTEXT_CANCELLED.to_owned())?;

        if let Some(refused) = await_verdict(end.verdicts)? {
            return Ok(refused);
        }
        transfer.update_progress(length, length);
        Ok(TransferOutcome::sent())
    }

    #[instrument(skip_all, fields(code = %code, file = %file_name))]
    fn send_file(
        &self,
        transfer: &mut Transfer,
        code: &str,
        file_name: &str,
    ) -> Step<TransferOutcome> {
        let length = transfer
            .source_len()
            .map_err(|e| format!("failed to size source: {e}"))?;
        let total = i64::try_from(length).unwrap_or(i64::MAX);
        let (end, transfer_id) = self.relay.claim_sender(&self.config.app_id, code)?;
        transfer.log(&format!("offering {file_name} ({length} bytes) on transfer {transfer_id}"));

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        end.offers
            .send(Offer {
                code: code.to_owned(),
                payload: Payload::File {
                    name: file_name.to_owned(),
                    length,
                    chunks: chunk_rx,
                },
            })
            .map_err(|_| ERR_CONTEXT_CANCELLED.to_owned())?;

        if let Some(refused) = await_verdict(end.verdicts)? {
            return Ok(refused);
        }

        transfer.update_progress(0, total);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; MAX_READ_CHUNK];
        let mut sent: i64 = 0;
        loop {
            let read = transfer
                .read(&mut buffer)
                .map_err(|e| format!("failed to read source: {e}"))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            chunk_tx
                .blocking_send(buffer[..read].to_vec())
                .map_err(|_| ERR_BROKEN_PIPE.to_owned())?;
            sent += read as i64;
            transfer.update_progress(sent, total);
        }
        drop(chunk_tx);
        if sent < total {
            // The receiver sees the channel close short and cancels.
            return Err(format!(
                "source ended after {sent} of {length} bytes: {ERR_UNEXPECTED_EOF}"
            ));
        }

        let digest = hex::encode(hasher.finalize());
        match end.acks.blocking_recv() {
            Ok(Ack::Received { sha256 }) if sha256 == digest => {
                debug!(%digest, "receiver confirmed digest");
                Ok(TransferOutcome::sent())
            }
            Ok(Ack::Received { sha256 }) => Err(format!(
                "sha256 mismatch: sent {digest}, receiver computed {sha256}"
            )),
            Ok(Ack::Failed(message)) => Err(message),
            Err(_) => Err(ERR_CONTEXT_CANCELLED.to_owned()),
        }
    }

    #[instrument(skip_all, fields(code = %code))]
    fn receive(&self, transfer: &mut Transfer, code: &str) -> Step<TransferOutcome> {
        let (end, transfer_id) = self.relay.claim_receiver(&self.config.app_id, code)?;
        transfer.log(&format!(
            "waiting for an offer on nameplate {}",
            nameplate(code)
        ));
        let ReceiverEnd {
            offers,
            verdicts,
            acks,
        } = end;
        let offer = offers
            .blocking_recv()
            .map_err(|_| ERR_CONTEXT_CANCELLED.to_owned())?;

        if offer.code != code {
            let _ = verdicts.send(Verdict::WrongCode);
            return Ok(TransferOutcome::failed(
                TransferFailure::WrongCode,
                ERR_WRONG_CODE,
            ));
        }

        let (name, length, mut chunks) = match offer.payload {
            Payload::Text(text) => {
                if verdicts.send(Verdict::Accept).is_err() {
                    transfer.log(ERR_TEXT_UNCONFIRMED);
                    return Ok(TransferOutcome::failed(
                        TransferFailure::ReceiveText,
                        ERR_TEXT_UNCONFIRMED,
                    ));
                }
                let length = i64::try_from(text.len()).unwrap_or(i64::MAX);
                transfer.update_progress(length, length);
                return Ok(TransferOutcome::text_received(text));
            }
            Payload::File {
                name,
                length,
                chunks,
            } => (name, length, chunks),
        };

        let total = i64::try_from(length).unwrap_or(i64::MAX);
        let decision = transfer
            .offer_metadata(total, &name, transfer_id)
            .map_err(|e| e.to_string())?;
        if decision == OfferDecision::Reject {
            let _ = verdicts.send(Verdict::Reject);
            return Ok(TransferOutcome::failed(
                TransferFailure::Rejected,
                ERR_TRANSFER_REJECTED,
            ));
        }
        let _ = verdicts.send(Verdict::Accept);

        transfer.update_progress(0, total);
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        while let Some(chunk) = chunks.blocking_recv() {
            received += chunk.len() as u64;
            let failure = if received > length {
                Some(format!("peer sent more than the {length} bytes offered"))
            } else {
                transfer
                    .write(&chunk)
                    .err()
                    .map(|e| format!("failed to write: {e}"))
            };
            if let Some(message) = failure {
                let _ = acks.send(Ack::Failed(message.clone()));
                return Err(message);
            }
            hasher.update(&chunk);
            transfer.update_progress(i64::try_from(received).unwrap_or(i64::MAX), total);
        }

        if received < length {
            let _ = acks.send(Ack::Failed(ERR_UNEXPECTED_EOF.to_owned()));
            return Err(ERR_UNEXPECTED_EOF.to_owned());
        }
        let _ = acks.send(Ack::Received {
            sha256: hex::encode(hasher.finalize()),
        });
        Ok(TransferOutcome::sent())
    }
}

/// `None` once the receiver accepts, or the refusal the sender finishes with.
fn await_verdict(verdicts: oneshot::Receiver<Verdict>) -> Step<Option<TransferOutcome>> {
    match verdicts.blocking_recv() {
        Ok(Verdict::Accept) => Ok(None),
        Ok(Verdict::Reject) => Ok(Some(TransferOutcome::failed(
            TransferFailure::Rejected,
            ERR_TRANSFER_REJECTED,
        ))),
        Ok(Verdict::WrongCode) => Ok(Some(TransferOutcome::failed(
            TransferFailure::WrongCode,
            ERR_WRONG_CODE,
        ))),
        Err(_) => Err(ERR_CONTEXT_CANCELLED.to_owned()),
    }
}

fn random_words(count: u32) -> Step<String> {
    let mut picks = vec![0u8; count as usize];
    SystemRandom::new()
        .fill(&mut picks)
        .map_err(|_| "system random source unavailable".to_owned())?;
    Ok(picks
        .iter()
        .map(|pick| WORDS[usize::from(*pick) % WORDS.len()])
        .collect::<Vec<_>>()
        .join("-"))
}
