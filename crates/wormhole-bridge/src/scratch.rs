// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-session scratch storage for in-flight envelopes.

use tracing::debug;
use wormhole_core::types::{
    CodegenOutcome, EnvelopeKind, FileMetadata, Progress, SessionId, TransferOutcome,
};

/// One slot per envelope kind. Slots start empty and are filled on first use.
///
/// The progress slot is rewritten in place on every update. The other slots
/// only hold an envelope the caller never took: a terminal result staged
/// without a registered result callback, or an offer accepted without a
/// metadata callback.
#[derive(Debug, Default)]
pub struct Scratch {
    pub(crate) progress: Option<Progress>,
    pub(crate) result: Option<TransferOutcome>,
    pub(crate) codegen: Option<CodegenOutcome>,
    pub(crate) metadata: Option<FileMetadata>,
}

impl Scratch {
    pub fn progress(&self) -> Option<Progress> {
        self.progress
    }

    pub fn result(&self) -> Option<&TransferOutcome> {
        self.result.as_ref()
    }

    pub fn codegen(&self) -> Option<&CodegenOutcome> {
        self.codegen.as_ref()
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    /// Drop every populated envelope slot, returning the kinds released.
    ///
    /// Each slot is inspected by its discriminant; only payloads that exist
    /// for that variant are touched.
    pub(crate) fn release(&mut self, session: SessionId) -> Vec<EnvelopeKind> {
        let mut released = Vec::new();

        if let Some(result) = self.result.take() {
            match &result {
                TransferOutcome::Success {
                    received_text: Some(text),
                } => debug!(%session, bytes = text.len(), "releasing undelivered received text"),
                TransferOutcome::Success {
                    received_text: None,
                } => debug!(%session, "releasing undelivered success result"),
                TransferOutcome::Failed { failure, message } => {
                    debug!(%session, ?failure, %message, "releasing undelivered failure result")
                }
            }
            released.push(EnvelopeKind::Result);
        }

        if let Some(codegen) = self.codegen.take() {
            match &codegen {
                CodegenOutcome::Generated { transfer_id, .. } => {
                    debug!(%session, %transfer_id, "releasing undelivered generated code")
                }
                CodegenOutcome::FailedToGetClient(message)
                | CodegenOutcome::CodeGenerationFailed(message) => {
                    debug!(%session, %message, "releasing undelivered codegen failure")
                }
            }
            released.push(EnvelopeKind::CodegenResult);
        }

        if let Some(metadata) = self.metadata.take() {
            debug!(%session, file = %metadata.file_name, "releasing staged file metadata");
            released.push(EnvelopeKind::Metadata);
        }

        self.progress = None;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wormhole_core::types::{TransferFailure, TransferId};

    #[test]
    fn empty_scratch_releases_nothing() {
        let mut scratch = Scratch::default();
        assert!(scratch.release(SessionId::new()).is_empty());
    }

    #[test]
    fn release_empties_every_slot_once() {
        let session = SessionId::new();
        let mut scratch = Scratch {
            progress: Some(Progress::new(3, 10)),
            result: Some(TransferOutcome::failed(TransferFailure::SendFile, "boom")),
            codegen: None,
            metadata: Some(FileMetadata {
                length: 10,
                file_name: "notes.txt".into(),
                transfer_id: TransferId(1),
                session,
            }),
        };

        let released = scratch.release(session);
        assert_eq!(released, vec![EnvelopeKind::Result, EnvelopeKind::Metadata]);
        assert!(scratch.progress().is_none());
        assert!(scratch.release(session).is_empty());
    }
}
