// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session bridge between a foreign caller and an asynchronous transfer
// engine.
//
// The caller registers a callback table, creates one session per operation,
// attaches engine state and starts the operation. Everything the engine
// reports afterwards (progress, file offers, log lines and exactly one
// terminal result) arrives through the table on the engine's worker thread.
// `ffi` exposes the same lifecycle over the C ABI.

pub mod ffi;
pub mod loopback;
pub mod scratch;
pub mod session;
pub mod traits;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use loopback::LoopbackEngine;
pub use scratch::Scratch;
pub use session::{SessionContext, TeardownReport};
pub use traits::{EngineClient, InFlight, Job, SessionCallbacks, SessionState};
pub use transfer::{Transfer, TransferStream};

use tracing_subscriber::EnvFilter;

/// Install a `tracing` fmt subscriber.
///
/// `filter` takes `EnvFilter` directives; without one, `RUST_LOG` is used and
/// then `info`. A second call, or a host that already installed a subscriber,
/// leaves the existing one in place.
pub fn init_logging(filter: Option<&str>) {
    let filter = filter
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "wormhole bridge logging ready");
    }
}
