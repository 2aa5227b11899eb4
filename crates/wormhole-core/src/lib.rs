// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Envelope types, errors and configuration shared by the wormhole bridge
// and the engines behind it.

pub mod classify;
pub mod config;
pub mod error;
pub mod types;

pub use config::ClientConfig;
pub use error::{BridgeError, StreamError};
pub use types::*;
