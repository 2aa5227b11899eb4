// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Client configuration.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::OperationClass;

pub const DEFAULT_APP_ID: &str = "lothar.com/wormhole/text-or-file-xfer";
pub const DEFAULT_RENDEZVOUS_URL: &str = "ws://relay.magic-wormhole.io:4000/v1";
pub const DEFAULT_TRANSIT_RELAY_URL: &str = "tcp:transit.magic-wormhole.io:4001";
pub const DEFAULT_PASSPHRASE_LENGTH: u32 = 2;

/// Longest invitation code (in words) an engine is asked to generate.
pub const MAX_PASSPHRASE_LENGTH: u32 = 16;

/// Environment variables consulted by [`ClientConfig::from_env`].
pub const ENV_RENDEZVOUS_URL: &str = "WORMHOLE_RELAY_URL";
pub const ENV_TRANSIT_RELAY_URL: &str = "WORMHOLE_TRANSITSERVER_URL";
pub const ENV_APP_ID: &str = "WORMHOLE_APPID";

/// Settings for one session's engine client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Protocol namespace; peers only meet within the same app id.
    pub app_id: String,
    /// Rendezvous (mailbox) server, `ws://` or `wss://`.
    pub rendezvous_url: String,
    /// Transit relay in `tcp:host:port` form.
    pub transit_relay_url: String,
    /// Number of words in a generated invitation code.
    pub passphrase_length: u32,
    /// Invitation code to rendezvous on. Required for sends and receives.
    pub code: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_owned(),
            rendezvous_url: DEFAULT_RENDEZVOUS_URL.to_owned(),
            transit_relay_url: DEFAULT_TRANSIT_RELAY_URL.to_owned(),
            passphrase_length: DEFAULT_PASSPHRASE_LENGTH,
            code: None,
        }
    }
}

impl ClientConfig {
    /// Default settings bound to an invitation code.
    pub fn with_code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overlaid with the `WORMHOLE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values returned by `lookup` for the `WORMHOLE_*` variable names.
    /// Empty values are ignored.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |name: &str| lookup(name).filter(|value: &String| !value.is_empty());
        if let Some(url) = lookup(ENV_RENDEZVOUS_URL) {
            self.rendezvous_url = url;
        }
        if let Some(url) = lookup(ENV_TRANSIT_RELAY_URL) {
            self.transit_relay_url = url;
        }
        if let Some(app_id) = lookup(ENV_APP_ID) {
            self.app_id = app_id;
        }
        self
    }

    /// Check the settings needed by a session of class `operation`.
    pub fn validate(&self, operation: OperationClass) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("app_id is empty".into()));
        }
        if !(self.rendezvous_url.starts_with("ws://") || self.rendezvous_url.starts_with("wss://"))
        {
            return Err(BridgeError::InvalidConfig(format!(
                "rendezvous_url must be a ws:// or wss:// URL, got {:?}",
                self.rendezvous_url
            )));
        }
        validate_transit_relay(&self.transit_relay_url)?;
        if !(1..=MAX_PASSPHRASE_LENGTH).contains(&self.passphrase_length) {
            return Err(BridgeError::InvalidConfig(format!(
                "passphrase_length must be between 1 and {MAX_PASSPHRASE_LENGTH}, got {}",
                self.passphrase_length
            )));
        }
        match (&self.code, operation.needs_code()) {
            (Some(code), true) => validate_code(code),
            (None, true) => Err(BridgeError::InvalidConfig(format!(
                "{operation} needs an invitation code"
            ))),
            (_, false) => Ok(()),
        }
    }
}

fn validate_transit_relay(url: &str) -> Result<()> {
    let invalid = || {
        BridgeError::InvalidConfig(format!(
            "transit_relay_url must look like tcp:host:port, got {url:?}"
        ))
    };
    let rest = url.strip_prefix("tcp:").ok_or_else(invalid)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

/// Check that `code` is `<nameplate>-<word>[-<word>...]`.
pub fn validate_code(code: &str) -> Result<()> {
    let mut parts = code.split('-');
    let nameplate = parts.next().unwrap_or_default();
    let words: Vec<&str> = parts.collect();
    let nameplate_ok = !nameplate.is_empty() && nameplate.bytes().all(|b| b.is_ascii_digit());
    let words_ok = !words.is_empty()
        && words
            .iter()
            .all(|w| !w.is_empty() && w.bytes().all(|b| b.is_ascii_alphanumeric()));
    if nameplate_ok && words_ok {
        Ok(())
    } else {
        Err(BridgeError::InvalidCode(code.to_owned()))
    }
}

/// Nameplate part of an invitation code (`"7"` for `"7-guitarist-revenge"`).
pub fn nameplate(code: &str) -> &str {
    code.split_once('-').map_or(code, |(nameplate, _)| nameplate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_codegen() {
        assert!(ClientConfig::default().validate(OperationClass::GenerateCode).is_ok());
    }

    #[test]
    fn send_without_code_is_rejected() {
        let err = ClientConfig::default()
            .validate(OperationClass::SendText)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_codes() {
        assert!(validate_code("7-guitarist-revenge").is_ok());
        assert!(validate_code("12-x").is_ok());
        for bad in ["", "7", "7-", "guitarist-revenge", "7--revenge", "7-gui tar"] {
            assert!(
                matches!(validate_code(bad), Err(BridgeError::InvalidCode(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn transit_relay_needs_host_and_port() {
        let mut config = ClientConfig::with_code("3-a-b");
        config.transit_relay_url = "tcp:relay.example:notaport".into();
        assert!(config.validate(OperationClass::SendFile).is_err());
        config.transit_relay_url = "tcp:relay.example:4001".into();
        assert!(config.validate(OperationClass::SendFile).is_ok());
    }

    #[test]
    fn passphrase_length_bounds() {
        let mut config = ClientConfig::default();
        config.passphrase_length = 0;
        assert!(config.validate(OperationClass::GenerateCode).is_err());
        config.passphrase_length = MAX_PASSPHRASE_LENGTH + 1;
        assert!(config.validate(OperationClass::GenerateCode).is_err());
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = ClientConfig::from_json(r#"{"app_id": "example.org/test", "code": "5-x-y"}"#)
            .expect("parse config");
        assert_eq!(config.app_id, "example.org/test");
        assert_eq!(config.code.as_deref(), Some("5-x-y"));
        assert_eq!(config.rendezvous_url, DEFAULT_RENDEZVOUS_URL);
        assert_eq!(config.passphrase_length, DEFAULT_PASSPHRASE_LENGTH);
    }

    #[test]
    fn overrides_skip_empty_values() {
        let config = ClientConfig::default().apply_overrides(|name| match name {
            ENV_RENDEZVOUS_URL => Some("wss://mailbox.example/v1".into()),
            ENV_APP_ID => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.rendezvous_url, "wss://mailbox.example/v1");
        assert_eq!(config.app_id, DEFAULT_APP_ID);
        assert_eq!(config.transit_relay_url, DEFAULT_TRANSIT_RELAY_URL);
    }

    #[test]
    fn nameplate_prefix() {
        assert_eq!(nameplate("7-guitarist-revenge"), "7");
        assert_eq!(nameplate("7"), "7");
    }
}
