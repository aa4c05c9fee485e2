//! Listen settings and log format selection.
//!
//! These are pure domain types. Where the values come from (config file,
//! environment, host UI) is the configuration collaborator's business; this
//! module only defines the string-keyed lookup and the defaults applied when a
//! key is unset.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::address::ListenAddress;

/// Default bind address (all interfaces).
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// Default port; `0` lets the OS assign one.
pub const DEFAULT_PORT: &str = "0";

/// Default certificate path used when TLS is enabled.
pub const DEFAULT_CERT: &str = "cert.pem";

/// Default private key path used when TLS is enabled.
pub const DEFAULT_KEY: &str = "key.pem";

/// Prefix for environment-backed option lookups.
pub const DEFAULT_ENV_PREFIX: &str = "WD_";

/// Source of string-keyed configuration values.
pub trait OptionLookup {
    /// Raw value for `key`, or `None` when the key is unset.
    fn get(&self, key: &str) -> Option<String>;
}

impl OptionLookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Option lookup backed by environment variables.
///
/// `address` resolves to `WD_ADDRESS` with the default prefix.
#[derive(Debug, Clone, Default)]
pub struct EnvLookup {
    vars: HashMap<String, String>,
}

impl EnvLookup {
    /// Snapshot the process environment under `prefix`.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Build from an explicit variable list (used by tests and hosts that
    /// forward their own environment).
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let key = key.into();
                key.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_ascii_lowercase(), value.into()))
            })
            .collect();
        Self { vars }
    }
}

impl OptionLookup for EnvLookup {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(&key.to_ascii_lowercase()).cloned()
    }
}

/// Parse a boolean option using the conventional spellings.
///
/// Returns `None` for anything outside the accepted spellings.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Listener settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Host or `unix:<path>`.
    pub address: String,
    /// Port string; ignored for Unix sockets.
    pub port: String,
    /// Serve over TLS.
    pub tls: bool,
    /// PEM certificate chain path.
    pub cert: String,
    /// PEM private key path.
    pub key: String,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT.to_string(),
            tls: false,
            cert: DEFAULT_CERT.to_string(),
            key: DEFAULT_KEY.to_string(),
        }
    }
}

impl ListenOptions {
    /// Read every key from `lookup`, falling back to the defaults.
    pub fn from_lookup(lookup: &dyn OptionLookup) -> Self {
        let defaults = Self::default();
        Self {
            address: lookup.get("address").unwrap_or(defaults.address),
            port: lookup.get("port").unwrap_or(defaults.port),
            tls: lookup
                .get("tls")
                .and_then(|raw| {
                    let parsed = parse_bool(&raw);
                    if parsed.is_none() {
                        debug!(value = %raw, "Ignoring unparsable tls option");
                    }
                    parsed
                })
                .unwrap_or(defaults.tls),
            cert: lookup.get("cert").unwrap_or(defaults.cert),
            key: lookup.get("key").unwrap_or(defaults.key),
        }
    }

    /// Resolve the transport and concrete address to bind.
    pub fn listen_address(&self) -> ListenAddress {
        ListenAddress::resolve(&self.address, &self.port)
    }
}

/// Structured log encoding selected by the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single line.
    #[default]
    Console,
    /// One compact JSON object per record.
    Json,
}

/// Unknown log format name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported log format '{0}' (expected 'console' or 'json')")]
pub struct LogFormatParseError(pub String);

impl FromStr for LogFormat {
    type Err = LogFormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            other => Err(LogFormatParseError(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => write!(f, "console"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let options = ListenOptions::from_lookup(&lookup(&[]));
        assert_eq!(options, ListenOptions::default());
        assert_eq!(options.address, "0.0.0.0");
        assert_eq!(options.port, "0");
        assert!(!options.tls);
        assert_eq!(options.cert, "cert.pem");
        assert_eq!(options.key, "key.pem");
    }

    #[test]
    fn test_set_values_override_defaults() {
        let options = ListenOptions::from_lookup(&lookup(&[
            ("address", "unix:/tmp/dav.sock"),
            ("tls", "true"),
            ("cert", "/etc/dav/cert.pem"),
        ]));
        assert_eq!(options.address, "unix:/tmp/dav.sock");
        assert!(options.tls);
        assert_eq!(options.cert, "/etc/dav/cert.pem");
        assert_eq!(options.key, "key.pem");
        assert_eq!(options.listen_address().transport(), "unix");
    }

    #[test]
    fn test_unparsable_bool_falls_back_to_default() {
        let options = ListenOptions::from_lookup(&lookup(&[("tls", "yes please")]));
        assert!(!options.tls);
    }

    #[test]
    fn test_parse_bool_spellings() {
        for raw in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("tRuE"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_env_lookup_strips_prefix_and_ignores_others() {
        let env = EnvLookup::from_vars(
            DEFAULT_ENV_PREFIX,
            [
                ("WD_ADDRESS", "127.0.0.1"),
                ("WD_PORT", "8081"),
                ("HOME", "/root"),
            ],
        );
        assert_eq!(env.get("address").as_deref(), Some("127.0.0.1"));
        assert_eq!(env.get("port").as_deref(), Some("8081"));
        assert_eq!(env.get("home"), None);

        let options = ListenOptions::from_lookup(&env);
        assert_eq!(options.listen_address().to_string(), "tcp://127.0.0.1:8081");
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Console".parse::<LogFormat>(), Ok(LogFormat::Console));
        assert_eq!("".parse::<LogFormat>(), Ok(LogFormat::Console));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
