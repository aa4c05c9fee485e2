//! Core domain types and port definitions for davkit.
//!
//! Nothing in this crate touches sockets or an async runtime. It defines the
//! contract between an embedding host and the service controller in
//! `davkit-runtime`:
//!
//! - [`events`]: the host callback port and its event codes
//! - [`address`]: the listen-address grammar (`unix:<path>` or `host:port`)
//! - [`settings`]: listen options with defaults and the log format selector
//! - [`diagnostics`]: the per-request diagnostic record
#![deny(unused_crate_dependencies)]

pub mod address;
pub mod diagnostics;
pub mod events;
pub mod settings;

// Re-export commonly used types for convenience
pub use address::{BoundAddress, ListenAddress, UNIX_PREFIX};
pub use diagnostics::RequestDiagnostic;
pub use events::{EventCode, NoopCallback, ServiceCallback};
pub use settings::{
    DEFAULT_ADDRESS, DEFAULT_CERT, DEFAULT_ENV_PREFIX, DEFAULT_KEY, DEFAULT_PORT, EnvLookup,
    ListenOptions, LogFormat, LogFormatParseError, OptionLookup, parse_bool,
};
