//! Runtime for the davkit file service.
//!
//! Hosts embed a single service instance and drive it with two calls,
//! [`start`] and [`stop`]. Everything that happens afterwards (bound address,
//! shutdown, failures, log records and per-request diagnostics) is reported
//! through the host's [`ServiceCallback`](davkit_core::ServiceCallback).
//!
//! The protocol itself is supplied by the host as a [`RequestHandler`]; this
//! crate owns the listener, TLS, the HTTP connection loop, and the bridges
//! that route logs and request summaries back to the host.

pub mod config;
pub mod controller;
pub mod diagnostics;
mod global;
pub mod handler;
pub mod listener;
pub mod logging;
pub mod serve;
pub mod tls;

pub use config::{ConfigError, ConfigSource, ServiceConfig, StaticConfigSource, UserHandler};
pub use controller::{ALREADY_RUNNING, Controller};
pub use global::{bound_address, is_running, start, stop};
pub use handler::{HandlerError, LoggerSlot, RequestHandler, RequestLogger, ResponseBody};
pub use listener::{Bind, BindError, BoundListener, SocketBinder};
pub use logging::LogSession;
pub use serve::{ServeError, Transport};
pub use tls::TlsError;
