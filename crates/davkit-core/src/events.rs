//! Host-facing lifecycle events.
//!
//! The controller reports everything that happens to a running service
//! through the [`ServiceCallback`] port. There is no other error channel:
//! start failures, stop failures, log output and per-request diagnostics all
//! arrive as [`EventCode`]-tagged messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category tag attached to every [`ServiceCallback::on_message`] call.
///
/// The integer values are part of the host contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventCode {
    /// Binding failed, or the serve loop ended with an error.
    StartFailed = -0x1,
    /// Releasing the listener or socket file failed during stop.
    StopFailed = -0x2,
    /// `start` was called while an instance is already running.
    AlreadyRunning = 0x01,
    /// A structured log record forwarded by the logging bridge.
    Message = 0x10,
    /// A per-request diagnostic record.
    Request = 0x20,
}

impl EventCode {
    /// Integer value handed to hosts that cannot consume the enum directly.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a raw integer back to a code.
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            -0x1 => Some(Self::StartFailed),
            -0x2 => Some(Self::StopFailed),
            0x01 => Some(Self::AlreadyRunning),
            0x10 => Some(Self::Message),
            0x20 => Some(Self::Request),
            _ => None,
        }
    }

    /// Whether the code signals a failure the host should surface.
    pub const fn is_failure(self) -> bool {
        self.as_i32() < 0
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartFailed => write!(f, "start_failed"),
            Self::StopFailed => write!(f, "stop_failed"),
            Self::AlreadyRunning => write!(f, "already_running"),
            Self::Message => write!(f, "message"),
            Self::Request => write!(f, "request"),
        }
    }
}

/// Port implemented by the embedding host to receive service events.
///
/// # Design
///
/// - **Object-safe**: held as `Arc<dyn ServiceCallback>` for the lifetime of
///   one running instance and dropped when that instance ends
/// - **Fire-and-forget**: methods don't return `Result`; hosts handle their
///   own failures
/// - **Concurrent**: `on_message` may be called from several tasks at once
///   (log records and request diagnostics originate on different threads)
///
/// # Ordering
///
/// `on_start` is always delivered before any message produced by the serve
/// loop of the same start. Nothing else is ordered across categories.
///
/// # Example
///
/// ```rust
/// use davkit_core::events::{EventCode, ServiceCallback};
///
/// struct PrintingCallback;
///
/// impl ServiceCallback for PrintingCallback {
///     fn on_start(&self, address: &str) {
///         println!("listening on {address}");
///     }
///     fn on_stop(&self) {
///         println!("stopped");
///     }
///     fn on_message(&self, code: EventCode, message: &str) {
///         println!("[{code}] {message}");
///     }
/// }
/// ```
pub trait ServiceCallback: Send + Sync {
    /// Called exactly once per successful start with the bound address
    /// (the port number for TCP, the socket path for Unix sockets).
    fn on_start(&self, address: &str);

    /// Called exactly once when the serve loop ends because of a stop request.
    fn on_stop(&self);

    /// Called for every other event.
    fn on_message(&self, code: EventCode, message: &str);
}

/// No-op implementation of `ServiceCallback` for tests and headless hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

impl ServiceCallback for NoopCallback {
    fn on_start(&self, _address: &str) {}
    fn on_stop(&self) {}
    fn on_message(&self, _code: EventCode, _message: &str) {}
}
