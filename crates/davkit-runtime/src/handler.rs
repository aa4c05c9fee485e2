//! Protocol request handler port.
//!
//! The file-access protocol itself lives outside this crate. The controller
//! only needs two things from it: a way to answer requests and a settable
//! per-request logging hook, which the diagnostics bridge takes over.

use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use http::request::Parts;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

/// Error reported by a handler for a single request.
pub type HandlerError = anyhow::Error;

/// Response body type produced by handlers.
pub type ResponseBody = BoxBody<Bytes, std::io::Error>;

/// Hook invoked by a handler after it completes a request.
///
/// Receives the request head and the handler's error, if any.
pub type RequestLogger = Arc<dyn Fn(&Parts, Option<&HandlerError>) + Send + Sync>;

/// Port for the protocol implementation serving requests.
///
/// Implementations must call the installed [`RequestLogger`] once per
/// completed request; [`LoggerSlot`] covers the bookkeeping.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one request.
    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody>;

    /// Replace the per-request logging hook.
    fn set_logger(&self, logger: RequestLogger);
}

/// Interior-mutable holder for a handler's [`RequestLogger`].
#[derive(Default)]
pub struct LoggerSlot {
    logger: RwLock<Option<RequestLogger>>,
}

impl LoggerSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `logger`, replacing any previous hook.
    pub fn set(&self, logger: RequestLogger) {
        *self.logger.write().unwrap_or_else(PoisonError::into_inner) = Some(logger);
    }

    /// Whether a hook is installed.
    pub fn is_set(&self) -> bool {
        self.logger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Invoke the hook if one is installed.
    pub fn log(&self, parts: &Parts, error: Option<&HandlerError>) {
        let logger = self
            .logger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(logger) = logger {
            logger(parts, error);
        }
    }
}

impl fmt::Debug for LoggerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Body with the given bytes.
pub fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Body with no bytes.
pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_empty_slot_ignores_log_calls() {
        let slot = LoggerSlot::new();
        let (parts, ()) = Request::builder().uri("/").body(()).unwrap().into_parts();
        assert!(!slot.is_set());
        slot.log(&parts, None);
    }

    #[test]
    fn test_slot_forwards_to_latest_logger() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot = LoggerSlot::new();

        let first = Arc::clone(&seen);
        slot.set(Arc::new(move |parts: &Parts, _err: Option<&HandlerError>| {
            first.lock().unwrap().push(format!("first {}", parts.uri.path()));
        }));
        let second = Arc::clone(&seen);
        slot.set(Arc::new(move |parts: &Parts, err: Option<&HandlerError>| {
            second
                .lock()
                .unwrap()
                .push(format!("second {} {}", parts.uri.path(), err.is_some()));
        }));

        let (parts, ()) = Request::builder().uri("/x").body(()).unwrap().into_parts();
        slot.log(&parts, Some(&anyhow::anyhow!("nope")));

        assert_eq!(*seen.lock().unwrap(), vec!["second /x true".to_string()]);
    }
}
