//! Serve loop: accepts connections and hands them to the request handler.

use std::convert::Infallible;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, warn};

use davkit_core::ListenOptions;

use crate::handler::RequestHandler;
use crate::listener::{Accept, Stream};
use crate::tls::{self, TlsError};

/// First delay after a transient accept error.
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the accept backoff.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that end the serve loop.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to load TLS material: {0}")]
    Tls(#[from] TlsError),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Whether connections are wrapped in TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls { cert: PathBuf, key: PathBuf },
}

impl Transport {
    /// Pick the transport described by the listen options.
    pub fn from_options(options: &ListenOptions) -> Self {
        if options.tls {
            Self::Tls {
                cert: PathBuf::from(&options.cert),
                key: PathBuf::from(&options.key),
            }
        } else {
            Self::Plain
        }
    }
}

/// Run the accept loop until `cancel` fires or a fatal error occurs.
///
/// Nothing is accepted before `gate` resolves, so callers can finish their
/// own bookkeeping first. A dropped gate sender counts as released.
///
/// # Arguments
///
/// * `listener` - Bound listener, owned by the loop from here on
/// * `handler` - Default request handler receiving all traffic
/// * `transport` - Plain or TLS; TLS material is read after the gate opens
/// * `gate` - Start gate
/// * `cancel` - Closes the listener and all live connections
///
/// # Returns
///
/// `Ok(())` when closed through `cancel`, otherwise the error that stopped it.
pub async fn serve(
    mut listener: Box<dyn Accept>,
    handler: Arc<dyn RequestHandler>,
    transport: Transport,
    gate: oneshot::Receiver<()>,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        _ = gate => {}
    }

    let acceptor = match &transport {
        Transport::Plain => None,
        Transport::Tls { cert, key } => Some(tls::load_acceptor(cert, key)?),
    };
    info!(tls = acceptor.is_some(), "Serve loop accepting connections");

    let mut backoff: Option<Duration> = None;
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                backoff = None;
                tokio::spawn(
                    handle_connection(
                        stream,
                        acceptor.clone(),
                        Arc::clone(&handler),
                        cancel.child_token(),
                    )
                    .in_current_span(),
                );
            }
            Err(error) if is_transient(&error) => {
                let delay = backoff.map_or(MIN_ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF));
                backoff = Some(delay);
                warn!(%error, ?delay, "Transient accept error; retrying");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err(ServeError::Accept(error)),
        }
    }

    info!("Serve loop closed");
    Ok(())
}

/// Accept errors that say nothing about the listener itself.
fn is_transient(error: &io::Error) -> bool {
    // EMFILE / ENFILE: descriptor exhaustion clears once connections close.
    #[cfg(unix)]
    if matches!(error.raw_os_error(), Some(23 | 24)) {
        return true;
    }
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

async fn handle_connection(
    stream: Stream,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
) {
    match acceptor {
        None => serve_connection(stream, handler, cancel).await,
        Some(acceptor) => {
            let handshake = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                handshake = acceptor.accept(stream) => handshake,
            };
            match handshake {
                Ok(tls_stream) => serve_connection(tls_stream, handler, cancel).await,
                Err(error) => debug!(%error, "TLS handshake failed"),
            }
        }
    }
}

async fn serve_connection<I>(io: I, handler: Arc<dyn RequestHandler>, cancel: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(request).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);

    tokio::select! {
        result = connection => {
            if let Err(error) = result {
                debug!(%error, "Connection ended with error");
            }
        }
        () = cancel.cancelled() => debug!("Dropping connection on shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use http::{Request, Response};
    use hyper::body::Incoming;

    use crate::handler::{ResponseBody, RequestLogger, empty};

    struct NullHandler;

    #[async_trait]
    impl RequestHandler for NullHandler {
        async fn handle(&self, _request: Request<Incoming>) -> Response<ResponseBody> {
            Response::new(empty())
        }

        fn set_logger(&self, _logger: RequestLogger) {}
    }

    /// Replays scripted accept results, then waits forever.
    struct ScriptedAccept(VecDeque<io::Error>);

    #[async_trait]
    impl Accept for ScriptedAccept {
        async fn accept(&mut self) -> io::Result<Stream> {
            match self.0.pop_front() {
                Some(error) => Err(error),
                None => std::future::pending().await,
            }
        }
    }

    fn scripted(errors: Vec<io::Error>) -> Box<dyn Accept> {
        Box::new(ScriptedAccept(errors.into()))
    }

    fn open_gate() -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        rx
    }

    #[test]
    fn test_transient_errors_are_classified() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::other("listener gone")));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(is_transient(&io::Error::from_raw_os_error(23)));
    }

    #[test]
    fn test_transport_follows_tls_flag() {
        let mut options = ListenOptions::default();
        assert_eq!(Transport::from_options(&options), Transport::Plain);

        options.tls = true;
        assert_eq!(
            Transport::from_options(&options),
            Transport::Tls {
                cert: PathBuf::from("cert.pem"),
                key: PathBuf::from("key.pem"),
            }
        );
    }

    #[tokio::test]
    async fn test_fatal_accept_error_ends_loop() {
        let result = serve(
            scripted(vec![io::Error::other("boom")]),
            Arc::new(NullHandler),
            Transport::Plain,
            open_gate(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ServeError::Accept(_))));
    }

    #[tokio::test]
    async fn test_transient_errors_back_off_then_cancel_cleanly() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            scripted(vec![
                io::Error::from(io::ErrorKind::ConnectionAborted),
                io::Error::from(io::ErrorKind::ConnectionReset),
            ]),
            Arc::new(NullHandler),
            Transport::Plain,
            open_gate(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        cancel.cancel();

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_gate_returns_ok() {
        let (_tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = serve(
            scripted(vec![io::Error::other("never reached")]),
            Arc::new(NullHandler),
            Transport::Plain,
            rx,
            cancel,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unreadable_tls_material_fails_after_gate() {
        let dir = tempfile::tempdir().unwrap();
        let result = serve(
            scripted(Vec::new()),
            Arc::new(NullHandler),
            Transport::Tls {
                cert: dir.path().join("missing-cert.pem"),
                key: dir.path().join("missing-key.pem"),
            },
            open_gate(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ServeError::Tls(_))));
    }
}
