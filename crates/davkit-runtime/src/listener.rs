//! Address resolver: binds TCP and Unix listeners.
//!
//! Binding is synchronous and happens on the caller's thread so that `start`
//! can report bind failures immediately. The std listener is then handed to
//! tokio, which requires the caller to be inside the controller's runtime
//! context.

use std::fs;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use davkit_core::{BoundAddress, ListenAddress};

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Errors surfaced while binding a listener.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind TCP listener at {addr}: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to register listener with the runtime: {source}")]
    Register {
        #[source]
        source: io::Error,
    },
    #[cfg(not(unix))]
    #[error("unix sockets are unsupported on this platform ({path})")]
    UnsupportedUnix { path: String },
    #[cfg(unix)]
    #[error("failed to bind unix listener at {path}: {source}")]
    Unix {
        path: String,
        #[source]
        source: io::Error,
    },
    #[cfg(unix)]
    #[error("existing unix socket {path} is already in use")]
    UnixInUse { path: String },
    #[cfg(unix)]
    #[error("unix socket path {path} is not a socket")]
    UnixNotSocket { path: String },
    #[cfg(unix)]
    #[error("failed to inspect existing unix socket {path}: {source}")]
    UnixProbe {
        path: String,
        #[source]
        source: io::Error,
    },
    #[cfg(unix)]
    #[error("failed to remove stale unix socket {path}: {source}")]
    UnixCleanup {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Accepted connection, before any TLS handshake.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Tcp(stream) => stream.is_write_vectored(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Source of incoming connections for the serve loop.
#[async_trait]
pub trait Accept: Send {
    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<Stream>;
}

/// Listening socket owned by the serve loop.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

#[async_trait]
impl Accept for Listener {
    async fn accept(&mut self) -> io::Result<Stream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "Accepted TCP connection");
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted unix connection");
                Ok(Stream::Unix(stream))
            }
        }
    }
}

/// A bound listener and the address it actually bound to.
pub struct BoundListener {
    /// Connection source handed to the serve loop.
    pub listener: Box<dyn Accept>,
    /// Real bound address (ephemeral port resolved).
    pub address: BoundAddress,
}

impl std::fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundListener")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Port for turning a [`ListenAddress`] into a bound listener.
///
/// Must be called from within a tokio runtime context.
pub trait Bind: Send + Sync {
    /// Bind `address`. Errors are returned, never reported to the host here.
    fn bind(&self, address: &ListenAddress) -> Result<BoundListener, BindError>;
}

/// Binds real OS sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketBinder;

impl Bind for SocketBinder {
    fn bind(&self, address: &ListenAddress) -> Result<BoundListener, BindError> {
        match address {
            ListenAddress::Tcp { addr } => bind_tcp(addr),
            ListenAddress::Unix { path } => {
                #[cfg(unix)]
                {
                    bind_unix(path)
                }

                #[cfg(not(unix))]
                {
                    Err(BindError::UnsupportedUnix {
                        path: path.display().to_string(),
                    })
                }
            }
        }
    }
}

fn bind_tcp(addr: &str) -> Result<BoundListener, BindError> {
    let tcp_error = |source| BindError::Tcp {
        addr: addr.to_string(),
        source,
    };
    let std_listener = std::net::TcpListener::bind(addr).map_err(tcp_error)?;
    let local = std_listener.local_addr().map_err(tcp_error)?;
    std_listener
        .set_nonblocking(true)
        .map_err(|source| BindError::Register { source })?;
    let listener =
        TcpListener::from_std(std_listener).map_err(|source| BindError::Register { source })?;

    debug!(addr = %local, "TCP listener bound");
    Ok(BoundListener {
        listener: Box::new(Listener::Tcp(listener)),
        address: BoundAddress::Tcp(local),
    })
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<BoundListener, BindError> {
    remove_stale_socket(path)?;

    let std_listener =
        std::os::unix::net::UnixListener::bind(path).map_err(|source| BindError::Unix {
            path: path.display().to_string(),
            source,
        })?;
    std_listener
        .set_nonblocking(true)
        .map_err(|source| BindError::Register { source })?;
    let listener =
        UnixListener::from_std(std_listener).map_err(|source| BindError::Register { source })?;

    debug!(path = %path.display(), "Unix listener bound");
    Ok(BoundListener {
        listener: Box::new(Listener::Unix(listener)),
        address: BoundAddress::Unix(path.to_path_buf()),
    })
}

/// Remove a socket file left behind by a previous process.
///
/// A socket that still accepts connections belongs to someone else and is
/// refused; so is any path that is not a socket.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> Result<(), BindError> {
    let display = || path.display().to_string();
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(BindError::UnixProbe {
                path: display(),
                source,
            });
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(BindError::UnixNotSocket { path: display() });
    }

    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_stream) => Err(BindError::UnixInUse { path: display() }),
        Err(error)
            if error.kind() == io::ErrorKind::ConnectionRefused
                || error.kind() == io::ErrorKind::NotFound =>
        {
            warn!(path = %path.display(), "Removing stale unix socket");
            fs::remove_file(path).map_err(|source| BindError::UnixCleanup {
                path: display(),
                source,
            })
        }
        Err(source) => Err(BindError::UnixProbe {
            path: display(),
            source,
        }),
    }
}

/// Unlink a Unix socket file, treating an already-missing file as success.
pub(crate) fn remove_socket_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_port_zero_reports_assigned_port() {
        let address = ListenAddress::resolve("127.0.0.1", "0");
        let bound = SocketBinder.bind(&address).unwrap();

        let port = bound.address.port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(bound.address.host_label(), port.to_string());
    }

    #[tokio::test]
    async fn test_tcp_listener_accepts_connections() {
        let address = ListenAddress::resolve("127.0.0.1", "0");
        let BoundListener {
            mut listener,
            address,
        } = SocketBinder.bind(&address).unwrap();
        let port = address.port().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut buf = [0_u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_bind_conflict_is_an_error() {
        let first = SocketBinder
            .bind(&ListenAddress::resolve("127.0.0.1", "0"))
            .unwrap();
        let port = first.address.port().unwrap().to_string();

        let error = SocketBinder
            .bind(&ListenAddress::resolve("127.0.0.1", &port))
            .unwrap_err();
        assert!(matches!(error, BindError::Tcp { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dav.sock");
        let address = ListenAddress::resolve(&format!("unix:{}", path.display()), "0");

        let bound = SocketBinder.bind(&address).unwrap();
        assert_eq!(bound.address, BoundAddress::Unix(path.clone()));
        assert_eq!(bound.address.host_label(), path.display().to_string());
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        {
            let _stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists(), "stale socket should remain on disk");

        let address = ListenAddress::Unix { path: path.clone() };
        let bound = SocketBinder.bind(&address).unwrap();
        assert_eq!(bound.address, BoundAddress::Unix(path));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_live_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _live = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let error = SocketBinder
            .bind(&ListenAddress::Unix { path })
            .unwrap_err();
        assert!(matches!(error, BindError::UnixInUse { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_regular_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"not a socket").unwrap();

        let error = SocketBinder
            .bind(&ListenAddress::Unix { path })
            .unwrap_err();
        assert!(matches!(error, BindError::UnixNotSocket { .. }));
    }

    #[test]
    fn test_remove_socket_file_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_socket_file(&dir.path().join("missing.sock")).is_ok());
    }
}
