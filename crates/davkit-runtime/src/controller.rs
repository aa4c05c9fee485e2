//! Instance controller: starts, supervises and stops the single service
//! instance.
//!
//! Key design decisions:
//! - **Bind-then-report**: the listener is bound on the caller's thread and
//!   the real address is reported through `on_start`
//! - **Start gate**: the serve loop accepts nothing until `on_start` returned
//! - **Single completion path**: only the watcher of the serve task clears
//!   the slot; `stop` merely requests closure
//! - **Generation guard**: a late completion never clears a newer instance
//! - **No callbacks under the lock**: hosts may call back into the controller
//! - **Own log target**: records inside the instance span reach only this
//!   instance's callback

use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Span, debug, error, info, warn};

use davkit_core::{BoundAddress, EventCode, ServiceCallback};

use crate::config::{ConfigSource, ServiceConfig};
use crate::diagnostics;
use crate::listener::{Bind, BoundListener, SocketBinder, remove_socket_file};
use crate::logging::{self, LogSession};
use crate::serve::{self, Transport};

/// Message sent with [`EventCode::AlreadyRunning`].
pub const ALREADY_RUNNING: &str = "Already running.";

/// The running service.
struct Instance {
    generation: u64,
    /// Closes the listener and every live connection.
    cancel: CancellationToken,
    bound: BoundAddress,
    callback: Arc<dyn ServiceCallback>,
    /// Socket file to unlink on close.
    unix_path: Option<PathBuf>,
    closing: bool,
    /// Carries the instance's log target.
    span: Span,
}

enum Slot {
    Idle,
    /// A `start` call is between its check and its insert.
    Starting,
    Running(Instance),
}

/// Claim on `Slot::Starting`; releases it unless the instance was committed,
/// including when host code panics during preparation.
struct StartClaim<'a> {
    state: &'a State,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        let mut slot = self.state.lock_slot();
        if matches!(*slot, Slot::Starting) {
            *slot = Slot::Idle;
        }
    }
}

/// Everything `start` prepares before it commits an instance.
struct Prepared {
    config: ServiceConfig,
    listener: BoundListener,
    session: LogSession,
}

struct State {
    runtime: Handle,
    binder: Arc<dyn Bind>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl State {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completion path for one instance: clear the slot, then report.
    fn retire(
        &self,
        generation: u64,
        outcome: Result<(), String>,
        callback: &Arc<dyn ServiceCallback>,
        session: LogSession,
    ) {
        match &outcome {
            Ok(()) => info!(generation, "Service stopped"),
            Err(message) => error!(generation, %message, "Service ended with error"),
        }

        let cleanup = {
            let mut slot = self.lock_slot();
            match mem::replace(&mut *slot, Slot::Idle) {
                Slot::Running(instance) if instance.generation == generation => {
                    // A closing instance had its socket file unlinked by stop.
                    match (&instance.unix_path, instance.closing) {
                        (Some(path), false) => remove_socket_file(path).err(),
                        _ => None,
                    }
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(error) = cleanup {
            warn!(%error, "Failed to remove unix socket after exit");
        }

        match outcome {
            Ok(()) => callback.on_stop(),
            Err(message) => callback.on_message(EventCode::StartFailed, &message),
        }
        session.finish();
    }
}

/// Controller for a single service instance.
///
/// `start` and `stop` are synchronous and never wait on network I/O; the
/// serve loop runs on the runtime behind `handle`.
///
/// # Example
///
/// ```ignore
/// let controller = Controller::new(runtime.handle().clone());
/// controller.start(&StaticConfigSource::new(config), callback);
/// // ... on_start(port) arrives on the callback
/// controller.stop();
/// // ... on_stop() arrives once the serve loop has exited
/// ```
pub struct Controller {
    state: Arc<State>,
}

impl Controller {
    /// Controller binding real sockets on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self::with_binder(runtime, Arc::new(SocketBinder))
    }

    /// Controller using a custom binder.
    pub fn with_binder(runtime: Handle, binder: Arc<dyn Bind>) -> Self {
        Self {
            state: Arc::new(State {
                runtime,
                binder,
                slot: Mutex::new(Slot::Idle),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start the service.
    ///
    /// Every outcome is reported on `callback`: `on_start` with the bound
    /// port (TCP) or socket path (Unix), `AlreadyRunning` when an instance
    /// exists or is being started, `StartFailed` when configuration or
    /// binding fails.
    pub fn start(&self, source: &dyn ConfigSource, callback: Arc<dyn ServiceCallback>) {
        let Some(claim) = self.claim() else {
            callback.on_message(EventCode::AlreadyRunning, ALREADY_RUNNING);
            return;
        };

        let prepared = match self.prepare(source, &callback) {
            Ok(prepared) => prepared,
            Err(message) => {
                drop(claim);
                callback.on_message(EventCode::StartFailed, &message);
                return;
            }
        };

        let span = prepared.session.span().clone();
        let (bound, gate) = self.commit(prepared, &callback);
        drop(claim);
        callback.on_start(&bound.host_label());
        // The receiver is gone only if the serve task already exited.
        let _ = gate.send(());
        span.in_scope(|| info!(address = %bound, "Service started"));
    }

    fn claim(&self) -> Option<StartClaim<'_>> {
        let mut slot = self.state.lock_slot();
        if !matches!(*slot, Slot::Idle) {
            return None;
        }
        *slot = Slot::Starting;
        Some(StartClaim { state: &self.state })
    }

    fn prepare(
        &self,
        source: &dyn ConfigSource,
        callback: &Arc<dyn ServiceCallback>,
    ) -> Result<Prepared, String> {
        let config = source.load().map_err(|error| error.to_string())?;
        let session = logging::install(config.debug, config.log_format, Arc::clone(callback));
        let span = session.span().clone();
        let _entered = span.enter();
        diagnostics::attach(&config, callback);

        let address = config.listen.listen_address();
        debug!(%address, tls = config.listen.tls, "Binding listener");
        let listener = {
            let _runtime = self.state.runtime.enter();
            self.state.binder.bind(&address)
        };
        match listener {
            Ok(listener) => Ok(Prepared {
                config,
                listener,
                session,
            }),
            Err(error) => {
                session.finish();
                Err(error.to_string())
            }
        }
    }

    /// Record the instance and spawn its tasks. Returns the bound address and
    /// the start gate.
    fn commit(
        &self,
        prepared: Prepared,
        callback: &Arc<dyn ServiceCallback>,
    ) -> (BoundAddress, oneshot::Sender<()>) {
        let Prepared {
            config,
            listener: BoundListener { listener, address },
            session,
        } = prepared;
        let span = session.span().clone();
        let cancel = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel();
        let unix_path = match &address {
            BoundAddress::Unix(path) => Some(path.clone()),
            BoundAddress::Tcp(_) => None,
        };

        let mut slot = self.state.lock_slot();
        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let serve_task = self.state.runtime.spawn(
            serve::serve(
                listener,
                Arc::clone(&config.handler),
                Transport::from_options(&config.listen),
                gate_rx,
                cancel.clone(),
            )
            .instrument(span.clone()),
        );
        let state = Arc::clone(&self.state);
        let watcher_callback = Arc::clone(callback);
        self.state.runtime.spawn(
            async move {
                let outcome = match serve_task.await {
                    Ok(result) => result.map_err(|error| error.to_string()),
                    Err(join_error) => Err(format!("serve task failed: {join_error}")),
                };
                state.retire(generation, outcome, &watcher_callback, session);
            }
            .instrument(span.clone()),
        );

        *slot = Slot::Running(Instance {
            generation,
            cancel,
            bound: address.clone(),
            callback: Arc::clone(callback),
            unix_path,
            closing: false,
            span,
        });
        (address, gate_tx)
    }

    /// Request closure of the running instance.
    ///
    /// Returns immediately; `on_stop` follows once the serve loop has exited.
    /// A no-op when nothing is running or closure was already requested.
    /// Failure to unlink a Unix socket file is reported as `StopFailed`.
    pub fn stop(&self) {
        let (callback, released, span) = {
            let mut slot = self.state.lock_slot();
            let Slot::Running(instance) = &mut *slot else {
                return;
            };
            if instance.closing {
                return;
            }
            instance.closing = true;
            instance.cancel.cancel();
            let released = instance
                .unix_path
                .as_deref()
                .map_or(Ok(()), remove_socket_file);
            (
                Arc::clone(&instance.callback),
                released,
                instance.span.clone(),
            )
        };

        let _entered = span.enter();
        info!("Stop requested");
        if let Err(error) = released {
            warn!(%error, "Failed to release listener");
            callback.on_message(EventCode::StopFailed, &error.to_string());
        }
    }

    /// Whether an instance is running (including one that is closing).
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock_slot(), Slot::Running(_))
    }

    /// Address of the running instance.
    pub fn bound_address(&self) -> Option<BoundAddress> {
        match &*self.state.lock_slot() {
            Slot::Running(instance) => Some(instance.bound.clone()),
            Slot::Idle | Slot::Starting => None,
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
