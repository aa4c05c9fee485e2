//! Process-wide entry points for hosts without their own tokio runtime.
//!
//! The controller and its runtime are created by the first `start` and live
//! for the rest of the process. The other entry points never create them.

use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use davkit_core::{BoundAddress, EventCode, ServiceCallback};

use crate::config::ConfigSource;
use crate::controller::Controller;

struct Global {
    // Owns the worker threads the controller's handle points at.
    _runtime: Runtime,
    controller: Controller,
}

static GLOBAL: OnceLock<Result<Global, String>> = OnceLock::new();

fn create() -> Result<Global, String> {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("davkit-worker")
        .build()
        .map_err(|error| format!("failed to build runtime: {error}"))?;
    let controller = Controller::new(runtime.handle().clone());
    debug!("Process-wide controller created");
    Ok(Global {
        _runtime: runtime,
        controller,
    })
}

/// The process-wide controller, if `start` has created it.
fn existing() -> Option<&'static Controller> {
    GLOBAL
        .get()
        .and_then(|global| global.as_ref().ok())
        .map(|global| &global.controller)
}

/// Start the process-wide service instance.
///
/// See [`Controller::start`]. A runtime that cannot be created is reported as
/// `StartFailed`.
pub fn start(source: &dyn ConfigSource, callback: Arc<dyn ServiceCallback>) {
    match GLOBAL.get_or_init(create) {
        Ok(global) => global.controller.start(source, callback),
        Err(message) => callback.on_message(EventCode::StartFailed, message),
    }
}

/// Request closure of the process-wide instance. See [`Controller::stop`].
pub fn stop() {
    if let Some(controller) = existing() {
        controller.stop();
    }
}

/// Whether the process-wide instance is running.
pub fn is_running() -> bool {
    existing().is_some_and(Controller::is_running)
}

/// Address of the process-wide instance.
pub fn bound_address() -> Option<BoundAddress> {
    existing().and_then(Controller::bound_address)
}
