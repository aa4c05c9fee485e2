//! Logging bridge: forwards `tracing` events to the host callback.
//!
//! The first session tries to install a global subscriber that writes to
//! stderr (filtered by `RUST_LOG`, default `warn`) and carries a
//! [`CallbackLayer`]. Hosts that already own the global dispatcher compose
//! [`layer()`] into their own subscriber instead; starting never fails on it.
//!
//! Each session opens an `instance` span. Records emitted inside that span,
//! including those from tasks instrumented with it, reach that session's
//! callback only. Records outside every instance span are not forwarded.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, OnceLock, PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Span, Subscriber, warn};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt as tracing_fmt};

use davkit_core::{EventCode, LogFormat, ServiceCallback};

const SESSION_SPAN: &str = "instance";

static SINKS: LazyLock<Arc<SinkRegistry>> = LazyLock::new(|| Arc::new(SinkRegistry::default()));
static INSTALLED: OnceLock<bool> = OnceLock::new();

thread_local! {
    // Set while a record is being handed to the host so that host-side
    // logging does not loop back into the bridge.
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Attach `callback` as the log target for a new instance.
///
/// Records at DEBUG and above are forwarded when `debug` is set, INFO and
/// above otherwise.
pub fn install(debug: bool, format: LogFormat, callback: Arc<dyn ServiceCallback>) -> LogSession {
    ensure_subscriber();
    let threshold = if debug { Level::DEBUG } else { Level::INFO };
    SINKS.attach(callback, threshold, format)
}

/// Layer routing records to the sessions opened by [`install`].
///
/// Add it to the host's subscriber when the host installs its own global
/// dispatcher.
///
/// ```ignore
/// tracing_subscriber::registry()
///     .with(tracing_subscriber::fmt::layer())
///     .with(davkit_runtime::logging::layer())
///     .init();
/// ```
pub fn layer() -> CallbackLayer {
    CallbackLayer::new(Arc::clone(&SINKS))
}

/// Whether this crate owns the global subscriber.
pub fn owns_global_subscriber() -> bool {
    INSTALLED.get().copied().unwrap_or(false)
}

fn ensure_subscriber() {
    INSTALLED.get_or_init(|| {
        let stderr_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let installed = tracing_subscriber::registry()
            .with(
                tracing_fmt::layer()
                    .with_writer(io::stderr)
                    .compact()
                    .with_filter(stderr_filter),
            )
            .with(layer())
            .try_init();
        match installed {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "Global subscriber already set; forwarding needs logging::layer()");
                false
            }
        }
    });
}

struct ActiveSink {
    callback: Arc<dyn ServiceCallback>,
    threshold: Level,
    format: LogFormat,
}

/// Log targets of the open sessions, keyed by session id.
#[derive(Default)]
pub struct SinkRegistry {
    next_id: AtomicU64,
    active: RwLock<HashMap<u64, ActiveSink>>,
}

impl SinkRegistry {
    /// Route records emitted inside the session's span to `callback` until
    /// the returned session ends.
    pub fn attach(
        self: &Arc<Self>,
        callback: Arc<dyn ServiceCallback>,
        threshold: Level,
        format: LogFormat,
    ) -> LogSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ActiveSink {
                    callback,
                    threshold,
                    format,
                },
            );
        LogSession {
            sinks: Arc::clone(self),
            id,
            span: tracing::error_span!("instance", session = id),
        }
    }

    /// Number of open sessions.
    pub fn attached(&self) -> usize {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn detach(&self, id: u64) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn target_for(&self, id: u64, level: Level) -> Option<(Arc<dyn ServiceCallback>, LogFormat)> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active
            .get(&id)
            .filter(|sink| level <= sink.threshold)
            .map(|sink| (Arc::clone(&sink.callback), sink.format))
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("attached", &self.attached())
            .finish_non_exhaustive()
    }
}

/// One instance's log target.
///
/// Dropping the session detaches it.
#[derive(Debug)]
pub struct LogSession {
    sinks: Arc<SinkRegistry>,
    id: u64,
    span: Span,
}

impl LogSession {
    /// Span whose records are forwarded to this session.
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Flush buffered output and detach.
    pub fn finish(self) {
        let _ = io::stderr().flush();
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        self.sinks.detach(self.id);
    }
}

/// Marks the current thread as forwarding until dropped.
struct Forwarding;

impl Forwarding {
    fn enter() -> Option<Self> {
        FORWARDING.with(|flag| (!flag.replace(true)).then_some(Self))
    }
}

impl Drop for Forwarding {
    fn drop(&mut self) {
        FORWARDING.with(|flag| flag.set(false));
    }
}

/// Session id carried by an instance span.
#[derive(Clone, Copy)]
struct SessionId(u64);

#[derive(Default)]
struct SessionField(Option<u64>);

impl Visit for SessionField {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "session" {
            self.0 = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

/// Layer forwarding rendered events to the session whose span encloses them.
pub struct CallbackLayer {
    sinks: Arc<SinkRegistry>,
}

impl CallbackLayer {
    pub const fn new(sinks: Arc<SinkRegistry>) -> Self {
        Self { sinks }
    }
}

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != SESSION_SPAN {
            return;
        }
        let mut field = SessionField::default();
        attrs.record(&mut field);
        if let (Some(session), Some(span)) = (field.0, ctx.span(id)) {
            span.extensions_mut().insert(SessionId(session));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(_forwarding) = Forwarding::enter() else {
            return;
        };
        let Some(session) = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.find_map(|span| span.extensions().get::<SessionId>().copied()))
        else {
            return;
        };
        let metadata = event.metadata();
        let Some((callback, format)) = self.sinks.target_for(session.0, *metadata.level()) else {
            return;
        };

        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        let line = fields.render(format, *metadata.level(), metadata.target());
        callback.on_message(EventCode::Message, &line);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }

    fn render(self, format: LogFormat, level: Level, target: &str) -> String {
        match format {
            LogFormat::Console => {
                let mut line = format!("{level} {target}: {}", self.message);
                for (key, value) in &self.fields {
                    match value {
                        Value::String(text) => {
                            let _ = write!(line, " {key}={text}");
                        }
                        other => {
                            let _ = write!(line, " {key}={other}");
                        }
                    }
                }
                line
            }
            LogFormat::Json => {
                let mut object = self.fields;
                object.insert("level".to_string(), Value::from(level.as_str()));
                object.insert("target".to_string(), Value::from(target));
                object.insert("message".to_string(), Value::from(self.message));
                Value::Object(object).to_string()
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }
}
