//! Hosts that own the global `tracing` dispatcher before the first start.
//! Kept in its own test binary because the dispatcher is process-wide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response};
use hyper::body::Incoming;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use davkit_core::{EventCode, ListenOptions, ServiceCallback};
use davkit_runtime::handler::empty;
use davkit_runtime::{
    Controller, RequestHandler, RequestLogger, ResponseBody, ServiceConfig, StaticConfigSource,
};

struct NullHandler;

#[async_trait]
impl RequestHandler for NullHandler {
    async fn handle(&self, _request: Request<Incoming>) -> Response<ResponseBody> {
        Response::new(empty())
    }

    fn set_logger(&self, _logger: RequestLogger) {}
}

#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Start,
    Stop,
    Message(EventCode, String),
}

struct Recorder(mpsc::UnboundedSender<Seen>);

impl ServiceCallback for Recorder {
    fn on_start(&self, _address: &str) {
        let _ = self.0.send(Seen::Start);
    }

    fn on_stop(&self) {
        let _ = self.0.send(Seen::Stop);
    }

    fn on_message(&self, code: EventCode, message: &str) {
        let _ = self.0.send(Seen::Message(code, message.to_string()));
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_succeeds_when_host_installed_subscriber() {
    tracing_subscriber::fmt().with_test_writer().init();

    let controller = Controller::new(Handle::current());
    let source = StaticConfigSource::new(ServiceConfig::new(Arc::new(NullHandler)).with_listen(
        ListenOptions {
            address: "127.0.0.1".to_string(),
            ..ListenOptions::default()
        },
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();

    controller.start(&source, Arc::new(Recorder(tx)));
    assert_eq!(next(&mut rx).await, Seen::Start);
    assert!(controller.is_running());
    assert!(!davkit_runtime::logging::owns_global_subscriber());

    controller.stop();
    assert_eq!(next(&mut rx).await, Seen::Stop);
}
