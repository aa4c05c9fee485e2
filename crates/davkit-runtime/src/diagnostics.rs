//! Request diagnostics bridge.
//!
//! Turns every completed request into a [`RequestDiagnostic`] and forwards
//! its JSON form to the host with [`EventCode::Request`].

use std::sync::Arc;

use http::request::Parts;

use davkit_core::{EventCode, RequestDiagnostic, ServiceCallback};

use crate::config::ServiceConfig;
use crate::handler::{HandlerError, RequestLogger};

/// Build the per-request hook for `callback`.
pub fn request_logger(callback: Arc<dyn ServiceCallback>) -> RequestLogger {
    Arc::new(move |parts: &Parts, error: Option<&HandlerError>| {
        let mut record = RequestDiagnostic::from_parts(parts);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        callback.on_message(EventCode::Request, &record.to_json());
    })
}

/// Install the hook on the default handler and every per-identity handler.
pub fn attach(config: &ServiceConfig, callback: &Arc<dyn ServiceCallback>) {
    let logger = request_logger(Arc::clone(callback));
    for handler in config.handlers() {
        handler.set_logger(Arc::clone(&logger));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::{Request, Response};
    use hyper::body::Incoming;
    use mockall::mock;
    use mockall::predicate::{always, eq};

    use crate::handler::{LoggerSlot, RequestHandler, ResponseBody, empty};

    mock! {
        Callback {}
        impl ServiceCallback for Callback {
            fn on_start(&self, address: &str);
            fn on_stop(&self);
            fn on_message(&self, code: EventCode, message: &str);
        }
    }

    #[derive(Default)]
    struct SlotHandler {
        logger: LoggerSlot,
    }

    #[async_trait]
    impl RequestHandler for SlotHandler {
        async fn handle(&self, _request: Request<Incoming>) -> Response<ResponseBody> {
            Response::new(empty())
        }

        fn set_logger(&self, logger: RequestLogger) {
            self.logger.set(logger);
        }
    }

    fn head(path: &str) -> Parts {
        Request::builder()
            .method("GET")
            .uri(path)
            .header("Content-Length", "42")
            .header("X-Expected-Entity-Length", "100")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_logger_forwards_request_record() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut callback = MockCallback::new();
        callback
            .expect_on_message()
            .with(eq(EventCode::Request), always())
            .times(1)
            .returning(move |_, message| sink.lock().unwrap().push(message.to_string()));

        let logger = request_logger(Arc::new(callback));
        logger(&head("/a/b"), None);

        let seen = seen.lock().unwrap();
        let value: serde_json::Value = serde_json::from_str(&seen[0]).unwrap();
        assert_eq!(value["method"], "GET");
        assert_eq!(value["path"], "/a/b");
        assert_eq!(value["content_length"], 42);
        assert_eq!(value["x_expected_entity_length"], 100);
        assert_eq!(value["error"], "");
    }

    #[test]
    fn test_handler_error_text_is_included() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let mut callback = MockCallback::new();
        callback
            .expect_on_message()
            .times(1)
            .returning(move |_, message| *sink.lock().unwrap() = message.to_string());

        let logger = request_logger(Arc::new(callback));
        logger(&head("/locked"), Some(&anyhow::anyhow!("resource is locked")));

        let value: serde_json::Value = serde_json::from_str(&seen.lock().unwrap()).unwrap();
        assert_eq!(value["error"], "resource is locked");
    }

    #[test]
    fn test_attach_covers_every_handler_variant() {
        let default = Arc::new(SlotHandler::default());
        let alice = Arc::new(SlotHandler::default());
        let bob = Arc::new(SlotHandler::default());
        let config = ServiceConfig::new(default.clone())
            .with_user("alice", alice.clone())
            .with_user("bob", bob.clone());

        let mut callback = MockCallback::new();
        callback
            .expect_on_message()
            .with(eq(EventCode::Request), always())
            .times(3)
            .return_const(());
        let callback: Arc<dyn ServiceCallback> = Arc::new(callback);

        attach(&config, &callback);

        for handler in [&default, &alice, &bob] {
            assert!(handler.logger.is_set());
            handler.logger.log(&head("/"), None);
        }
    }
}
