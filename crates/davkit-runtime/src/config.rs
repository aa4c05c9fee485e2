//! Configuration collaborator port.
//!
//! Acquiring and parsing configuration (files, environment precedence,
//! per-user settings) happens outside the controller. A [`ConfigSource`]
//! hands over a ready [`ServiceConfig`] with constructed handlers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use davkit_core::{ListenOptions, LogFormat};

use crate::handler::RequestHandler;

/// Errors raised while acquiring configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration could not be read.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// The configuration was read but is not usable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Handler bound to a configured identity.
#[derive(Clone)]
pub struct UserHandler {
    /// Identity the handler serves.
    pub username: String,
    /// Handler variant for this identity.
    pub handler: Arc<dyn RequestHandler>,
}

impl fmt::Debug for UserHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserHandler")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Everything the controller needs to run one instance.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Lower the log threshold to DEBUG.
    pub debug: bool,
    /// Encoding of forwarded log records.
    pub log_format: LogFormat,
    /// Default handler; receives all traffic and may route to `users` itself.
    pub handler: Arc<dyn RequestHandler>,
    /// Per-identity handler variants.
    pub users: Vec<UserHandler>,
    /// Listener settings.
    pub listen: ListenOptions,
}

impl ServiceConfig {
    /// Config with production defaults around `handler`.
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            debug: false,
            log_format: LogFormat::default(),
            handler,
            users: Vec::new(),
            listen: ListenOptions::default(),
        }
    }

    /// Replace the listener settings.
    #[must_use]
    pub fn with_listen(mut self, listen: ListenOptions) -> Self {
        self.listen = listen;
        self
    }

    /// Add a per-identity handler.
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        self.users.push(UserHandler {
            username: username.into(),
            handler,
        });
        self
    }

    /// Every handler variant: the default first, then one per identity.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn RequestHandler>> {
        std::iter::once(&self.handler).chain(self.users.iter().map(|user| &user.handler))
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("debug", &self.debug)
            .field("log_format", &self.log_format)
            .field("users", &self.users)
            .field("listen", &self.listen)
            .finish_non_exhaustive()
    }
}

/// Port for the configuration collaborator.
pub trait ConfigSource: Send + Sync {
    /// Produce the configuration for a new instance.
    fn load(&self) -> Result<ServiceConfig, ConfigError>;
}

/// Source that hands out a prepared config.
#[derive(Clone, Debug)]
pub struct StaticConfigSource {
    config: ServiceConfig,
}

impl StaticConfigSource {
    /// Wrap `config`.
    pub const fn new(config: ServiceConfig) -> Self {
        Self { config }
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<ServiceConfig, ConfigError> {
        Ok(self.config.clone())
    }
}

impl<F> ConfigSource for F
where
    F: Fn() -> Result<ServiceConfig, ConfigError> + Send + Sync,
{
    fn load(&self) -> Result<ServiceConfig, ConfigError> {
        self()
    }
}
