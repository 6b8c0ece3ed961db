//! Error taxonomy
//!
//! - Configuration errors (unknown provider, missing/invalid settings) fail
//!   orchestrator construction outright.
//! - Provider errors come from a provider's own Present/CleanUp and are
//!   accumulated by the orchestrator.
//! - Process errors (spawn, handshake, transport) look the same as provider
//!   errors at the call site.
//! - Aggregate errors wrap everything one Present/CleanUp produced.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unrecognized DNS provider: {0}")]
    UnknownProvider(String),

    #[error("{provider}: {message}")]
    Configuration { provider: String, message: String },

    #[error("{0}")]
    Provider(String),

    #[error("provider process: {0}")]
    Process(String),

    #[error("provider handshake failed: {0}")]
    Handshake(String),

    #[error("provider {0} has not been configured")]
    NotConfigured(String),

    #[error("provider {0} has been closed")]
    Closed(String),

    #[error("provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    pub fn configuration(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether this error should abort orchestrator construction.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownProvider(_) | Self::Configuration { .. })
    }

    /// Kind tag used when the error crosses the worker boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownProvider(_) => ErrorKind::UnknownProvider,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::NotConfigured(_) => ErrorKind::NotConfigured,
            Self::Provider(_) | Self::Aggregate(_) => ErrorKind::Provider,
            Self::Process(_) | Self::Handshake(_) | Self::Closed(_) | Self::Timeout(_) => {
                ErrorKind::Process
            }
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Provider(format!("{:#}", err))
    }
}

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownProvider,
    Configuration,
    NotConfigured,
    Provider,
    Process,
}

/// Error as transmitted between parent and worker.
///
/// `message` is the full display text of the original error; the parent
/// rebuilds an [`Error`] whose display text is that message unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn into_error(self, provider: &str) -> Error {
        match self.kind {
            ErrorKind::UnknownProvider => Error::UnknownProvider(provider.to_string()),
            ErrorKind::Configuration => {
                // The message already carries the "<provider>: " prefix.
                let prefix = format!("{}: ", provider);
                let message = self
                    .message
                    .strip_prefix(&prefix)
                    .map(str::to_string)
                    .unwrap_or(self.message);
                Error::configuration(provider, message)
            }
            ErrorKind::NotConfigured => Error::NotConfigured(provider.to_string()),
            ErrorKind::Provider => Error::Provider(self.message),
            ErrorKind::Process => Error::Process(self.message),
        }
    }
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Every error produced by one Present/CleanUp across the provider set.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// The display text of every wrapped error, in collection order.
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.errors.len() == 1 {
            "error"
        } else {
            "errors"
        };
        write!(f, "{} {} occurred:", self.errors.len(), noun)?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
