//! Error types for the device plugin runtime.

use std::io;
use std::result;
use tonic::Status;

/// A specialized Result type for device plugin operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for device plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource name rejected by the extended resource name rules
    #[error("{0} is not a valid extended resource name: {1}")]
    InvalidResourceName(String, String),

    /// Listener bind, stale socket cleanup or dial failures
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The kubelet could not be reached or rejected the registration
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Session lifecycle misuse or server failure
    #[error("Session error: {0}")]
    Session(String),

    /// The restart watch source failed
    #[error("Watch error: {0}")]
    Watch(String),
}

impl Error {
    /// True for errors detected before any resource was acquired.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::InvalidResourceName(..))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watch(err.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Config(msg) => Status::failed_precondition(format!("Config error: {}", msg)),
            Error::InvalidResourceName(..) => Status::invalid_argument(err.to_string()),
            Error::Transport(msg) => Status::unavailable(msg),
            Error::Io(err) => Status::internal(format!("I/O error: {}", err)),
            Error::Registration(msg) => Status::unavailable(msg),
            Error::Session(msg) => Status::internal(format!("Session error: {}", msg)),
            Error::Watch(msg) => Status::internal(format!("Watch error: {}", msg)),
        }
    }
}
