//! Broker-level error type shared by the configuration, engine and server layers.

use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for the Foreman broker process.
///
/// Crate-specific errors (`JobError`, `ProtocolError`) convert into this
/// type at the layer boundary so `main` only has one thing to report.
#[derive(Error, Debug)]
pub enum ForemanError {
    // ============ Configuration Errors ============
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ============ Infrastructure Errors ============
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the listener
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    /// Persistence backend error
    #[error("Persistence error: {0}")]
    Persistence(String),

    // ============ Engine Errors ============
    /// Job engine error
    #[error("Job engine error: {0}")]
    Engine(String),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Bind { .. } => "BIND_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors that should stop the process at startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Bind { .. })
    }
}
