//! Custom error types for the application.
//!
//! `ControllerError` is the single error type for the whole crate, built with
//! `thiserror` so components can propagate failures with `?` instead of panicking.
//! Variants are grouped by the categories the control plane actually distinguishes
//! when deciding what to tell a client: a bad precondition, a transport failure, a
//! protocol-level instrument complaint, an illegal state transition, a persistence
//! failure, or a lookup miss.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ControllerError>;

#[derive(Error, Debug)]
pub enum ControllerError {
    /// A caller-supplied precondition was violated (out-of-range value, unknown
    /// mode, unit mismatch) without ever reaching the driver.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The byte transport to an instrument failed (I/O, timeout, disconnect).
    #[error("transport error: {0}")]
    Transport(String),

    /// The instrument responded but its response violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation was attempted in a state that does not permit it (e.g.
    /// `pause()` on an idle sequence controller).
    #[error("invalid state for operation: {0}")]
    State(String),

    /// Reading or writing a durable library (sequences, trigger scripts) failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A referenced id (device, sequence, trigger script, client) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation is not implemented by this driver/transport.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// Graceful shutdown of one or more owned tasks failed.
    #[error("shutdown failed with {0} error(s)")]
    ShutdownFailed(usize),
}

impl From<figment::Error> for ControllerError {
    fn from(err: figment::Error) -> Self {
        ControllerError::Configuration(err.to_string())
    }
}
