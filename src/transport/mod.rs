//! Byte-oriented request/response transport to one instrument (§4.1).
//!
//! A `Transport` is deliberately narrow: it knows nothing about SCPI dialects or
//! instrument semantics, only how to exchange a request line for a response line
//! within a timeout. `Driver` implementations (see `crate::driver`) build instrument
//! protocols on top of one `Transport`.

mod mock;
#[cfg(feature = "transport_serial")]
mod serial;

pub use mock::MockTransport;
#[cfg(feature = "transport_serial")]
pub use serial::SerialTransport;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;

/// A single request/response exchange with one instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and waits up to `timeout` for a response. Implementations
    /// translate I/O failures and timeouts into `ControllerError::Transport`.
    async fn send(&mut self, request: &str, timeout: Duration) -> AppResult<String>;
}
