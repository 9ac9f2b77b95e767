//! Instrument-family adapters: map high-level operations onto `Transport`
//! exchanges (§4.2). Grounded on the teacher's capability-trait design in
//! `instrument::capabilities` — there, capability traits (`PositionControl`,
//! `PowerMeasurement`, ...) wrap a command channel; here one `Driver` trait covers
//! the whole bench-instrument surface since a single `DeviceSession` owns exactly
//! one driver and dispatch doesn't need a dynamic capability registry.

mod mock;

pub use mock::MockDriver;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::model::{Capabilities, DeviceInfo};

/// A snapshot of what `readStatus` returns: everything that changes between polls.
#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub mode: Option<String>,
    pub output_enabled: bool,
    pub setpoints: HashMap<String, f64>,
    pub measurements: HashMap<String, f64>,
}

/// The operations a `DeviceSession` drives its instrument through.
///
/// All operations may fail with `ControllerError::Transport`, `::Protocol`, or
/// `::Unsupported`; implementations do not need to validate preconditions the
/// session already checked (range, known mode/output name) but must surface
/// genuine instrument refusals as `::Protocol`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Static identity and capability description. Pure with respect to device
    /// state; implementations typically cache this after the first call.
    async fn describe(&mut self) -> AppResult<(DeviceInfo, Capabilities)>;

    async fn read_status(&mut self) -> AppResult<DriverStatus>;

    async fn set_mode(&mut self, mode: &str) -> AppResult<()>;

    async fn set_output(&mut self, enabled: bool) -> AppResult<()>;

    async fn set_value(&mut self, name: &str, value: f64) -> AppResult<()>;
}
