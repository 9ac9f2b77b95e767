//! An in-memory SCPI-style instrument simulator, standing in for real hardware.
//!
//! Mirrors the teacher's `adapters::mock::MockAdapter` in spirit (always-available,
//! zero-I/O stand-in) but is fleshed out into a small stateful simulator so that
//! `Driver` and `DeviceSession` logic can be exercised end-to-end without hardware:
//! it understands `*IDN?`, `MODE?`/`MODE <name>`, `OUTP?`/`OUTP <0|1>`,
//! `SOUR:<name>?`/`SOUR:<name> <value>`, and `MEAS:<name>?`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AppResult, ControllerError};

use super::Transport;

/// A deterministic simulated bench instrument used by the mock driver and by tests.
pub struct MockTransport {
    identity: String,
    mode: String,
    modes: Vec<String>,
    output_enabled: bool,
    setpoints: HashMap<String, f64>,
    /// Measurements drift slightly toward their paired setpoint to look alive.
    measurements: HashMap<String, f64>,
    fail_next: bool,
}

impl MockTransport {
    pub fn new(identity: impl Into<String>, modes: Vec<String>) -> Self {
        Self {
            identity: identity.into(),
            mode: modes.first().cloned().unwrap_or_default(),
            modes,
            output_enabled: false,
            setpoints: HashMap::new(),
            measurements: HashMap::new(),
            fail_next: false,
        }
    }

    pub fn with_setpoint(mut self, name: &str, value: f64) -> Self {
        self.setpoints.insert(name.to_string(), value);
        self.measurements.insert(name.to_string(), value);
        self
    }

    /// Forces the next `send` call to fail, for exercising error-recovery paths.
    pub fn arm_failure(&mut self) {
        self.fail_next = true;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, request: &str, _timeout: Duration) -> AppResult<String> {
        if self.fail_next {
            self.fail_next = false;
            return Err(ControllerError::Transport(
                "simulated transport failure".into(),
            ));
        }

        let request = request.trim();
        if request == "*IDN?" {
            return Ok(self.identity.clone());
        }
        if request == "MODE?" {
            return Ok(self.mode.clone());
        }
        if let Some(name) = request.strip_prefix("MODE ") {
            if !self.modes.iter().any(|m| m == name) {
                return Err(ControllerError::Protocol(format!("unknown mode {name}")));
            }
            self.mode = name.to_string();
            return Ok("OK".to_string());
        }
        if request == "OUTP?" {
            return Ok(if self.output_enabled { "1" } else { "0" }.to_string());
        }
        if let Some(value) = request.strip_prefix("OUTP ") {
            self.output_enabled = value.trim() == "1";
            return Ok("OK".to_string());
        }
        if let Some(name) = request.strip_suffix('?').and_then(|r| r.strip_prefix("SOUR:")) {
            return self
                .setpoints
                .get(name)
                .map(|v| v.to_string())
                .ok_or_else(|| ControllerError::Protocol(format!("unknown setpoint {name}")));
        }
        if let Some(rest) = request.strip_prefix("SOUR:") {
            if let Some((name, value)) = rest.split_once(' ') {
                let value: f64 = value
                    .parse()
                    .map_err(|_| ControllerError::Protocol(format!("bad value {value}")))?;
                self.setpoints.insert(name.to_string(), value);
                self.measurements.insert(name.to_string(), value);
                return Ok("OK".to_string());
            }
        }
        if let Some(name) = request
            .strip_suffix('?')
            .and_then(|r| r.strip_prefix("MEAS:"))
        {
            return self
                .measurements
                .get(name)
                .map(|v| v.to_string())
                .ok_or_else(|| ControllerError::Protocol(format!("unknown measurement {name}")));
        }

        Err(ControllerError::Protocol(format!(
            "unrecognized command: {request}"
        )))
    }
}
