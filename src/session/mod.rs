//! DeviceSession (§4.3): owns one `Driver`, serializes all outgoing operations
//! through a single task, polls measurements, and broadcasts state to subscribers.
//!
//! Grounded on `other_examples/instrument_manager_v3.rs`'s `InstrumentHandle`
//! shape: a `mpsc` command channel with oneshot replies gives external callers a
//! handle that never touches the instrument directly, and a `broadcast` channel
//! fans state out to any number of subscribers without the session task needing to
//! track them individually.

mod manager;

pub use manager::{DeviceEnumerator, SessionManager, StaticEnumerator};

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::DeviceEvent;
use crate::config::SessionConfig;
use crate::driver::{Driver, DriverStatus};
use crate::error::{AppResult, ControllerError};
use crate::model::{ConnectionStatus, DeviceSessionState};

/// Commands accepted by a running session task.
enum Command {
    SetMode {
        mode: String,
        reply: oneshot::Sender<AppResult<()>>,
    },
    SetOutput {
        enabled: bool,
        reply: oneshot::Sender<AppResult<()>>,
    },
    SetValue {
        name: String,
        value: f64,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Reconnect {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<DeviceSessionState>,
    },
    Shutdown,
}

/// A handle to a running `DeviceSession` task. Cloning a handle is cheap; every
/// clone shares the same underlying session.
#[derive(Clone)]
pub struct DeviceSessionHandle {
    device_id: String,
    command_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<DeviceEvent>,
}

impl DeviceSessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events_tx.subscribe()
    }

    pub async fn snapshot(&self) -> AppResult<DeviceSessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await
            .map_err(|_| ControllerError::State("session task ended".into()))
    }

    pub async fn set_mode(&self, mode: impl Into<String>) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetMode {
            mode: mode.into(),
            reply,
        })
        .await?;
        self.recv(rx).await
    }

    pub async fn set_output(&self, enabled: bool) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetOutput { enabled, reply }).await?;
        self.recv(rx).await
    }

    pub async fn set_value(&self, name: impl Into<String>, value: f64) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetValue {
            name: name.into(),
            value,
            reply,
        })
        .await?;
        self.recv(rx).await
    }

    pub async fn reconnect(&self) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reconnect { reply }).await?;
        self.recv(rx).await
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ControllerError::State("session task ended".into()))
    }

    async fn recv(&self, rx: oneshot::Receiver<AppResult<()>>) -> AppResult<()> {
        rx.await
            .map_err(|_| ControllerError::State("session task ended".into()))?
    }
}

/// Spawns a session task that owns `driver` for its entire lifetime.
pub fn spawn(
    device_id: String,
    mut driver: Box<dyn Driver>,
    config: SessionConfig,
) -> AppResult<(DeviceSessionHandle, JoinHandle<()>)> {
    let (command_tx, mut command_rx) = mpsc::channel(32);
    let (events_tx, _) = broadcast::channel(256);

    let handle = DeviceSessionHandle {
        device_id: device_id.clone(),
        command_tx,
        events_tx: events_tx.clone(),
    };

    let task = tokio::spawn(async move {
        let (info, capabilities) = match driver.describe().await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "describe() failed; session exiting");
                return;
            }
        };
        let mut state = DeviceSessionState::new(info, capabilities);
        state.connection_status = ConnectionStatus::Connected;

        let mut current_period = config.poll_interval;
        let mut poll_interval = tokio::time::interval(current_period);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                maybe_cmd = command_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => {
                            handle_command(cmd, &mut *driver, &mut state, &device_id, &config, &events_tx).await;
                        }
                    }
                }

                _ = poll_interval.tick() => {
                    poll_once(&mut *driver, &mut state, &device_id, &config, &events_tx).await;
                    let target = if state.connection_status == ConnectionStatus::Error {
                        config.poll_interval_backoff
                    } else {
                        config.poll_interval
                    };
                    if current_period != target {
                        current_period = target;
                        poll_interval = tokio::time::interval(target);
                        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    }
                }
            }
        }

        tracing::info!(device_id = %device_id, "session task stopped");
    });

    Ok((handle, task))
}

async fn handle_command(
    cmd: Command,
    driver: &mut dyn Driver,
    state: &mut DeviceSessionState,
    device_id: &str,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) {
    match cmd {
        Command::Snapshot { reply } => {
            let _ = reply.send(state.clone());
        }
        Command::SetMode { mode, reply } => {
            let result = apply_set_mode(driver, state, device_id, &mode, config, events_tx).await;
            let _ = reply.send(result);
        }
        Command::SetOutput { enabled, reply } => {
            let result = apply_set_output(driver, state, device_id, enabled, config, events_tx).await;
            let _ = reply.send(result);
        }
        Command::SetValue { name, value, reply } => {
            let result = apply_set_value(driver, state, device_id, &name, value, config, events_tx).await;
            let _ = reply.send(result);
        }
        Command::Reconnect { reply } => {
            state.connection_status = ConnectionStatus::Connected;
            state.consecutive_errors = 0;
            let _ = reply.send(Ok(()));
        }
        Command::Shutdown => {}
    }
}

async fn apply_set_mode(
    driver: &mut dyn Driver,
    state: &mut DeviceSessionState,
    device_id: &str,
    mode: &str,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) -> AppResult<()> {
    if !state.capabilities.modes_settable {
        return Err(ControllerError::Precondition("modes are not settable".into()));
    }
    if !state.capabilities.has_mode(mode) {
        return Err(ControllerError::Precondition(format!("unknown mode {mode}")));
    }
    let previous = state.mode.clone();
    state.mode = Some(mode.to_string());
    match driver.set_mode(mode).await {
        Ok(()) => {
            emit_field(events_tx, device_id, "mode", serde_json::json!(mode));
            Ok(())
        }
        Err(e) => {
            state.mode = previous;
            record_command_failure(state, device_id, &e, config, events_tx);
            Err(e)
        }
    }
}

async fn apply_set_output(
    driver: &mut dyn Driver,
    state: &mut DeviceSessionState,
    device_id: &str,
    enabled: bool,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) -> AppResult<()> {
    let previous = state.output_enabled;
    state.output_enabled = enabled;
    match driver.set_output(enabled).await {
        Ok(()) => {
            emit_field(events_tx, device_id, "outputEnabled", serde_json::json!(enabled));
            Ok(())
        }
        Err(e) => {
            state.output_enabled = previous;
            record_command_failure(state, device_id, &e, config, events_tx);
            Err(e)
        }
    }
}

async fn apply_set_value(
    driver: &mut dyn Driver,
    state: &mut DeviceSessionState,
    device_id: &str,
    name: &str,
    value: f64,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) -> AppResult<()> {
    let descriptor = state
        .capabilities
        .output(name)
        .ok_or_else(|| ControllerError::Precondition(format!("unknown output {name}")))?
        .clone();
    if value < descriptor.min || value > descriptor.max {
        return Err(ControllerError::Precondition(format!(
            "{name}={value} out of range [{}, {}]",
            descriptor.min, descriptor.max
        )));
    }
    let previous = state.setpoints.get(name).copied();
    state.setpoints.insert(name.to_string(), value);
    match driver.set_value(name, value).await {
        Ok(()) => {
            emit_field(
                events_tx,
                device_id,
                &format!("setpoints.{name}"),
                serde_json::json!(value),
            );
            Ok(())
        }
        Err(e) => {
            match previous {
                Some(v) => {
                    state.setpoints.insert(name.to_string(), v);
                }
                None => {
                    state.setpoints.remove(name);
                }
            }
            record_command_failure(state, device_id, &e, config, events_tx);
            Err(e)
        }
    }
}

fn record_command_failure(
    state: &mut DeviceSessionState,
    device_id: &str,
    error: &ControllerError,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) {
    state.consecutive_errors += 1;
    tracing::warn!(device_id = %device_id, error = %error, "command failed");
    let _ = events_tx.send(DeviceEvent::Error {
        device_id: device_id.to_string(),
        message: error.to_string(),
    });
    maybe_transition_to_error(state, device_id, config, events_tx);
}

async fn poll_once(
    driver: &mut dyn Driver,
    state: &mut DeviceSessionState,
    device_id: &str,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) {
    match driver.read_status().await {
        Ok(DriverStatus {
            output_enabled,
            measurements,
            ..
        }) => {
            state.consecutive_errors = 0;
            if state.connection_status == ConnectionStatus::Error {
                state.connection_status = ConnectionStatus::Connected;
                emit_field(
                    events_tx,
                    device_id,
                    "connectionStatus",
                    serde_json::json!("connected"),
                );
            }
            state.output_enabled = output_enabled;
            state.measurements = measurements.clone();
            let now = Utc::now();
            state.history.push_sample(now, &measurements);
            let cutoff = now - chrono::Duration::from_std(config.history_window).unwrap_or_default();
            state.history.truncate_before(cutoff);
            state.last_updated = now;
            let _ = events_tx.send(DeviceEvent::Measurement {
                device_id: device_id.to_string(),
                timestamp: now,
                values: measurements,
            });
        }
        Err(e) => {
            tracing::debug!(device_id = %device_id, error = %e, "poll failed");
            state.consecutive_errors += 1;
            maybe_transition_to_error(state, device_id, config, events_tx);
        }
    }
}

fn maybe_transition_to_error(
    state: &mut DeviceSessionState,
    device_id: &str,
    config: &SessionConfig,
    events_tx: &broadcast::Sender<DeviceEvent>,
) {
    if state.consecutive_errors >= config.max_consecutive_errors
        && state.connection_status != ConnectionStatus::Error
    {
        state.connection_status = ConnectionStatus::Error;
        tracing::warn!(device_id = %device_id, "connection status -> error");
        emit_field(
            events_tx,
            device_id,
            "connectionStatus",
            serde_json::json!("error"),
        );
    }
}

fn emit_field(
    events_tx: &broadcast::Sender<DeviceEvent>,
    device_id: &str,
    field: &str,
    value: serde_json::Value,
) {
    let _ = events_tx.send(DeviceEvent::Field {
        device_id: device_id.to_string(),
        field: field.to_string(),
        value,
    });
}

/// Joins a spawned session task with a bound timeout, mirroring
/// `InstrumentManagerV3::shutdown_all`'s per-task grace period.
pub async fn join_with_timeout(task: JoinHandle<()>, timeout: Duration) -> AppResult<()> {
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ControllerError::State(format!("session task panicked: {e}"))),
        Err(_) => Err(ControllerError::ShutdownFailed(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::transport::MockTransport;

    fn test_driver() -> Box<dyn Driver> {
        let transport = MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into(), "CC".into()])
            .with_setpoint("voltage", 0.0)
            .with_setpoint("current", 0.0);
        Box::new(MockDriver::power_supply(transport, "psu-1"))
    }

    #[tokio::test]
    async fn test_set_value_updates_state() {
        let (handle, task) = spawn("psu-1".into(), test_driver(), SessionConfig::default()).unwrap();
        handle.set_value("voltage", 12.0).await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.setpoints["voltage"], 12.0);
        handle.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_set_value_out_of_range_rejected() {
        let (handle, task) = spawn("psu-1".into(), test_driver(), SessionConfig::default()).unwrap();
        let err = handle.set_value("voltage", 999.0).await.unwrap_err();
        assert!(matches!(err, ControllerError::Precondition(_)));
        handle.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected_without_calling_driver() {
        let (handle, task) = spawn("psu-1".into(), test_driver(), SessionConfig::default()).unwrap();
        let err = handle.set_mode("BOGUS").await.unwrap_err();
        assert!(matches!(err, ControllerError::Precondition(_)));
        handle.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_subscribe_receives_measurement_events() {
        let config = SessionConfig {
            poll_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let (handle, task) = spawn("psu-1".into(), test_driver(), config).unwrap();
        let mut rx = handle.subscribe();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        assert!(matches!(event, DeviceEvent::Measurement { .. }));
        handle.shutdown().await;
        let _ = task.await;
    }
}
