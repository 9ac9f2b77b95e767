//! TriggerRuntime (§4.9): evaluates one `TriggerScript` against a wall clock tick
//! and the live measurement stream of whatever `DeviceSession`s its value
//! conditions reference, dispatching actions through `SessionManager` /
//! `SequenceManager`.
//!
//! Grounded on the teacher's `data/trigger.rs` for the rising-edge/holdoff shape
//! (`TriggerState`, `TriggerStats`) and on `other_examples/run_engine.rs` for the
//! single-threaded tick-and-evaluate loop structure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::bus::DeviceEvent;
use crate::config::TriggerConfig;
use crate::error::AppResult;
use crate::model::{
    RepeatPolicy, TriggerAction, TriggerCondition, TriggerScript, TriggerScriptExecutionState,
    TriggerScriptState, TriggerState as TriggerStateRecord,
};
use crate::sequence::SequenceManager;
use crate::session::SessionManager;

/// Events a `TriggerScriptManager` rebroadcasts onto the `SubscriptionBus`.
#[derive(Debug, Clone)]
pub enum TriggerRuntimeEvent {
    Started(TriggerScriptState),
    Progress(TriggerScriptState),
    Stopped(TriggerScriptState),
    Paused(TriggerScriptState),
    Resumed(TriggerScriptState),
    Error(TriggerScriptState),
    Fired {
        script_id: String,
        trigger_id: String,
        fired_at: chrono::DateTime<Utc>,
    },
    ActionFailed {
        script_id: String,
        trigger_id: String,
        message: String,
    },
}

struct PerTrigger {
    fired_count: u64,
    last_fired_at: Option<chrono::DateTime<Utc>>,
    condition_met: bool,
}

struct Inner {
    execution_state: TriggerScriptExecutionState,
    started_at: chrono::DateTime<Utc>,
    pause_elapsed: Duration,
    paused_at: Option<tokio::time::Instant>,
    per_trigger: Vec<PerTrigger>,
    latest_measurements: HashMap<(String, String), f64>,
    error: Option<String>,
    stop_requested: bool,
    pause_requested: bool,
}

/// One running (or idle) evaluation of a `TriggerScript`. At most one alive per
/// `TriggerScriptManager`.
pub struct TriggerRuntime {
    script: TriggerScript,
    sessions: Arc<SessionManager>,
    sequences: Arc<SequenceManager>,
    config: TriggerConfig,
    events_tx: broadcast::Sender<TriggerRuntimeEvent>,
    inner: RwLock<Inner>,
}

impl TriggerRuntime {
    pub fn new(
        script: TriggerScript,
        sessions: Arc<SessionManager>,
        sequences: Arc<SequenceManager>,
        config: TriggerConfig,
    ) -> Arc<Self> {
        let per_trigger = script
            .triggers
            .iter()
            .map(|_| PerTrigger {
                fired_count: 0,
                last_fired_at: None,
                condition_met: false,
            })
            .collect();
        Arc::new(Self {
            script,
            sessions,
            sequences,
            config,
            events_tx: broadcast::channel(256).0,
            inner: RwLock::new(Inner {
                execution_state: TriggerScriptExecutionState::Idle,
                started_at: Utc::now(),
                pause_elapsed: Duration::ZERO,
                paused_at: None,
                per_trigger,
                latest_measurements: HashMap::new(),
                error: None,
                stop_requested: false,
                pause_requested: false,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerRuntimeEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self) -> TriggerScriptState {
        let inner = self.inner.read().await;
        let elapsed = (Utc::now() - inner.started_at)
            .to_std()
            .unwrap_or_default()
            .saturating_sub(inner.pause_elapsed);
        let trigger_states = self
            .script
            .triggers
            .iter()
            .zip(inner.per_trigger.iter())
            .map(|(t, p)| TriggerStateRecord {
                trigger_id: t.id.clone(),
                fired_count: p.fired_count,
                last_fired_at: p.last_fired_at,
                condition_met: p.condition_met,
            })
            .collect();
        TriggerScriptState {
            script_id: self.script.id.clone(),
            execution_state: inner.execution_state,
            started_at: inner.started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            trigger_states,
            error: inner.error.clone(),
        }
    }

    pub async fn execution_state(&self) -> TriggerScriptExecutionState {
        self.inner.read().await.execution_state
    }

    /// Runs the evaluation loop to completion (stop/error). Callers spawn this.
    pub async fn start(self: Arc<Self>) -> AppResult<()> {
        {
            let mut inner = self.inner.write().await;
            inner.execution_state = TriggerScriptExecutionState::Running;
            inner.started_at = Utc::now();
        }
        self.emit(TriggerRuntimeEvent::Started(self.state().await)).await;

        let mut measurements = self.sessions.subscribe();
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let stop_requested = self.inner.read().await.stop_requested;
            if stop_requested {
                break;
            }

            tokio::select! {
                biased;

                event = measurements.recv() => {
                    match event {
                        Ok(DeviceEvent::Measurement { device_id, values, .. }) => {
                            self.on_measurement(&device_id, &values).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "trigger runtime measurement stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = tick.tick() => {
                    let paused = self.inner.read().await.pause_requested;
                    if !paused {
                        self.evaluate_time_triggers().await;
                        self.emit(TriggerRuntimeEvent::Progress(self.state().await)).await;
                    }
                }
            }
        }

        self.inner.write().await.execution_state = TriggerScriptExecutionState::Idle;
        self.emit(TriggerRuntimeEvent::Stopped(self.state().await)).await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.write().await.stop_requested = true;
    }

    pub async fn pause(&self) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.pause_requested = true;
        inner.paused_at = Some(tokio::time::Instant::now());
        inner.execution_state = TriggerScriptExecutionState::Paused;
        drop(inner);
        self.emit(TriggerRuntimeEvent::Paused(self.state().await)).await;
        Ok(())
    }

    pub async fn resume(&self) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(paused_at) = inner.paused_at.take() {
            inner.pause_elapsed += paused_at.elapsed();
        }
        inner.pause_requested = false;
        inner.execution_state = TriggerScriptExecutionState::Running;
        drop(inner);
        self.emit(TriggerRuntimeEvent::Resumed(self.state().await)).await;
        Ok(())
    }

    async fn on_measurement(&self, device_id: &str, values: &HashMap<String, f64>) {
        if self.inner.read().await.pause_requested {
            return;
        }
        {
            let mut inner = self.inner.write().await;
            for (parameter, value) in values {
                inner
                    .latest_measurements
                    .insert((device_id.to_string(), parameter.clone()), *value);
            }
        }
        for index in 0..self.script.triggers.len() {
            let matches = matches!(
                &self.script.triggers[index].condition,
                TriggerCondition::Value { device_id: d, .. } if d == device_id
            );
            if matches {
                self.evaluate_trigger(index).await;
            }
        }
    }

    async fn evaluate_time_triggers(&self) {
        for index in 0..self.script.triggers.len() {
            if matches!(self.script.triggers[index].condition, TriggerCondition::Time { .. }) {
                self.evaluate_trigger(index).await;
            }
        }
    }

    /// Evaluates one trigger's condition and, on a rising edge (subject to
    /// debounce and `repeat_mode`), fires its action.
    async fn evaluate_trigger(&self, index: usize) {
        let trigger = &self.script.triggers[index];
        let now_met = {
            let inner = self.inner.read().await;
            match &trigger.condition {
                // For `repeat`, re-arming is measured from the trigger's own last
                // fire rather than script start, so it fires again every `seconds`
                // (not just once when the absolute elapsed time crosses it).
                TriggerCondition::Time { seconds } => match inner.per_trigger[index].last_fired_at {
                    Some(last) => {
                        let since = (Utc::now() - last).to_std().unwrap_or_default();
                        since.as_secs_f64() >= *seconds
                    }
                    None => {
                        let elapsed = (Utc::now() - inner.started_at)
                            .to_std()
                            .unwrap_or_default()
                            .saturating_sub(inner.pause_elapsed);
                        elapsed.as_secs_f64() >= *seconds
                    }
                },
                TriggerCondition::Value {
                    device_id,
                    parameter,
                    operator,
                    value,
                } => inner
                    .latest_measurements
                    .get(&(device_id.clone(), parameter.clone()))
                    .is_some_and(|v| operator.evaluate(*v, *value)),
            }
        };

        let mut inner = self.inner.write().await;
        let was_met = inner.per_trigger[index].condition_met;
        inner.per_trigger[index].condition_met = now_met;
        if !now_met {
            return;
        }

        let rising_edge = !was_met;
        if !rising_edge {
            return;
        }

        if trigger.repeat_mode == RepeatPolicy::Once && inner.per_trigger[index].fired_count > 0 {
            return;
        }

        if trigger.debounce_ms > 0 {
            if let Some(last) = inner.per_trigger[index].last_fired_at {
                let since = (Utc::now() - last).num_milliseconds().max(0) as u64;
                if since < trigger.debounce_ms {
                    return;
                }
            }
        }

        let now = Utc::now();
        inner.per_trigger[index].fired_count += 1;
        inner.per_trigger[index].last_fired_at = Some(now);
        drop(inner);

        self.emit(TriggerRuntimeEvent::Fired {
            script_id: self.script.id.clone(),
            trigger_id: trigger.id.clone(),
            fired_at: now,
        })
        .await;

        if let Err(e) = self.dispatch_action(&trigger.action).await {
            self.emit(TriggerRuntimeEvent::ActionFailed {
                script_id: self.script.id.clone(),
                trigger_id: trigger.id.clone(),
                message: e.to_string(),
            })
            .await;
        }
    }

    async fn dispatch_action(&self, action: &TriggerAction) -> AppResult<()> {
        match action {
            TriggerAction::SetValue {
                device_id,
                parameter,
                value,
            } => {
                self.sessions
                    .get(device_id)
                    .await?
                    .set_value(parameter.clone(), *value)
                    .await
            }
            TriggerAction::SetOutput { device_id, enabled } => {
                self.sessions.get(device_id).await?.set_output(*enabled).await
            }
            TriggerAction::SetMode { device_id, mode } => {
                self.sessions.get(device_id).await?.set_mode(mode.clone()).await
            }
            TriggerAction::StartSequence {
                sequence_id,
                device_id,
                parameter,
                repeat_mode,
                repeat_count,
            } => {
                self.sequences
                    .run(crate::model::SequenceRunConfig {
                        sequence_id: sequence_id.clone(),
                        device_id: device_id.clone(),
                        parameter: parameter.clone(),
                        repeat_mode: *repeat_mode,
                        repeat_count: *repeat_count,
                    })
                    .await
                    .map(|_| ())
            }
            TriggerAction::StopSequence => self.sequences.abort().await,
            TriggerAction::PauseSequence => self.sequences.pause().await,
        }
    }

    async fn emit(&self, event: TriggerRuntimeEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::driver::MockDriver;
    use crate::model::{ComparisonOperator, Trigger, new_id};
    use crate::session::{DeviceEnumerator, StaticEnumerator};
    use crate::transport::MockTransport;

    async fn harness() -> (Arc<SessionManager>, Arc<SequenceManager>) {
        let enumerator = Arc::new(StaticEnumerator::new());
        enumerator
            .register("psu-1", || {
                let transport = MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into()])
                    .with_setpoint("voltage", 0.0)
                    .with_setpoint("current", 0.0);
                Box::new(MockDriver::power_supply(transport, "psu-1"))
            })
            .await;
        let bus = Arc::new(crate::bus::SubscriptionBus::new(64));
        let sessions = Arc::new(SessionManager::new(
            enumerator as Arc<dyn DeviceEnumerator>,
            SessionConfig::default(),
            bus.clone(),
        ));
        sessions.scan().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let library = crate::sequence::SequenceLibrary::open(dir.path(), 10).await.unwrap();
        let sequences = Arc::new(SequenceManager::new(
            library,
            sessions.clone(),
            bus,
            crate::config::SequenceConfig::default(),
        ));
        (sessions, sequences)
    }

    #[tokio::test]
    async fn test_time_trigger_fires_once_after_elapsed_seconds() {
        let (sessions, sequences) = harness().await;
        let script = TriggerScript {
            id: "s1".into(),
            name: "turn on after 0s".into(),
            triggers: vec![Trigger {
                id: new_id(),
                condition: TriggerCondition::Time { seconds: 0.0 },
                action: TriggerAction::SetOutput {
                    device_id: "psu-1".into(),
                    enabled: true,
                },
                repeat_mode: RepeatPolicy::Once,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let runtime = TriggerRuntime::new(
            script,
            sessions.clone(),
            sequences,
            TriggerConfig {
                tick_interval: Duration::from_millis(10),
            },
        );
        let handle = tokio::spawn(runtime.clone().start());
        tokio::time::sleep(Duration::from_millis(60)).await;
        runtime.stop().await;
        let _ = handle.await;

        let state = runtime.state().await;
        assert_eq!(state.trigger_states[0].fired_count, 1);
        let snap = sessions.get("psu-1").await.unwrap().snapshot().await.unwrap();
        assert!(snap.output_enabled);
        sessions.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_value_trigger_rising_edge_only() {
        let (sessions, sequences) = harness().await;
        let script = TriggerScript {
            id: "s2".into(),
            name: "cutoff".into(),
            triggers: vec![Trigger {
                id: new_id(),
                condition: TriggerCondition::Value {
                    device_id: "psu-1".into(),
                    parameter: "current".into(),
                    operator: ComparisonOperator::Gt,
                    value: 1.0,
                },
                action: TriggerAction::SetOutput {
                    device_id: "psu-1".into(),
                    enabled: false,
                },
                repeat_mode: RepeatPolicy::Repeat,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let runtime = TriggerRuntime::new(
            script,
            sessions.clone(),
            sequences,
            TriggerConfig {
                tick_interval: Duration::from_secs(10),
            },
        );
        runtime.on_measurement("psu-1", &HashMap::from([("current".to_string(), 2.0)])).await;
        runtime.on_measurement("psu-1", &HashMap::from([("current".to_string(), 2.0)])).await;
        let state = runtime.state().await;
        assert_eq!(state.trigger_states[0].fired_count, 1);
        sessions.stop().await.unwrap();
    }
}
