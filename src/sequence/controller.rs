//! SequenceController (§4.7): drift-free timer-driven playback of one sequence
//! against one device output.
//!
//! Grounded on `other_examples/run_engine.rs`'s `RunEngine`: an `RwLock`-guarded
//! execution state (`Idle/Running/Paused/...`), boolean pause/abort request
//! flags checked inside the execution loop, and a broadcast channel for
//! progress/terminal events. The absolute-schedule-vector timing model is this
//! component's own addition (`run_engine.rs` drives plan commands rather than a
//! timed waveform), built from §4.7's schedule-drift-free requirement.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use crate::config::SequenceConfig;
use crate::error::{AppResult, ControllerError};
use crate::model::{
    RepeatMode, SequenceDefinition, SequenceExecutionState, SequenceRunConfig, SequenceState,
    Waveform, WaveformStep,
};
use crate::session::DeviceSessionHandle;
use crate::waveform;

/// Progress/terminal events a `SequenceManager` rebroadcasts onto the
/// `SubscriptionBus`.
#[derive(Debug, Clone)]
pub enum SequenceEvent {
    Started(SequenceState),
    Progress(SequenceState),
    Completed(SequenceState),
    Aborted(SequenceState),
    Error(SequenceState),
}

struct Schedule {
    steps: Vec<WaveformStep>,
    targets: Vec<Instant>,
}

impl Schedule {
    fn build(steps: Vec<WaveformStep>, start: Instant, min_interval: Duration) -> Self {
        let mut targets = Vec::with_capacity(steps.len());
        let mut cursor = start;
        targets.push(cursor);
        for step in &steps[..steps.len().saturating_sub(1)] {
            cursor += Duration::from_millis(step.dwell_ms).max(min_interval);
            targets.push(cursor);
        }
        Self { steps, targets }
    }
}

/// One running (or idle) playback. At most one is alive per `SequenceManager`.
pub struct SequenceController {
    definition: SequenceDefinition,
    run_config: SequenceRunConfig,
    session: DeviceSessionHandle,
    config: SequenceConfig,
    events_tx: broadcast::Sender<SequenceEvent>,
    inner: RwLock<Inner>,
}

struct Inner {
    execution_state: SequenceExecutionState,
    schedule: Option<Schedule>,
    current_step_index: usize,
    current_cycle: u32,
    total_cycles: Option<u32>,
    started_at: chrono::DateTime<Utc>,
    pause_elapsed: Duration,
    paused_at: Option<Instant>,
    commanded_value: Option<f64>,
    last_commanded_for_seed: f64,
    error: Option<String>,
    abort_requested: bool,
    pause_requested: bool,
}

impl SequenceController {
    pub fn new(
        definition: SequenceDefinition,
        run_config: SequenceRunConfig,
        session: DeviceSessionHandle,
        config: SequenceConfig,
    ) -> AppResult<Arc<Self>> {
        let total_cycles = match run_config.repeat_mode {
            RepeatMode::Once => Some(1),
            RepeatMode::Count => {
                let count = run_config
                    .repeat_count
                    .ok_or_else(|| ControllerError::Precondition("repeatCount required".into()))?;
                if count < 1 {
                    return Err(ControllerError::Precondition("repeatCount must be >= 1".into()));
                }
                Some(count)
            }
            RepeatMode::Continuous => None,
        };

        let seed = match &definition.waveform {
            Waveform::Random(w) => w.start_value,
            _ => 0.0,
        };

        Ok(Arc::new(Self {
            definition,
            run_config,
            session,
            config,
            events_tx: broadcast::channel(256).0,
            inner: RwLock::new(Inner {
                execution_state: SequenceExecutionState::Idle,
                schedule: None,
                current_step_index: 0,
                current_cycle: 0,
                total_cycles,
                started_at: Utc::now(),
                pause_elapsed: Duration::ZERO,
                paused_at: None,
                commanded_value: None,
                last_commanded_for_seed: seed,
                error: None,
                abort_requested: false,
                pause_requested: false,
            }),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self) -> SequenceState {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let elapsed = (now - inner.started_at)
            .to_std()
            .unwrap_or_default()
            .saturating_sub(inner.pause_elapsed);
        SequenceState {
            sequence_id: self.definition.id.clone(),
            run_config: self.run_config.clone(),
            execution_state: inner.execution_state,
            current_step_index: inner.current_step_index,
            total_steps: inner.schedule.as_ref().map(|s| s.steps.len()).unwrap_or(0),
            current_cycle: inner.current_cycle,
            total_cycles: inner.total_cycles,
            started_at: inner.started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            commanded_value: inner.commanded_value,
            error: inner.error.clone(),
        }
    }

    /// Runs the whole playback to completion (or abort/error) on the calling
    /// task. Callers spawn this; it returns once a terminal state is reached.
    pub async fn start(self: Arc<Self>) -> AppResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.execution_state != SequenceExecutionState::Idle {
                return Err(ControllerError::State(
                    "sequence controller is not idle".into(),
                ));
            }
            inner.execution_state = SequenceExecutionState::Running;
            inner.started_at = Utc::now();
        }

        if let Some(pre) = self.definition.pre_value {
            let value = self.definition.apply_modifiers(pre);
            if let Err(e) = self
                .session
                .set_value(self.run_config.parameter.clone(), value)
                .await
            {
                return self.fail(e.to_string()).await;
            }
        }

        self.rebuild_schedule(Instant::now()).await;
        self.emit(SequenceEvent::Started(self.state().await)).await;

        loop {
            let (abort, pause) = {
                let inner = self.inner.read().await;
                (inner.abort_requested, inner.pause_requested)
            };
            if abort {
                return self.do_abort().await;
            }
            if pause {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let target = {
                let inner = self.inner.read().await;
                match &inner.schedule {
                    Some(s) => s.targets[inner.current_step_index],
                    None => break,
                }
            };
            tokio::time::sleep_until(target).await;
            self.skip_ahead_if_behind().await;

            let done = self.fire_current_step().await?;
            if done {
                break;
            }
        }

        Ok(())
    }

    /// Fires the current step, advances indices/cycles, and rebuilds the
    /// schedule at a cycle boundary. Returns `true` once the sequence has
    /// reached a terminal state.
    async fn fire_current_step(self: &Arc<Self>) -> AppResult<bool> {
        let (value, parameter) = {
            let inner = self.inner.read().await;
            let schedule = inner
                .schedule
                .as_ref()
                .ok_or_else(|| ControllerError::State("no schedule built".into()))?;
            let raw = schedule.steps[inner.current_step_index].value;
            (
                self.definition.apply_modifiers(raw),
                self.run_config.parameter.clone(),
            )
        };

        match self.session.set_value(parameter, value).await {
            Ok(()) => {}
            Err(e) => {
                self.fail(e.to_string()).await?;
                return Ok(true);
            }
        }

        let mut inner = self.inner.write().await;
        inner.commanded_value = Some(value);
        inner.last_commanded_for_seed = value;
        drop(inner);
        self.emit(SequenceEvent::Progress(self.state().await)).await;

        let mut inner = self.inner.write().await;
        let step_count = inner.schedule.as_ref().unwrap().steps.len();
        inner.current_step_index += 1;
        if inner.current_step_index >= step_count {
            inner.current_step_index = 0;
            inner.current_cycle += 1;
            let cycle_done = inner
                .total_cycles
                .is_some_and(|total| inner.current_cycle >= total);
            if cycle_done {
                inner.execution_state = SequenceExecutionState::Completed;
                drop(inner);
                if let Some(post) = self.definition.post_value {
                    let value = self.definition.apply_modifiers(post);
                    let _ = self.session.set_value(self.run_config.parameter.clone(), value).await;
                }
                self.emit(SequenceEvent::Completed(self.state().await)).await;
                return Ok(true);
            }
            let last_dwell_ms = inner
                .schedule
                .as_ref()
                .and_then(|s| s.steps.last())
                .map(|s| s.dwell_ms)
                .unwrap_or(0);
            let resume_at = Instant::now()
                + Duration::from_millis(last_dwell_ms.max(self.config.min_interval_ms));
            let seed = inner.last_commanded_for_seed;
            drop(inner);
            self.rebuild_schedule_with_seed(resume_at, seed).await;
        }
        Ok(false)
    }

    /// Frame-dropping policy (§4.7): if the wake-up is far behind schedule,
    /// advance `current_step_index` past steps whose dwell has already fully
    /// elapsed, without calling `setValue` for them, so overall cycle timing
    /// is preserved. The last step of a cycle is never skipped — it always
    /// gets its full dwell before the cycle boundary runs.
    async fn skip_ahead_if_behind(&self) {
        let mut inner = self.inner.write().await;
        let last_index = match &inner.schedule {
            Some(s) if !s.steps.is_empty() => s.steps.len() - 1,
            _ => return,
        };
        let now = Instant::now();
        loop {
            if inner.current_step_index >= last_index {
                break;
            }
            let next = inner.current_step_index + 1;
            let Some((dwell, next_target)) = inner.schedule.as_ref().map(|schedule| {
                (
                    Duration::from_millis(schedule.steps[inner.current_step_index].dwell_ms),
                    schedule.targets[next],
                )
            }) else {
                break;
            };
            if now > next_target + dwell {
                inner.current_step_index = next;
            } else {
                break;
            }
        }
    }

    async fn rebuild_schedule(self: &Arc<Self>, start: Instant) {
        let seed = self.inner.read().await.last_commanded_for_seed;
        self.rebuild_schedule_with_seed(start, seed).await;
    }

    async fn rebuild_schedule_with_seed(self: &Arc<Self>, start: Instant, seed: f64) {
        let steps = waveform::generate(&self.definition.waveform, seed);
        let min_interval = Duration::from_millis(self.config.min_interval_ms);
        let schedule = Schedule::build(steps, start, min_interval);
        self.inner.write().await.schedule = Some(schedule);
    }

    pub async fn pause(&self) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if inner.execution_state != SequenceExecutionState::Running {
            return Err(ControllerError::State("sequence is not running".into()));
        }
        inner.execution_state = SequenceExecutionState::Paused;
        inner.pause_requested = true;
        inner.paused_at = Some(Instant::now());
        Ok(())
    }

    pub async fn resume(&self) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if inner.execution_state != SequenceExecutionState::Paused {
            return Err(ControllerError::State("sequence is not paused".into()));
        }
        if let Some(paused_at) = inner.paused_at.take() {
            let gap = paused_at.elapsed();
            inner.pause_elapsed += gap;
            let current = inner.current_step_index;
            let min_interval = Duration::from_millis(self.config.min_interval_ms);
            if let Some(schedule) = inner.schedule.as_mut() {
                for target in &mut schedule.targets {
                    *target += gap;
                }
                // The immediate next step always gets at least minIntervalMs from
                // the moment of resume, even if the shifted target already elapsed.
                if let Some(next_target) = schedule.targets.get_mut(current) {
                    let floor = Instant::now() + min_interval;
                    if *next_target < floor {
                        *next_target = floor;
                    }
                }
            }
        }
        inner.execution_state = SequenceExecutionState::Running;
        inner.pause_requested = false;
        Ok(())
    }

    pub async fn abort(&self) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if !matches!(
            inner.execution_state,
            SequenceExecutionState::Running | SequenceExecutionState::Paused
        ) {
            return Err(ControllerError::State(
                "sequence is not running or paused".into(),
            ));
        }
        inner.abort_requested = true;
        Ok(())
    }

    async fn do_abort(self: &Arc<Self>) -> AppResult<()> {
        if let Some(post) = self.definition.post_value {
            let value = self.definition.apply_modifiers(post);
            let _ = self
                .session
                .set_value(self.run_config.parameter.clone(), value)
                .await;
        }
        self.inner.write().await.execution_state = SequenceExecutionState::Idle;
        self.emit(SequenceEvent::Aborted(self.state().await)).await;
        Ok(())
    }

    async fn fail(self: &Arc<Self>, message: String) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.execution_state = SequenceExecutionState::Error;
        inner.error = Some(message);
        drop(inner);
        self.emit(SequenceEvent::Error(self.state().await)).await;
        Ok(())
    }

    async fn emit(&self, event: SequenceEvent) {
        let _ = self.events_tx.send(event);
    }

    pub async fn execution_state(&self) -> SequenceExecutionState {
        self.inner.read().await.execution_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::driver::MockDriver;
    use crate::model::{ParametricKind, ParametricWaveform};
    use crate::transport::MockTransport;

    async fn session() -> (DeviceSessionHandle, tokio::task::JoinHandle<()>) {
        let transport = MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into()])
            .with_setpoint("voltage", 0.0);
        let driver = Box::new(MockDriver::power_supply(transport, "psu-1"));
        crate::session::spawn("psu-1".into(), driver, SessionConfig::default()).unwrap()
    }

    fn def(points: u32, interval_ms: u64) -> SequenceDefinition {
        SequenceDefinition {
            id: "seq-1".into(),
            name: "ramp".into(),
            unit: "V".into(),
            waveform: Waveform::Ramp(ParametricWaveform {
                kind: ParametricKind::Ramp,
                min: 0.0,
                max: 10.0,
                points_per_cycle: points,
                interval_ms,
            }),
            pre_value: None,
            post_value: Some(0.0),
            scale: None,
            offset: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_once_completes_and_applies_post_value() {
        let (session, task) = session().await;
        let run_config = SequenceRunConfig {
            sequence_id: "seq-1".into(),
            device_id: "psu-1".into(),
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Once,
            repeat_count: None,
        };
        let controller =
            SequenceController::new(def(3, 10), run_config, session.clone(), SequenceConfig::default())
                .unwrap();
        let mut events = controller.subscribe();
        controller.clone().start().await.unwrap();
        let snap = session.snapshot().await.unwrap();
        assert_eq!(snap.setpoints["voltage"], 0.0);
        assert!(matches!(events.recv().await.unwrap(), SequenceEvent::Started(_)));

        session.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_count_requires_repeat_count() {
        let (session, task) = session().await;
        let run_config = SequenceRunConfig {
            sequence_id: "seq-1".into(),
            device_id: "psu-1".into(),
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Count,
            repeat_count: None,
        };
        let err = SequenceController::new(def(3, 10), run_config, session.clone(), SequenceConfig::default())
            .unwrap_err();
        assert!(matches!(err, ControllerError::Precondition(_)));
        session.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_pause_resume_state_transitions() {
        let (session, task) = session().await;
        let run_config = SequenceRunConfig {
            sequence_id: "seq-1".into(),
            device_id: "psu-1".into(),
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Continuous,
            repeat_count: None,
        };
        let controller =
            SequenceController::new(def(5, 5000), run_config, session.clone(), SequenceConfig::default())
                .unwrap();
        let runner = tokio::spawn(controller.clone().start());
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.pause().await.unwrap();
        assert_eq!(controller.execution_state().await, SequenceExecutionState::Paused);
        controller.resume().await.unwrap();
        controller.abort().await.unwrap();
        let _ = runner.await;
        assert_eq!(controller.execution_state().await, SequenceExecutionState::Idle);
        session.shutdown().await;
        let _ = task.await;
    }
}
