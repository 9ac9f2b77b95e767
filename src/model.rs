//! The shared data model: device identity/capabilities, session state, and the
//! durable sequence/trigger definitions. Mirrors the teacher's `core.rs` convention
//! of keeping plain, serde-derived structs separate from the actors that own them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of instrument a `DeviceSession` fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    PowerSupply,
    ElectronicLoad,
    Oscilloscope,
}

/// Static identity of a device, as reported by its driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: Option<String>,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

/// One settable output channel (e.g. voltage, current) on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetpointDescriptor {
    pub name: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub decimals: u32,
    /// If set, this setpoint is only meaningful while the device is in one of
    /// these modes.
    pub modes: Option<Vec<String>>,
}

/// One readable measurement channel on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementDescriptor {
    pub name: String,
    pub unit: String,
    pub decimals: u32,
}

/// Static capability description returned by `Driver::describe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub modes: Vec<String>,
    pub modes_settable: bool,
    pub outputs: Vec<SetpointDescriptor>,
    pub measurements: Vec<MeasurementDescriptor>,
    pub features: Vec<String>,
    pub channels: Vec<String>,
}

impl Capabilities {
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&SetpointDescriptor> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn has_measurement(&self, name: &str) -> bool {
        self.measurements.iter().any(|m| m.name == name)
    }

    pub fn has_mode(&self, name: &str) -> bool {
        self.modes.iter().any(|m| m == name)
    }
}

/// A device's live connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Error,
}

/// Bounded-window time series kept for every measurement channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub timestamps: Vec<DateTime<Utc>>,
    pub series: HashMap<String, Vec<f64>>,
}

impl History {
    pub fn push_sample(&mut self, now: DateTime<Utc>, measurements: &HashMap<String, f64>) {
        self.timestamps.push(now);
        for (name, value) in measurements {
            self.series.entry(name.clone()).or_default().push(*value);
        }
        // Keep every series the same length as `timestamps` even if a sample
        // round didn't report a channel, so indices stay aligned.
        for values in self.series.values_mut() {
            if values.len() < self.timestamps.len() {
                let last = values.last().copied().unwrap_or(0.0);
                values.push(last);
            }
        }
    }

    pub fn truncate_before(&mut self, cutoff: DateTime<Utc>) {
        let drop = self.timestamps.iter().take_while(|t| **t < cutoff).count();
        if drop == 0 {
            return;
        }
        self.timestamps.drain(0..drop);
        for values in self.series.values_mut() {
            let drop = drop.min(values.len());
            values.drain(0..drop);
        }
    }
}

/// The authoritative, publishable state of one device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSessionState {
    pub info: DeviceInfo,
    pub capabilities: Capabilities,
    pub connection_status: ConnectionStatus,
    pub consecutive_errors: u32,
    pub mode: Option<String>,
    pub output_enabled: bool,
    pub setpoints: HashMap<String, f64>,
    pub measurements: HashMap<String, f64>,
    pub history: History,
    pub last_updated: DateTime<Utc>,
}

impl DeviceSessionState {
    pub fn new(info: DeviceInfo, capabilities: Capabilities) -> Self {
        let mode = capabilities.modes.first().cloned();
        Self {
            info,
            capabilities,
            connection_status: ConnectionStatus::Disconnected,
            consecutive_errors: 0,
            mode,
            output_enabled: false,
            setpoints: HashMap::new(),
            measurements: HashMap::new(),
            history: History::default(),
            last_updated: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Waveforms / sequences
// ---------------------------------------------------------------------------

/// One point of an arbitrary waveform: an explicit value held for `dwell_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WaveformStep {
    pub value: f64,
    pub dwell_ms: u64,
}

/// The shape parameters of a parametric (sine/triangle/ramp/square/steps) waveform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametricWaveform {
    pub kind: ParametricKind,
    pub min: f64,
    pub max: f64,
    pub points_per_cycle: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParametricKind {
    Sine,
    Triangle,
    Ramp,
    Square,
    Steps,
}

/// A random-walk waveform: each point steps from the previous one by a bounded
/// random delta, clamped to `[min, max]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomWalkWaveform {
    pub start_value: f64,
    pub max_step_size: f64,
    pub min: f64,
    pub max: f64,
    pub points_per_cycle: u32,
    pub interval_ms: u64,
}

/// An explicit, caller-specified list of `{value, dwellMs}` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitraryWaveform {
    pub steps: Vec<WaveformStep>,
}

/// A sequence's waveform, tagged so the generator can dispatch on it dynamically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Waveform {
    Sine(ParametricWaveform),
    Triangle(ParametricWaveform),
    Ramp(ParametricWaveform),
    Square(ParametricWaveform),
    Steps(ParametricWaveform),
    Random(RandomWalkWaveform),
    Arbitrary(ArbitraryWaveform),
}

/// A named, durable sequence definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: String,
    pub name: String,
    pub unit: String,
    pub waveform: Waveform,
    pub pre_value: Option<f64>,
    pub post_value: Option<f64>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub max_clamp: Option<f64>,
    pub max_slew_rate: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SequenceDefinition {
    /// Applies the modifier chain (`scale` then `offset` then `maxClamp`) to a raw
    /// generated value, per §4.5.
    pub fn apply_modifiers(&self, value: f64) -> f64 {
        let mut v = value * self.scale.unwrap_or(1.0) + self.offset.unwrap_or(0.0);
        if let Some(clamp) = self.max_clamp {
            v = v.min(clamp);
        }
        v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    Once,
    Count,
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRunConfig {
    pub sequence_id: String,
    pub device_id: String,
    pub parameter: String,
    pub repeat_mode: RepeatMode,
    pub repeat_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceExecutionState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceState {
    pub sequence_id: String,
    pub run_config: SequenceRunConfig,
    pub execution_state: SequenceExecutionState,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub current_cycle: u32,
    pub total_cycles: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub commanded_value: Option<f64>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    Once,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ComparisonOperator {
    pub fn evaluate(self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOperator::Gt => lhs > rhs,
            ComparisonOperator::Lt => lhs < rhs,
            ComparisonOperator::Ge => lhs >= rhs,
            ComparisonOperator::Le => lhs <= rhs,
            ComparisonOperator::Eq => (lhs - rhs).abs() < f64::EPSILON,
            ComparisonOperator::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerCondition {
    Time {
        seconds: f64,
    },
    Value {
        device_id: String,
        parameter: String,
        operator: ComparisonOperator,
        value: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerAction {
    SetValue {
        device_id: String,
        parameter: String,
        value: f64,
    },
    SetOutput {
        device_id: String,
        enabled: bool,
    },
    SetMode {
        device_id: String,
        mode: String,
    },
    StartSequence {
        sequence_id: String,
        device_id: String,
        parameter: String,
        repeat_mode: RepeatMode,
        repeat_count: Option<u32>,
    },
    StopSequence,
    PauseSequence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub condition: TriggerCondition,
    pub action: TriggerAction,
    pub repeat_mode: RepeatPolicy,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerScript {
    pub id: String,
    pub name: String,
    pub triggers: Vec<Trigger>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerScriptExecutionState {
    Idle,
    Running,
    Paused,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerState {
    pub trigger_id: String,
    pub fired_count: u64,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub condition_met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerScriptState {
    pub script_id: String,
    pub execution_state: TriggerScriptExecutionState,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub trigger_states: Vec<TriggerState>,
    pub error: Option<String>,
}

/// Generates a fresh server-side id, matching the teacher's preference for
/// `uuid` v4 identifiers over caller-supplied ones.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_lookup() {
        let caps = Capabilities {
            outputs: vec![SetpointDescriptor {
                name: "voltage".into(),
                unit: "V".into(),
                min: 0.0,
                max: 30.0,
                decimals: 2,
                modes: None,
            }],
            ..Default::default()
        };
        assert!(caps.has_output("voltage"));
        assert!(!caps.has_output("current"));
    }

    #[test]
    fn test_history_truncate() {
        let mut h = History::default();
        let t0 = Utc::now();
        let mut m = HashMap::new();
        m.insert("v".to_string(), 1.0);
        h.push_sample(t0, &m);
        h.push_sample(t0 + chrono::Duration::seconds(10), &m);
        h.truncate_before(t0 + chrono::Duration::seconds(5));
        assert_eq!(h.timestamps.len(), 1);
        assert_eq!(h.series["v"].len(), 1);
    }

    #[test]
    fn test_comparison_operator() {
        assert!(ComparisonOperator::Gt.evaluate(5.0, 1.0));
        assert!(!ComparisonOperator::Lt.evaluate(5.0, 1.0));
        assert!(ComparisonOperator::Eq.evaluate(1.0, 1.0));
    }

    #[test]
    fn test_apply_modifiers() {
        let def = SequenceDefinition {
            id: "s1".into(),
            name: "ramp".into(),
            unit: "V".into(),
            waveform: Waveform::Ramp(ParametricWaveform {
                kind: ParametricKind::Ramp,
                min: 0.0,
                max: 1.0,
                points_per_cycle: 2,
                interval_ms: 100,
            }),
            pre_value: None,
            post_value: None,
            scale: Some(2.0),
            offset: Some(1.0),
            max_clamp: Some(2.5),
            max_slew_rate: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(def.apply_modifiers(1.0), 2.5);
        assert_eq!(def.apply_modifiers(0.0), 1.0);
    }
}
