//! Integration coverage for graceful shutdown and end-to-end scenarios spanning
//! sessions, sequences, and trigger scripts together.

use std::sync::Arc;
use std::time::Duration;

use bench_controller::bus::SubscriptionBus;
use bench_controller::config::{SequenceConfig, SessionConfig, TriggerConfig};
use bench_controller::driver::MockDriver;
use bench_controller::model::{
    ComparisonOperator, ParametricKind, ParametricWaveform, RepeatMode, RepeatPolicy,
    SequenceDefinition, SequenceRunConfig, Trigger, TriggerAction, TriggerCondition,
    TriggerScript, Waveform,
};
use bench_controller::sequence::{SequenceLibrary, SequenceManager};
use bench_controller::session::{DeviceEnumerator, SessionManager, StaticEnumerator};
use bench_controller::transport::MockTransport;
use bench_controller::trigger::{TriggerScriptLibrary, TriggerScriptManager};

async fn build_sessions() -> Arc<SessionManager> {
    let enumerator = Arc::new(StaticEnumerator::new());
    enumerator
        .register("psu-1", || {
            let transport =
                MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into(), "CC".into()])
                    .with_setpoint("voltage", 0.0)
                    .with_setpoint("current", 0.0);
            Box::new(MockDriver::power_supply(transport, "psu-1"))
        })
        .await;
    let bus = Arc::new(SubscriptionBus::new(64));
    let sessions = Arc::new(SessionManager::new(
        enumerator as Arc<dyn DeviceEnumerator>,
        SessionConfig {
            poll_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        },
        bus,
    ));
    sessions.scan().await.unwrap();
    sessions
}

#[tokio::test]
async fn test_shutdown_completes_within_timeout() {
    let sessions = build_sessions().await;
    let start = std::time::Instant::now();
    sessions.stop().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "session shutdown took too long"
    );
}

#[tokio::test]
async fn test_sequence_run_to_completion_emits_terminal_event() {
    let sessions = build_sessions().await;
    let bus = Arc::new(SubscriptionBus::new(64));
    let dir = tempfile::tempdir().unwrap();
    let library = SequenceLibrary::open(dir.path(), 10).await.unwrap();
    let manager = SequenceManager::new(library, sessions.clone(), bus, SequenceConfig::default());

    let def = SequenceDefinition {
        id: String::new(),
        name: "quick ramp".into(),
        unit: "V".into(),
        waveform: Waveform::Ramp(ParametricWaveform {
            kind: ParametricKind::Ramp,
            min: 0.0,
            max: 5.0,
            points_per_cycle: 3,
            interval_ms: 10,
        }),
        pre_value: None,
        post_value: Some(0.0),
        scale: None,
        offset: None,
        max_clamp: None,
        max_slew_rate: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    let saved = manager.save(def).await.unwrap();

    manager
        .run(SequenceRunConfig {
            sequence_id: saved.id,
            device_id: "psu-1".into(),
            parameter: "voltage".into(),
            repeat_mode: RepeatMode::Once,
            repeat_count: None,
        })
        .await
        .unwrap();

    // Give the controller time to run its (short) schedule to completion.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snap = sessions.get("psu-1").await.unwrap().snapshot().await.unwrap();
    assert_eq!(snap.setpoints["voltage"], 0.0);

    sessions.stop().await.unwrap();
}

#[tokio::test]
async fn test_trigger_script_set_output_action_end_to_end() {
    let sessions = build_sessions().await;
    let bus = Arc::new(SubscriptionBus::new(64));
    let dir = tempfile::tempdir().unwrap();
    let seq_library = SequenceLibrary::open(dir.path(), 10).await.unwrap();
    let sequences = Arc::new(SequenceManager::new(
        seq_library,
        sessions.clone(),
        bus.clone(),
        SequenceConfig::default(),
    ));
    let trigger_library = TriggerScriptLibrary::open(dir.path(), 10).await.unwrap();
    let triggers = TriggerScriptManager::new(
        trigger_library,
        sessions.clone(),
        sequences,
        bus,
        TriggerConfig {
            tick_interval: Duration::from_millis(10),
        },
    );

    let script = TriggerScript {
        id: String::new(),
        name: "enable output immediately".into(),
        triggers: vec![Trigger {
            id: bench_controller::model::new_id(),
            condition: TriggerCondition::Time { seconds: 0.0 },
            action: TriggerAction::SetOutput {
                device_id: "psu-1".into(),
                enabled: true,
            },
            repeat_mode: RepeatPolicy::Once,
            debounce_ms: 0,
        }],
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    let saved = triggers.save(script).await.unwrap();
    triggers.run(&saved.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = sessions.get("psu-1").await.unwrap().snapshot().await.unwrap();
    assert!(snap.output_enabled);

    triggers.stop().await;
    sessions.stop().await.unwrap();
}

#[tokio::test]
async fn test_value_trigger_refuses_to_fire_below_threshold() {
    let sessions = build_sessions().await;
    let bus = Arc::new(SubscriptionBus::new(64));
    let dir = tempfile::tempdir().unwrap();
    let seq_library = SequenceLibrary::open(dir.path(), 10).await.unwrap();
    let sequences = Arc::new(SequenceManager::new(
        seq_library,
        sessions.clone(),
        bus.clone(),
        SequenceConfig::default(),
    ));
    let trigger_library = TriggerScriptLibrary::open(dir.path(), 10).await.unwrap();
    let triggers = TriggerScriptManager::new(
        trigger_library,
        sessions.clone(),
        sequences,
        bus,
        TriggerConfig {
            tick_interval: Duration::from_millis(10),
        },
    );

    let script = TriggerScript {
        id: String::new(),
        name: "overcurrent cutoff".into(),
        triggers: vec![Trigger {
            id: bench_controller::model::new_id(),
            condition: TriggerCondition::Value {
                device_id: "psu-1".into(),
                parameter: "current".into(),
                operator: ComparisonOperator::Gt,
                value: 4.5,
            },
            action: TriggerAction::SetOutput {
                device_id: "psu-1".into(),
                enabled: false,
            },
            repeat_mode: RepeatPolicy::Once,
            debounce_ms: 0,
        }],
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    let saved = triggers.save(script).await.unwrap();
    sessions
        .get("psu-1")
        .await
        .unwrap()
        .set_output(true)
        .await
        .unwrap();
    triggers.run(&saved.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = sessions.get("psu-1").await.unwrap().snapshot().await.unwrap();
    assert!(snap.output_enabled, "current never exceeded threshold, output must stay on");

    triggers.stop().await;
    sessions.stop().await.unwrap();
}
