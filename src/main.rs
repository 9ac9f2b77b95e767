//! Process entry point: loads configuration, wires the session/sequence/trigger
//! managers and the subscription bus together, and runs until interrupted.
//!
//! Wiring mirrors the teacher's `DaqManagerActor::run` construction in
//! `app_actor.rs`; the global allocator follows the teacher's own
//! Microsoft-Rust-Guidelines (`M-MIMALLOC-APPS`) convention.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use bench_controller::config::ControllerConfig;
use bench_controller::driver::MockDriver;
use bench_controller::sequence::{SequenceLibrary, SequenceManager};
use bench_controller::session::{DeviceEnumerator, SessionManager, StaticEnumerator};
use bench_controller::transport::MockTransport;
use bench_controller::trigger::{TriggerScriptLibrary, TriggerScriptManager};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "bench-controller", about = "Laboratory bench controller service")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControllerConfig::load(cli.config.as_deref())?;
    tracing::info!(?config, "starting bench-controller");

    let enumerator = Arc::new(StaticEnumerator::new());
    enumerator
        .register("psu-1", || {
            let transport = MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into(), "CC".into()])
                .with_setpoint("voltage", 0.0)
                .with_setpoint("current", 0.0);
            Box::new(MockDriver::power_supply(transport, "psu-1"))
        })
        .await;

    let bus = Arc::new(bench_controller::bus::SubscriptionBus::new(
        config.storage.client_queue_watermark,
    ));

    let sessions = Arc::new(SessionManager::new(
        enumerator as Arc<dyn DeviceEnumerator>,
        config.session.clone(),
        bus.clone(),
    ));
    sessions.scan().await?;

    let data_dir = config.resolve_data_dir()?;
    let sequence_library =
        SequenceLibrary::open(&data_dir, config.storage.max_library_size).await?;
    let sequences = Arc::new(SequenceManager::new(
        sequence_library,
        sessions.clone(),
        bus.clone(),
        config.sequence.clone(),
    ));

    let trigger_library =
        TriggerScriptLibrary::open(&data_dir, config.storage.max_library_size).await?;
    let triggers = Arc::new(TriggerScriptManager::new(
        trigger_library,
        sessions.clone(),
        sequences.clone(),
        bus.clone(),
        config.trigger.clone(),
    ));

    let device_events = sessions.subscribe();
    let bus_forwarder = bus.clone();
    tokio::spawn(async move {
        bus_forwarder.forward_device_events(device_events).await;
    });

    tracing::info!("bench-controller ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping services");

    triggers.stop().await;
    sequences.abort().await.ok();
    sessions.stop().await?;

    Ok(())
}
