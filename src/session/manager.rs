//! SessionManager (§4.4): process-wide registry of `DeviceSession`s.
//!
//! Grounded directly on `InstrumentManagerV3`: a factory/enumerator discovers
//! what should exist, `spawn_instrument`-equivalent logic creates sessions that
//! don't exist yet, and `shutdown_all` tears every session down with a bounded
//! per-task timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{DeviceEvent, ServerMessage, SharedBus};
use crate::config::SessionConfig;
use crate::driver::Driver;
use crate::error::{AppResult, ControllerError};
use crate::model::DeviceInfo;

use super::{spawn, DeviceSessionHandle};

/// Discovers which devices should currently have a session. A real deployment
/// would probe serial ports or a VISA resource list; tests and the default
/// build use a static list instead.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    /// Returns the device ids that should be active, each paired with a factory
    /// that builds its `Driver` when a new session needs to be spawned.
    async fn enumerate(&self) -> AppResult<Vec<(String, Box<dyn Driver>)>>;
}

/// A `DeviceEnumerator` over a fixed, caller-provided set of drivers.
pub struct StaticEnumerator {
    factories: Mutex<Vec<(String, Box<dyn Fn() -> Box<dyn Driver> + Send + Sync>)>>,
}

impl StaticEnumerator {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(Vec::new()),
        }
    }

    pub async fn register(
        &self,
        device_id: impl Into<String>,
        factory: impl Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    ) {
        self.factories
            .lock()
            .await
            .push((device_id.into(), Box::new(factory)));
    }
}

impl Default for StaticEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceEnumerator for StaticEnumerator {
    async fn enumerate(&self) -> AppResult<Vec<(String, Box<dyn Driver>)>> {
        let factories = self.factories.lock().await;
        Ok(factories
            .iter()
            .map(|(id, factory)| (id.clone(), factory()))
            .collect())
    }
}

struct Entry {
    handle: DeviceSessionHandle,
    task: JoinHandle<()>,
}

/// Owns every `DeviceSession` in the process.
pub struct SessionManager {
    enumerator: Arc<dyn DeviceEnumerator>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Entry>>,
    events_tx: broadcast::Sender<DeviceEvent>,
    bus: SharedBus,
}

impl SessionManager {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>, config: SessionConfig, bus: SharedBus) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            enumerator,
            config,
            sessions: Mutex::new(HashMap::new()),
            events_tx,
            bus,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events_tx.subscribe()
    }

    /// Re-runs discovery: spawns sessions for newly seen device ids and tears
    /// down sessions for ids no longer reported, preserving everything else.
    pub async fn scan(&self) -> AppResult<Vec<DeviceInfo>> {
        let discovered = self.enumerator.enumerate().await?;
        let discovered_ids: std::collections::HashSet<String> =
            discovered.iter().map(|(id, _)| id.clone()).collect();

        let mut sessions = self.sessions.lock().await;

        let stale: Vec<String> = sessions
            .keys()
            .filter(|id| !discovered_ids.contains(*id))
            .cloned()
            .collect();
        let mut changed = !stale.is_empty();
        for id in stale {
            if let Some(entry) = sessions.remove(&id) {
                entry.handle.shutdown().await;
                let _ = super::join_with_timeout(entry.task, Duration::from_secs(5)).await;
            }
        }

        for (id, driver) in discovered {
            if sessions.contains_key(&id) {
                continue;
            }
            let (handle, task) = spawn(id.clone(), driver, self.config.clone())?;
            let mut forward_rx = handle.subscribe();
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Ok(event) = forward_rx.recv().await {
                    let _ = events_tx.send(event);
                }
            });
            sessions.insert(id, Entry { handle, task });
            changed = true;
        }

        let mut infos = Vec::with_capacity(sessions.len());
        let mut ids = Vec::with_capacity(sessions.len());
        for (id, entry) in sessions.iter() {
            ids.push(id.clone());
            infos.push(entry.handle.snapshot().await?.info);
        }
        drop(sessions);

        if changed {
            self.bus
                .broadcast(ServerMessage::DeviceList { device_ids: ids })
                .await;
        }

        Ok(infos)
    }

    pub async fn get(&self, device_id: &str) -> AppResult<DeviceSessionHandle> {
        self.sessions
            .lock()
            .await
            .get(device_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| ControllerError::NotFound(format!("device {device_id}")))
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Shuts every session down with a 5s per-task grace period, matching
    /// `InstrumentManagerV3::shutdown_all`.
    pub async fn stop(&self) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        let mut failures = 0usize;
        for (id, entry) in sessions.drain() {
            entry.handle.shutdown().await;
            if let Err(e) = super::join_with_timeout(entry.task, Duration::from_secs(5)).await {
                tracing::error!(device_id = %id, error = %e, "session shutdown failed");
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(ControllerError::ShutdownFailed(failures));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::transport::MockTransport;

    fn mock_factory(id: &'static str) -> impl Fn() -> Box<dyn Driver> + Send + Sync {
        move || {
            let transport = MockTransport::new("Simulated,PSU-100,1,1.0", vec!["CV".into()])
                .with_setpoint("voltage", 0.0)
                .with_setpoint("current", 0.0);
            Box::new(MockDriver::power_supply(transport, id))
        }
    }

    #[tokio::test]
    async fn test_scan_spawns_and_preserves_sessions() {
        let enumerator = Arc::new(StaticEnumerator::new());
        enumerator.register("psu-1", mock_factory("psu-1")).await;
        let bus = Arc::new(crate::bus::SubscriptionBus::new(64));
        let manager = SessionManager::new(enumerator, SessionConfig::default(), bus);

        let infos = manager.scan().await.unwrap();
        assert_eq!(infos.len(), 1);

        manager.get("psu-1").await.unwrap().set_value("voltage", 9.0).await.unwrap();
        manager.scan().await.unwrap();
        let snap = manager.get("psu-1").await.unwrap().snapshot().await.unwrap();
        assert_eq!(snap.setpoints["voltage"], 9.0);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_unknown_device_not_found() {
        let enumerator = Arc::new(StaticEnumerator::new());
        let bus = Arc::new(crate::bus::SubscriptionBus::new(64));
        let manager = SessionManager::new(enumerator, SessionConfig::default(), bus);
        let err = manager.get("missing").await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)));
    }
}
