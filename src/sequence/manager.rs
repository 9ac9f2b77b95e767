//! SequenceManager (§4.8): library façade + owner of the single active
//! `SequenceController`, rebroadcasting its events onto the `SubscriptionBus`.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::{ServerMessage, SharedBus};
use crate::config::SequenceConfig;
use crate::error::{AppResult, ControllerError};
use crate::model::{SequenceDefinition, SequenceRunConfig, SequenceState};
use crate::session::SessionManager;

use super::controller::{SequenceController, SequenceEvent};
use super::library::SequenceLibrary;

struct ActiveRun {
    controller: Arc<SequenceController>,
    task: tokio::task::JoinHandle<AppResult<()>>,
}

pub struct SequenceManager {
    library: SequenceLibrary,
    sessions: Arc<SessionManager>,
    bus: SharedBus,
    config: SequenceConfig,
    active: Mutex<Option<ActiveRun>>,
}

impl SequenceManager {
    pub fn new(
        library: SequenceLibrary,
        sessions: Arc<SessionManager>,
        bus: SharedBus,
        config: SequenceConfig,
    ) -> Self {
        Self {
            library,
            sessions,
            bus,
            config,
            active: Mutex::new(None),
        }
    }

    pub async fn list_library(&self) -> Vec<SequenceDefinition> {
        let sequences = self.library.list().await;
        self.bus
            .broadcast(ServerMessage::SequenceLibrary {
                sequences: sequences.clone(),
            })
            .await;
        sequences
    }

    pub async fn save(&self, def: SequenceDefinition) -> AppResult<SequenceDefinition> {
        let saved = if def.id.is_empty() {
            self.library.add(def).await?
        } else {
            self.library.update(def).await?
        };
        self.bus
            .broadcast(ServerMessage::SequenceLibrarySaved {
                sequence: saved.clone(),
            })
            .await;
        self.bus
            .broadcast(ServerMessage::SequenceLibrary {
                sequences: self.library.list().await,
            })
            .await;
        Ok(saved)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        self.library.delete(id).await?;
        self.bus
            .broadcast(ServerMessage::SequenceLibraryDeleted {
                sequence_id: id.to_string(),
            })
            .await;
        self.bus
            .broadcast(ServerMessage::SequenceLibrary {
                sequences: self.library.list().await,
            })
            .await;
        Ok(())
    }

    /// Starts a sequence run. If another is active, it is aborted first (§4.8).
    pub async fn run(&self, run_config: SequenceRunConfig) -> AppResult<SequenceState> {
        let definition = self.library.get(&run_config.sequence_id).await?;
        if definition.unit != run_config.unit_of(&self.sessions, &run_config.device_id).await? {
            return Err(ControllerError::Precondition(
                "sequence unit does not match device output unit".into(),
            ));
        }

        self.abort_active().await?;

        let session = self.sessions.get(&run_config.device_id).await?;
        let controller = SequenceController::new(
            definition,
            run_config,
            session,
            self.config.clone(),
        )?;

        let mut events = controller.subscribe();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let message = match event {
                    SequenceEvent::Started(s) => ServerMessage::SequenceStarted { state: s },
                    SequenceEvent::Progress(s) => ServerMessage::SequenceProgress { state: s },
                    SequenceEvent::Completed(s) => ServerMessage::SequenceCompleted { state: s },
                    SequenceEvent::Aborted(s) => ServerMessage::SequenceAborted { state: s },
                    SequenceEvent::Error(s) => ServerMessage::SequenceError { state: s },
                };
                bus.broadcast(message).await;
            }
        });

        let state = controller.state().await;
        let run_task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start().await }
        });
        *self.active.lock().await = Some(ActiveRun {
            controller,
            task: run_task,
        });
        Ok(state)
    }

    pub async fn abort(&self) -> AppResult<()> {
        self.abort_active().await
    }

    async fn abort_active(&self) -> AppResult<()> {
        let mut active = self.active.lock().await;
        if let Some(run) = active.take() {
            if run.controller.abort().await.is_ok() {
                let _ = run.task.await;
            }
        }
        Ok(())
    }

    pub async fn pause(&self) -> AppResult<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => run.controller.pause().await,
            None => Err(ControllerError::State("no active sequence".into())),
        }
    }

    pub async fn resume(&self) -> AppResult<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => run.controller.resume().await,
            None => Err(ControllerError::State("no active sequence".into())),
        }
    }

    pub async fn active_state(&self) -> Option<SequenceState> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => Some(run.controller.state().await),
            None => None,
        }
    }
}

/// Small helper trait so `run()` can validate the unit match without importing
/// `SessionManager`/model internals into every call site.
#[async_trait::async_trait]
trait RunConfigExt {
    async fn unit_of(&self, sessions: &SessionManager, device_id: &str) -> AppResult<String>;
}

#[async_trait::async_trait]
impl RunConfigExt for SequenceRunConfig {
    async fn unit_of(&self, sessions: &SessionManager, device_id: &str) -> AppResult<String> {
        let session = sessions.get(device_id).await?;
        let snapshot = session.snapshot().await?;
        let descriptor = snapshot
            .capabilities
            .output(&self.parameter)
            .ok_or_else(|| ControllerError::Precondition(format!("unknown output {}", self.parameter)))?;
        Ok(descriptor.unit.clone())
    }
}
