//! TriggerScriptManager (§4.10): library façade + owner of the single active
//! `TriggerRuntime`, rebroadcasting its events onto the `SubscriptionBus`.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::{ServerMessage, SharedBus};
use crate::config::TriggerConfig;
use crate::error::{AppResult, ControllerError};
use crate::model::{TriggerScript, TriggerScriptState};
use crate::sequence::SequenceManager;
use crate::session::SessionManager;

use super::library::TriggerScriptLibrary;
use super::runtime::{TriggerRuntime, TriggerRuntimeEvent};

struct ActiveRun {
    runtime: Arc<TriggerRuntime>,
    task: tokio::task::JoinHandle<AppResult<()>>,
}

pub struct TriggerScriptManager {
    library: TriggerScriptLibrary,
    sessions: Arc<SessionManager>,
    sequences: Arc<SequenceManager>,
    bus: SharedBus,
    config: TriggerConfig,
    active: Mutex<Option<ActiveRun>>,
}

impl TriggerScriptManager {
    pub fn new(
        library: TriggerScriptLibrary,
        sessions: Arc<SessionManager>,
        sequences: Arc<SequenceManager>,
        bus: SharedBus,
        config: TriggerConfig,
    ) -> Self {
        Self {
            library,
            sessions,
            sequences,
            bus,
            config,
            active: Mutex::new(None),
        }
    }

    pub async fn list_library(&self) -> Vec<TriggerScript> {
        self.library.list().await
    }

    pub async fn save(&self, script: TriggerScript) -> AppResult<TriggerScript> {
        let saved = if script.id.is_empty() {
            self.library.add(script).await?
        } else {
            self.library.update(script).await?
        };
        self.bus
            .broadcast(ServerMessage::TriggerScriptLibrary {
                scripts: self.library.list().await,
            })
            .await;
        Ok(saved)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        self.library.delete(id).await?;
        self.bus
            .broadcast(ServerMessage::TriggerScriptLibrary {
                scripts: self.library.list().await,
            })
            .await;
        Ok(())
    }

    /// Starts a trigger script run. If another is active, it is stopped first.
    pub async fn run(&self, script_id: &str) -> AppResult<TriggerScriptState> {
        let script = self.library.get(script_id).await?;
        self.stop_active().await;

        let runtime = TriggerRuntime::new(
            script,
            self.sessions.clone(),
            self.sequences.clone(),
            self.config.clone(),
        );

        let mut events = runtime.subscribe();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let message = match event {
                    TriggerRuntimeEvent::Started(s) => ServerMessage::TriggerScriptStarted { state: s },
                    TriggerRuntimeEvent::Progress(s) => ServerMessage::TriggerScriptProgress { state: s },
                    TriggerRuntimeEvent::Stopped(s) => ServerMessage::TriggerScriptStopped { state: s },
                    TriggerRuntimeEvent::Paused(s) => ServerMessage::TriggerScriptPaused { state: s },
                    TriggerRuntimeEvent::Resumed(s) => ServerMessage::TriggerScriptResumed { state: s },
                    TriggerRuntimeEvent::Error(s) => ServerMessage::TriggerScriptError { state: s },
                    TriggerRuntimeEvent::Fired {
                        script_id,
                        trigger_id,
                        fired_at,
                    } => ServerMessage::TriggerFired {
                        script_id,
                        trigger_id,
                        fired_at,
                    },
                    TriggerRuntimeEvent::ActionFailed {
                        script_id,
                        trigger_id,
                        message,
                    } => ServerMessage::TriggerActionFailed {
                        script_id,
                        trigger_id,
                        message,
                    },
                };
                bus.broadcast(message).await;
            }
        });

        let state = runtime.state().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.start().await }
        });
        *self.active.lock().await = Some(ActiveRun { runtime, task });
        Ok(state)
    }

    pub async fn stop(&self) {
        self.stop_active().await;
    }

    async fn stop_active(&self) {
        let mut active = self.active.lock().await;
        if let Some(run) = active.take() {
            run.runtime.stop().await;
            let _ = run.task.await;
        }
    }

    pub async fn pause(&self) -> AppResult<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => run.runtime.pause().await,
            None => Err(ControllerError::State("no active trigger script".into())),
        }
    }

    pub async fn resume(&self) -> AppResult<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => run.runtime.resume().await,
            None => Err(ControllerError::State("no active trigger script".into())),
        }
    }

    pub async fn active_state(&self) -> Option<TriggerScriptState> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => Some(run.runtime.state().await),
            None => None,
        }
    }
}
