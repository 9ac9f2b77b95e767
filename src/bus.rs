//! The external message catalog (§6) and the `SubscriptionBus` fan-out (§4.11).
//!
//! Wire framing (JSON-over-WebSocket) is out of scope; these are the plain Rust
//! enums an outer transport layer would serialize. The bus itself is grounded on
//! `other_examples/instrument_manager_v3.rs`'s per-client forwarder-task pattern:
//! one broadcast channel feeds many per-client `mpsc` queues, each drained by its
//! own task so one slow client can't stall another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::model::{SequenceState, TriggerScriptState};

/// Internal events emitted by a `DeviceSession`, device-scoped by construction.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Measurement {
        device_id: String,
        timestamp: DateTime<Utc>,
        values: HashMap<String, f64>,
    },
    Field {
        device_id: String,
        field: String,
        value: serde_json::Value,
    },
    Error {
        device_id: String,
        message: String,
    },
}

impl DeviceEvent {
    fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Measurement { device_id, .. } => device_id,
            DeviceEvent::Field { device_id, .. } => device_id,
            DeviceEvent::Error { device_id, .. } => device_id,
        }
    }

    /// Measurement messages are dropped under backpressure; everything else
    /// (field changes, device errors) must always be delivered (§4.11).
    fn is_droppable(&self) -> bool {
        matches!(self, DeviceEvent::Measurement { .. })
    }
}

/// Server-push messages, matching the catalog in §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    DeviceList {
        device_ids: Vec<String>,
    },
    Subscribed {
        device_id: String,
        state: crate::model::DeviceSessionState,
    },
    Measurement {
        device_id: String,
        timestamp: DateTime<Utc>,
        values: HashMap<String, f64>,
    },
    Field {
        device_id: String,
        field: String,
        value: serde_json::Value,
    },
    Error {
        device_id: Option<String>,
        message: String,
    },
    SequenceLibrary {
        sequences: Vec<crate::model::SequenceDefinition>,
    },
    SequenceLibrarySaved {
        sequence: crate::model::SequenceDefinition,
    },
    SequenceLibraryDeleted {
        sequence_id: String,
    },
    SequenceStarted {
        state: SequenceState,
    },
    SequenceProgress {
        state: SequenceState,
    },
    SequenceCompleted {
        state: SequenceState,
    },
    SequenceAborted {
        state: SequenceState,
    },
    SequenceError {
        state: SequenceState,
    },
    TriggerScriptLibrary {
        scripts: Vec<crate::model::TriggerScript>,
    },
    TriggerScriptStarted {
        state: TriggerScriptState,
    },
    TriggerScriptProgress {
        state: TriggerScriptState,
    },
    TriggerScriptStopped {
        state: TriggerScriptState,
    },
    TriggerScriptPaused {
        state: TriggerScriptState,
    },
    TriggerScriptResumed {
        state: TriggerScriptState,
    },
    TriggerScriptError {
        state: TriggerScriptState,
    },
    TriggerFired {
        script_id: String,
        trigger_id: String,
        fired_at: DateTime<Utc>,
    },
    TriggerActionFailed {
        script_id: String,
        trigger_id: String,
        message: String,
    },
}

type ClientId = String;

struct Client {
    tx: mpsc::Sender<ServerMessage>,
    subscribed_devices: HashSet<String>,
}

/// Typed fan-out of server-push messages to every connected client, honoring the
/// device-scoped subscription filter and the measurement-drop backpressure
/// policy from §4.11.
pub struct SubscriptionBus {
    clients: Mutex<HashMap<ClientId, Client>>,
    watermark: usize,
}

impl SubscriptionBus {
    pub fn new(watermark: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            watermark,
        }
    }

    /// Registers a new client and returns the receiving end of its send queue.
    pub async fn connect(&self, client_id: impl Into<String>) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.watermark);
        self.clients.lock().await.insert(
            client_id.into(),
            Client {
                tx,
                subscribed_devices: HashSet::new(),
            },
        );
        rx
    }

    pub async fn disconnect(&self, client_id: &str) {
        self.clients.lock().await.remove(client_id);
    }

    /// Subscribes a client to `device_id` and sends it the current device
    /// state as a `subscribed` message (§4.3/§6: "on subscribe emits a
    /// `subscribed` message containing the full current state").
    pub async fn subscribe(
        &self,
        client_id: &str,
        device_id: &str,
        state: crate::model::DeviceSessionState,
    ) {
        let tx = {
            let mut clients = self.clients.lock().await;
            let Some(client) = clients.get_mut(client_id) else {
                return;
            };
            client.subscribed_devices.insert(device_id.to_string());
            client.tx.clone()
        };
        let _ = tx
            .send(ServerMessage::Subscribed {
                device_id: device_id.to_string(),
                state,
            })
            .await;
    }

    pub async fn unsubscribe(&self, client_id: &str, device_id: &str) {
        if let Some(client) = self.clients.lock().await.get_mut(client_id) {
            client.subscribed_devices.remove(device_id);
        }
    }

    /// Broadcasts to every connected client, regardless of device subscription
    /// (used for global messages: device list, library, and terminal
    /// sequence/trigger events). None of these are `measurement` messages, so
    /// none are droppable (§4.11) — every client is guaranteed delivery.
    pub async fn broadcast(&self, message: ServerMessage) {
        let clients = self.clients.lock().await;
        for client in clients.values() {
            let _ = client.tx.send(message.clone()).await;
        }
    }

    /// Delivers a device-scoped message only to clients subscribed to that
    /// device. Measurement messages are dropped (not queued) for any client
    /// whose send queue is full; every other message type blocks briefly to
    /// guarantee delivery.
    async fn deliver_device_event(&self, event: DeviceEvent, as_message: ServerMessage) {
        let clients = self.clients.lock().await;
        for client in clients.values() {
            if !client.subscribed_devices.contains(event.device_id()) {
                continue;
            }
            if event.is_droppable() {
                if client.tx.try_send(as_message.clone()).is_err() {
                    tracing::debug!(device_id = %event.device_id(), "dropped measurement message under backpressure");
                }
            } else {
                let _ = client.tx.send(as_message.clone()).await;
            }
        }
    }

    /// Drains a `DeviceSession`/`SessionManager` broadcast channel and republishes
    /// every event onto this bus, applying the per-message device filter.
    pub async fn forward_device_events(&self, mut rx: broadcast::Receiver<DeviceEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let message = match event.clone() {
                        DeviceEvent::Measurement {
                            device_id,
                            timestamp,
                            values,
                        } => ServerMessage::Measurement {
                            device_id,
                            timestamp,
                            values,
                        },
                        DeviceEvent::Field {
                            device_id,
                            field,
                            value,
                        } => ServerMessage::Field {
                            device_id,
                            field,
                            value,
                        },
                        DeviceEvent::Error { device_id, message } => ServerMessage::Error {
                            device_id: Some(device_id),
                            message,
                        },
                    };
                    self.deliver_device_event(event, message).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscription bus forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Shared handle type most components take as a dependency.
pub type SharedBus = Arc<SubscriptionBus>;
