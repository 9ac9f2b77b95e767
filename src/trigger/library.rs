//! TriggerScriptLibrary: durable CRUD over `TriggerScript`s, symmetric to
//! `sequence::library::SequenceLibrary` (§4.6 applies identically to trigger
//! scripts per §4.10).

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppResult, ControllerError};
use crate::model::{new_id, TriggerScript};

const CURRENT_VERSION: u32 = 1;
const MAX_LIBRARY_SIZE_HARD_CAP: usize = 10_000;

#[derive(Debug, Serialize, Deserialize)]
struct LibraryDocument {
    version: u32,
    scripts: Vec<TriggerScript>,
    last_modified: chrono::DateTime<Utc>,
}

pub struct TriggerScriptLibrary {
    path: PathBuf,
    max_size: usize,
    state: Mutex<Vec<TriggerScript>>,
}

impl TriggerScriptLibrary {
    pub async fn open(dir: &Path, max_size: usize) -> AppResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("trigger-scripts.json");
        let scripts = match tokio::fs::read(&path).await {
            Ok(bytes) => Self::parse(&bytes, max_size)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            max_size: max_size.min(MAX_LIBRARY_SIZE_HARD_CAP),
            state: Mutex::new(scripts),
        })
    }

    fn parse(bytes: &[u8], max_size: usize) -> AppResult<Vec<TriggerScript>> {
        let doc: LibraryDocument = serde_json::from_slice(bytes)
            .map_err(|e| ControllerError::Persistence(format!("invalid trigger library JSON: {e}")))?;
        if doc.version != CURRENT_VERSION {
            return Err(ControllerError::Persistence(format!(
                "unsupported trigger library version {}",
                doc.version
            )));
        }
        let mut scripts = doc.scripts;
        if scripts.len() > max_size {
            scripts.truncate(max_size);
        }
        Ok(scripts)
    }

    pub async fn list(&self) -> Vec<TriggerScript> {
        self.state.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> AppResult<TriggerScript> {
        self.state
            .lock()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("trigger script {id}")))
    }

    pub async fn add(&self, mut script: TriggerScript) -> AppResult<TriggerScript> {
        let mut scripts = self.state.lock().await;
        if scripts.len() >= self.max_size {
            return Err(ControllerError::Persistence(format!(
                "trigger script library full ({} scripts)",
                self.max_size
            )));
        }
        let now = Utc::now();
        script.id = new_id();
        script.created_at = now;
        script.updated_at = now;
        scripts.push(script.clone());
        Self::persist(&self.path, &scripts).await?;
        Ok(script)
    }

    pub async fn update(&self, mut script: TriggerScript) -> AppResult<TriggerScript> {
        let mut scripts = self.state.lock().await;
        let existing = scripts
            .iter_mut()
            .find(|s| s.id == script.id)
            .ok_or_else(|| ControllerError::NotFound(format!("trigger script {}", script.id)))?;
        script.created_at = existing.created_at;
        script.updated_at = Utc::now();
        *existing = script.clone();
        Self::persist(&self.path, &scripts).await?;
        Ok(script)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let mut scripts = self.state.lock().await;
        let before = scripts.len();
        scripts.retain(|s| s.id != id);
        if scripts.len() == before {
            return Err(ControllerError::NotFound(format!("trigger script {id}")));
        }
        Self::persist(&self.path, &scripts).await?;
        Ok(())
    }

    async fn persist(path: &Path, scripts: &[TriggerScript]) -> AppResult<()> {
        let doc = LibraryDocument {
            version: CURRENT_VERSION,
            scripts: scripts.to_vec(),
            last_modified: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComparisonOperator, RepeatPolicy, Trigger, TriggerAction, TriggerCondition};

    fn sample_script() -> TriggerScript {
        TriggerScript {
            id: String::new(),
            name: "overcurrent cutoff".into(),
            triggers: vec![Trigger {
                id: new_id(),
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let lib = TriggerScriptLibrary::open(dir.path(), 10).await.unwrap();
        let added = lib.add(sample_script()).await.unwrap();
        let fetched = lib.get(&added.id).await.unwrap();
        assert_eq!(fetched.triggers.len(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let lib = TriggerScriptLibrary::open(dir.path(), 10).await.unwrap();
        let added = lib.add(sample_script()).await.unwrap();
        let reopened = TriggerScriptLibrary::open(dir.path(), 10).await.unwrap();
        assert_eq!(reopened.list().await.len(), 1);
        assert_eq!(reopened.get(&added.id).await.unwrap().name, "overcurrent cutoff");
    }
}
