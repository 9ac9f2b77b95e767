//! SequenceLibrary (§4.6): durable CRUD over `SequenceDefinition`s with atomic
//! persistence. Grounded on the teacher's `metadata.rs` (plain serde struct with
//! builder-ish helpers) and `data/storage.rs` (create-parent-dir-then-write
//! idiom); the atomic write itself (temp file + rename) is the standard crash-safe
//! pattern neither teacher file used verbatim but both gesture at via
//! `with_context` error wrapping, reproduced here with `thiserror`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppResult, ControllerError};
use crate::model::{new_id, SequenceDefinition};

const CURRENT_VERSION: u32 = 1;
const MAX_LIBRARY_SIZE_HARD_CAP: usize = 10_000;

#[derive(Debug, Serialize, Deserialize)]
struct LibraryDocument {
    version: u32,
    sequences: Vec<SequenceDefinition>,
    last_modified: chrono::DateTime<Utc>,
}

/// Durable, mutex-guarded collection of sequence definitions.
pub struct SequenceLibrary {
    path: PathBuf,
    max_size: usize,
    state: Mutex<Vec<SequenceDefinition>>,
}

impl SequenceLibrary {
    /// Loads (or initializes) the library file at `dir/sequences.json`.
    pub async fn open(dir: &Path, max_size: usize) -> AppResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("sequences.json");
        let sequences = match tokio::fs::read(&path).await {
            Ok(bytes) => Self::parse(&bytes, max_size)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            max_size: max_size.min(MAX_LIBRARY_SIZE_HARD_CAP),
            state: Mutex::new(sequences),
        })
    }

    fn parse(bytes: &[u8], max_size: usize) -> AppResult<Vec<SequenceDefinition>> {
        let doc: LibraryDocument = serde_json::from_slice(bytes)
            .map_err(|e| ControllerError::Persistence(format!("invalid sequence library JSON: {e}")))?;
        if doc.version != CURRENT_VERSION {
            return Err(ControllerError::Persistence(format!(
                "unsupported sequence library version {}",
                doc.version
            )));
        }
        let mut sequences = doc.sequences;
        if sequences.len() > max_size {
            tracing::warn!(
                count = sequences.len(),
                max_size,
                "sequence library exceeds max size, truncating on load"
            );
            sequences.truncate(max_size);
        }
        Ok(sequences)
    }

    pub async fn list(&self) -> Vec<SequenceDefinition> {
        self.state.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> AppResult<SequenceDefinition> {
        self.state
            .lock()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("sequence {id}")))
    }

    pub async fn add(&self, mut def: SequenceDefinition) -> AppResult<SequenceDefinition> {
        let mut sequences = self.state.lock().await;
        if sequences.len() >= self.max_size {
            return Err(ControllerError::Persistence(format!(
                "sequence library full ({} sequences)",
                self.max_size
            )));
        }
        let now = Utc::now();
        def.id = new_id();
        def.created_at = now;
        def.updated_at = now;
        sequences.push(def.clone());
        Self::persist(&self.path, &sequences).await?;
        Ok(def)
    }

    pub async fn update(&self, mut def: SequenceDefinition) -> AppResult<SequenceDefinition> {
        let mut sequences = self.state.lock().await;
        let existing = sequences
            .iter_mut()
            .find(|s| s.id == def.id)
            .ok_or_else(|| ControllerError::NotFound(format!("sequence {}", def.id)))?;
        def.created_at = existing.created_at;
        def.updated_at = Utc::now();
        *existing = def.clone();
        Self::persist(&self.path, &sequences).await?;
        Ok(def)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let mut sequences = self.state.lock().await;
        let before = sequences.len();
        sequences.retain(|s| s.id != id);
        if sequences.len() == before {
            return Err(ControllerError::NotFound(format!("sequence {id}")));
        }
        Self::persist(&self.path, &sequences).await?;
        Ok(())
    }

    /// Writes the whole document atomically: serialize, write to a temp file in
    /// the same directory, then rename over the real path.
    async fn persist(path: &Path, sequences: &[SequenceDefinition]) -> AppResult<()> {
        let doc = LibraryDocument {
            version: CURRENT_VERSION,
            sequences: sequences.to_vec(),
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
    use crate::model::{ParametricKind, ParametricWaveform, Waveform};

    fn sample_def() -> SequenceDefinition {
        SequenceDefinition {
            id: String::new(),
            name: "ramp up".into(),
            unit: "V".into(),
            waveform: Waveform::Ramp(ParametricWaveform {
                kind: ParametricKind::Ramp,
                min: 0.0,
                max: 10.0,
                points_per_cycle: 10,
                interval_ms: 100,
            }),
            pre_value: None,
            post_value: None,
            scale: None,
            offset: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let lib = SequenceLibrary::open(dir.path(), 10).await.unwrap();
        let added = lib.add(sample_def()).await.unwrap();
        assert!(!added.id.is_empty());
        assert_eq!(lib.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let lib = SequenceLibrary::open(dir.path(), 10).await.unwrap();
        let added = lib.add(sample_def()).await.unwrap();

        let reopened = SequenceLibrary::open(dir.path(), 10).await.unwrap();
        let fetched = reopened.get(&added.id).await.unwrap();
        assert_eq!(fetched.name, "ramp up");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let lib = SequenceLibrary::open(dir.path(), 10).await.unwrap();
        let err = lib.delete("nope").await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_library_full_rejects_add() {
        let dir = tempfile::tempdir().unwrap();
        let lib = SequenceLibrary::open(dir.path(), 1).await.unwrap();
        lib.add(sample_def()).await.unwrap();
        let err = lib.add(sample_def()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Persistence(_)));
    }
}
