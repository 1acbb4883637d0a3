use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::matching::CompatibilityMatrix;

use super::state::EventState;

/// Everything persisted for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub state: EventState,
    pub matrix: CompatibilityMatrix,
}

/// Durable storage with all-or-nothing writes: after `commit` returns `Err`, a
/// later `load` sees the previous document.
pub trait EventStore: Send + Sync {
    fn load(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError>;
    fn commit(&self, state: &EventState) -> Result<(), StoreError>;
    fn save_matrix(&self, event_id: &str, matrix: &CompatibilityMatrix) -> Result<(), StoreError>;
    fn event_ids(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<HashMap<String, StoredEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn events(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredEvent>>, StoreError> {
        self.events
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl EventStore for MemoryStore {
    fn load(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.events()?.get(event_id).cloned())
    }

    fn commit(&self, state: &EventState) -> Result<(), StoreError> {
        let mut events = self.events()?;
        match events.get_mut(&state.event_id) {
            Some(stored) => stored.state = state.clone(),
            None => {
                events.insert(
                    state.event_id.clone(),
                    StoredEvent { state: state.clone(), matrix: CompatibilityMatrix::new() },
                );
            }
        }
        Ok(())
    }

    fn save_matrix(&self, event_id: &str, matrix: &CompatibilityMatrix) -> Result<(), StoreError> {
        let mut events = self.events()?;
        let stored = events
            .get_mut(event_id)
            .ok_or_else(|| StoreError::Unavailable(format!("event {event_id} has no stored state")))?;
        stored.matrix = matrix.clone();
        Ok(())
    }

    fn event_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.events()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One directory, two JSON documents per event: `<id>.state.json` and
/// `<id>.matrix.json`. Writes go to a temp file that is renamed over the old one.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStore { dir })
    }

    fn state_path(&self, event_id: &str) -> PathBuf {
        self.dir.join(format!("{event_id}.state.json"))
    }

    fn matrix_path(&self, event_id: &str) -> PathBuf {
        self.dir.join(format!("{event_id}.matrix.json"))
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl EventStore for FileStore {
    fn load(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        let Some(state) = read_json::<EventState>(&self.state_path(event_id))? else {
            return Ok(None);
        };
        let matrix = read_json(&self.matrix_path(event_id))?.unwrap_or_default();
        Ok(Some(StoredEvent { state, matrix }))
    }

    fn commit(&self, state: &EventState) -> Result<(), StoreError> {
        write_atomic(&self.state_path(&state.event_id), state)
    }

    fn save_matrix(&self, event_id: &str, matrix: &CompatibilityMatrix) -> Result<(), StoreError> {
        write_atomic(&self.matrix_path(event_id), matrix)
    }

    fn event_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".state.json")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::event::state::EventSettings;
    use crate::matching::{Participant, ParticipantId};

    fn sample_state(id: &str) -> EventState {
        let mut state = EventState::new(id, EventSettings::from_config(&EngineConfig::default()));
        state
            .participants
            .insert(ParticipantId::from("ada"), Participant::new("ada", "Ada"));
        state
    }

    #[test]
    fn test_memory_store_keeps_matrix_across_commits() {
        let store = MemoryStore::new();
        assert!(store.load("night").unwrap().is_none());
        let mut state = sample_state("night");
        store.commit(&state).unwrap();

        let mut matrix = CompatibilityMatrix::new();
        matrix.insert(&"ada".into(), &"bob".into(), 71.0);
        store.save_matrix("night", &matrix).unwrap();

        state.version = 3;
        store.commit(&state).unwrap();
        let loaded = store.load("night").unwrap().unwrap();
        assert_eq!(loaded.state.version, 3);
        assert_eq!(loaded.matrix, matrix);
        assert!(store.save_matrix("other", &matrix).is_err());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let state = sample_state("spring-mixer");
        store.commit(&state).unwrap();

        let loaded = store.load("spring-mixer").unwrap().unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.matrix.len(), 0);
        assert_eq!(store.event_ids().unwrap(), vec!["spring-mixer".to_string()]);
        // no temp file left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_file_store_reopens_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.commit(&sample_state("a")).unwrap();
        }
        let reopened = FileStore::open(dir.path()).unwrap();
        assert!(reopened.load("a").unwrap().is_some());
        assert!(reopened.load("b").unwrap().is_none());
    }
}
