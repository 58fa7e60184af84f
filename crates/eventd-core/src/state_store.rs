use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collection::CollectionStateForm;
use crate::error::{EventdError, Result};

/// Durable mapping from collection directory to that collection's per-plugin state.
/// The whole map is re-serialized and written atomically on every flush, matching
/// the write discipline in the component design: after each event is fully
/// dispatched to all plugins.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DurableState(pub BTreeMap<PathBuf, CollectionStateForm>);

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the durable state file. A missing file is not an error — the caller
    /// takes this as the signal to run the fresh-install bootstrap path. A file that
    /// exists but fails to decode is a `StateIoError`, which the engine logs and
    /// likewise treats as fresh-install.
    pub fn load(&self) -> Result<Option<DurableState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EventdError::StateIo(e.to_string())),
        };
        match bincode::deserialize::<DurableState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => Err(EventdError::StateIo(format!("corrupt state file: {e}"))),
        }
    }

    /// Writes the whole map atomically: encode to a temp file in the same
    /// directory, then rename over the destination. A write failure is logged by the
    /// caller and does not abort the loop; the next successful write covers the
    /// missed id.
    pub fn save(&self, state: &DurableState) -> Result<()> {
        let bytes = bincode::serialize(state)
            .map_err(|e| EventdError::StateIo(format!("failed to encode state: {e}")))?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp-{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("state"),
            std::process::id()
        ));
        fs::write(&tmp_path, &bytes).map_err(|e| EventdError::StateIo(e.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| EventdError::StateIo(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::PluginState;

    #[test]
    fn missing_file_reads_as_none() {
        let path = std::env::temp_dir().join(format!("eventd-core-missing-{}", std::process::id()));
        let _ = fs::remove_file(&path);
        let store = StateStore::new(&path);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn round_trip_preserves_plugin_state() {
        let path = std::env::temp_dir().join(format!("eventd-core-roundtrip-{}", std::process::id()));
        let _ = fs::remove_file(&path);
        let store = StateStore::new(&path);

        let mut plugins = BTreeMap::new();
        plugins.insert(
            "demo".to_owned(),
            PluginState { last_event_id: Some(42), backlog: BTreeMap::new() },
        );
        let mut state = DurableState::default();
        state.0.insert(
            PathBuf::from("/plugins/collection_a"),
            CollectionStateForm::Structured(plugins),
        );

        store.save(&state).unwrap();
        let restored = store.load().unwrap().expect("state should exist");
        match &restored.0[&PathBuf::from("/plugins/collection_a")] {
            CollectionStateForm::Structured(plugins) => {
                assert_eq!(plugins["demo"].last_event_id, Some(42));
            }
            CollectionStateForm::Legacy(_) => panic!("expected structured form"),
        }

        fs::remove_file(&path).ok();
    }
}
