use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use eventd_plugin_sdk::event::Event;
use crate::plugin::{Plugin, PluginLoader};

/// A directory of plugins. Iteration is in sorted-filename order, which is
/// load-bearing: it determines callback invocation order across plugins and must be
/// deterministic, so plugins are kept in a `BTreeMap` rather than a `HashMap`.
pub struct PluginCollection {
    directory: PathBuf,
    plugins: BTreeMap<String, Plugin>,
    extension: &'static str,
}

/// Per-plugin durable state: `(lastEventId, backlog)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PluginState {
    pub last_event_id: Option<u64>,
    pub backlog: BTreeMap<u64, SystemTime>,
}

impl PluginCollection {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            plugins: BTreeMap::new(),
            extension: "wasm",
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.values()
    }

    /// Scans the directory: a file qualifies iff its basename ends with the plugin
    /// extension and doesn't begin with `.`. Existing plugin instances are kept (so
    /// their cursor survives); plugins whose files disappeared are dropped. Every
    /// kept-or-new plugin is then asked to `load()`.
    pub fn load(&mut self, loader: &mut dyn PluginLoader) -> std::io::Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if basename.starts_with('.') {
                continue;
            }
            if !basename
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", self.extension))
            {
                continue;
            }
            if !(path.is_file() || path.is_symlink()) {
                continue;
            }
            let name = basename
                .strip_suffix(&format!(".{}", self.extension))
                .unwrap_or(basename)
                .to_owned();
            seen.insert(name.clone());
            self.plugins
                .entry(name.clone())
                .or_insert_with(|| Plugin::new(name, path.clone()));
        }
        self.plugins.retain(|name, _| seen.contains(name));

        for plugin in self.plugins.values_mut() {
            let mtime = fs::metadata(plugin.path())
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            plugin.load(mtime, loader);
        }
        Ok(())
    }

    /// Dispatches one event to every active plugin, in sorted-basename order.
    pub fn process(&mut self, event: &Event, use_session_uuid: bool, now: SystemTime) {
        for (name, plugin) in &mut self.plugins {
            if plugin.active() {
                plugin.process(event, use_session_uuid, now);
            } else {
                log::debug!(target: name, "skipping inactive plugin {name}");
            }
        }
    }

    pub fn next_unprocessed_event_id(&mut self, now: SystemTime) -> Option<u64> {
        self.plugins
            .values_mut()
            .filter(|p| p.active())
            .filter_map(|p| p.next_unprocessed_id(now))
            .min()
    }

    pub fn get_state(&self) -> BTreeMap<String, PluginState> {
        self.plugins
            .iter()
            .map(|(name, plugin)| {
                let (last_event_id, backlog) = plugin.snapshot_state();
                (name.clone(), PluginState { last_event_id, backlog })
            })
            .collect()
    }

    /// Restores per-plugin state. Also accepts a bare integer, broadcasting it as
    /// `lastEventId` to every plugin — the legacy form.
    pub fn set_state(&mut self, state: CollectionStateForm) {
        match state {
            CollectionStateForm::Legacy(last_event_id) => {
                for plugin in self.plugins.values_mut() {
                    plugin.apply_state(Some(last_event_id), BTreeMap::new());
                }
            }
            CollectionStateForm::Structured(states) => {
                for (name, plugin) in &mut self.plugins {
                    if let Some(state) = states.get(name) {
                        plugin.apply_state(state.last_event_id, state.backlog.clone());
                    }
                }
            }
        }
    }
}

/// The durable per-collection state shape: either a single legacy integer
/// (pre-structured-format installs) or the structured per-plugin map. Readers must
/// accept both; writers always emit `Structured`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CollectionStateForm {
    Legacy(u64),
    Structured(BTreeMap<String, PluginState>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::LoadOutcome;

    struct EmptyLoader;
    impl PluginLoader for EmptyLoader {
        fn load(&mut self, _path: &Path, _plugin_name: &str) -> LoadOutcome {
            LoadOutcome::Callbacks(Vec::new())
        }
    }

    #[test]
    fn load_skips_dotfiles_and_wrong_extension() {
        let dir = std::env::temp_dir().join(format!(
            "eventd-core-test-{}-{}",
            std::process::id(),
            "load_skips"
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("real.wasm"), b"").unwrap();
        fs::write(dir.join(".hidden.wasm"), b"").unwrap();
        fs::write(dir.join("notes.txt"), b"").unwrap();

        let mut collection = PluginCollection::new(&dir);
        collection.load(&mut EmptyLoader).unwrap();
        let names: Vec<_> = collection.plugins().map(|p| p.name().to_owned()).collect();
        assert_eq!(names, vec!["real".to_owned()]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn legacy_state_broadcasts_to_every_plugin() {
        let dir = std::env::temp_dir().join(format!(
            "eventd-core-test-{}-{}",
            std::process::id(),
            "legacy_state"
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.wasm"), b"").unwrap();
        fs::write(dir.join("b.wasm"), b"").unwrap();

        let mut collection = PluginCollection::new(&dir);
        collection.load(&mut EmptyLoader).unwrap();
        collection.set_state(CollectionStateForm::Legacy(100));
        for plugin in collection.plugins() {
            assert_eq!(plugin.last_event_id(), Some(100));
        }

        fs::remove_dir_all(&dir).unwrap();
    }
}
