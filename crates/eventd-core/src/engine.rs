use std::time::{Duration, SystemTime};

use crate::collection::{CollectionStateForm, PluginCollection};
use crate::error::{EventdError, Result};
use crate::plugin::PluginLoader;
use crate::source::EventSource;
use crate::state_store::{DurableState, StateStore};

/// Abstracts wall-clock access so the retry policy and the inter-poll sleep can be
/// driven deterministically in tests instead of burning real time.
pub trait Clock {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_conn_retries: u32,
    pub conn_retry_sleep: Duration,
    pub fetch_interval: Duration,
    pub use_session_uuid: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_conn_retries: 3,
            conn_retry_sleep: Duration::from_secs(60),
            fetch_interval: Duration::from_secs(1),
            use_session_uuid: false,
        }
    }
}

/// Drives the single-threaded main loop: reloads, fetches, dispatches, checkpoints.
/// Daemonization (pid file, double fork, signal handlers) lives outside this type,
/// in the binary crate — the engine only needs to be told, once per iteration,
/// whether it should keep going.
pub struct Engine {
    collections: Vec<PluginCollection>,
    source: Box<dyn EventSource>,
    state_store: StateStore,
    config: EngineConfig,
    clock: Box<dyn Clock>,
}

impl Engine {
    pub fn new(
        collections: Vec<PluginCollection>,
        source: Box<dyn EventSource>,
        state_store: StateStore,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(collections, source, state_store, config, Box::new(SystemClock))
    }

    pub fn with_clock(
        collections: Vec<PluginCollection>,
        source: Box<dyn EventSource>,
        state_store: StateStore,
        config: EngineConfig,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self { collections, source, state_store, config, clock }
    }

    pub fn collections(&self) -> &[PluginCollection] {
        &self.collections
    }

    /// Bootstrap sequence per the component design: load every collection once,
    /// restore durable state if present, and — only if nothing restored a cursor —
    /// seed every plugin with the single most-recent event id so a fresh install
    /// doesn't replay all of history.
    pub fn bootstrap(&mut self, loader: &mut dyn PluginLoader, should_continue: &dyn Fn() -> bool) -> Result<()> {
        for collection in &mut self.collections {
            collection.load(loader).map_err(|e| {
                EventdError::Config(format!(
                    "failed to scan plugin directory {}: {e}",
                    collection.directory().display()
                ))
            })?;
        }

        match self.state_store.load() {
            Ok(Some(durable)) => self.apply_durable_state(durable),
            Ok(None) => {}
            Err(e) => log::error!(target: "engine", "failed to read durable state, starting fresh: {e}"),
        }

        let any_has_cursor = self
            .collections
            .iter()
            .flat_map(|c| c.plugins())
            .any(|p| p.last_event_id().is_some());
        if !any_has_cursor {
            if let Some(Some(id)) = self.fetch_most_recent_with_retry(should_continue) {
                for collection in &mut self.collections {
                    collection.set_state(CollectionStateForm::Legacy(id));
                }
            }
        }

        self.persist_state();
        Ok(())
    }

    fn apply_durable_state(&mut self, durable: DurableState) {
        for collection in &mut self.collections {
            if let Some(form) = durable.0.get(collection.directory()) {
                collection.set_state(form.clone());
            }
        }
    }

    /// Runs the main loop until `should_continue` reports false. Any error that
    /// escapes a single iteration is treated as an uncaught loop-level failure: it is
    /// logged at CRITICAL (with email delivery, at the daemon layer) and the loop
    /// exits, leaving pid-file cleanup to the caller.
    pub fn run(&mut self, loader: &mut dyn PluginLoader, should_continue: &dyn Fn() -> bool) {
        while should_continue() {
            if let Err(e) = self.run_once(loader, should_continue) {
                crate::critical!(target: "engine", "uncaught engine error, shutting down: {e}");
                break;
            }
        }
    }

    /// A single main-loop iteration, steps 1-5 of the component design. Exposed
    /// separately so callers (and tests) can step the loop deterministically.
    pub fn run_once(&mut self, loader: &mut dyn PluginLoader, should_continue: &dyn Fn() -> bool) -> Result<()> {
        let now = self.clock.now();
        let global_next_id = self
            .collections
            .iter_mut()
            .filter_map(|c| c.next_unprocessed_event_id(now))
            .min();

        if let Some(since_id) = global_next_id {
            let Some(events) = self.fetch_with_retry(since_id, should_continue) else {
                return Ok(());
            };
            for event in events {
                let now = self.clock.now();
                for collection in &mut self.collections {
                    collection.process(&event, self.config.use_session_uuid, now);
                }
                self.persist_state();
            }
        }

        self.clock.sleep(self.config.fetch_interval);

        for collection in &mut self.collections {
            if let Err(e) = collection.load(loader) {
                log::error!(
                    target: "engine",
                    "failed to reload collection {}: {e}",
                    collection.directory().display()
                );
            }
        }
        Ok(())
    }

    fn persist_state(&mut self) {
        let mut durable = DurableState::default();
        for collection in &self.collections {
            durable
                .0
                .insert(collection.directory().to_path_buf(), CollectionStateForm::Structured(collection.get_state()));
        }
        if let Err(e) = self.state_store.save(&durable) {
            log::error!(target: "engine", "failed to persist state: {e}");
        }
    }

    /// Retry policy for the event source: on failure, increment an attempt counter;
    /// once it reaches `max_conn_retries`, log at ERROR and sleep `conn_retry_sleep`
    /// before resetting and continuing; otherwise log at WARNING and retry
    /// immediately. Retries never advance the cursor. Returns `None` only if
    /// `should_continue` goes false while we're waiting out a retry, so shutdown
    /// stays responsive even mid-outage.
    fn fetch_with_retry(
        &mut self,
        since_id: u64,
        should_continue: &dyn Fn() -> bool,
    ) -> Option<Vec<eventd_plugin_sdk::event::Event>> {
        let mut attempts: u32 = 0;
        loop {
            if !should_continue() {
                return None;
            }
            match self.source.fetch_events(since_id) {
                Ok(events) => return Some(events),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_conn_retries {
                        log::error!(
                            target: "engine",
                            "event source fetch failed {attempts} times in a row: {e}"
                        );
                        self.clock.sleep(self.config.conn_retry_sleep);
                        attempts = 0;
                    } else {
                        log::warn!(
                            target: "engine",
                            "event source fetch failed, retrying ({attempts}/{}): {e}",
                            self.config.max_conn_retries
                        );
                    }
                }
            }
        }
    }

    fn fetch_most_recent_with_retry(&mut self, should_continue: &dyn Fn() -> bool) -> Option<Option<u64>> {
        let mut attempts: u32 = 0;
        loop {
            if !should_continue() {
                return None;
            }
            match self.source.most_recent_event_id() {
                Ok(id) => return Some(id),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_conn_retries {
                        log::error!(
                            target: "engine",
                            "bootstrap event-source query failed {attempts} times in a row: {e}"
                        );
                        self.clock.sleep(self.config.conn_retry_sleep);
                        attempts = 0;
                    } else {
                        log::warn!(
                            target: "engine",
                            "bootstrap event-source query failed, retrying ({attempts}/{}): {e}",
                            self.config.max_conn_retries
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventd_plugin_sdk::event::Event;
    use crate::plugin::LoadOutcome;
    use crate::source::FakeEventSource;
    use std::cell::RefCell;
    use std::path::Path;

    struct EmptyLoader;
    impl PluginLoader for EmptyLoader {
        fn load(&mut self, _path: &Path, _plugin_name: &str) -> LoadOutcome {
            LoadOutcome::Callbacks(Vec::new())
        }
    }

    struct FakeClock {
        now: RefCell<SystemTime>,
        slept: RefCell<Vec<Duration>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self { now: RefCell::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)), slept: RefCell::new(Vec::new()) }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> SystemTime {
            *self.now.borrow()
        }

        fn sleep(&self, duration: Duration) {
            self.slept.borrow_mut().push(duration);
        }
    }

    fn make_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("eventd-core-engine-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn s1_fresh_install_seeds_every_plugin_with_most_recent_id() {
        let dir = make_dir("fresh_install");
        std::fs::write(dir.join("p.wasm"), b"").unwrap();

        let source = FakeEventSource::new(vec![Event::new(100, "Any")]);
        let state_path = dir.join("state.bin");
        let mut engine = Engine::with_clock(
            vec![PluginCollection::new(&dir)],
            Box::new(source),
            StateStore::new(&state_path),
            EngineConfig::default(),
            Box::new(FakeClock::new()),
        );

        engine.bootstrap(&mut EmptyLoader, &|| true).unwrap();
        let plugin = engine.collections()[0].plugins().next().unwrap();
        assert_eq!(plugin.last_event_id(), Some(100));
        assert!(state_path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn bootstrap_restores_structured_durable_state_without_querying_source() {
        let dir = make_dir("restore_state");
        std::fs::write(dir.join("p.wasm"), b"").unwrap();
        let state_path = dir.join("state.bin");

        // First run establishes a cursor and writes state.
        {
            let source = FakeEventSource::new(vec![Event::new(5, "Any")]);
            let mut engine = Engine::with_clock(
                vec![PluginCollection::new(&dir)],
                Box::new(source),
                StateStore::new(&state_path),
                EngineConfig::default(),
                Box::new(FakeClock::new()),
            );
            engine.bootstrap(&mut EmptyLoader, &|| true).unwrap();
        }

        // Second run must not touch the source at all: it should restore from disk.
        let source = FakeEventSource::new(vec![]).fail_next(usize::MAX / 2);
        let mut engine = Engine::with_clock(
            vec![PluginCollection::new(&dir)],
            Box::new(source),
            StateStore::new(&state_path),
            EngineConfig::default(),
            Box::new(FakeClock::new()),
        );
        engine.bootstrap(&mut EmptyLoader, &|| true).unwrap();
        let plugin = engine.collections()[0].plugins().next().unwrap();
        assert_eq!(plugin.last_event_id(), Some(5));

        std::fs::remove_dir_all(&dir).ok();
    }
}
