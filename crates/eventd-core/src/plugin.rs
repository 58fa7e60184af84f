use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::callback::Callback;
use eventd_plugin_sdk::event::Event;

/// How long a backlog-id is kept around awaiting late arrival before it is expired
/// and logged as dropped. Hard-coded, not configurable — see the open question on
/// this in the project's design notes.
const BACKLOG_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// The result of (re-)evaluating a plugin's source. Distinguishes source-evaluation
/// failure (ERROR) from a missing or misbehaving `registerCallbacks` entry point
/// (CRITICAL), matching the two distinct failure points in the load algorithm.
pub enum LoadOutcome {
    Callbacks(Vec<Callback>),
    EvalError(String),
    RegistrationError(String),
}

/// Evaluates a plugin's source fresh and returns its registered callbacks in
/// registration order. The concrete implementation (a WASM module load, in the
/// daemon binary) stands in for "import a freshly-evaluated module and call its
/// `registerCallbacks`".
pub trait PluginLoader {
    fn load(&mut self, path: &Path, plugin_name: &str) -> LoadOutcome;
}

/// The unit of hot-reload: a source file producing an ordered list of callbacks,
/// plus a per-plugin cursor and backlog of skipped ids awaiting late arrival.
pub struct Plugin {
    name: String,
    path: PathBuf,
    mtime: Option<SystemTime>,
    callbacks: Vec<Callback>,
    active: bool,
    last_event_id: Option<u64>,
    backlog: BTreeMap<u64, SystemTime>,
}

impl Plugin {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            mtime: None,
            callbacks: Vec::new(),
            active: true,
            last_event_id: None,
            backlog: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }

    pub fn backlog(&self) -> &BTreeMap<u64, SystemTime> {
        &self.backlog
    }

    pub fn callbacks(&self) -> &[Callback] {
        &self.callbacks
    }

    /// Restores a cursor from durable state. Used during bootstrap, never during
    /// normal operation.
    pub fn apply_state(&mut self, last_event_id: Option<u64>, backlog: BTreeMap<u64, SystemTime>) {
        self.last_event_id = last_event_id;
        self.backlog = backlog;
    }

    pub fn snapshot_state(&self) -> (Option<u64>, BTreeMap<u64, SystemTime>) {
        (self.last_event_id, self.backlog.clone())
    }

    /// `load()`: re-evaluates the plugin source if, and only if, its on-disk mtime
    /// has advanced past the last time it was loaded. A no-op otherwise (property 6).
    pub fn load(&mut self, mtime: SystemTime, loader: &mut dyn PluginLoader) -> bool {
        if self.mtime == Some(mtime) {
            return self.active;
        }
        self.callbacks.clear();
        self.active = true;
        self.mtime = Some(mtime);

        match loader.load(&self.path, &self.name) {
            LoadOutcome::Callbacks(callbacks) => {
                self.callbacks = callbacks;
            }
            LoadOutcome::EvalError(reason) => {
                log::error!(target: &self.name, "failed to load plugin {}: {reason}", self.name);
                self.active = false;
            }
            LoadOutcome::RegistrationError(reason) => {
                eventd_critical(&self.name, &format!("registerCallbacks failed for {}: {reason}", self.name));
                self.active = false;
            }
        }
        self.active
    }

    /// `process(event)`: the three-branch dispatch described in the component
    /// design — backlog catch-up, stale/duplicate drop, or normal advance.
    pub fn process(&mut self, event: &Event, use_session_uuid: bool, now: SystemTime) -> bool {
        if !self.active {
            return false;
        }
        if self.backlog.contains_key(&event.id) {
            if self.process_internal(event, use_session_uuid) {
                self.backlog.remove(&event.id);
            }
            // A backlog id is by definition below lastEventId; even on success it
            // must never move the cursor backwards (property 2 and 4).
        } else if self.last_event_id.is_some_and(|last| event.id <= last) {
            log::debug!(
                target: &self.name,
                "dropping duplicate/stale event {} (lastEventId={:?}) for plugin {}",
                event.id, self.last_event_id, self.name
            );
        } else if self.process_internal(event, use_session_uuid) {
            self.update_last_event_id(event.id, now);
        }
        self.active
    }

    /// Iterates callbacks in registration order; the first one that fails kills the
    /// whole plugin for this and every subsequent event, until a reload. Returns
    /// whether the plugin is still active, so the caller only advances the cursor
    /// (or drops a backlog id) on success — a failed event must be retried once the
    /// plugin reloads, not silently skipped.
    fn process_internal(&mut self, event: &Event, use_session_uuid: bool) -> bool {
        for callback in &mut self.callbacks {
            if !callback.active() || !callback.can_process(event) {
                continue;
            }
            if let Err(failure) = callback.process(event, use_session_uuid) {
                eventd_critical(
                    callback.logger_name(),
                    &format!(
                        "callback {} failed on event {}: {}{}",
                        failure.callback,
                        event.id,
                        failure.reason,
                        failure
                            .context
                            .as_ref()
                            .map(|c| format!(" (locals: {c})"))
                            .unwrap_or_default(),
                    ),
                );
                self.active = false;
                break;
            }
        }
        self.active
    }

    fn update_last_event_id(&mut self, new_id: u64, now: SystemTime) {
        if let Some(last) = self.last_event_id {
            if new_id > last + 1 {
                let expiry = now.checked_add(BACKLOG_EXPIRY).unwrap_or(now);
                for skipped in (last + 1)..new_id {
                    self.backlog.insert(skipped, expiry);
                }
            }
        }
        self.last_event_id = Some(new_id);
    }

    /// The id this plugin would like to see next; governs the global fetch
    /// lower-bound. Expires any backlog entries whose deadline has passed first.
    pub fn next_unprocessed_id(&mut self, now: SystemTime) -> Option<u64> {
        let expired: Vec<u64> = self
            .backlog
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.backlog.remove(&id);
            log::warn!(target: &self.name, "backlog entry {id} expired for plugin {}", self.name);
        }

        let backlog_min = self.backlog.keys().next().copied();
        let next_after_last = self.last_event_id.map(|last| last + 1);
        match (backlog_min, next_after_last) {
            (Some(b), Some(n)) => Some(b.min(n)),
            (Some(b), None) => Some(b),
            (None, Some(n)) => Some(n),
            (None, None) => None,
        }
    }
}

fn eventd_critical(target: &str, message: &str) {
    crate::critical!(target: target, "{message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackId, FnRuntime};
    use eventd_plugin_sdk::match_filter::MatchFilter;
    use serde_json::Value;

    struct StaticLoader(Vec<&'static str>);

    impl PluginLoader for StaticLoader {
        fn load(&mut self, _path: &Path, plugin_name: &str) -> LoadOutcome {
            let callbacks = self
                .0
                .iter()
                .map(|name| {
                    Callback::new(
                        CallbackId::Function { name: (*name).to_owned() },
                        plugin_name,
                        "demo",
                        "key",
                        MatchFilter::new(),
                        Value::Null,
                        Box::new(FnRuntime(|_e, args, _s| Ok(args.clone()))),
                    )
                })
                .collect();
            LoadOutcome::Callbacks(callbacks)
        }
    }

    struct FailingLoader;
    impl PluginLoader for FailingLoader {
        fn load(&mut self, _path: &Path, _plugin_name: &str) -> LoadOutcome {
            LoadOutcome::EvalError("syntax error".to_owned())
        }
    }

    fn epoch(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn reload_with_unchanged_mtime_is_a_noop() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        let mut loader = StaticLoader(vec!["a"]);
        assert!(plugin.load(epoch(1), &mut loader));
        assert_eq!(plugin.callbacks().len(), 1);

        let mut loader2 = StaticLoader(vec!["a", "b"]);
        plugin.load(epoch(1), &mut loader2);
        assert_eq!(plugin.callbacks().len(), 1, "same mtime must not reload");
    }

    #[test]
    fn reload_with_advanced_mtime_clears_callbacks_first() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        let mut loader = StaticLoader(vec!["a"]);
        plugin.load(epoch(1), &mut loader);

        let mut loader2 = StaticLoader(vec!["b", "c"]);
        plugin.load(epoch(2), &mut loader2);
        assert_eq!(plugin.callbacks().len(), 2);
    }

    #[test]
    fn eval_failure_marks_plugin_inactive() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        let mut loader = FailingLoader;
        assert!(!plugin.load(epoch(1), &mut loader));
        assert!(!plugin.active());
    }

    #[test]
    fn s2_in_order_dispatch_advances_cursor() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        plugin.apply_state(Some(10), BTreeMap::new());
        for id in 11..=13u64 {
            plugin.process(&Event::new(id, "Any"), false, epoch(id));
        }
        assert_eq!(plugin.last_event_id(), Some(13));
        assert!(plugin.backlog().is_empty());
    }

    #[test]
    fn s3_gap_and_catchup() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        plugin.apply_state(Some(10), BTreeMap::new());
        plugin.process(&Event::new(13, "Any"), false, epoch(1000));
        assert_eq!(plugin.last_event_id(), Some(13));
        assert_eq!(plugin.backlog().len(), 2);
        assert_eq!(plugin.next_unprocessed_id(epoch(1000)), Some(11));

        plugin.process(&Event::new(11, "Any"), false, epoch(1001));
        assert_eq!(plugin.last_event_id(), Some(13), "backlog hits don't move lastEventId backwards");
        assert!(!plugin.backlog().contains_key(&11));

        plugin.process(&Event::new(12, "Any"), false, epoch(1002));
        assert!(!plugin.backlog().contains_key(&12));

        plugin.process(&Event::new(14, "Any"), false, epoch(1003));
        assert_eq!(plugin.last_event_id(), Some(14));
    }

    #[test]
    fn s4_backlog_expiry() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        let mut backlog = BTreeMap::new();
        backlog.insert(95, epoch(999));
        plugin.apply_state(Some(100), backlog);
        assert_eq!(plugin.next_unprocessed_id(epoch(1000)), Some(101));
        assert!(plugin.backlog().is_empty());
    }

    #[test]
    fn s5_crashing_callback_kills_plugin_and_skips_later_callbacks() {
        let b_ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        let mut loader = CrashThenRunLoader { b_ran: b_ran.clone() };
        plugin.load(epoch(1), &mut loader);
        plugin.apply_state(Some(0), BTreeMap::new());

        plugin.process(&Event::new(1, "Any"), false, epoch(1));
        assert!(!plugin.active());
        assert!(!plugin.callbacks()[0].active(), "A must be marked inactive");
        assert!(!b_ran.load(std::sync::atomic::Ordering::SeqCst), "B must not have run");
        assert_eq!(plugin.last_event_id(), Some(0), "a failed event must not advance the cursor");
    }

    #[test]
    fn failing_callback_leaves_backlog_id_in_place_for_retry() {
        let mut plugin = Plugin::new("demo", "/plugins/demo.wasm");
        let mut loader = CrashThenRunLoader { b_ran: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)) };
        plugin.load(epoch(1), &mut loader);
        let mut backlog = BTreeMap::new();
        backlog.insert(1, epoch(9999));
        plugin.apply_state(Some(5), backlog);

        plugin.process(&Event::new(1, "Any"), false, epoch(1));
        assert!(!plugin.active());
        assert!(plugin.backlog().contains_key(&1), "a failed backlog event must stay in the backlog for retry");
        assert_eq!(plugin.last_event_id(), Some(5));
    }

    struct CrashThenRunLoader {
        b_ran: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }
    impl PluginLoader for CrashThenRunLoader {
        fn load(&mut self, _path: &Path, plugin_name: &str) -> LoadOutcome {
            let a = Callback::new(
                CallbackId::Function { name: "A".to_owned() },
                plugin_name,
                "demo",
                "key",
                MatchFilter::new(),
                Value::Null,
                Box::new(FnRuntime(|_e, _a, _s| Err("boom".to_owned()))),
            );
            let b_ran = self.b_ran.clone();
            let b = Callback::new(
                CallbackId::Function { name: "B".to_owned() },
                plugin_name,
                "demo",
                "key",
                MatchFilter::new(),
                Value::Null,
                Box::new(FnRuntime(move |_e, args, _s| {
                    b_ran.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(args.clone())
                })),
            );
            LoadOutcome::Callbacks(vec![a, b])
        }
    }
}
