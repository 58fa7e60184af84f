use crate::error::{EventdError, Result};
use eventd_plugin_sdk::event::Event;

/// Thin adapter over the remote event log. Implementations are expected to return
/// events ordered ascending by id, and to map protocol/response/socket-level failures
/// to `EventdError::TransientSource` so the engine's retry policy can recognize them.
pub trait EventSource {
    /// Fetch events with `id >= since_id`, ascending by id, bounded to some
    /// source-defined batch size.
    fn fetch_events(&mut self, since_id: u64) -> Result<Vec<Event>>;

    /// The id of the single most-recently-committed event, or `None` if the log is
    /// empty. Used only during fresh-install bootstrap.
    fn most_recent_event_id(&mut self) -> Result<Option<u64>>;
}

/// An in-memory event source for tests: a fixed ascending log plus optional
/// scripted failures, so the engine's retry policy and backlog logic can be
/// exercised deterministically.
#[derive(Debug, Default)]
pub struct FakeEventSource {
    log: Vec<Event>,
    batch_size: usize,
    /// Number of `fetch_events` calls left that should fail before succeeding.
    fail_next_calls: usize,
}

impl FakeEventSource {
    pub fn new(log: Vec<Event>) -> Self {
        Self {
            log,
            batch_size: 100,
            fail_next_calls: 0,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn fail_next(mut self, calls: usize) -> Self {
        self.fail_next_calls = calls;
        self
    }

    pub fn push(&mut self, event: Event) {
        self.log.push(event);
        self.log.sort_by_key(|e| e.id);
    }
}

impl EventSource for FakeEventSource {
    fn fetch_events(&mut self, since_id: u64) -> Result<Vec<Event>> {
        if self.fail_next_calls > 0 {
            self.fail_next_calls -= 1;
            return Err(EventdError::TransientSource("simulated outage".to_owned()));
        }
        Ok(self
            .log
            .iter()
            .filter(|e| e.id >= since_id)
            .take(self.batch_size)
            .cloned()
            .collect())
    }

    fn most_recent_event_id(&mut self) -> Result<Option<u64>> {
        Ok(self.log.iter().map(|e| e.id).max())
    }
}
