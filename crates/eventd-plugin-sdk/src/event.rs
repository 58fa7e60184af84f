use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entry from the remote service's append-only event log.
///
/// `id` is monotonically increasing and unique but gap-tolerant: concurrent writers
/// on the source side may allocate ids out of commit order, so a fetch can skip over
/// an id that only becomes visible later. The dispatch engine's backlog bookkeeping
/// exists precisely to absorb that; plugins only ever see events in the order the
/// engine decides to dispatch them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub event_type: String,
    pub attribute_name: Option<String>,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub entity: Value,
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub project: Value,
    #[serde(default)]
    pub session_uuid: Option<String>,
}

impl Event {
    pub fn new(id: u64, event_type: impl Into<String>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            attribute_name: None,
            meta: Value::Null,
            entity: Value::Null,
            user: Value::Null,
            project: Value::Null,
            session_uuid: None,
        }
    }

    pub fn with_attribute_name(mut self, attribute_name: impl Into<String>) -> Self {
        self.attribute_name = Some(attribute_name.into());
        self
    }
}
