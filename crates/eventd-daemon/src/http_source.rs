use std::time::Duration;

use eventd_core::error::{EventdError, Result};
use eventd_core::source::EventSource;
use eventd_core::Event;
use serde_json::{json, Value};
use ureq::Agent;

use crate::config::SourceConfig;

/// A read-only query back into the event source's entity store, used to resolve
/// `fetch_event_source_entity` calls made by plugins.
pub trait EntityLookup: Send + Sync {
    fn fetch_entity(&self, entity_type: &str, entity_id: i64, fields: &[String]) -> anyhow::Result<Value>;
}

fn make_agent() -> Agent {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    Agent::new_with_config(
        Agent::config_builder()
            .no_delay(true)
            .user_agent(format!("eventd/{VERSION}"))
            .max_response_header_size(256 * 1024)
            .timeout_global(Some(Duration::from_secs(30)))
            .timeout_recv_body(Some(Duration::from_secs(60)))
            .build(),
    )
}

/// Talks to the project-tracking service's JSON-RPC entity API, the wire protocol
/// the original daemon's `shotgun_api3` client speaks: every request authenticates
/// with a script name/key pair and names an entity type, filters, and a field list.
pub struct HttpEventSource {
    agent: Agent,
    endpoint: String,
    script_name: String,
    script_key: String,
}

impl HttpEventSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            agent: make_agent(),
            endpoint: format!("{}/api3/json", config.server.trim_end_matches('/')),
            script_name: config.name.clone(),
            script_key: config.key.clone(),
        }
    }

    fn auth(&self) -> Value {
        json!({ "script_name": self.script_name, "script_key": self.script_key })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({ "method_name": method, "params": [self.auth(), params] });
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(&body)
            .map_err(|e| EventdError::TransientSource(e.to_string()))?;
        response
            .into_body()
            .read_json::<Value>()
            .map_err(|e| EventdError::TransientSource(format!("malformed response: {e}")))
    }

    fn parse_events(payload: &Value) -> Result<Vec<Event>> {
        let results = payload
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| EventdError::TransientSource("response missing \"results\" array".to_owned()))?;
        results.iter().map(Self::parse_event).collect()
    }

    fn parse_event(row: &Value) -> Result<Event> {
        let id = row
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| EventdError::TransientSource("event row missing integer id".to_owned()))?;
        let event_type = row
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_owned();
        Ok(Event {
            id,
            event_type,
            attribute_name: row.get("attribute_name").and_then(Value::as_str).map(str::to_owned),
            meta: row.get("meta").cloned().unwrap_or(Value::Null),
            entity: row.get("entity").cloned().unwrap_or(Value::Null),
            user: row.get("user").cloned().unwrap_or(Value::Null),
            project: row.get("project").cloned().unwrap_or(Value::Null),
            session_uuid: row.get("session_uuid").and_then(Value::as_str).map(str::to_owned),
        })
    }
}

impl EventSource for HttpEventSource {
    fn fetch_events(&mut self, since_id: u64) -> Result<Vec<Event>> {
        let params = json!({
            "type": "EventLogEntry",
            "filters": { "logical_operator": "all", "conditions": [
                { "path": "id", "relation": "greater_than", "values": [since_id.saturating_sub(1)] }
            ]},
            "fields": ["id", "event_type", "attribute_name", "meta", "entity", "user", "project", "session_uuid"],
            "sorts": [{ "field_name": "id", "direction": "asc" }],
        });
        let payload = self.call("read", params)?;
        Self::parse_events(&payload)
    }

    fn most_recent_event_id(&mut self) -> Result<Option<u64>> {
        let params = json!({
            "type": "EventLogEntry",
            "filters": { "logical_operator": "all", "conditions": [] },
            "fields": ["id"],
            "sorts": [{ "field_name": "id", "direction": "desc" }],
            "paging": { "entities_per_page": 1, "current_page": 1 },
        });
        let payload = self.call("read", params)?;
        let results = payload.get("results").and_then(Value::as_array);
        Ok(results.and_then(|r| r.first()).and_then(|row| row.get("id")).and_then(Value::as_u64))
    }
}

impl EntityLookup for HttpEventSource {
    fn fetch_entity(&self, entity_type: &str, entity_id: i64, fields: &[String]) -> anyhow::Result<Value> {
        let params = json!({
            "type": entity_type,
            "filters": { "logical_operator": "all", "conditions": [
                { "path": "id", "relation": "is", "values": [entity_id] }
            ]},
            "fields": fields,
        });
        let payload = self.call("read", params)?;
        payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("entity {entity_type}:{entity_id} not found"))
    }
}
