use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Attributes admitted for an event type: either everything (null/wildcard) or a
/// named subset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attributes {
    Any,
    Named(HashSet<String>),
}

/// A declarative predicate constraining which events reach a callback. `*` as an
/// event-type key matches any event type. An empty or absent filter matches
/// everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchFilter(HashMap<String, Attributes>);

impl MatchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, event_type: impl Into<String>, attributes: Attributes) -> Self {
        self.0.insert(event_type.into(), attributes);
        self
    }

    pub fn any_event_type(attributes: Attributes) -> Self {
        Self::new().insert("*", attributes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn admits(&self, event: &Event) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let attributes = match self.0.get("*") {
            Some(attrs) => attrs,
            None => match self.0.get(&event.event_type) {
                Some(attrs) => attrs,
                None => return false,
            },
        };
        match attributes {
            Attributes::Any => true,
            Attributes::Named(names) => match &event.attribute_name {
                Some(name) if !name.is_empty() => names.contains(name),
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, attribute_name: Option<&str>) -> Event {
        let mut e = Event::new(1, event_type);
        e.attribute_name = attribute_name.map(str::to_owned);
        e
    }

    #[test]
    fn empty_filter_admits_everything() {
        assert!(MatchFilter::new().admits(&event("Shotgun_Task_Change", Some("sg_status_list"))));
    }

    #[test]
    fn s6_match_filter_scenario() {
        let filter = MatchFilter::new().insert(
            "Shotgun_Task_Change",
            Attributes::Named(["sg_status_list".to_owned()].into()),
        );
        assert!(filter.admits(&event("Shotgun_Task_Change", Some("sg_status_list"))));
        assert!(!filter.admits(&event("Shotgun_Task_Change", Some("sg_cut_in"))));
        assert!(!filter.admits(&event("Shotgun_Shot_Change", Some("sg_status_list"))));
    }
}
