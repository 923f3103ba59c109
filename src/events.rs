//! Parsing of transaction event logs into a lookup table.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("transaction produced no log entries")]
    EmptyLog,
}

/// One entry of a transaction's raw log, as returned by the node.
#[derive(Debug, Clone, Deserialize)]
pub struct TxLog {
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

/// Event type to attribute key to attribute value.
pub type EventTable = BTreeMap<String, BTreeMap<String, String>>;

/// Flatten the events of a transaction log into a two-level table.
///
/// Only the first log entry is consulted, which is all a single-message
/// transaction produces. When an event type or an attribute key occurs more
/// than once, the last occurrence wins.
pub fn parse_events(logs: &[TxLog]) -> Result<EventTable, EventError> {
    let first = logs.first().ok_or(EventError::EmptyLog)?;

    let mut table = EventTable::new();

    for event in &first.events {
        let mut attributes = BTreeMap::new();

        for attribute in &event.attributes {
            attributes.insert(attribute.key.clone(), attribute.value.clone());
        }

        table.insert(event.kind.clone(), attributes);
    }

    Ok(table)
}
