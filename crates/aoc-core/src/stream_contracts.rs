//! Wire contracts for the live status stream.
//!
//! Every server-pushed message is a JSON envelope
//! `{ "type": ..., "timestamp": ..., "data": { ... } }`. The envelope is
//! decoded into a [`StreamEvent`] whose payload is typed for the event kinds
//! the dashboard knows about and kept verbatim for everything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{deserialize_id, deserialize_optional_id, WorkItemStatus};

pub const AGENT_STATUS_EVENT: &str = "agent_status";
pub const TASK_UPDATE_EVENT: &str = "task_update";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("envelope decode failed: {0}")]
    Decode(String),
    #[error("envelope is missing an event type")]
    MissingType,
    #[error("invalid timestamp '{value}': {reason}")]
    Timestamp { value: String, reason: String },
}

/// A parsed unit of server-pushed information.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "data")]
    pub payload: EventPayload,
    /// Resumption identifier supplied by the transport, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamEvent {
    pub fn agent_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AgentStatus(status) => Some(&status.agent_id),
            EventPayload::Heartbeat(heartbeat) => Some(&heartbeat.agent_id),
            EventPayload::TaskUpdate(update) => update.active_agent.as_deref(),
            EventPayload::Other(fields) => fields.get("agent_id").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    AgentStatus(AgentStatusPayload),
    TaskUpdate(TaskUpdatePayload),
    Heartbeat(HeartbeatPayload),
    /// Unknown kinds, or known kinds whose fields did not match, preserved as sent.
    Other(Map<String, Value>),
}

impl EventPayload {
    pub fn from_parts(event_type: &str, data: Map<String, Value>) -> Self {
        match event_type {
            AGENT_STATUS_EVENT => typed(data, EventPayload::AgentStatus),
            TASK_UPDATE_EVENT => typed(data, EventPayload::TaskUpdate),
            HEARTBEAT_EVENT => typed(data, EventPayload::Heartbeat),
            _ => EventPayload::Other(data),
        }
    }

    pub fn is_typed(&self) -> bool {
        !matches!(self, EventPayload::Other(_))
    }
}

fn typed<T, F>(data: Map<String, Value>, wrap: F) -> EventPayload
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> EventPayload,
{
    match serde_json::from_value::<T>(Value::Object(data.clone())) {
        Ok(payload) => wrap(payload),
        Err(_) => EventPayload::Other(data),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStatusPayload {
    pub agent_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Fields this client does not model, kept so the payload round-trips.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskUpdatePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    pub status: WorkItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agent: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub last_heartbeat_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    timestamp: String,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    id: Option<String>,
}

/// Decode one text frame into a [`StreamEvent`].
///
/// `transport_id` is the identifier the transport attached to the frame (the
/// SSE `id:` line); it takes precedence over an `id` carried in the envelope.
pub fn parse_stream_event(
    raw: &str,
    transport_id: Option<&str>,
) -> Result<StreamEvent, ContractError> {
    let envelope: RawEnvelope =
        serde_json::from_str(raw.trim()).map_err(|err| ContractError::Decode(err.to_string()))?;
    let event_type = envelope.event_type.trim();
    if event_type.is_empty() {
        return Err(ContractError::MissingType);
    }
    let timestamp = DateTime::parse_from_rfc3339(envelope.timestamp.trim())
        .map_err(|err| ContractError::Timestamp {
            value: envelope.timestamp.clone(),
            reason: err.to_string(),
        })?
        .with_timezone(&Utc);
    let id = transport_id
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or(envelope.id.filter(|value| !value.is_empty()));

    Ok(StreamEvent {
        event_type: event_type.to_string(),
        timestamp,
        payload: EventPayload::from_parts(event_type, envelope.data),
        id,
    })
}
