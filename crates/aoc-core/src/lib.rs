use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

pub mod stream_contracts;

pub use stream_contracts::{
    parse_stream_event, AgentStatusPayload, ContractError, EventPayload, HeartbeatPayload,
    StreamEvent, TaskUpdatePayload,
};

/// Work item status carried by `task_update` events.
///
/// Producers disagree on spelling, so the common ones are folded together and
/// anything else is kept as sent in [`WorkItemStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkItemStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Done,
    Cancelled,
    Other(String),
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Other(raw) => raw,
        }
    }

    /// A finished item will not produce further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase().replace('_', "-");
        Ok(match normalized.as_str() {
            "pending" => Self::Pending,
            "in-progress" | "inprogress" => Self::InProgress,
            "blocked" => Self::Blocked,
            "done" => Self::Done,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Other(input.to_string()),
        })
    }
}

impl Serialize for WorkItemStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WorkItemStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|never: Infallible| match never {})
    }
}

/// Ids arrive as either strings or numbers depending on the producer.
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

pub(crate) fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
