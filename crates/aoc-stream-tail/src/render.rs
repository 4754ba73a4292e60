use aoc_core::{EventPayload, StreamEvent};
use chrono::SecondsFormat;
use serde_json::Value;

pub fn render_line(event: &StreamEvent) -> String {
    let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let summary = match &event.payload {
        EventPayload::AgentStatus(status) => {
            let mut out = format!("agent={} status={}", status.agent_id, status.status);
            if let Some(message) = status.message.as_deref().filter(|m| !m.is_empty()) {
                out.push_str(&format!(" msg={message:?}"));
            }
            out
        }
        EventPayload::TaskUpdate(update) => {
            let mut out = format!("task={} status={}", update.task_id, update.status);
            if let Some(title) = update.title.as_deref() {
                out.push_str(&format!(" title={title:?}"));
            }
            if let Some(agent) = update.active_agent.as_deref() {
                out.push_str(&format!(" agent={agent}"));
            }
            out
        }
        EventPayload::Heartbeat(heartbeat) => {
            let mut out = format!(
                "agent={} last_heartbeat_ms={}",
                heartbeat.agent_id, heartbeat.last_heartbeat_ms
            );
            if let Some(lifecycle) = heartbeat.lifecycle.as_deref() {
                out.push_str(&format!(" lifecycle={lifecycle}"));
            }
            out
        }
        EventPayload::Other(fields) => Value::Object(fields.clone()).to_string(),
    };
    match event.id.as_deref() {
        Some(id) => format!("{timestamp} {:<13} [{id}] {summary}", event.event_type),
        None => format!("{timestamp} {:<13} {summary}", event.event_type),
    }
}

pub fn render_json(event: &StreamEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

pub fn render_snapshot(snapshot: &Value, json: bool) -> String {
    if json {
        serde_json::json!({ "type": "snapshot", "data": snapshot }).to_string()
    } else {
        format!("snapshot {snapshot}")
    }
}
