//! Reconnection policy: backoff, staleness, and the reconnection-state
//! transitions.
//!
//! Everything here is pure. Callers pass the current time in, nothing reads a
//! clock or touches a timer, and every function returns a new value instead of
//! mutating its input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ReconnectionConfig;
use crate::error::StreamResult;

/// Connection history for one stream subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionState {
    /// Most recent event id received; sent back to the server to resume.
    pub last_event_id: Option<String>,
    /// Reconnect attempts since the last successful open.
    pub attempt_count: u32,
    /// First failure of the current outage.
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ReconnectionState {
    pub fn is_disconnected(&self) -> bool {
        self.disconnected_at.is_some()
    }

    /// Time spent in the current outage, zero while connected.
    pub fn outage_duration(&self, now: DateTime<Utc>) -> Duration {
        self.disconnected_at
            .and_then(|since| now.signed_duration_since(since).to_std().ok())
            .unwrap_or_default()
    }
}

/// Inputs to [`update_reconnection_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectionEvent {
    Attempt,
    Disconnect,
    Event {
        #[serde(default)]
        event_id: Option<String>,
    },
    /// Kinds this version does not know about. Applying one changes nothing.
    #[serde(other)]
    Unknown,
}

/// `initial_delay * backoff_multiplier^attempt_count`, capped at `max_delay`.
///
/// No jitter is applied; the same inputs always give the same delay.
pub fn calculate_backoff(attempt_count: u32, config: &ReconnectionConfig) -> StreamResult<Duration> {
    config.validate_backoff()?;

    let factor = config.backoff_multiplier.powf(f64::from(attempt_count));
    let scaled_nanos = config.initial_delay.as_nanos() as f64 * factor;
    let max_nanos = config.max_delay.as_nanos() as f64;
    if !scaled_nanos.is_finite() || scaled_nanos >= max_nanos {
        return Ok(config.max_delay);
    }
    Ok(Duration::from_nanos(scaled_nanos as u64))
}

/// Whether the current outage has lasted long enough that resuming from
/// `last_event_id` can no longer be trusted. The threshold is inclusive.
pub fn should_full_refresh(
    state: &ReconnectionState,
    config: &ReconnectionConfig,
    now: DateTime<Utc>,
) -> StreamResult<bool> {
    config.validate_refresh_threshold()?;

    if !state.is_disconnected() {
        return Ok(false);
    }
    Ok(state.outage_duration(now) >= config.full_refresh_threshold)
}

pub fn create_reconnection_state(last_event_id: Option<String>) -> ReconnectionState {
    ReconnectionState {
        last_event_id,
        ..ReconnectionState::default()
    }
}

pub fn update_reconnection_state(
    state: ReconnectionState,
    event: &ReconnectionEvent,
    now: DateTime<Utc>,
) -> ReconnectionState {
    match event {
        ReconnectionEvent::Attempt => ReconnectionState {
            attempt_count: state.attempt_count.saturating_add(1),
            last_attempt_at: Some(now),
            ..state
        },
        ReconnectionEvent::Disconnect => ReconnectionState {
            disconnected_at: state.disconnected_at.or(Some(now)),
            ..state
        },
        ReconnectionEvent::Event {
            event_id: Some(event_id),
        } => ReconnectionState {
            last_event_id: Some(event_id.clone()),
            ..state
        },
        ReconnectionEvent::Event { event_id: None } | ReconnectionEvent::Unknown => state,
    }
}

/// Applied on every successful open. Keeps the resume position.
pub fn reset_reconnection_state(state: ReconnectionState) -> ReconnectionState {
    create_reconnection_state(state.last_event_id)
}
