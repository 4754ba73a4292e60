//! Resilient client for the dashboard's live status stream.
//!
//! The pieces layer bottom-up:
//!
//! * [`policy`]: pure backoff and staleness rules over [`ReconnectionState`].
//! * [`dispatcher`]: topic based fan-out of parsed events and lifecycle
//!   notifications.
//! * [`manager`]: the sans-IO connection state machine.
//! * [`runtime`]: a tokio loop that drives the manager, with SSE ([`sse`]) and
//!   WebSocket ([`ws`]) connectors.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod policy;
pub mod runtime;
pub mod sse;
pub mod ws;

pub use aoc_core::{parse_stream_event, EventPayload, StreamEvent};
pub use config::{millis_u64, ReconnectionConfig};
pub use dispatcher::{
    DisconnectNotice, DisconnectReason, DispatchReport, EventDispatcher, SubscriptionId, Topic,
    WILDCARD_TOPIC,
};
pub use error::{StreamError, StreamResult};
pub use manager::{
    ConnectionId, ConnectionState, FullRefreshSignal, OpenRequest, RawMessage, Scheduler,
    StreamConnectionManager, TimerId, Transport,
};
pub use policy::{
    calculate_backoff, create_reconnection_state, reset_reconnection_state, should_full_refresh,
    update_reconnection_state, ReconnectionEvent, ReconnectionState,
};
pub use runtime::{Connector, MessageStream, StreamClient, StreamHandle};
pub use sse::SseConnector;
pub use ws::WsConnector;
