//! Connection lifecycle for one stream subscription.
//!
//! [`StreamConnectionManager`] performs no I/O itself. It asks a [`Transport`]
//! to open and close connections and a [`Scheduler`] to arm and cancel the
//! reconnect timer, and it is told about outcomes through the `handle_*`
//! methods. Each connection attempt and each timer carries an id; reports that
//! carry a stale id are ignored, so nothing from a discarded connection or a
//! cancelled timer can act on the manager afterwards.

use aoc_core::parse_stream_event;
use chrono::{DateTime, Utc};
use std::fmt;
use std::mem;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{millis_u64, ReconnectionConfig};
use crate::dispatcher::{DisconnectNotice, DisconnectReason, DispatchReport, EventDispatcher};
use crate::error::{StreamError, StreamResult};
use crate::policy::{
    calculate_backoff, create_reconnection_state, reset_reconnection_state, should_full_refresh,
    update_reconnection_state, ReconnectionEvent, ReconnectionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    ReconnectPending,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectPending => "reconnect_pending",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

#[cfg(test)]
impl ConnectionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub connection_id: ConnectionId,
    pub url: String,
    /// Position to resume from, when the server supports it.
    pub last_event_id: Option<String>,
}

/// One text frame as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: Option<String>,
    pub data: String,
}

impl RawMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            data: data.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Opens and closes the underlying connection. Outcomes are reported back
/// through [`StreamConnectionManager::handle_open`],
/// [`StreamConnectionManager::handle_message`] and
/// [`StreamConnectionManager::handle_failure`].
pub trait Transport {
    fn open(&mut self, request: OpenRequest);
    fn close(&mut self, connection_id: ConnectionId);
}

/// Arms and cancels the reconnect timer. A fired timer is reported through
/// [`StreamConnectionManager::handle_timer`].
pub trait Scheduler {
    fn schedule(&mut self, timer: TimerId, delay: Duration);
    fn cancel(&mut self, timer: TimerId);
}

/// Raised when an outage outlived the full-refresh threshold and the owner
/// must re-fetch a complete snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullRefreshSignal {
    pub last_event_id: Option<String>,
    pub outage: Duration,
    pub attempt_count: u32,
}

pub type FullRefreshCallback = Box<dyn FnMut(&FullRefreshSignal) + Send>;

#[derive(Debug, Clone, Copy)]
struct PendingReconnect {
    timer: TimerId,
    delay: Duration,
}

pub struct StreamConnectionManager<T, S> {
    url: String,
    config: ReconnectionConfig,
    transport: T,
    scheduler: S,
    dispatcher: EventDispatcher,
    refresh_listeners: Vec<FullRefreshCallback>,
    state: ConnectionState,
    reconnection: ReconnectionState,
    active: Option<ConnectionId>,
    pending: Option<PendingReconnect>,
    next_connection: u64,
    next_timer: u64,
    stopping: bool,
    refresh_signalled: bool,
    config_error_reported: bool,
}

impl<T: Transport, S: Scheduler> StreamConnectionManager<T, S> {
    pub fn new(
        url: impl Into<String>,
        config: ReconnectionConfig,
        transport: T,
        scheduler: S,
    ) -> Self {
        Self {
            url: url.into(),
            config,
            transport,
            scheduler,
            dispatcher: EventDispatcher::new(),
            refresh_listeners: Vec::new(),
            state: ConnectionState::Idle,
            reconnection: create_reconnection_state(None),
            active: None,
            pending: None,
            next_connection: 0,
            next_timer: 0,
            stopping: false,
            refresh_signalled: false,
            config_error_reported: false,
        }
    }

    /// Seed the resume position, e.g. with an id persisted before a restart.
    pub fn with_last_event_id(mut self, last_event_id: Option<String>) -> Self {
        self.reconnection = create_reconnection_state(last_event_id);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnection(&self) -> &ReconnectionState {
        &self.reconnection
    }

    /// Delay of the reconnect timer currently armed, if any.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending.map(|pending| pending.delay)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn on_full_refresh<F>(&mut self, callback: F)
    where
        F: FnMut(&FullRefreshSignal) + Send + 'static,
    {
        self.refresh_listeners.push(Box::new(callback));
    }

    /// Start streaming. A no-op while a connection is live or being opened.
    ///
    /// From `ReconnectPending` the armed timer is cancelled and the attempt
    /// happens now. An invalid configuration is reported once on the error
    /// channel, leaves the manager `Closed`, and is returned.
    pub fn connect(&mut self, now: DateTime<Utc>) -> StreamResult<bool> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(event = "stream_connect_ignored", state = %self.state, url = %self.url);
            return Ok(false);
        }
        if let Err(err) = self.config.validate() {
            self.fail_config(&err);
            return Err(err);
        }

        self.stopping = false;
        if let Some(pending) = self.pending.take() {
            self.scheduler.cancel(pending.timer);
        }
        if self.reconnection.is_disconnected() {
            self.apply(ReconnectionEvent::Attempt, now);
        }
        self.open_transport();
        Ok(true)
    }

    /// Stop streaming. Cancels the reconnect timer and closes the live
    /// connection before returning; nothing reconnects afterwards until
    /// [`connect`](Self::connect) is called again.
    pub fn disconnect(&mut self, now: DateTime<Utc>) {
        self.stopping = true;
        if let Some(pending) = self.pending.take() {
            self.scheduler.cancel(pending.timer);
            debug!(event = "stream_reconnect_cancelled", timer = %pending.timer);
        }
        if let Some(connection_id) = self.active.take() {
            self.transport.close(connection_id);
        }
        if self.state == ConnectionState::Closed {
            return;
        }

        let was_connected = self.state == ConnectionState::Connected;
        self.set_state(ConnectionState::Closed);
        info!(event = "stream_closed", url = %self.url);
        if was_connected {
            self.apply(ReconnectionEvent::Disconnect, now);
            self.dispatcher.notify_disconnect(&DisconnectNotice {
                reason: DisconnectReason::Requested,
                error: None,
            });
        }
    }

    /// Final teardown: disconnect and drop every listener.
    pub fn shutdown(&mut self, now: DateTime<Utc>) {
        self.disconnect(now);
        self.dispatcher.unsubscribe_all();
        self.refresh_listeners.clear();
    }

    pub fn handle_open(&mut self, connection_id: ConnectionId, now: DateTime<Utc>) {
        if !self.is_current(connection_id) || self.state != ConnectionState::Connecting {
            debug!(event = "stream_stale_open", connection = %connection_id);
            return;
        }

        let outage = self.reconnection.outage_duration(now);
        let attempts = self.reconnection.attempt_count;
        self.maybe_signal_full_refresh(now);
        self.reconnection = reset_reconnection_state(mem::take(&mut self.reconnection));
        self.refresh_signalled = false;
        self.set_state(ConnectionState::Connected);
        info!(
            event = "stream_connected",
            url = %self.url,
            connection = %connection_id,
            attempts,
            outage_ms = millis_u64(outage)
        );
        self.dispatcher.notify_connect();
    }

    /// Parse and fan out one message. Malformed messages are dropped and
    /// return `None`; the stream carries on.
    pub fn handle_message(
        &mut self,
        connection_id: ConnectionId,
        message: RawMessage,
        now: DateTime<Utc>,
    ) -> Option<DispatchReport> {
        if !self.is_current(connection_id) || self.state != ConnectionState::Connected {
            debug!(event = "stream_stale_message", connection = %connection_id);
            return None;
        }

        let parsed = match parse_stream_event(&message.data, message.id.as_deref()) {
            Ok(parsed) => parsed,
            Err(err) => {
                let err = StreamError::from(err);
                warn!(
                    event = "stream_message_dropped",
                    connection = %connection_id,
                    error = %err,
                    bytes = message.data.len()
                );
                return None;
            }
        };

        self.apply(
            ReconnectionEvent::Event {
                event_id: parsed.id.clone(),
            },
            now,
        );
        let report = self.dispatcher.dispatch(&parsed);
        for failure in &report.failures {
            warn!(
                event = "stream_subscriber_failed",
                subscription = %failure.subscription,
                event_type = %parsed.event_type,
                error = %failure.error
            );
        }
        Some(report)
    }

    pub fn handle_failure(
        &mut self,
        connection_id: ConnectionId,
        error: StreamError,
        now: DateTime<Utc>,
    ) {
        if !self.is_current(connection_id)
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            debug!(event = "stream_stale_failure", connection = %connection_id, error = %error);
            return;
        }

        self.transport.close(connection_id);
        self.active = None;
        if self.stopping {
            self.set_state(ConnectionState::Closed);
            return;
        }

        self.apply(ReconnectionEvent::Disconnect, now);
        warn!(
            event = "stream_disconnected",
            url = %self.url,
            connection = %connection_id,
            attempts = self.reconnection.attempt_count,
            error = %error
        );
        self.dispatcher.notify_disconnect(&DisconnectNotice {
            reason: DisconnectReason::TransportFailure,
            error: Some(error),
        });
        self.maybe_signal_full_refresh(now);
        self.schedule_reconnect();
    }

    pub fn handle_timer(&mut self, timer: TimerId, now: DateTime<Utc>) {
        match self.pending {
            Some(pending) if pending.timer == timer => {}
            _ => {
                debug!(event = "stream_stale_timer", timer = %timer);
                return;
            }
        }
        self.pending = None;
        if self.state != ConnectionState::ReconnectPending {
            return;
        }

        self.apply(ReconnectionEvent::Attempt, now);
        self.open_transport();
    }

    fn is_current(&self, connection_id: ConnectionId) -> bool {
        self.active == Some(connection_id)
    }

    fn apply(&mut self, event: ReconnectionEvent, now: DateTime<Utc>) {
        let previous = mem::take(&mut self.reconnection);
        self.reconnection = update_reconnection_state(previous, &event, now);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(event = "stream_state", from = %self.state, to = %next);
            self.state = next;
        }
    }

    fn open_transport(&mut self) {
        self.next_connection += 1;
        let connection_id = ConnectionId(self.next_connection);
        self.active = Some(connection_id);
        self.set_state(ConnectionState::Connecting);
        info!(
            event = "stream_connecting",
            url = %self.url,
            connection = %connection_id,
            attempt = self.reconnection.attempt_count,
            last_event_id = self.reconnection.last_event_id.as_deref().unwrap_or("")
        );
        self.transport.open(OpenRequest {
            connection_id,
            url: self.url.clone(),
            last_event_id: self.reconnection.last_event_id.clone(),
        });
    }

    fn schedule_reconnect(&mut self) {
        if self.pending.is_some() {
            return;
        }
        let delay = match calculate_backoff(self.reconnection.attempt_count, &self.config) {
            Ok(delay) => delay,
            Err(err) => {
                self.fail_config(&err);
                return;
            }
        };

        self.next_timer += 1;
        let timer = TimerId(self.next_timer);
        self.pending = Some(PendingReconnect { timer, delay });
        self.set_state(ConnectionState::ReconnectPending);
        info!(
            event = "stream_reconnect_scheduled",
            url = %self.url,
            timer = %timer,
            delay_ms = millis_u64(delay),
            attempt = self.reconnection.attempt_count + 1
        );
        self.scheduler.schedule(timer, delay);
    }

    fn maybe_signal_full_refresh(&mut self, now: DateTime<Utc>) {
        if self.refresh_signalled {
            return;
        }
        match should_full_refresh(&self.reconnection, &self.config, now) {
            Ok(true) => {
                self.refresh_signalled = true;
                let signal = FullRefreshSignal {
                    last_event_id: self.reconnection.last_event_id.clone(),
                    outage: self.reconnection.outage_duration(now),
                    attempt_count: self.reconnection.attempt_count,
                };
                warn!(
                    event = "stream_full_refresh",
                    url = %self.url,
                    outage_ms = millis_u64(signal.outage),
                    attempts = signal.attempt_count
                );
                for listener in &mut self.refresh_listeners {
                    listener(&signal);
                }
            }
            Ok(false) => {}
            Err(err) => self.fail_config(&err),
        }
    }

    fn fail_config(&mut self, err: &StreamError) {
        error!(event = "stream_config_invalid", url = %self.url, error = %err);
        if !self.config_error_reported {
            self.config_error_reported = true;
            self.dispatcher.notify_error(err);
        }
        if let Some(pending) = self.pending.take() {
            self.scheduler.cancel(pending.timer);
        }
        if let Some(connection_id) = self.active.take() {
            self.transport.close(connection_id);
        }
        self.set_state(ConnectionState::Closed);
    }
}

impl<T, S> fmt::Debug for StreamConnectionManager<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnectionManager")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("reconnection", &self.reconnection)
            .field("active", &self.active)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_core::StreamEvent;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingTransport {
        opened: Vec<OpenRequest>,
        closed: Vec<ConnectionId>,
    }

    impl RecordingTransport {
        fn last_open(&self) -> &OpenRequest {
            self.opened.last().expect("transport was opened")
        }
    }

    impl Transport for RecordingTransport {
        fn open(&mut self, request: OpenRequest) {
            self.opened.push(request);
        }

        fn close(&mut self, connection_id: ConnectionId) {
            self.closed.push(connection_id);
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Vec<(TimerId, Duration)>,
        cancelled: Vec<TimerId>,
    }

    impl RecordingScheduler {
        fn last_timer(&self) -> TimerId {
            self.scheduled.last().expect("timer was scheduled").0
        }

        fn delays(&self) -> Vec<Duration> {
            self.scheduled.iter().map(|(_, delay)| *delay).collect()
        }
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&mut self, timer: TimerId, delay: Duration) {
            self.scheduled.push((timer, delay));
        }

        fn cancel(&mut self, timer: TimerId) {
            self.cancelled.push(timer);
        }
    }

    type TestManager = StreamConnectionManager<RecordingTransport, RecordingScheduler>;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_707_335_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    fn config() -> ReconnectionConfig {
        ReconnectionConfig::new(
            Duration::from_millis(1_000),
            Duration::from_millis(30_000),
            Duration::from_millis(60_000),
        )
    }

    fn manager() -> TestManager {
        StreamConnectionManager::new(
            "http://127.0.0.1:42000/events",
            config(),
            RecordingTransport::default(),
            RecordingScheduler::default(),
        )
    }

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().expect("log lock").push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().expect("log lock").clone()
        }

        fn count(&self, entry: &str) -> usize {
            self.entries().iter().filter(|value| *value == entry).count()
        }
    }

    fn observe(manager: &mut TestManager) -> Log {
        let log = Log::default();
        let sink = log.clone();
        manager.dispatcher_mut().on_connect(move || sink.push("connect"));
        let sink = log.clone();
        manager
            .dispatcher_mut()
            .on_disconnect(move |notice: &DisconnectNotice| {
                sink.push(format!("disconnect:{:?}", notice.reason));
            });
        let sink = log.clone();
        manager
            .dispatcher_mut()
            .on_error(move |error: &StreamError| sink.push(format!("error:{}", error.error_kind())));
        let sink = log.clone();
        manager.on_full_refresh(move |_signal: &FullRefreshSignal| sink.push("refresh"));
        let sink = log.clone();
        manager.dispatcher_mut().subscribe("*", move |event: &StreamEvent| {
            sink.push(format!("event:{}", event.event_type));
            Ok(())
        });
        log
    }

    fn envelope(event_type: &str) -> String {
        format!(r#"{{"type":"{event_type}","timestamp":"2026-02-07T21:00:00Z","data":{{}}}}"#)
    }

    fn open_connected(manager: &mut TestManager, at: i64) -> ConnectionId {
        manager.connect(ts(at)).expect("connect");
        let connection_id = manager.transport().last_open().connection_id;
        manager.handle_open(connection_id, ts(at));
        connection_id
    }

    #[test]
    fn connect_is_idempotent_while_live() {
        let mut manager = manager().with_last_event_id(Some("e40".to_string()));
        assert_eq!(manager.state(), ConnectionState::Idle);

        assert!(manager.connect(ts(0)).expect("connect"));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!manager.connect(ts(1)).expect("second connect"));
        assert_eq!(manager.transport().opened.len(), 1);
        assert_eq!(
            manager.transport().last_open().last_event_id.as_deref(),
            Some("e40")
        );

        let connection_id = manager.transport().last_open().connection_id;
        manager.handle_open(connection_id, ts(2));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.connect(ts(3)).expect("connect while connected"));
        assert_eq!(manager.transport().opened.len(), 1);
    }

    #[test]
    fn three_failures_back_off_then_reset_on_open() {
        let mut manager = manager();
        let log = observe(&mut manager);

        manager.connect(ts(0)).expect("connect");
        let mut now = 0;
        for _ in 0..3 {
            let connection_id = manager.transport().last_open().connection_id;
            manager.handle_failure(connection_id, StreamError::transport("refused"), ts(now));
            assert_eq!(manager.state(), ConnectionState::ReconnectPending);
            let delay = manager.pending_delay().expect("timer armed");
            now += delay.as_millis() as i64;
            let timer = manager.scheduler().last_timer();
            manager.handle_timer(timer, ts(now));
            assert_eq!(manager.state(), ConnectionState::Connecting);
        }

        let delays = manager.scheduler().delays();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000)
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(manager.reconnection().attempt_count, 3);
        assert_eq!(manager.transport().opened.len(), 4);
        assert_eq!(log.count("disconnect:TransportFailure"), 3);

        let connection_id = manager.transport().last_open().connection_id;
        manager.handle_open(connection_id, ts(now));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.reconnection().attempt_count, 0);
        assert!(manager.reconnection().disconnected_at.is_none());
        assert_eq!(log.count("connect"), 1);
        assert_eq!(log.count("refresh"), 0);
    }

    #[test]
    fn disconnect_cancels_pending_timer_for_good() {
        let mut manager = manager();
        let connection_id = open_connected(&mut manager, 0);
        manager.handle_failure(connection_id, StreamError::transport("reset"), ts(10));
        let timer = manager.scheduler().last_timer();

        manager.disconnect(ts(20));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.scheduler().cancelled, vec![timer]);

        manager.handle_timer(timer, ts(60_000));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.transport().opened.len(), 1);
        assert_eq!(manager.scheduler().scheduled.len(), 1);
    }

    #[test]
    fn late_transport_failure_after_disconnect_is_ignored() {
        let mut manager = manager();
        let log = observe(&mut manager);
        let connection_id = open_connected(&mut manager, 0);

        manager.disconnect(ts(5));
        manager.disconnect(ts(6));
        assert_eq!(manager.transport().closed, vec![connection_id]);
        assert_eq!(log.count("disconnect:Requested"), 1);

        manager.handle_failure(connection_id, StreamError::transport("eof"), ts(7));
        manager.handle_message(connection_id, RawMessage::new(envelope("heartbeat")), ts(8));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.scheduler().scheduled.is_empty());
        assert_eq!(log.count("event:heartbeat"), 0);
    }

    #[test]
    fn duplicate_failure_reports_arm_a_single_timer() {
        let mut manager = manager();
        let connection_id = open_connected(&mut manager, 0);
        manager.handle_failure(connection_id, StreamError::transport("reset"), ts(1));
        manager.handle_failure(connection_id, StreamError::transport("reset"), ts(2));
        assert_eq!(manager.scheduler().scheduled.len(), 1);
        assert_eq!(manager.transport().closed, vec![connection_id]);
    }

    #[test]
    fn messages_record_resume_position_and_fan_out() {
        let mut manager = manager();
        let log = observe(&mut manager);
        let connection_id = open_connected(&mut manager, 0);

        let report = manager
            .handle_message(
                connection_id,
                RawMessage::new(envelope("agent_status")).with_id("e41"),
                ts(1),
            )
            .expect("dispatched");
        assert_eq!(report.delivered, 1);
        assert_eq!(manager.reconnection().last_event_id.as_deref(), Some("e41"));

        assert!(manager
            .handle_message(connection_id, RawMessage::new("{not json").with_id("e42"), ts(2))
            .is_none());
        assert_eq!(manager.reconnection().last_event_id.as_deref(), Some("e41"));

        manager.handle_message(connection_id, RawMessage::new(envelope("heartbeat")), ts(3));
        assert_eq!(manager.reconnection().last_event_id.as_deref(), Some("e41"));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            log.entries(),
            vec!["connect", "event:agent_status", "event:heartbeat"]
        );

        manager.handle_failure(connection_id, StreamError::transport("eof"), ts(4));
        let timer = manager.scheduler().last_timer();
        manager.handle_timer(timer, ts(1_004));
        assert_eq!(
            manager.transport().last_open().last_event_id.as_deref(),
            Some("e41")
        );
    }

    #[test]
    fn long_outage_signals_full_refresh_once() {
        let mut manager = manager();
        let log = observe(&mut manager);
        let connection_id = open_connected(&mut manager, 0);

        manager.handle_failure(connection_id, StreamError::transport("reset"), ts(1_000));
        assert_eq!(log.count("refresh"), 0);

        let mut now = 1_000;
        for _ in 0..8 {
            let delay = manager.pending_delay().expect("timer armed");
            now += delay.as_millis() as i64;
            let timer = manager.scheduler().last_timer();
            manager.handle_timer(timer, ts(now));
            let attempt = manager.transport().last_open().connection_id;
            manager.handle_failure(attempt, StreamError::transport("refused"), ts(now));
        }
        assert!(now - 1_000 >= 60_000);
        assert_eq!(log.count("refresh"), 1);
        assert_eq!(manager.reconnection().disconnected_at, Some(ts(1_000)));

        let timer = manager.scheduler().last_timer();
        manager.handle_timer(timer, ts(now + 30_000));
        let attempt = manager.transport().last_open().connection_id;
        manager.handle_open(attempt, ts(now + 30_000));
        assert_eq!(log.count("refresh"), 1);
        assert_eq!(log.count("connect"), 2);

        manager.handle_failure(attempt, StreamError::transport("reset"), ts(now + 40_000));
        assert_eq!(log.count("refresh"), 1);
    }

    #[test]
    fn reopening_after_a_long_single_gap_still_refreshes() {
        let mut manager = manager();
        let refreshes = Arc::new(Mutex::new(Vec::new()));
        let sink = refreshes.clone();
        manager.on_full_refresh(move |signal: &FullRefreshSignal| {
            sink.lock().expect("refresh lock").push(signal.clone());
        });
        let connection_id = open_connected(&mut manager, 0);
        manager
            .handle_message(connection_id, RawMessage::new(envelope("heartbeat")).with_id("e7"), ts(1))
            .expect("dispatched");

        manager.handle_failure(connection_id, StreamError::transport("suspend"), ts(10));
        let timer = manager.scheduler().last_timer();
        manager.handle_timer(timer, ts(90_010));
        let attempt = manager.transport().last_open().connection_id;
        manager.handle_open(attempt, ts(90_010));

        let refreshes = refreshes.lock().expect("refresh lock");
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].last_event_id.as_deref(), Some("e7"));
        assert_eq!(refreshes[0].outage, Duration::from_millis(90_000));
        assert_eq!(refreshes[0].attempt_count, 1);
    }

    #[test]
    fn invalid_config_is_reported_once_and_never_retried() {
        let mut manager = StreamConnectionManager::new(
            "http://127.0.0.1:42000/events",
            ReconnectionConfig::new(Duration::ZERO, Duration::from_secs(1), Duration::from_secs(60)),
            RecordingTransport::default(),
            RecordingScheduler::default(),
        );
        let log = observe(&mut manager);

        let err = manager.connect(ts(0)).expect_err("invalid config");
        assert!(err.is_fatal());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.connect(ts(1)).is_err());

        assert_eq!(log.entries(), vec!["error:invalid_parameter"]);
        assert!(manager.transport().opened.is_empty());
        assert!(manager.scheduler().scheduled.is_empty());
    }

    #[test]
    fn connect_while_pending_attempts_immediately() {
        let mut manager = manager();
        let connection_id = open_connected(&mut manager, 0);
        manager.handle_failure(connection_id, StreamError::transport("reset"), ts(1));
        let timer = manager.scheduler().last_timer();

        assert!(manager.connect(ts(2)).expect("reconnect now"));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.scheduler().cancelled, vec![timer]);
        assert_eq!(manager.reconnection().attempt_count, 1);

        manager.handle_timer(timer, ts(1_001));
        assert_eq!(manager.transport().opened.len(), 2);
    }

    #[test]
    fn connect_after_close_resumes_from_last_event() {
        let mut manager = manager();
        let log = observe(&mut manager);
        let connection_id = open_connected(&mut manager, 0);
        manager
            .handle_message(connection_id, RawMessage::new(envelope("task_update")).with_id("e9"), ts(1))
            .expect("dispatched");
        manager.disconnect(ts(2));

        assert!(manager.connect(ts(3)).expect("reconnect"));
        let request = manager.transport().last_open().clone();
        assert_ne!(request.connection_id, connection_id);
        assert_eq!(request.last_event_id.as_deref(), Some("e9"));

        manager.handle_open(request.connection_id, ts(4));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(log.count("connect"), 2);
        assert_eq!(manager.reconnection().attempt_count, 0);
    }

    #[test]
    fn shutdown_drops_listeners() {
        let mut manager = manager();
        let log = observe(&mut manager);
        open_connected(&mut manager, 0);

        manager.shutdown(ts(1));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.dispatcher().listener_count(), 0);
        assert_eq!(log.count("disconnect:Requested"), 1);
    }
}
