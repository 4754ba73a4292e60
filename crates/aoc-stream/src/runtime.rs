//! Tokio binding for [`StreamConnectionManager`].
//!
//! One loop task owns the manager. Each connection attempt runs in its own
//! reader task and each reconnect timer in its own sleep task; both report
//! back to the loop over a bounded channel, so a slow subscriber holds the
//! readers back instead of buffering without limit. Closing a connection or
//! cancelling a timer aborts its task.

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ReconnectionConfig;
use crate::dispatcher::{EventCallback, EventDispatcher, SubscriptionId, Topic};
use crate::error::{StreamError, StreamResult};
use crate::manager::{
    ConnectionId, ConnectionState, FullRefreshSignal, OpenRequest, RawMessage, Scheduler,
    StreamConnectionManager, TimerId, Transport,
};

pub const DEFAULT_EVENT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 32;

pub type MessageStream = BoxStream<'static, StreamResult<RawMessage>>;

/// Opens one connection and yields its messages.
///
/// Resolving `Ok` means the connection is open. The returned stream ends, or
/// yields an error, when the connection drops.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = StreamResult<MessageStream>> + Send;
}

#[derive(Debug)]
pub(crate) enum LoopEvent {
    Opened(ConnectionId),
    Message(ConnectionId, RawMessage),
    Failed(ConnectionId, StreamError),
    TimerFired(TimerId),
}

pub(crate) struct TaskTransport<C> {
    connector: Arc<C>,
    events: mpsc::Sender<LoopEvent>,
    readers: HashMap<ConnectionId, JoinHandle<()>>,
}

impl<C: Connector> TaskTransport<C> {
    fn new(connector: C, events: mpsc::Sender<LoopEvent>) -> Self {
        Self {
            connector: Arc::new(connector),
            events,
            readers: HashMap::new(),
        }
    }
}

impl<C: Connector> Transport for TaskTransport<C> {
    fn open(&mut self, request: OpenRequest) {
        self.readers.retain(|_, reader| !reader.is_finished());

        let connection_id = request.connection_id;
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let mut stream = match connector.connect(request).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = events.send(LoopEvent::Failed(connection_id, err)).await;
                    return;
                }
            };
            if events.send(LoopEvent::Opened(connection_id)).await.is_err() {
                return;
            }
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(message) => LoopEvent::Message(connection_id, message),
                    Err(err) => LoopEvent::Failed(connection_id, err),
                };
                let failed = matches!(event, LoopEvent::Failed(..));
                if events.send(event).await.is_err() || failed {
                    return;
                }
            }
            let _ = events
                .send(LoopEvent::Failed(
                    connection_id,
                    StreamError::transport("stream ended"),
                ))
                .await;
        });
        self.readers.insert(connection_id, reader);
    }

    fn close(&mut self, connection_id: ConnectionId) {
        if let Some(reader) = self.readers.remove(&connection_id) {
            reader.abort();
        }
    }
}

impl<C> Drop for TaskTransport<C> {
    fn drop(&mut self) {
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
    }
}

pub(crate) struct TokioScheduler {
    events: mpsc::Sender<LoopEvent>,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    fn new(events: mpsc::Sender<LoopEvent>) -> Self {
        Self {
            events,
            timers: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, timer: TimerId, delay: Duration) {
        self.timers.retain(|_, task| !task.is_finished());

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LoopEvent::TimerFired(timer)).await;
        });
        self.timers.insert(timer, task);
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(task) = self.timers.remove(&timer) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}

/// Wall-clock time advanced by the tokio clock, so paused-time tests see the
/// same outage lengths the timers do.
struct LoopClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl LoopClock {
    fn start() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

enum Command {
    Connect(oneshot::Sender<StreamResult<bool>>),
    Disconnect(oneshot::Sender<()>),
    Subscribe {
        topic: Topic,
        callback: EventCallback,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe(SubscriptionId, oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

type TaskManager<C> = StreamConnectionManager<TaskTransport<C>, TokioScheduler>;

/// A stream subscription that has not started yet. Register listeners, then
/// [`spawn`](Self::spawn) it onto the current tokio runtime.
pub struct StreamClient<C: Connector> {
    manager: TaskManager<C>,
    events: mpsc::Receiver<LoopEvent>,
}

impl<C: Connector> StreamClient<C> {
    pub fn new(url: impl Into<String>, config: ReconnectionConfig, connector: C) -> Self {
        Self::with_buffer(url, config, connector, DEFAULT_EVENT_BUFFER)
    }

    pub fn with_buffer(
        url: impl Into<String>,
        config: ReconnectionConfig,
        connector: C,
        buffer: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
        let manager = StreamConnectionManager::new(
            url,
            config,
            TaskTransport::new(connector, event_tx.clone()),
            TokioScheduler::new(event_tx),
        );
        Self {
            manager,
            events: event_rx,
        }
    }

    pub fn resume_from(mut self, last_event_id: Option<String>) -> Self {
        self.manager = self.manager.with_last_event_id(last_event_id);
        self
    }

    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        self.manager.dispatcher_mut()
    }

    pub fn on_full_refresh<F>(&mut self, callback: F)
    where
        F: FnMut(&FullRefreshSignal) + Send + 'static,
    {
        self.manager.on_full_refresh(callback);
    }

    /// Start the loop task. Must be called from within a tokio runtime.
    /// Nothing connects until [`StreamHandle::connect`] is called.
    pub fn spawn(self) -> StreamHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(self.manager.state());
        tokio::spawn(run_loop(self.manager, command_rx, self.events, state_tx));
        StreamHandle {
            commands: command_tx,
            state: state_rx,
        }
    }
}

/// Control surface of a running stream. Clones share the same loop; once
/// every clone is dropped the stream disconnects and all listeners go away.
#[derive(Clone)]
pub struct StreamHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> StreamResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| StreamError::Stopped)
    }

    pub async fn connect(&self) -> StreamResult<bool> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Connect(reply)).await?;
        response.await.map_err(|_| StreamError::Stopped)?
    }

    /// Returns once the pending timer is cancelled and the live connection
    /// is closed.
    pub async fn disconnect(&self) -> StreamResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Disconnect(reply)).await?;
        response.await.map_err(|_| StreamError::Stopped)
    }

    pub async fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> StreamResult<SubscriptionId>
    where
        F: FnMut(&aoc_core::StreamEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.send(Command::Subscribe {
            topic: topic.into(),
            callback: Box::new(callback),
            reply,
        })
        .await?;
        response.await.map_err(|_| StreamError::Stopped)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> StreamResult<bool> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Unsubscribe(id, reply)).await?;
        response.await.map_err(|_| StreamError::Stopped)
    }

    /// Disconnect, drop every listener, and stop the loop task.
    pub async fn shutdown(self) -> StreamResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        response.await.map_err(|_| StreamError::Stopped)
    }

    async fn send(&self, command: Command) -> StreamResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| StreamError::Stopped)
    }
}

async fn run_loop<C: Connector>(
    mut manager: TaskManager<C>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<LoopEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let clock = LoopClock::start();
    debug!(event = "stream_loop_started", url = %manager.url());

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if !apply_command(&mut manager, command, &clock, &state) {
                        break;
                    }
                }
                None => {
                    manager.shutdown(clock.now());
                    publish(&state, manager.state());
                    break;
                }
            },
            Some(event) = events.recv() => {
                apply_event(&mut manager, event, clock.now());
                publish(&state, manager.state());
            }
        }
    }

    info!(event = "stream_loop_stopped", url = %manager.url());
}

/// Replies go out after the new state is published, so a caller that awaited
/// a command observes its effect. Returns `false` once the loop should stop.
fn apply_command<C: Connector>(
    manager: &mut TaskManager<C>,
    command: Command,
    clock: &LoopClock,
    state: &watch::Sender<ConnectionState>,
) -> bool {
    match command {
        Command::Connect(reply) => {
            let result = manager.connect(clock.now());
            publish(state, manager.state());
            let _ = reply.send(result);
        }
        Command::Disconnect(ack) => {
            manager.disconnect(clock.now());
            publish(state, manager.state());
            let _ = ack.send(());
        }
        Command::Subscribe {
            topic,
            callback,
            reply,
        } => {
            let id = manager.dispatcher_mut().subscribe(topic, callback);
            let _ = reply.send(id);
        }
        Command::Unsubscribe(id, reply) => {
            let _ = reply.send(manager.dispatcher_mut().unsubscribe(id));
        }
        Command::Shutdown(ack) => {
            manager.shutdown(clock.now());
            publish(state, manager.state());
            let _ = ack.send(());
            return false;
        }
    }
    true
}

fn apply_event<C: Connector>(manager: &mut TaskManager<C>, event: LoopEvent, now: DateTime<Utc>) {
    match event {
        LoopEvent::Opened(connection_id) => manager.handle_open(connection_id, now),
        LoopEvent::Message(connection_id, message) => {
            manager.handle_message(connection_id, message, now);
        }
        LoopEvent::Failed(connection_id, error) => {
            manager.handle_failure(connection_id, error, now)
        }
        LoopEvent::TimerFired(timer) => manager.handle_timer(timer, now),
    }
}

fn publish(state: &watch::Sender<ConnectionState>, current: ConnectionState) {
    state.send_if_modified(|published| {
        if *published == current {
            return false;
        }
        *published = current;
        true
    });
}
