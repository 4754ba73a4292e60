//! Topic-keyed fan-out of stream events plus the lifecycle channels.

use aoc_core::StreamEvent;
use std::collections::HashMap;
use std::fmt;

use crate::error::StreamError;

pub const WILDCARD_TOPIC: &str = "*";

pub type EventCallback = Box<dyn FnMut(&StreamEvent) -> anyhow::Result<()> + Send>;
pub type ConnectCallback = Box<dyn FnMut() + Send>;
pub type DisconnectCallback = Box<dyn FnMut(&DisconnectNotice) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&StreamError) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event, whatever its type.
    All,
    Exact(String),
}

impl Topic {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed == WILDCARD_TOPIC {
            Topic::All
        } else {
            Topic::Exact(trimmed.to_string())
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Topic::All => true,
            Topic::Exact(topic) => topic == event_type,
        }
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic::parse(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic::parse(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TransportFailure,
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub reason: DisconnectReason,
    pub error: Option<StreamError>,
}

#[derive(Debug)]
pub struct CallbackFailure {
    pub subscription: SubscriptionId,
    pub error: anyhow::Error,
}

/// Outcome of one [`EventDispatcher::dispatch`] call.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<CallbackFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Registration<F> {
    id: SubscriptionId,
    callback: F,
}

fn remove_registration<F>(registrations: &mut Vec<Registration<F>>, id: SubscriptionId) -> bool {
    let before = registrations.len();
    registrations.retain(|registration| registration.id != id);
    registrations.len() != before
}

/// Listener registry. Callbacks run synchronously on the caller's task, in
/// registration order within a topic.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: u64,
    by_topic: HashMap<String, Vec<Registration<EventCallback>>>,
    wildcard: Vec<Registration<EventCallback>>,
    connect: Vec<Registration<ConnectCallback>>,
    disconnect: Vec<Registration<DisconnectCallback>>,
    error: Vec<Registration<ErrorCallback>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub fn subscribe<F>(&mut self, topic: impl Into<Topic>, callback: F) -> SubscriptionId
    where
        F: FnMut(&StreamEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.allocate_id();
        let registration = Registration {
            id,
            callback: Box::new(callback) as EventCallback,
        };
        match topic.into() {
            Topic::All => self.wildcard.push(registration),
            Topic::Exact(topic) => self.by_topic.entry(topic).or_default().push(registration),
        }
        id
    }

    pub fn on_connect<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.allocate_id();
        self.connect.push(Registration {
            id,
            callback: Box::new(callback) as ConnectCallback,
        });
        id
    }

    pub fn on_disconnect<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&DisconnectNotice) + Send + 'static,
    {
        let id = self.allocate_id();
        self.disconnect.push(Registration {
            id,
            callback: Box::new(callback) as DisconnectCallback,
        });
        id
    }

    pub fn on_error<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&StreamError) + Send + 'static,
    {
        let id = self.allocate_id();
        self.error.push(Registration {
            id,
            callback: Box::new(callback) as ErrorCallback,
        });
        id
    }

    /// Remove one registration from whichever channel holds it.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut emptied = None;
        let mut removed = false;
        for (topic, registrations) in self.by_topic.iter_mut() {
            if remove_registration(registrations, id) {
                removed = true;
                if registrations.is_empty() {
                    emptied = Some(topic.clone());
                }
                break;
            }
        }
        if let Some(topic) = emptied {
            self.by_topic.remove(&topic);
        }
        removed
            || remove_registration(&mut self.wildcard, id)
            || remove_registration(&mut self.connect, id)
            || remove_registration(&mut self.disconnect, id)
            || remove_registration(&mut self.error, id)
    }

    pub fn unsubscribe_all(&mut self) {
        self.by_topic.clear();
        self.wildcard.clear();
        self.connect.clear();
        self.disconnect.clear();
        self.error.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum::<usize>()
            + self.wildcard.len()
            + self.connect.len()
            + self.disconnect.len()
            + self.error.len()
    }

    /// Fan `event` out to its exact-topic subscribers, then to wildcard ones.
    ///
    /// A callback returning an error does not stop the remaining callbacks;
    /// failures are collected in the report for the caller to act on.
    pub fn dispatch(&mut self, event: &StreamEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let exact = self
            .by_topic
            .get_mut(&event.event_type)
            .map(|registrations| registrations.iter_mut())
            .into_iter()
            .flatten();
        for registration in exact.chain(self.wildcard.iter_mut()) {
            report.delivered += 1;
            if let Err(error) = (registration.callback)(event) {
                report.failures.push(CallbackFailure {
                    subscription: registration.id,
                    error,
                });
            }
        }
        report
    }

    pub fn notify_connect(&mut self) {
        for registration in &mut self.connect {
            (registration.callback)();
        }
    }

    pub fn notify_disconnect(&mut self, notice: &DisconnectNotice) {
        for registration in &mut self.disconnect {
            (registration.callback)(notice);
        }
    }

    pub fn notify_error(&mut self, error: &StreamError) {
        for registration in &mut self.error {
            (registration.callback)(error);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("topics", &self.by_topic.keys().collect::<Vec<_>>())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
