//! Subscriber registry and event fan-out
//!
//! Each subscriber is one open SSE connection, fed through an unbounded
//! channel. Pushes never block, so one slow client cannot hold up the rest.
//! Besides events, subscribers see job boundary markers, which chat streams
//! use to carry exactly one job.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::agent::{EventSink, StreamEvent};

/// Item delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// An event for the client
    Event(StreamEvent),
    /// The job with this id has claimed the agent; its events follow
    JobStarted(Uuid),
    /// The job with this id has pushed its terminal event
    JobFinished(Uuid),
}

/// Sending half of a subscriber connection
pub type SubscriberTx = mpsc::UnboundedSender<Delivery>;

/// Receiving half of a subscriber connection
pub type SubscriberRx = mpsc::UnboundedReceiver<Delivery>;

/// Multicasts events to every connected subscriber
#[derive(Debug, Default)]
pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<String, SubscriberTx>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, SubscriberTx>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber and acknowledge it with a `connected` event
    pub fn add_subscriber(&self, id: impl Into<String>, tx: SubscriberTx) {
        let id = id.into();
        if tx.send(Delivery::Event(StreamEvent::connected(&id))).is_err() {
            debug!("Subscriber {} disconnected before registration", id);
            return;
        }
        let mut subscribers = self.subscribers();
        subscribers.insert(id.clone(), tx);
        debug!("Subscriber {} added ({} total)", id, subscribers.len());
    }

    /// Register a new subscriber under a fresh id
    pub fn subscribe(&self) -> (String, SubscriberRx) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_subscriber(&id, tx);
        (id, rx)
    }

    /// Push an event to every subscriber, dropping any that have gone away
    pub fn broadcast(&self, event: StreamEvent) {
        self.deliver(Delivery::Event(event));
    }

    fn deliver(&self, delivery: Delivery) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|id, tx| {
            let delivered = tx.send(delivery.clone()).is_ok();
            if !delivered {
                debug!("Subscriber {} gone, removing", id);
            }
            delivered
        });
    }

    /// Push an event to one subscriber; no-op if it is not registered
    pub fn send_to_one(&self, id: &str, event: StreamEvent) {
        let mut subscribers = self.subscribers();
        let failed = match subscribers.get(id) {
            Some(tx) => tx.send(Delivery::Event(event)).is_err(),
            None => return,
        };
        if failed {
            debug!("Subscriber {} gone, removing", id);
            subscribers.remove(id);
        }
    }

    /// Close and forget a subscriber. Returns false if it was not registered.
    pub fn remove_subscriber(&self, id: &str) -> bool {
        let removed = self.subscribers().remove(id).is_some();
        if removed {
            debug!("Subscriber {} removed", id);
        }
        removed
    }

    /// Close every subscriber
    pub fn close_all(&self) {
        let mut subscribers = self.subscribers();
        if !subscribers.is_empty() {
            debug!("Closing {} subscribers", subscribers.len());
        }
        subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl EventSink for EventBroadcaster {
    fn push(&self, event: StreamEvent) {
        self.broadcast(event);
    }

    fn job_started(&self, job_id: Uuid) {
        self.deliver(Delivery::JobStarted(job_id));
    }

    fn job_finished(&self, job_id: Uuid) {
        self.deliver(Delivery::JobFinished(job_id));
    }
}
