//! In-process event bus.
//!
//! Lifecycle events fan out to registered listeners over bounded channels.
//! Publishing never blocks: a listener that cannot keep up misses events
//! rather than stalling the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::SYSTEM_SERVICE;

/// Buffered events per listener before backpressure drops kick in.
const LISTENER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Heartbeat,
    ServiceStatusChanged,
    ServiceDeleted,
    ServiceCreated,
    ServiceConfigChanged,
    ServiceConfigStaged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Milliseconds since the epoch, stamped at publication.
    pub time: i64,
    pub service_name: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, service_name: impl Into<String>) -> Event {
        Event {
            time: 0,
            service_name: service_name.into(),
            event_type,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Event {
        self.data = Some(data);
        self
    }
}

type Filter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Listener {
    tx: mpsc::Sender<Event>,
    filter: Filter,
}

/// Handle returned by [`EventBus::add_listener`]; pass it back to
/// [`EventBus::remove_listener`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Single-writer, multi-subscriber fan-out of lifecycle events.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Register a listener with a predicate. Events failing the predicate
    /// are never delivered to this listener.
    pub fn add_listener<F>(&self, filter: F) -> (ListenerHandle, mpsc::Receiver<Event>)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(
                id,
                Listener {
                    tx,
                    filter: Box::new(filter),
                },
            );
        (ListenerHandle(id), rx)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.inner
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(&handle.0);
    }

    /// Publish an event to every listener whose predicate accepts it. The
    /// timestamp is stamped here. Full listener channels miss the event;
    /// closed listeners are removed.
    pub fn publish(&self, mut event: Event) {
        event.time = chrono::Utc::now().timestamp_millis();
        let mut gone = Vec::new();
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .expect("listener lock poisoned");
        for (id, l) in listeners.iter() {
            if !(l.filter)(&event) {
                continue;
            }
            match l.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("event listener {id} is full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            listeners.remove(&id);
        }
    }

    /// Publish a heartbeat for the `sys` pseudo-service every second until
    /// cancelled.
    pub async fn heartbeat(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    self.publish(Event::new(EventType::Heartbeat, SYSTEM_SERVICE));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_delivers_to_matching_listeners() {
        let bus = EventBus::new();
        let (_h1, mut rx1) = bus.add_listener(|_| true);
        let (_h2, mut rx2) = bus.add_listener(|e| e.service_name == "web");
        let (_h3, mut rx3) = bus.add_listener(|e| e.service_name == "other");

        bus.publish(Event::new(EventType::ServiceCreated, "web"));

        let e1 = rx1.recv().await.unwrap();
        assert_eq!(e1.event_type, EventType::ServiceCreated);
        assert!(e1.time > 0);
        assert_eq!(rx2.recv().await.unwrap().service_name, "web");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_does_not_block_on_full_listener() {
        let bus = EventBus::new();
        let (_h, mut rx) = bus.add_listener(|_| true);
        for _ in 0..LISTENER_BUFFER + 8 {
            bus.publish(Event::new(EventType::Heartbeat, "sys"));
        }
        // The buffer's worth of events is there; the overflow was dropped.
        let mut got = 0;
        while rx.try_recv().is_ok() {
            got += 1;
        }
        assert_eq!(got, LISTENER_BUFFER);
    }

    #[tokio::test]
    async fn removed_listener_receives_nothing() {
        let bus = EventBus::new();
        let (h, mut rx) = bus.add_listener(|_| true);
        bus.remove_listener(h);
        bus.publish(Event::new(EventType::ServiceDeleted, "web"));
        assert!(rx.recv().await.is_none());
    }
}
