//! Fan-out of lifecycle events to registered listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use fleet_id::EventId;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::EventError;
use crate::types::{InstanceSummary, LifecycleAction, LifecycleEvent};

/// Default capacity of the broadcast channel handed to subscribers.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Receives lifecycle events.
///
/// Implementations must not block: they run on the publisher's task.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), EventError>;
}

impl<F> EventListener for F
where
    F: Fn(&LifecycleEvent) -> Result<(), EventError> + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), EventError> {
        self(event)
    }
}

/// Token returned by [`EventNotifier::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Explicitly constructed event channel shared by the controller components.
pub struct EventNotifier {
    listeners: RwLock<Vec<(ListenerHandle, Arc<dyn EventListener>)>>,
    sender: broadcast::Sender<LifecycleEvent>,
    next_event_id: AtomicU64,
    next_listener_id: AtomicU64,
}

impl EventNotifier {
    /// Create a notifier with the default subscriber channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a notifier whose subscriber channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
            next_event_id: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Register a callback listener.
    pub fn register(&self, listener: Arc<dyn EventListener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((handle, listener)),
            Err(poisoned) => poisoned.into_inner().push((handle, listener)),
        }
        debug!(listener = handle.0, "Registered event listener");
        handle
    }

    /// Remove a previously registered listener. Returns false if unknown.
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        before != listeners.len()
    }

    /// Number of registered callback listeners.
    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Build and publish an event for a transition.
    pub fn notify(
        &self,
        service: &str,
        group: &str,
        instance: Option<InstanceSummary>,
        action: LifecycleAction,
        detail: Option<String>,
    ) -> LifecycleEvent {
        let event = LifecycleEvent {
            event_id: EventId::new(self.next_event_id.fetch_add(1, Ordering::SeqCst)),
            occurred_at: Utc::now(),
            service: service.to_string(),
            group: group.to_string(),
            instance,
            action,
            detail,
        };
        self.publish(&event);
        event
    }

    /// Deliver an already-built event to every listener and subscriber.
    pub fn publish(&self, event: &LifecycleEvent) {
        // Snapshot so a listener may (un)register without deadlocking.
        let listeners: Vec<_> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(h, l)| (*h, Arc::clone(l))).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(h, l)| (*h, Arc::clone(l)))
                .collect(),
        };

        for (handle, listener) in listeners {
            if let Err(e) = listener.on_event(event) {
                warn!(
                    listener = handle.0,
                    event_id = %event.event_id,
                    event_type = event.event_type(),
                    service = %event.service,
                    error = %e,
                    "Event delivery failed"
                );
            }
        }

        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Listener that writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(event)?;
        info!(
            event_id = %event.event_id,
            event_type = event.event_type(),
            service = %event.service,
            group = %event.group,
            payload = %payload,
            "Lifecycle event"
        );
        Ok(())
    }
}
