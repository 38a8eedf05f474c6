//! Connection lifecycle notifications.

use std::sync::{Arc, Mutex};

use crate::errors::ErrorKind;
use crate::push::ListenerId;

/// A state transition of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The initial connection was established.
    Connected,
    /// The connection was lost, with the classification of the cause.
    Disconnected(ErrorKind),
    /// A reconnection attempt is starting.
    Reconnecting,
    /// A replacement connection was established.
    Reconnected,
}

/// A destination for lifecycle events.
pub trait EventListener: Send + Sync + 'static {
    /// Delivers an event. `Err` unregisters the listener.
    fn notify(&self, event: ConnectionEvent) -> Result<(), crate::push::SendError>;
}

impl EventListener for tokio::sync::mpsc::UnboundedSender<ConnectionEvent> {
    fn notify(&self, event: ConnectionEvent) -> Result<(), crate::push::SendError> {
        self.send(event).map_err(|_| crate::push::SendError)
    }
}

impl EventListener for std::sync::mpsc::Sender<ConnectionEvent> {
    fn notify(&self, event: ConnectionEvent) -> Result<(), crate::push::SendError> {
        self.send(event).map_err(|_| crate::push::SendError)
    }
}

impl<T, F> EventListener for F
where
    F: Fn(ConnectionEvent) -> Result<(), T> + Send + Sync + 'static,
{
    fn notify(&self, event: ConnectionEvent) -> Result<(), crate::push::SendError> {
        self(event).map_err(|_| crate::push::SendError)
    }
}

impl<T> EventListener for Arc<T>
where
    T: EventListener + ?Sized,
{
    fn notify(&self, event: ConnectionEvent) -> Result<(), crate::push::SendError> {
        (**self).notify(event)
    }
}

#[derive(Default)]
struct ListenersInner {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn EventListener>)>,
}

/// The set of registered lifecycle listeners.
#[derive(Default)]
pub(crate) struct LifecycleListeners {
    inner: Mutex<ListenersInner>,
}

impl LifecycleListeners {
    pub(crate) fn add(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .retain(|(_, listener)| listener.notify(event).is_ok());
    }
}
