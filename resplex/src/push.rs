//! Out-of-band push message routing.
//!
//! Push frames are not replies. They bypass the reply queue entirely and are
//! fanned out to registered listeners; the absence of a listener never stalls
//! or corrupts reply correlation.

use std::sync::{Arc, Mutex};

use crate::value::Value;

/// Kind of a push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    /// `invalidate` notifications from client-side caching.
    Invalidate,
    /// Channel message.
    Message,
    /// Pattern-channel message.
    PMessage,
    /// Sharded channel message.
    SMessage,
    /// Subscription confirmation.
    Subscribe,
    /// Pattern subscription confirmation.
    PSubscribe,
    /// Sharded subscription confirmation.
    SSubscribe,
    /// Unsubscription confirmation.
    Unsubscribe,
    /// Pattern unsubscription confirmation.
    PUnsubscribe,
    /// Sharded unsubscription confirmation.
    SUnsubscribe,
    /// Synthesized locally when the connection is lost. Never sent by a
    /// server.
    Disconnection,
    /// Any other push kind.
    Other(String),
}

impl PushKind {
    pub(crate) fn parse(kind: String) -> PushKind {
        match kind.as_str() {
            "invalidate" => PushKind::Invalidate,
            "message" => PushKind::Message,
            "pmessage" => PushKind::PMessage,
            "smessage" => PushKind::SMessage,
            "subscribe" => PushKind::Subscribe,
            "psubscribe" => PushKind::PSubscribe,
            "ssubscribe" => PushKind::SSubscribe,
            "unsubscribe" => PushKind::Unsubscribe,
            "punsubscribe" => PushKind::PUnsubscribe,
            "sunsubscribe" => PushKind::SUnsubscribe,
            _ => PushKind::Other(kind),
        }
    }
}

/// A complete push message, kind plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PushInfo {
    /// Kind of the message.
    pub kind: PushKind,
    /// Payload elements following the kind marker.
    pub data: Vec<Value>,
}

/// Error returned from a listener that can no longer receive messages. The
/// listener is dropped from the router.
#[derive(Debug)]
pub struct SendError;

/// A destination for push messages.
///
/// Implemented for the common channel senders and for plain functions, so a
/// listener can be registered without a wrapper type.
pub trait PushSender: Send + Sync + 'static {
    /// Delivers a message. `Err` unregisters the listener.
    fn send(&self, info: PushInfo) -> Result<(), SendError>;
}

impl PushSender for tokio::sync::mpsc::UnboundedSender<PushInfo> {
    fn send(&self, info: PushInfo) -> Result<(), SendError> {
        tokio::sync::mpsc::UnboundedSender::send(self, info).map_err(|_| SendError)
    }
}

impl PushSender for std::sync::mpsc::Sender<PushInfo> {
    fn send(&self, info: PushInfo) -> Result<(), SendError> {
        std::sync::mpsc::Sender::send(self, info).map_err(|_| SendError)
    }
}

impl<T, F> PushSender for F
where
    F: Fn(PushInfo) -> Result<(), T> + Send + Sync + 'static,
{
    fn send(&self, info: PushInfo) -> Result<(), SendError> {
        self(info).map_err(|_| SendError)
    }
}

impl<T> PushSender for Arc<T>
where
    T: PushSender + ?Sized,
{
    fn send(&self, info: PushInfo) -> Result<(), SendError> {
        (**self).send(info)
    }
}

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(pub(crate) u64);

struct Listener {
    id: ListenerId,
    filter: Option<PushKind>,
    sender: Arc<dyn PushSender>,
}

#[derive(Default)]
struct RouterInner {
    next_id: u64,
    listeners: Vec<Listener>,
}

/// Fans push messages out to registered listeners.
#[derive(Default)]
pub struct OutOfBandRouter {
    inner: Mutex<RouterInner>,
}

impl OutOfBandRouter {
    /// Registers a listener. With a `filter`, only messages of that exact
    /// kind are delivered; without one, everything is.
    pub fn register(&self, filter: Option<PushKind>, sender: impl PushSender) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push(Listener {
            id,
            filter,
            sender: Arc::new(sender),
        });
        id
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|listener| listener.id != id);
        inner.listeners.len() != before
    }

    /// Delivers a message to every matching listener, dropping listeners
    /// whose receiving side went away.
    pub(crate) fn dispatch(&self, info: PushInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|listener| {
            match &listener.filter {
                Some(kind) if *kind != info.kind => return true,
                _ => {}
            }
            listener.sender.send(info.clone()).is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: PushKind) -> PushInfo {
        PushInfo {
            kind,
            data: vec![Value::SimpleString("chan".into())],
        }
    }

    #[test]
    fn filtered_listener_only_sees_its_kind() {
        let router = OutOfBandRouter::default();
        let (tx, rx) = std::sync::mpsc::channel();
        router.register(Some(PushKind::Invalidate), tx);

        router.dispatch(message(PushKind::Message));
        router.dispatch(message(PushKind::Invalidate));

        assert_eq!(rx.try_recv().unwrap().kind, PushKind::Invalidate);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unfiltered_listener_sees_everything() {
        let router = OutOfBandRouter::default();
        let (tx, rx) = std::sync::mpsc::channel();
        router.register(None, tx);

        router.dispatch(message(PushKind::Message));
        router.dispatch(message(PushKind::Other("custom".into())));

        assert_eq!(rx.try_recv().unwrap().kind, PushKind::Message);
        assert_eq!(rx.try_recv().unwrap().kind, PushKind::Other("custom".into()));
    }

    #[test]
    fn closed_listener_is_dropped() {
        let router = OutOfBandRouter::default();
        let (tx, rx) = std::sync::mpsc::channel();
        router.register(None, tx);
        drop(rx);

        router.dispatch(message(PushKind::Message));
        assert!(router.inner.lock().unwrap().listeners.is_empty());
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let router = OutOfBandRouter::default();
        let (tx, rx) = std::sync::mpsc::channel();
        let id = router.register(None, tx);
        assert!(router.remove(id));
        assert!(!router.remove(id));

        router.dispatch(message(PushKind::Message));
        assert!(rx.try_recv().is_err());
    }
}
