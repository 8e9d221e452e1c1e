/// Event plumbing
/// Subscribe/dispose listener lists used by the PTY registry, and the sink the
/// coordinator publishes host notifications into.

use crate::models::HostEvent;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Handle returned by every subscribe call. Dropping it unsubscribes.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn dispose(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

struct ListenerSlots<T: ?Sized> {
    next_id: u64,
    slots: Vec<(u64, Arc<T>)>,
}

/// Ordered list of callbacks. Emission works on a snapshot so a callback may
/// subscribe or unsubscribe without deadlocking.
pub struct Listeners<T: ?Sized> {
    inner: Arc<Mutex<ListenerSlots<T>>>,
}

impl<T: ?Sized> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSlots {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<T>) -> Subscription {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.slots.push((id, listener));
            id
        };

        let weak: Weak<Mutex<ListenerSlots<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().slots.retain(|(slot_id, _)| *slot_id != id);
            }
        })
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.lock().slots.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().slots.clear();
    }
}

/// Receiver of outbound host notifications. The host renders immediately,
/// so there is no batching or backpressure.
pub trait HostSink: Send + Sync + 'static {
    fn emit(&self, event: HostEvent);
}

/// Forwards host events into an unbounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl HostSink for ChannelSink {
    fn emit(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("host event dropped, receiver closed");
        }
    }
}
