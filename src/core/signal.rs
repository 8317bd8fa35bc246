//! In-process change notification.
//!
//! Subscriptions are keyed on point identity (a process-unique integer),
//! not on the point code, so renaming a point does not silently
//! unsubscribe its listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::point::Point;

/// Process-unique point identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointId(pub u64);

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

static NEXT_POINT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next point identity.
pub fn next_point_id() -> PointId {
    PointId(NEXT_POINT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Identity of one subscription on a [`ChangeSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique subscriber identity.
pub fn next_subscriber_id() -> SubscriberId {
    SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Payload delivered to change listeners.
#[derive(Clone)]
pub struct ChangeEvent {
    /// The point whose value changed.
    pub point: Arc<Point>,
    /// The reverse-linked point, when one is configured.
    pub related: Option<Arc<Point>>,
}

/// A synchronous change listener.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Per-point subscriber list.
///
/// Connecting twice with the same [`SubscriberId`] replaces the previous
/// listener, so repeated subscription passes are safe.
#[derive(Default)]
pub struct ChangeSignal {
    listeners: Mutex<Vec<(SubscriberId, ChangeListener)>>,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a listener.
    pub fn connect(&self, id: SubscriberId, listener: ChangeListener) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(slot) = listeners.iter_mut().find(|(sid, _)| *sid == id) {
            slot.1 = listener;
        } else {
            listeners.push((id, listener));
        }
    }

    /// Remove a listener, if present.
    pub fn disconnect(&self, id: SubscriberId) {
        self.listeners.lock().unwrap().retain(|(sid, _)| *sid != id);
    }

    /// Deliver an event to every listener.
    ///
    /// Listeners run on the caller's thread; the snapshot taken here lets
    /// them re-subscribe without deadlocking.
    pub fn emit(&self, event: &ChangeEvent) {
        let snapshot: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Check whether anyone is listening.
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }
}

impl std::fmt::Debug for ChangeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().unwrap().len();
        f.debug_struct("ChangeSignal").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::{Point, PointKind};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_duplicate_subscription_replaces() {
        let signal = ChangeSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            signal.connect(
                SubscriberId(7),
                Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let point = Point::builder(PointKind::Signal, "sw1", 1, 0x0001, 1).build();
        signal.emit(&ChangeEvent {
            point,
            related: None,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect() {
        let signal = ChangeSignal::new();
        signal.connect(SubscriberId(1), Arc::new(|_| {}));
        assert!(!signal.is_empty());
        signal.disconnect(SubscriberId(1));
        assert!(signal.is_empty());
    }

    #[test]
    fn test_point_ids_are_unique() {
        let a = next_point_id();
        let b = next_point_id();
        assert_ne!(a, b);
    }
}
