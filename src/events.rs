use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use crate::hash::Signature;

/// Task lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    /// A persisted output was found for the task's signature.
    CacheHit,
    /// The persistence store was consulted and had no usable record.
    CacheMiss,
}

/// A lifecycle event, delivered synchronously on the executing thread.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub task: String,
    pub signature: Signature,
}

pub(crate) type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-out of lifecycle events to registered observers.
///
/// Observer panics are caught and logged; they never reach the scheduler.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, listener: Listener) {
        self.listeners.write().unwrap().push(listener);
    }

    pub(crate) fn emit(&self, event: &Event) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(task = %event.task, kind = ?event.kind, "event listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn listeners_receive_events_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.kind);
        }));

        let event = |kind| Event {
            kind,
            task: "t".to_string(),
            signature: Signature(1),
        };
        bus.emit(&event(EventKind::TaskStarted));
        bus.emit(&event(EventKind::TaskCompleted));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::TaskStarted, EventKind::TaskCompleted],
        );
    }

    #[test]
    fn panicking_listener_does_not_poison_the_bus() {
        let bus = EventBus::default();
        bus.subscribe(Arc::new(|_: &Event| panic!("observer bug")));

        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        bus.subscribe(Arc::new(move |_: &Event| {
            *sink.lock().unwrap() += 1;
        }));

        let event = Event {
            kind: EventKind::TaskStarted,
            task: "t".to_string(),
            signature: Signature(1),
        };
        bus.emit(&event);
        bus.emit(&event);

        // The healthy listener still saw both emissions.
        assert_eq!(*seen.lock().unwrap(), 2);
    }
}
