// src/ccp/listener.rs

//! Broadcast subscriptions by event type, independent of correlation.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;

use crate::ccp::{Dispatch, EventType};
use crate::error::Result;

/// Observes every inbound event of the types it is subscribed to
pub trait EventListener: Send + Sync {
    fn on_event(&self, dispatch: &Dispatch) -> Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&Dispatch) -> Result<()> + Send + Sync,
{
    fn on_event(&self, dispatch: &Dispatch) -> Result<()> {
        self(dispatch)
    }
}

/// Listeners keyed by event type, then by caller-chosen listener id
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<EventType, HashMap<String, Arc<dyn EventListener>>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("event_types", &self.listeners.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the listener registered under `listener_id`
    pub fn subscribe(
        &self,
        event_type: EventType,
        listener_id: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) {
        let listener_id = listener_id.into();
        let replaced = self
            .listeners
            .entry(event_type)
            .or_default()
            .insert(listener_id.clone(), listener)
            .is_some();
        tracing::debug!(
            "Listener '{}' {} for {}",
            listener_id,
            if replaced { "replaced" } else { "subscribed" },
            event_type
        );
    }

    pub fn unsubscribe(&self, event_type: EventType, listener_id: &str) -> bool {
        self.listeners
            .get_mut(&event_type)
            .map(|mut listeners| listeners.remove(listener_id).is_some())
            .unwrap_or(false)
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.listeners
            .get(&event_type)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Delivers `dispatch` to every listener of its type.
    ///
    /// Errors and panics are logged per listener and never stop delivery to
    /// the rest. Returns the number of listeners that handled it cleanly.
    pub fn fan_out(&self, dispatch: &Dispatch) -> usize {
        let event_type = dispatch.event_type();
        // Snapshot, so (un)subscribing from inside a listener cannot deadlock.
        let targets: Vec<(String, Arc<dyn EventListener>)> = match self.listeners.get(&event_type)
        {
            Some(listeners) => listeners
                .iter()
                .map(|(id, listener)| (id.clone(), Arc::clone(listener)))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (listener_id, listener) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(dispatch))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::error!(
                        "Listener '{}' failed to handle {} from {}: {}",
                        listener_id,
                        event_type,
                        dispatch.source,
                        e
                    );
                }
                Err(_) => {
                    tracing::error!(
                        "Listener '{}' panicked handling {} from {}",
                        listener_id,
                        event_type,
                        dispatch.source
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccp::event::{ComponentState, ControlEvent, Status};
    use crate::error::{Error, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status_dispatch() -> Dispatch {
        Dispatch::new(
            "App1__comp1",
            ControlEvent::new(Status::new(ComponentState::Running, "up")),
        )
    }

    fn counting_listener() -> (Arc<AtomicUsize>, Arc<dyn EventListener>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let listener: Arc<dyn EventListener> = Arc::new(move |_: &Dispatch| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (calls, listener)
    }

    #[test]
    fn test_resubscribe_replaces() {
        let registry = ListenerRegistry::new();
        let (first_calls, first) = counting_listener();
        let (second_calls, second) = counting_listener();

        registry.subscribe(EventType::Status, "L1", first);
        registry.subscribe(EventType::Status, "L1", second);
        assert_eq!(registry.listener_count(EventType::Status), 1);

        assert_eq!(registry.fan_out(&status_dispatch()), 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_mid_stream() {
        let registry = ListenerRegistry::new();
        let (l1_calls, l1) = counting_listener();
        let (l2_calls, l2) = counting_listener();
        registry.subscribe(EventType::Status, "L1", l1);
        registry.subscribe(EventType::Status, "L2", l2);

        registry.fan_out(&status_dispatch());
        assert!(registry.unsubscribe(EventType::Status, "L1"));
        assert!(!registry.unsubscribe(EventType::Status, "L1"));
        registry.fan_out(&status_dispatch());

        assert_eq!(l1_calls.load(Ordering::SeqCst), 1);
        assert_eq!(l2_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_only_matching_type_is_delivered() {
        let registry = ListenerRegistry::new();
        let (calls, listener) = counting_listener();
        registry.subscribe(EventType::Handshake, "L1", listener);
        assert_eq!(registry.fan_out(&status_dispatch()), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listeners_are_isolated() {
        let registry = ListenerRegistry::new();
        let (calls, healthy) = counting_listener();
        let failing: Arc<dyn EventListener> = Arc::new(|_: &Dispatch| -> Result<()> {
            Err(Error::new(ErrorKind::Application, "listener rejected event"))
        });
        let panicking: Arc<dyn EventListener> =
            Arc::new(|_: &Dispatch| -> Result<()> { panic!("listener bug") });

        registry.subscribe(EventType::Status, "failing", failing);
        registry.subscribe(EventType::Status, "panicking", panicking);
        registry.subscribe(EventType::Status, "healthy", healthy);

        assert_eq!(registry.fan_out(&status_dispatch()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let inner = Arc::clone(&registry);
        let one_shot: Arc<dyn EventListener> = Arc::new(move |_: &Dispatch| -> Result<()> {
            inner.unsubscribe(EventType::Status, "one-shot");
            Ok(())
        });
        registry.subscribe(EventType::Status, "one-shot", one_shot);

        assert_eq!(registry.fan_out(&status_dispatch()), 1);
        assert_eq!(registry.fan_out(&status_dispatch()), 0);
    }
}
