//! Local subscriber table keyed by event name.
//!
//! Each event name has at most one live once-handler. The handler is removed
//! from the table in the same step that selects it for invocation, so a
//! duplicate message for a key that already fired finds no subscriber and is
//! dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::bridge::protocol::{EventName, PeerMessage};
use crate::error::CoordinatorError;
use crate::tracker::{HandlerFuture, HandlerId};

pub type OnceHandler = Box<dyn FnOnce(serde_json::Value) -> HandlerFuture + Send>;

struct Subscriber {
    id: HandlerId,
    /// The table is shared across tasks; the mutex makes a `Send`-only closure `Sync`.
    handler: StdMutex<OnceHandler>,
}

/// The handler selected for one inbound message, with its future already built.
pub struct Invocation {
    pub handler_id: HandlerId,
    pub event: EventName,
    pub future: HandlerFuture,
}

#[derive(Default)]
pub struct EventRouter {
    table: DashMap<EventName, Subscriber>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler that is removed the first time it is selected.
    pub fn subscribe_once(
        &self,
        event: EventName,
        id: HandlerId,
        handler: OnceHandler,
    ) -> Result<(), CoordinatorError> {
        match self.table.entry(event) {
            Entry::Occupied(entry) => Err(CoordinatorError::DuplicateRegistration(
                entry.key().clone(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(Subscriber {
                    id,
                    handler: StdMutex::new(handler),
                });
                Ok(())
            }
        }
    }

    /// Remove a subscriber before it fires. Returns whether it was present.
    pub fn unsubscribe(&self, event: &EventName, id: HandlerId) -> bool {
        self.table
            .remove_if(event, |_, subscriber| subscriber.id == id)
            .is_some()
    }

    pub fn is_subscribed(&self, event: &EventName) -> bool {
        self.table.contains_key(event)
    }

    /// Take the handler for `message`, if any, and call it.
    ///
    /// The closure is called after the table entry is released, so it may
    /// register follow-up handlers synchronously. A panic in the closure is
    /// caught and resurfaces from the returned future, where the completion
    /// tracker records it like any other handler panic.
    pub fn route(&self, message: PeerMessage) -> Option<Invocation> {
        let PeerMessage {
            event_name,
            event_params,
        } = message;

        let Some((event, subscriber)) = self.table.remove(&event_name) else {
            tracing::debug!(event = %event_name, "No subscriber, dropping message");
            return None;
        };

        let handler = subscriber
            .handler
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let future: HandlerFuture =
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event_params))) {
                Ok(future) => future,
                Err(panic) => {
                    tracing::warn!(
                        event = %event,
                        handler_id = %subscriber.id,
                        "Handler panicked before returning its future"
                    );
                    Box::pin(resume_panic(panic))
                }
            };

        Some(Invocation {
            handler_id: subscriber.id,
            event,
            future,
        })
    }
}

async fn resume_panic(payload: Box<dyn Any + Send>) -> anyhow::Result<()> {
    std::panic::resume_unwind(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::tracker::{CompletionTracker, WaitScope};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn done() -> HandlerFuture {
        Box::pin(async { Ok::<(), anyhow::Error>(()) })
    }

    fn recording_once(seen: &Arc<Mutex<Vec<serde_json::Value>>>) -> OnceHandler {
        let seen = Arc::clone(seen);
        Box::new(move |params| -> HandlerFuture {
            seen.lock().unwrap().push(params);
            done()
        })
    }

    #[tokio::test]
    async fn once_handler_fires_exactly_once() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let event = EventName::namespaced(0, "walkPhase");
        router
            .subscribe_once(event.clone(), HandlerId::new(), recording_once(&seen))
            .unwrap();

        let message = PeerMessage::new(event.clone(), json!({"x": 1, "y": 2, "z": 3}));
        let first = router.route(message.clone()).unwrap();
        assert_eq!(first.event, event);
        first.future.await.unwrap();

        assert!(router.route(message).is_none());
        assert_eq!(*seen.lock().unwrap(), vec![json!({"x": 1, "y": 2, "z": 3})]);
        assert!(!router.is_subscribed(&event));
    }

    #[test]
    fn second_once_handler_for_same_event_is_rejected() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let event = EventName::namespaced(2, "stopPhase");
        let first = HandlerId::new();
        router
            .subscribe_once(event.clone(), first, recording_once(&seen))
            .unwrap();

        let err = router
            .subscribe_once(event.clone(), HandlerId::new(), recording_once(&seen))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateRegistration(e) if e == event));
        assert!(router.unsubscribe(&event, first), "first handler kept");
    }

    #[test]
    fn namespaced_events_do_not_cross_episodes() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router
            .subscribe_once(
                EventName::namespaced(6, "walkPhase"),
                HandlerId::new(),
                recording_once(&seen),
            )
            .unwrap();

        let stale = router.route(PeerMessage::new(
            EventName::namespaced(7, "walkPhase"),
            json!(null),
        ));
        assert!(stale.is_none());
        assert!(seen.lock().unwrap().is_empty());
        assert!(router.is_subscribed(&EventName::namespaced(6, "walkPhase")));
    }

    #[test]
    fn router_is_shareable_across_tasks() {
        fn shareable<T: Send + Sync + 'static>() {}
        shareable::<EventRouter>();
    }

    #[test]
    fn message_without_subscribers_is_dropped() {
        let router = EventRouter::new();
        assert!(router.route(PeerMessage::new("nobody", json!(1))).is_none());
    }

    #[test]
    fn unsubscribe_removes_pending_handler_by_id() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let event = EventName::namespaced(1, "ready");
        let id = HandlerId::new();
        router
            .subscribe_once(event.clone(), id, recording_once(&seen))
            .unwrap();

        assert!(!router.unsubscribe(&event, HandlerId::new()));
        assert!(router.unsubscribe(&event, id));
        assert!(!router.unsubscribe(&event, id));
        assert!(router.route(PeerMessage::new(event, json!(null))).is_none());
    }

    #[test]
    fn handler_closure_may_register_follow_up_synchronously() {
        let router = Arc::new(EventRouter::new());
        let first = EventName::namespaced(0, "ready");
        let next = EventName::namespaced(0, "stop");

        let handler: OnceHandler = {
            let router = Arc::clone(&router);
            let next = next.clone();
            Box::new(move |_params| -> HandlerFuture {
                let seen = Arc::new(Mutex::new(Vec::new()));
                router
                    .subscribe_once(next, HandlerId::new(), recording_once(&seen))
                    .unwrap();
                done()
            })
        };
        router
            .subscribe_once(first.clone(), HandlerId::new(), handler)
            .unwrap();

        assert!(router.route(PeerMessage::new(first, json!(null))).is_some());
        assert!(router.is_subscribed(&next));
    }

    #[tokio::test]
    async fn panic_in_closure_body_is_reported_as_handler_panic() {
        let router = EventRouter::new();
        let tracker = CompletionTracker::new();
        let event = EventName::namespaced(0, "walkPhase");
        let id = tracker.register(&event);
        router
            .subscribe_once(
                event.clone(),
                id,
                Box::new(|_params| -> HandlerFuture { panic!("closure blew up") }),
            )
            .unwrap();

        let invocation = router
            .route(PeerMessage::new(event.clone(), json!(null)))
            .unwrap();
        tracker
            .execute(invocation.handler_id, invocation.future)
            .await
            .unwrap();

        let report = tracker
            .wait(WaitScope::Episode(0), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            report.failures,
            vec![HandlerError::Panicked {
                event,
                message: "closure blew up".to_string(),
            }]
        );
        assert!(router.route(PeerMessage::new("anything", json!(null))).is_none());
    }
}
