//! Completion tracking for once-handlers.
//!
//! Every once-handler gets a registration that moves `Pending -> Executing ->
//! Done`. `Done` is reached whether the handler returned `Ok`, returned `Err`
//! or panicked, so a failing handler never blocks teardown. The completion wait
//! reports failures instead of swallowing them and distinguishes "all done"
//! from "timed out with N still pending".

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bridge::protocol::EventName;
use crate::error::{CompletionError, HandlerError};

pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Future produced by a phase handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Unique identifier for a handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(uuid::Uuid);

impl HandlerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Pending,
    Executing,
    Done,
}

struct Registration {
    event: EventName,
    state: HandlerState,
    error: Option<HandlerError>,
}

/// Which registrations a completion wait covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitScope {
    Episode(u64),
    /// Registrations whose event name carries no episode namespace.
    Unscoped,
    All,
}

impl WaitScope {
    fn covers(&self, event: &EventName) -> bool {
        match self {
            Self::Episode(n) => event.episode() == Some(*n),
            Self::Unscoped => event.episode().is_none(),
            Self::All => true,
        }
    }

    fn episode(&self) -> Option<u64> {
        match self {
            Self::Episode(n) => Some(*n),
            _ => None,
        }
    }
}

/// Outcome of a completion wait in which every covered handler finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionReport {
    pub episode: Option<u64>,
    pub completed: usize,
    pub failures: Vec<HandlerError>,
}

impl CompletionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub struct CompletionTracker {
    registrations: DashMap<HandlerId, Registration>,
    changed: Notify,
}

impl CompletionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, event: &EventName) -> HandlerId {
        let id = HandlerId::new();
        self.registrations.insert(
            id,
            Registration {
                event: event.clone(),
                state: HandlerState::Pending,
                error: None,
            },
        );
        tracing::trace!(handler_id = %id, event = %event, "Handler registered");
        id
    }

    /// Drop a registration that will never be invoked (unsubscribed or rejected).
    pub fn forget(&self, id: HandlerId) {
        if self.registrations.remove(&id).is_some() {
            self.changed.notify_waiters();
        }
    }

    pub fn state(&self, id: HandlerId) -> Option<HandlerState> {
        self.registrations.get(&id).map(|r| r.state)
    }

    /// Registrations in `scope` that have not reached `Done`.
    pub fn pending_handlers(&self, scope: WaitScope) -> usize {
        self.registrations
            .iter()
            .filter(|r| r.state != HandlerState::Done && scope.covers(&r.event))
            .count()
    }

    /// Mark `id` executing and run `future` to completion on its own task.
    ///
    /// The state changes before this returns, so a completion wait started
    /// right after dispatch already sees the handler as running.
    pub fn execute(self: &Arc<Self>, id: HandlerId, future: HandlerFuture) -> JoinHandle<()> {
        let event = match self.registrations.get_mut(&id) {
            Some(mut registration) => {
                registration.state = HandlerState::Executing;
                registration.event.clone()
            }
            None => {
                tracing::error!(handler_id = %id, "Bug: executing handler with no registration");
                EventName::new("<unregistered>")
            }
        };

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(handler_id = %id, event = %event, "Handler started");
            let error = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(HandlerError::Failed {
                    event: event.clone(),
                    message: format!("{e:#}"),
                }),
                Err(panic) => Some(HandlerError::Panicked {
                    event: event.clone(),
                    message: panic_message(panic.as_ref()),
                }),
            };
            match &error {
                Some(e) => tracing::warn!(handler_id = %id, error = %e, "Handler failed"),
                None => tracing::debug!(handler_id = %id, event = %event, "Handler finished"),
            }
            tracker.finish(id, error);
        })
    }

    fn finish(&self, id: HandlerId, error: Option<HandlerError>) {
        if let Some(mut registration) = self.registrations.get_mut(&id) {
            registration.state = HandlerState::Done;
            registration.error = error;
        }
        self.changed.notify_waiters();
    }

    /// Wait until every registration in `scope` is done, bounded by `timeout`.
    ///
    /// Finished registrations in `scope` are drained on return either way;
    /// registrations still pending after a timeout stay tracked.
    pub async fn wait(
        &self,
        scope: WaitScope,
        timeout: Duration,
    ) -> Result<CompletionReport, CompletionError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.pending_handlers(scope) == 0 {
                return Ok(self.drain_finished(scope));
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                let pending = self.pending_handlers(scope);
                if pending == 0 {
                    return Ok(self.drain_finished(scope));
                }
                let report = self.drain_finished(scope);
                tracing::warn!(
                    episode = ?scope.episode(),
                    pending,
                    waited_ms = timeout.as_millis() as u64,
                    "Timed out waiting for phase handlers"
                );
                return Err(CompletionError::TimedOut {
                    episode: scope.episode(),
                    pending,
                    waited: timeout,
                    failures: report.failures,
                });
            }
        }
    }

    fn drain_finished(&self, scope: WaitScope) -> CompletionReport {
        let finished: Vec<HandlerId> = self
            .registrations
            .iter()
            .filter(|r| r.state == HandlerState::Done && scope.covers(&r.event))
            .map(|r| *r.key())
            .collect();

        let mut report = CompletionReport {
            episode: scope.episode(),
            ..CompletionReport::default()
        };
        for id in finished {
            if let Some((_, registration)) = self.registrations.remove(&id) {
                report.completed += 1;
                report.failures.extend(registration.error);
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
