//! Error taxonomy for the coordination core.
//!
//! Every kind here is recovered locally by the coordinator except a listener
//! that cannot bind at startup and a retry policy that has run out of attempts.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::bridge::protocol::EventName;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind peer listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("gave up connecting to peer at {addr} after {attempts} attempts: {last_error}")]
    GaveUp {
        addr: String,
        attempts: u32,
        #[source]
        last_error: io::Error,
    },

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure of a single phase handler.
///
/// Never sent to the peer. Collected by the completion tracker and reported
/// from the completion wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler for {event} failed: {message}")]
    Failed { event: EventName, message: String },

    #[error("handler for {event} panicked: {message}")]
    Panicked { event: EventName, message: String },
}

impl HandlerError {
    pub fn event(&self) -> &EventName {
        match self {
            Self::Failed { event, .. } | Self::Panicked { event, .. } => event,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("a once-handler is already registered for {0}")]
    DuplicateRegistration(EventName),

    #[error("failed to encode payload for {event}: {source}")]
    Encode {
        event: EventName,
        #[source]
        source: serde_json::Error,
    },

    #[error("connections have already been set up")]
    AlreadyStarted,

    #[error("coordinator has been shut down")]
    ShutDown,
}

/// Completion wait ran past its bound.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("timed out after {waited:?} with {pending} handler(s) pending (episode {episode:?})")]
    TimedOut {
        episode: Option<u64>,
        pending: usize,
        waited: Duration,
        failures: Vec<HandlerError>,
    },
}

impl CompletionError {
    pub fn pending(&self) -> usize {
        match self {
            Self::TimedOut { pending, .. } => *pending,
        }
    }

    pub fn failures(&self) -> &[HandlerError] {
        match self {
            Self::TimedOut { failures, .. } => failures,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}
