//! lockstep: two-peer phase barrier for agents running an episode in lockstep.

mod version;

pub mod agreement;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod router;
pub mod tracker;

pub use coordinator::{Coordinator, Delivery, EpisodeScope};

pub use agreement::{SharedRng, decide_primary, draw_index, pick_random};
pub use bridge::protocol::{EventName, PeerMessage};
pub use bridge::transport::{Backoff, ConnectionState, RetryPolicy};
pub use config::{CoordinatorConfig, PeerIdentity};
pub use error::{CompletionError, ConfigError, CoordinatorError, HandlerError, TransportError};
pub use tracker::{CompletionReport, HandlerId, HandlerState, WaitScope};
pub use version::{LOCKSTEP_VERSION, VersionInfo};
