//! Coordinator configuration.
//!
//! The hosting process supplies identity and peer address, usually through the
//! per-bot environment variables set by the deployment.

use std::str::FromStr;
use std::time::Duration;

use crate::agreement::{DEFAULT_RNG_SEED, SharedRng};
use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;
use crate::bridge::transport::RetryPolicy;
use crate::error::ConfigError;
use crate::tracker::DEFAULT_COMPLETION_TIMEOUT;

pub const ENV_BOT_NAME: &str = "BOT_NAME";
pub const ENV_OTHER_BOT_NAME: &str = "OTHER_BOT_NAME";
pub const ENV_COORD_PORT: &str = "COORD_PORT";
pub const ENV_OTHER_COORD_HOST: &str = "OTHER_COORD_HOST";
pub const ENV_OTHER_COORD_PORT: &str = "OTHER_COORD_PORT";
pub const ENV_BOT_RNG_SEED: &str = "BOT_RNG_SEED";

/// Who this process is and where its peer listens. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub local_name: String,
    pub listen_port: u16,
    pub peer_host: String,
    pub peer_port: u16,
}

impl PeerIdentity {
    pub fn new(
        local_name: impl Into<String>,
        listen_port: u16,
        peer_host: impl Into<String>,
        peer_port: u16,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            listen_port,
            peer_host: peer_host.into(),
            peer_port,
        }
    }

    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.peer_host, self.peer_port)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub identity: PeerIdentity,
    /// Peer's bot name, needed for role agreement.
    pub peer_name: Option<String>,
    /// Must match the peer's seed.
    pub rng_seed: u64,
    pub retry: RetryPolicy,
    pub completion_timeout: Duration,
    pub max_line_bytes: usize,
}

impl CoordinatorConfig {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            peer_name: None,
            rng_seed: DEFAULT_RNG_SEED,
            retry: RetryPolicy::default(),
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Fresh generator at the start of the shared stream.
    pub fn shared_rng(&self) -> SharedRng {
        SharedRng::seeded(self.rng_seed)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// `BOT_NAME`, `COORD_PORT`, `OTHER_COORD_HOST` and `OTHER_COORD_PORT` are
    /// required. `OTHER_BOT_NAME` and `BOT_RNG_SEED` are optional.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let identity = PeerIdentity::new(
            required(ENV_BOT_NAME)?,
            parse_var(ENV_COORD_PORT, &required(ENV_COORD_PORT)?)?,
            required(ENV_OTHER_COORD_HOST)?,
            parse_var(ENV_OTHER_COORD_PORT, &required(ENV_OTHER_COORD_PORT)?)?,
        );

        let mut config = Self::new(identity);
        if let Some(peer_name) = lookup(ENV_OTHER_BOT_NAME).filter(|v| !v.trim().is_empty()) {
            config = config.with_peer_name(peer_name);
        }
        if let Some(seed) = lookup(ENV_BOT_RNG_SEED) {
            config = config.with_rng_seed(parse_var(ENV_BOT_RNG_SEED, &seed)?);
        }
        Ok(config)
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
