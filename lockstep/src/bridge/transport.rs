//! TCP transport between the two peers.
//!
//! Each process owns one passive listener (the peer's outbound connection lands
//! here) and one outbound connection to the peer's listener. The two halves
//! together form a single bidirectional logical channel, and because both sides
//! listen and connect at once, the pair meets regardless of start order.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Failed attempts between `warn` logs while the peer stays unreachable.
const WARN_EVERY_ATTEMPTS: u32 = 15;

/// Delay schedule between outbound connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// When and how often to retry the outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(interval),
            max_attempts: None,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential { initial, max },
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before the next attempt, given how many attempts have failed so far.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { initial, max } => {
                let exponent = failed_attempts.saturating_sub(1);
                let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    pub fn allows_another_attempt(&self, failed_attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| failed_attempts < max)
    }

    /// Delay between an established connection closing and the first reconnect attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.delay_after(1)
    }
}

/// Lifecycle of one side of the channel.
///
/// The outbound side cycles `Connecting -> Connected -> Closed -> Reconnecting
/// -> Connected ...` and ends in `GaveUp` only under a bounded retry policy.
/// The inbound side never reconnects; it waits for the peer to connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
    Reconnecting,
    GaveUp,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Reconnecting => "reconnecting",
            Self::GaveUp => "gave_up",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passive side of the channel.
pub struct PeerListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl PeerListener {
    /// Bind on all interfaces. Failure here is the one fatal startup condition.
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| TransportError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { port, source })?;
        tracing::debug!(%local_addr, "Peer listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on inbound stream");
        }
        Ok((stream, remote))
    }
}

/// Connect to the peer, retrying according to `policy`.
///
/// Connection refused is the normal outcome while the peer is still starting,
/// so failures are logged quietly until they persist.
pub async fn connect_with_retry(
    host: &str,
    port: u16,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<TcpStream, TransportError> {
    let addr = format!("{host}:{port}");
    let mut failed_attempts: u32 = 0;

    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = TcpStream::connect((host, port)) => result,
        };

        match attempt {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY on outbound stream");
                }
                tracing::info!(peer = %addr, attempts = failed_attempts + 1, "Connected to peer");
                return Ok(stream);
            }
            Err(e) => {
                failed_attempts = failed_attempts.saturating_add(1);
                if !policy.allows_another_attempt(failed_attempts) {
                    tracing::error!(peer = %addr, attempts = failed_attempts, error = %e, "Giving up on peer connection");
                    return Err(TransportError::GaveUp {
                        addr,
                        attempts: failed_attempts,
                        last_error: e,
                    });
                }

                let delay = policy.delay_after(failed_attempts);
                if failed_attempts % WARN_EVERY_ATTEMPTS == 0 {
                    tracing::warn!(peer = %addr, attempts = failed_attempts, error = %e, "Peer still unreachable");
                } else {
                    tracing::debug!(
                        peer = %addr,
                        attempt = failed_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Peer not reachable, retrying"
                    );
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fixed_two_seconds_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_secs(2)));
        assert_eq!(policy.max_attempts, None);
        assert!(policy.allows_another_attempt(u32::MAX - 1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(500), Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(64), Duration::from_millis(1000));
    }

    #[test]
    fn bounded_policy_stops_at_max_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        assert!(policy.allows_another_attempt(2));
        assert!(!policy.allows_another_attempt(3));
    }

    #[test]
    fn connection_state_strings() {
        assert_eq!(ConnectionState::GaveUp.to_string(), "gave_up");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }

    #[tokio::test]
    async fn bounded_retry_gives_up_on_closed_port() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        let cancel = CancellationToken::new();

        let err = connect_with_retry("127.0.0.1", port, &policy, &cancel)
            .await
            .unwrap_err();
        match err {
            TransportError::GaveUp { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn retry_succeeds_once_listener_appears() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = RetryPolicy::fixed(Duration::from_millis(20));
        let cancel = CancellationToken::new();

        let connector = tokio::spawn({
            let cancel = cancel.clone();
            async move { connect_with_retry("127.0.0.1", port, &policy, &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (_accepted, _) = listener.accept().await.unwrap();

        let stream = connector.await.unwrap().unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn cancel_stops_retry_loop() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = RetryPolicy::fixed(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let connector = tokio::spawn({
            let cancel = cancel.clone();
            async move { connect_with_retry("127.0.0.1", port, &policy, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = connector.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn listener_reports_bound_port() {
        let listener = PeerListener::bind(0).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }
}
