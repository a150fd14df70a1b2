//! Peer channel plumbing.
//!
//! - **protocol**: `PeerMessage` wire type and episode-namespaced `EventName`
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: listener, connect-with-retry and connection states

pub mod codec;
pub mod protocol;
pub mod transport;
