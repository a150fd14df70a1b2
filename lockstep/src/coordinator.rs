//! Coordinator - the two-peer message bus and phase barrier.
//!
//! Flow:
//! 1. Bind the listener (fatal if the port is unavailable)
//! 2. Accept the peer's outbound connection and connect to the peer's
//!    listener concurrently; ready once both are up
//! 3. Every inbound frame, from any connection, goes through one dispatcher
//!    task that routes it to the subscriber table in arrival order
//! 4. Once-handlers run on their own tasks, tracked to completion
//! 5. If the outbound connection closes, reconnect after the retry interval;
//!    messages sent meanwhile are dropped, not queued
//!
//! A phase transition is "register a once-handler for the next phase, then
//! send the current phase's event". Both peers run the same driver code, so
//! each send on one side meets a registration on the other.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{EventName, PeerMessage};
use crate::bridge::transport::{ConnectionState, PeerListener, connect_with_retry};
use crate::config::CoordinatorConfig;
use crate::error::{CompletionError, CoordinatorError, TransportError};
use crate::router::{EventRouter, OnceHandler};
use crate::tracker::{CompletionReport, CompletionTracker, HandlerId, WaitScope};

type PeerWriter = FramedWrite<OwnedWriteHalf, JsonLinesCodec<PeerMessage>>;

/// Write side of the current outbound connection.
struct OutboundLink {
    writer: PeerWriter,
    /// Cancelled by a failed write so the supervisor drops this connection.
    broken: CancellationToken,
}

/// Inbound frames buffered between reader tasks and the dispatcher.
const DISPATCH_QUEUE_DEPTH: usize = 256;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What happened to a message handed to [`Coordinator::send_to_peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the outbound connection.
    Sent,
    /// No outbound connection, or the write failed. The message is gone.
    Dropped,
}

/// Handle to the coordination core. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    router: EventRouter,
    tracker: Arc<CompletionTracker>,
    outbound: Mutex<Option<OutboundLink>>,
    outbound_state: watch::Sender<ConnectionState>,
    inbound_state: watch::Sender<ConnectionState>,
    inbound_connections: AtomicUsize,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (outbound_state, _) = watch::channel(ConnectionState::Connecting);
        let (inbound_state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(Inner {
                config,
                router: EventRouter::new(),
                tracker: CompletionTracker::new(),
                outbound: Mutex::new(None),
                outbound_state,
                inbound_state,
                inbound_connections: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn local_name(&self) -> &str {
        &self.inner.config.identity.local_name
    }

    /// Listen and connect concurrently; resolves once both directions are up.
    ///
    /// Fails if the listen port cannot be bound, if a bounded retry policy runs
    /// out before the peer is reachable, or if the coordinator is shut down
    /// first. A failed setup releases the listen port and may be retried.
    /// Handlers may be registered before calling this.
    pub async fn setup_connections(&self) -> Result<(), CoordinatorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShutDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CoordinatorError::AlreadyStarted);
        }

        let identity = &self.inner.config.identity;
        let listener = match PeerListener::bind(identity.listen_port).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        tracing::info!(
            bot = %identity.local_name,
            listen = %listener.local_addr(),
            peer = %identity.peer_addr(),
            "Setting up peer connections"
        );

        // Cancelled with the coordinator, or on its own if setup fails.
        let session = self.inner.shutdown.child_token();

        let (frame_tx, frame_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner),
            frame_rx,
            session.clone(),
        ));

        let (inbound_ready_tx, inbound_ready_rx) = oneshot::channel();
        tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            frame_tx.clone(),
            inbound_ready_tx,
            session.clone(),
        ));

        let (outbound_ready_tx, outbound_ready_rx) = oneshot::channel();
        tokio::spawn(outbound_loop(
            Arc::clone(&self.inner),
            frame_tx,
            outbound_ready_tx,
            session.clone(),
        ));

        let inbound = async {
            inbound_ready_rx
                .await
                .map_err(|_| CoordinatorError::ShutDown)
        };
        let outbound = async {
            match outbound_ready_rx.await {
                Ok(result) => result.map_err(CoordinatorError::from),
                Err(_) => Err(CoordinatorError::ShutDown),
            }
        };
        if let Err(e) = tokio::try_join!(inbound, outbound) {
            tracing::warn!(bot = %identity.local_name, error = %e, "Peer channel setup failed");
            session.cancel();
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::info!(bot = %identity.local_name, "Peer channel ready");
        Ok(())
    }

    /// Register a handler that runs at most once, on the first `event` from the peer.
    ///
    /// The handler is unsubscribed before it runs, whether it then succeeds,
    /// fails or panics. The closure itself is called on the dispatcher before
    /// the next inbound message is routed, so follow-up phases registered in
    /// the closure body (outside the returned future) are in place before any
    /// later message from the peer arrives.
    pub fn register_once<F, Fut>(
        &self,
        event: impl Into<EventName>,
        handler: F,
    ) -> Result<HandlerId, CoordinatorError>
    where
        F: FnOnce(serde_json::Value) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShutDown);
        }
        let event = event.into();
        let id = self.inner.tracker.register(&event);
        let handler: OnceHandler = Box::new(move |params| handler(params).boxed());
        if let Err(e) = self.inner.router.subscribe_once(event.clone(), id, handler) {
            self.inner.tracker.forget(id);
            return Err(e);
        }
        tracing::debug!(event = %event, handler_id = %id, "Once-handler registered");
        Ok(id)
    }

    /// Remove a once-handler that has not fired yet.
    pub fn unregister(&self, event: &EventName, id: HandlerId) -> bool {
        let removed = self.inner.router.unsubscribe(event, id);
        if removed {
            self.inner.tracker.forget(id);
        }
        removed
    }

    /// Send `event` with `payload` to the peer over the outbound connection.
    ///
    /// Without an established outbound connection the message is dropped and
    /// logged; there is no queue and no retry at the message level.
    pub async fn send_to_peer<P: Serialize>(
        &self,
        event: impl Into<EventName>,
        payload: P,
    ) -> Result<Delivery, CoordinatorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShutDown);
        }
        let event = event.into();
        let params = serde_json::to_value(payload).map_err(|source| CoordinatorError::Encode {
            event: event.clone(),
            source,
        })?;

        let mut outbound = self.inner.outbound.lock().await;
        let Some(link) = outbound.as_mut() else {
            tracing::info!(event = %event, "Not connected to peer, dropping message");
            return Ok(Delivery::Dropped);
        };

        match link.writer.send(PeerMessage::new(event.clone(), params)).await {
            Ok(()) => {
                tracing::debug!(event = %event, "Sent event to peer");
                Ok(Delivery::Sent)
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                tracing::warn!(event = %event, error = %e, "Message too large, dropping");
                Ok(Delivery::Dropped)
            }
            Err(e) => {
                tracing::warn!(event = %event, error = %e, "Write to peer failed, dropping connection");
                if let Some(link) = outbound.take() {
                    link.broken.cancel();
                }
                drop(outbound);
                self.inner.outbound_state.send_replace(ConnectionState::Closed);
                Ok(Delivery::Dropped)
            }
        }
    }

    /// Wait for every tracked once-handler, across all episodes, to finish.
    pub async fn wait_for_all_phases_to_finish(
        &self,
    ) -> Result<CompletionReport, CompletionError> {
        self.wait(WaitScope::All).await
    }

    pub async fn wait(&self, scope: WaitScope) -> Result<CompletionReport, CompletionError> {
        self.inner
            .tracker
            .wait(scope, self.inner.config.completion_timeout)
            .await
    }

    pub fn pending_handlers(&self, scope: WaitScope) -> usize {
        self.inner.tracker.pending_handlers(scope)
    }

    /// View of this coordinator that namespaces every event by `episode`.
    pub fn episode(&self, episode: u64) -> EpisodeScope {
        EpisodeScope {
            coordinator: self.clone(),
            episode,
        }
    }

    pub fn outbound_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.outbound_state.subscribe()
    }

    pub fn inbound_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.inbound_state.subscribe()
    }

    /// Whether at least one inbound connection from the peer is open.
    pub fn inbound_connected(&self) -> bool {
        self.inner.inbound_connections.load(Ordering::SeqCst) > 0
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound_state.borrow().is_connected()
            && self.inner.inbound_state.borrow().is_connected()
    }

    /// Stop accepting, reconnecting and dispatching. Handlers already running finish.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(bot = %self.local_name(), "Shutting down coordinator");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Coordinator view bound to one episode number.
///
/// Base names passed here become `episode_{n}_{base}` on the wire, so a
/// handler left over from one episode never fires on another episode's message.
#[derive(Clone)]
pub struct EpisodeScope {
    coordinator: Coordinator,
    episode: u64,
}

impl EpisodeScope {
    pub fn number(&self) -> u64 {
        self.episode
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn event(&self, base: &str) -> EventName {
        EventName::namespaced(self.episode, base)
    }

    pub fn register_once<F, Fut>(&self, base: &str, handler: F) -> Result<HandlerId, CoordinatorError>
    where
        F: FnOnce(serde_json::Value) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.coordinator.register_once(self.event(base), handler)
    }

    pub async fn send_to_peer<P: Serialize>(
        &self,
        base: &str,
        payload: P,
    ) -> Result<Delivery, CoordinatorError> {
        self.coordinator.send_to_peer(self.event(base), payload).await
    }

    /// Wait for this episode's once-handlers only.
    pub async fn wait_for_all_phases_to_finish(
        &self,
    ) -> Result<CompletionReport, CompletionError> {
        self.coordinator.wait(WaitScope::Episode(self.episode)).await
    }

    pub fn pending_handlers(&self) -> usize {
        self.coordinator
            .pending_handlers(WaitScope::Episode(self.episode))
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut frames: mpsc::Receiver<PeerMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = frames.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        tracing::trace!(event = %message.event_name, "Dispatching event");

        if let Some(invocation) = inner.router.route(message) {
            inner
                .tracker
                .execute(invocation.handler_id, invocation.future);
        }
    }
    tracing::debug!("Dispatcher stopped");
}

/// Wait out [`ACCEPT_ERROR_BACKOFF`]. Returns true if cancelled meanwhile.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => false,
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: PeerListener,
    frames: mpsc::Sender<PeerMessage>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut ready = Some(ready);
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept peer connection");
                if accept_backoff(&cancel).await {
                    break;
                }
                continue;
            }
        };

        let open = inner.inbound_connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(%remote, open_connections = open, "Peer connected to listener");
        inner.inbound_state.send_replace(ConnectionState::Connected);
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }

        let inner = Arc::clone(&inner);
        let frames = frames.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            serve_inbound(&inner, stream, frames, &cancel).await;
            let open = inner.inbound_connections.fetch_sub(1, Ordering::SeqCst) - 1;
            tracing::info!(%remote, open_connections = open, "Inbound peer connection closed");
            if open == 0 {
                inner.inbound_state.send_replace(ConnectionState::Closed);
            }
        });
    }
    tracing::debug!("Accept loop stopped");
}

async fn serve_inbound(
    inner: &Inner,
    stream: TcpStream,
    frames: mpsc::Sender<PeerMessage>,
    cancel: &CancellationToken,
) {
    // The write half stays open for the life of the connection: the peer
    // treats EOF on its outbound socket as a closed connection.
    let (read_half, _write_half) = stream.into_split();
    let reader = FramedRead::new(
        read_half,
        JsonLinesCodec::with_max_line_bytes(inner.config.max_line_bytes),
    );
    read_frames("inbound", reader, &frames, cancel).await;
}

/// Forward decoded frames until the connection closes or the coordinator stops.
async fn read_frames<R: AsyncRead + Unpin>(
    direction: &'static str,
    mut reader: FramedRead<R, JsonLinesCodec<PeerMessage>>,
    frames: &mpsc::Sender<PeerMessage>,
    shutdown: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(message)) => {
                tracing::trace!(direction, event = %message.event_name, "Frame received");
                if frames.send(message).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(direction, error = %e, "Peer read error");
                break;
            }
            None => {
                tracing::debug!(direction, "Peer connection reached EOF");
                break;
            }
        }
    }
}

async fn outbound_loop(
    inner: Arc<Inner>,
    frames: mpsc::Sender<PeerMessage>,
    ready: oneshot::Sender<Result<(), TransportError>>,
    cancel: CancellationToken,
) {
    let mut ready = Some(ready);
    let identity = &inner.config.identity;
    let policy = inner.config.retry;

    loop {
        let stream = match connect_with_retry(
            &identity.peer_host,
            identity.peer_port,
            &policy,
            &cancel,
        )
        .await
        {
            Ok(stream) => stream,
            Err(TransportError::Cancelled) => break,
            Err(e) => {
                inner.outbound_state.send_replace(ConnectionState::GaveUp);
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => {
                        tracing::error!(error = %e, "Outbound connection lost for good");
                    }
                }
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let codec = || JsonLinesCodec::with_max_line_bytes(inner.config.max_line_bytes);
        let broken = CancellationToken::new();
        *inner.outbound.lock().await = Some(OutboundLink {
            writer: FramedWrite::new(write_half, codec()),
            broken: broken.clone(),
        });
        inner.outbound_state.send_replace(ConnectionState::Connected);
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }

        // The peer never writes on this connection; reading only detects close.
        tokio::select! {
            _ = read_frames("outbound", FramedRead::new(read_half, codec()), &frames, &cancel) => {}
            _ = broken.cancelled() => {}
        }
        inner.outbound.lock().await.take();
        inner.outbound_state.send_replace(ConnectionState::Closed);

        if cancel.is_cancelled() {
            break;
        }

        let delay = policy.reconnect_delay();
        tracing::warn!(
            peer = %identity.peer_addr(),
            delay_ms = delay.as_millis() as u64,
            "Outbound peer connection closed, reconnecting"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        inner.outbound_state.send_replace(ConnectionState::Reconnecting);
    }

    inner.outbound.lock().await.take();
    inner.outbound_state.send_replace(ConnectionState::Closed);
    tracing::debug!("Outbound loop stopped");
}
