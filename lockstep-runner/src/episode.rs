//! Episode drivers run by the binary.
//!
//! The handshake episode exercises every coordination primitive: both bots
//! draw a plan from the shared RNG, exchange it under `ready`, answer with
//! `stop`, and arm the next episode from inside the `stop` handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use anyhow::{Context, bail};
use async_trait::async_trait;
use lockstep::{
    CompletionError, CompletionReport, EpisodeScope, SharedRng, decide_primary, pick_random,
};
use serde::{Deserialize, Serialize};

const READY: &str = "ready";
const STOP: &str = "stop";

const HEADINGS: [&str; 4] = ["north", "east", "south", "west"];

/// Chains the phases of one kind of episode.
#[async_trait]
pub trait EpisodeDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register the episode's once-handlers. Idempotent per episode.
    fn arm(&self, scope: &EpisodeScope) -> anyhow::Result<()>;

    /// Send this bot's opening event and wait for the episode to finish.
    async fn run(&self, scope: &EpisodeScope) -> Result<CompletionReport, CompletionError>;
}

/// What each bot believes the pair agreed on for one episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub bot: String,
    pub primary: bool,
    pub heading: String,
    /// Shared RNG draws consumed once this plan was drawn.
    pub draws: u64,
}

impl Plan {
    /// Check the peer's plan against ours; exactly one primary, same heading.
    pub fn check_against(&self, peer: &Plan) -> anyhow::Result<()> {
        if self.draws != peer.draws {
            bail!(
                "shared RNG out of step: {} drew {} times, {} drew {} times",
                self.bot,
                self.draws,
                peer.bot,
                peer.draws
            );
        }
        if self.primary == peer.primary {
            bail!(
                "role disagreement: {} primary={}, {} primary={}",
                self.bot,
                self.primary,
                peer.bot,
                peer.primary
            );
        }
        if self.heading != peer.heading {
            bail!(
                "heading disagreement: {} chose {}, {} chose {}",
                self.bot,
                self.heading,
                peer.bot,
                peer.heading
            );
        }
        Ok(())
    }
}

struct HandshakeState {
    local_name: String,
    peer_name: String,
    last_episode: u64,
    rng: StdMutex<SharedRng>,
    plans: StdMutex<HashMap<u64, Plan>>,
}

/// Two-phase demonstration episode.
#[derive(Clone)]
pub struct Handshake {
    state: Arc<HandshakeState>,
}

impl Handshake {
    pub fn new(
        local_name: impl Into<String>,
        peer_name: impl Into<String>,
        rng: SharedRng,
        episodes: u64,
    ) -> Self {
        Self {
            state: Arc::new(HandshakeState {
                local_name: local_name.into(),
                peer_name: peer_name.into(),
                last_episode: episodes.saturating_sub(1),
                rng: StdMutex::new(rng),
                plans: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn plan(&self, episode: u64) -> Option<Plan> {
        lock(&self.state.plans).ok()?.get(&episode).cloned()
    }

    fn draw_plan(&self) -> anyhow::Result<Plan> {
        let state = &self.state;
        let mut rng = lock(&state.rng)?;
        let primary = decide_primary(&state.local_name, &state.peer_name, &mut *rng);
        let heading = pick_random(&HEADINGS, &mut *rng)
            .copied()
            .unwrap_or(HEADINGS[0]);
        Ok(Plan {
            bot: state.local_name.clone(),
            primary,
            heading: heading.to_string(),
            draws: rng.draws(),
        })
    }
}

#[async_trait]
impl EpisodeDriver for Handshake {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn arm(&self, scope: &EpisodeScope) -> anyhow::Result<()> {
        let episode = scope.number();
        if lock(&self.state.plans)?.contains_key(&episode) {
            return Ok(());
        }

        let plan = self.draw_plan()?;
        tracing::debug!(
            episode,
            primary = plan.primary,
            heading = %plan.heading,
            draws = plan.draws,
            "Episode armed"
        );
        lock(&self.state.plans)?.insert(episode, plan.clone());

        let reply = scope.clone();
        scope.register_once(READY, move |params| async move {
            reply.send_to_peer(STOP, &plan).await?;
            let peer: Plan =
                serde_json::from_value(params).context("peer sent an unreadable plan")?;
            plan.check_against(&peer)?;
            tracing::info!(
                episode = reply.number(),
                peer = %peer.bot,
                primary = plan.primary,
                heading = %plan.heading,
                "Agreed with peer"
            );
            anyhow::Ok(())
        })?;

        // Armed synchronously on the dispatcher: the peer's next `ready`
        // follows its `stop` on the same connection.
        let driver = self.clone();
        let next = scope.coordinator().episode(episode + 1);
        let last_episode = self.state.last_episode;
        scope.register_once(STOP, move |_| {
            let armed = if episode < last_episode {
                driver.arm(&next)
            } else {
                Ok(())
            };
            async move { armed }
        })?;
        Ok(())
    }

    async fn run(&self, scope: &EpisodeScope) -> Result<CompletionReport, CompletionError> {
        match self.plan(scope.number()) {
            Some(plan) => match scope.send_to_peer(READY, &plan).await {
                Ok(delivery) => {
                    tracing::debug!(episode = scope.number(), ?delivery, "Sent ready")
                }
                Err(e) => {
                    tracing::warn!(episode = scope.number(), error = %e, "Failed to send ready")
                }
            },
            None => tracing::error!(episode = scope.number(), "Episode was never armed"),
        }
        scope.wait_for_all_phases_to_finish().await
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> anyhow::Result<MutexGuard<'_, T>> {
    match mutex.lock() {
        Ok(guard) => Ok(guard),
        Err(_poisoned) => {
            tracing::error!("Handshake state mutex poisoned");
            bail!("handshake state mutex poisoned")
        }
    }
}
