//! lockstep: run one bot's side of a coordinated episode sequence.
//!
//! Every option falls back to the per-bot environment variables the
//! deployment provisions, so the same binary runs unchanged in each container.

mod episode;

use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lockstep::{
    CompletionError, Coordinator, CoordinatorConfig, PeerIdentity, RetryPolicy, VersionInfo,
};

use crate::episode::{EpisodeDriver, Handshake};

#[derive(Parser, Debug)]
#[command(name = "lockstep", version, about)]
struct Args {
    /// This bot's name.
    #[arg(long, env = "BOT_NAME")]
    bot_name: String,
    /// The peer bot's name.
    #[arg(long, env = "OTHER_BOT_NAME")]
    peer_name: String,
    /// Port to accept the peer's connection on.
    #[arg(long, env = "COORD_PORT", default_value_t = 8100)]
    port: u16,
    #[arg(long, env = "OTHER_COORD_HOST")]
    peer_host: String,
    #[arg(long, env = "OTHER_COORD_PORT", default_value_t = 8100)]
    peer_port: u16,
    /// Shared RNG seed; must match the peer's.
    #[arg(long, env = "BOT_RNG_SEED", default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 1)]
    episodes: u64,
    /// Delay between connection attempts (initial delay with --retry-max-interval-ms).
    #[arg(long, default_value_t = 2000)]
    retry_interval_ms: u64,
    /// Switch to exponential backoff capped at this delay.
    #[arg(long)]
    retry_max_interval_ms: Option<u64>,
    /// Give up connecting after this many failed attempts.
    #[arg(long)]
    retry_max_attempts: Option<u32>,
    #[arg(long, default_value_t = 60)]
    completion_timeout_secs: u64,
    /// Abort on the first episode that times out or reports handler failures.
    #[arg(long)]
    strict: bool,
}

impl Args {
    fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.retry_interval_ms);
        let policy = match self.retry_max_interval_ms {
            Some(max) => RetryPolicy::exponential(initial, Duration::from_millis(max)),
            None => RetryPolicy::fixed(initial),
        };
        match self.retry_max_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }

    fn coordinator_config(&self) -> CoordinatorConfig {
        let identity = PeerIdentity::new(
            self.bot_name.clone(),
            self.port,
            self.peer_host.clone(),
            self.peer_port,
        );
        CoordinatorConfig::new(identity)
            .with_peer_name(self.peer_name.clone())
            .with_rng_seed(self.seed)
            .with_retry(self.retry_policy())
            .with_completion_timeout(Duration::from_secs(self.completion_timeout_secs))
    }
}

/// Map a LOCKSTEP_LOG value to a filter level; unknown values mean `info`.
fn log_level(value: Option<&str>) -> &'static str {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Log to stderr, as JSON when LOG_FORMAT=json. RUST_LOG overrides LOCKSTEP_LOG.
fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = log_level(std::env::var("LOCKSTEP_LOG").ok().as_deref());
            EnvFilter::new(format!("lockstep={level},lockstep_runner={level}"))
        }
    };

    let output = fmt::layer().with_writer(std::io::stderr);
    let output = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => output.json().boxed(),
        _ => output.boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let version = VersionInfo::new().with_bot(args.bot_name.clone());
    tracing::info!(
        version = %serde_json::to_string(&version)?,
        peer = %args.peer_name,
        episodes = args.episodes,
        seed = args.seed,
        "Starting lockstep runner"
    );

    let config = args.coordinator_config();
    let coordinator = Coordinator::new(config.clone());
    let driver = Handshake::new(
        args.bot_name.clone(),
        args.peer_name.clone(),
        config.shared_rng(),
        args.episodes,
    );

    if args.episodes == 0 {
        tracing::info!("No episodes requested");
        return Ok(());
    }

    // The peer may send episode 0's first event as soon as it connects.
    driver
        .arm(&coordinator.episode(0))
        .context("failed to arm first episode")?;

    tokio::select! {
        result = run_episodes(&coordinator, &driver, &args) => {
            coordinator.shutdown();
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            coordinator.shutdown();
            Ok(())
        }
    }
}

async fn run_episodes<D: EpisodeDriver>(
    coordinator: &Coordinator,
    driver: &D,
    args: &Args,
) -> anyhow::Result<()> {
    coordinator
        .setup_connections()
        .await
        .context("failed to establish peer channel")?;

    for n in 0..args.episodes {
        let scope = coordinator.episode(n);
        driver.arm(&scope)?;
        tracing::info!(episode = n, driver = driver.name(), "Episode starting");

        match driver.run(&scope).await {
            Ok(report) if report.is_clean() => {
                tracing::info!(episode = n, completed = report.completed, "Episode finished");
            }
            Ok(report) => {
                for failure in &report.failures {
                    tracing::warn!(episode = n, error = %failure, "Phase handler failed");
                }
                if args.strict {
                    bail!(
                        "episode {n} finished with {} failed handler(s)",
                        report.failures.len()
                    );
                }
            }
            Err(e @ CompletionError::TimedOut { .. }) => {
                if args.strict {
                    return Err(e).context(format!("episode {n} did not finish"));
                }
                tracing::warn!(episode = n, error = %e, "Continuing after timed-out episode");
            }
        }
    }

    tracing::info!(episodes = args.episodes, "All episodes done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep::Backoff;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "lockstep",
            "--bot-name",
            "Alpha",
            "--peer-name",
            "Bravo",
            "--peer-host",
            "sender_bravo_instance_0",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_deployment() {
        let args = parse(&[]);
        let config = args.coordinator_config();
        assert_eq!(config.identity.listen_port, 8100);
        assert_eq!(config.identity.peer_addr(), "sender_bravo_instance_0:8100");
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.completion_timeout, Duration::from_secs(60));
        assert!(!args.strict);
    }

    #[test]
    fn log_level_names() {
        assert_eq!(log_level(Some("DEBUG")), "debug");
        assert_eq!(log_level(Some("warning")), "warn");
        assert_eq!(log_level(Some("loud")), "info");
        assert_eq!(log_level(None), "info");
    }

    #[test]
    fn exponential_retry_flags() {
        let args = parse(&[
            "--retry-interval-ms",
            "100",
            "--retry-max-interval-ms",
            "1600",
            "--retry-max-attempts",
            "9",
        ]);
        let policy = args.retry_policy();
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(1600),
            }
        );
        assert_eq!(policy.max_attempts, Some(9));
    }
}
