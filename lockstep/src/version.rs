//! Version information for lockstep.

/// Lockstep version from Cargo.toml
pub const LOCKSTEP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version reported by a running coordinator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub lockstep: &'static str,
    /// Bot name of the process reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            lockstep: LOCKSTEP_VERSION,
            bot: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bot(mut self, bot: impl Into<String>) -> Self {
        self.bot = Some(bot.into());
        self
    }
}
