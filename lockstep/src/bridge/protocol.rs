//! Wire protocol types for peer-to-peer coordination.
//!
//! One message shape travels in both directions:
//! `{"eventName": "episode_7_walkPhase", "eventParams": <any JSON>}`.
//! The protocol enforces no schema on `eventParams`; callers pick their own
//! payload types and go through serde at the edges.

use std::fmt;

use serde::{Deserialize, Serialize};

const EPISODE_PREFIX: &str = "episode_";

/// Name of a phase event, optionally namespaced by episode number.
///
/// The wire form of a namespaced name is `episode_{n}_{base}`. Only canonical
/// decimal episode numbers are recognised while parsing (no sign, no leading
/// zeros) so that `parse(name).to_string() == name` always holds and two
/// distinct wire names never collapse onto the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EventName {
    episode: Option<u64>,
    base: String,
}

impl EventName {
    /// An event outside any episode namespace.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            episode: None,
            base: base.into(),
        }
    }

    pub fn namespaced(episode: u64, base: impl Into<String>) -> Self {
        Self {
            episode: Some(episode),
            base: base.into(),
        }
    }

    pub fn parse(name: &str) -> Self {
        if let Some(rest) = name.strip_prefix(EPISODE_PREFIX)
            && let Some((digits, base)) = rest.split_once('_')
            && !base.is_empty()
            && is_canonical_number(digits)
            && let Ok(episode) = digits.parse::<u64>()
        {
            return Self::namespaced(episode, base);
        }
        Self::new(name)
    }

    pub fn episode(&self) -> Option<u64> {
        self.episode
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

fn is_canonical_number(digits: &str) -> bool {
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits.len() == 1 || !digits.starts_with('0'))
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.episode {
            Some(episode) => write!(f, "{EPISODE_PREFIX}{episode}_{}", self.base),
            None => f.write_str(&self.base),
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.to_string()
    }
}

/// A single message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    pub event_name: EventName,
    /// Missing params decode as `null`.
    #[serde(default)]
    pub event_params: serde_json::Value,
}

impl PeerMessage {
    pub fn new(event_name: impl Into<EventName>, event_params: serde_json::Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_params,
        }
    }
}
