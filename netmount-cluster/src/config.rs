//! Mount configuration.

use crate::error::{MountError, MountResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by a coordinator and the proxies it spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Inactivity window after which a transaction or data-tree proxy
    /// cancels its handle and stops (ms).
    pub idle_timeout_ms: u64,
    /// How long a caller waits for any reply from a coordinator or proxy (ms).
    pub ask_timeout_ms: u64,
    /// Bounded mailbox size of every actor.
    pub mailbox_capacity: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            ask_timeout_ms: 10_000,
            mailbox_capacity: 32,
        }
    }
}

impl MountConfig {
    /// Parses and validates a JSON configuration. Missing fields take
    /// their defaults.
    pub fn from_json(json: &str) -> MountResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the actors cannot run with.
    pub fn validate(&self) -> MountResult<()> {
        if self.mailbox_capacity == 0 {
            return Err(MountError::Config("mailbox_capacity must be positive".into()));
        }
        if self.ask_timeout_ms == 0 {
            return Err(MountError::Config("ask_timeout_ms must be positive".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(MountError::Config("idle_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }
}
