//! Messenger and context configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Role;

/// Origin value that matches any peer origin.
pub const ANY_ORIGIN: &str = "*";

/// Default reply timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default number of context snapshots kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Configuration for one messenger instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessengerConfig {
    /// Which side this messenger speaks for.
    pub role: Role,
    /// Origin of this side, stamped on outgoing envelopes.
    pub origin: String,
    /// Origin of the peer. Inbound traffic from anywhere else is dropped.
    pub target_origin: String,
    /// How long a request waits for its reply.
    pub timeout_ms: u64,
    /// Extra attempts made after a request times out.
    pub retry_attempts: u32,
    /// Log dropped traffic at debug level instead of trace.
    pub debug: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            role: Role::Host,
            origin: ANY_ORIGIN.to_string(),
            target_origin: ANY_ORIGIN.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_attempts: 0,
            debug: false,
        }
    }
}

impl MessengerConfig {
    /// Host-side configuration.
    #[must_use]
    pub fn host(origin: impl Into<String>, target_origin: impl Into<String>) -> Self {
        Self {
            role: Role::Host,
            origin: origin.into(),
            target_origin: target_origin.into(),
            ..Self::default()
        }
    }

    /// Guest-side configuration.
    #[must_use]
    pub fn guest(origin: impl Into<String>, target_origin: impl Into<String>) -> Self {
        Self {
            role: Role::Guest,
            origin: origin.into(),
            target_origin: target_origin.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub const fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Reply timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether traffic observed from `origin` is acceptable.
    #[must_use]
    pub fn accepts_origin(&self, origin: &str) -> bool {
        self.target_origin == ANY_ORIGIN || self.target_origin == origin
    }
}

/// Configuration for a context store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    /// Route a fresh context starts at.
    pub initial_route: String,
    /// `app.environment` of a fresh context.
    pub environment: String,
    /// Maximum number of snapshots kept in history.
    pub history_limit: usize,
    /// Pull the peer's context on this interval, if set.
    pub sync_interval_ms: Option<u64>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            initial_route: "/".to_string(),
            environment: "production".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            sync_interval_ms: None,
        }
    }
}

impl ContextConfig {
    #[must_use]
    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_ms.map(Duration::from_millis)
    }
}
