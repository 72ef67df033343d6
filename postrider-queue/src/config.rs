//! Queue configuration.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

const fn default_max_tries() -> u32 {
    8
}

const fn default_workers() -> usize {
    16
}

const fn default_initial_retry_secs() -> u64 {
    15 * 60
}

const fn default_retry_time_scale() -> f64 {
    2.0
}

const fn default_post_init_delay_secs() -> u64 {
    10
}

/// Settings for a [`Queue`](crate::Queue).
///
/// The retry delay before attempt `n + 1` is
/// `initial_retry_secs * retry_time_scale ^ (n - 1)`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Directory holding the per-message file triples.
    pub location: PathBuf,

    /// Attempts before a message is given up on.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Concurrent delivery workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// This MTA's name, reported in generated notifications.
    #[serde(default)]
    pub hostname: String,

    /// Domain used for synthesized message ids and the MAILER-DAEMON
    /// address. Required when a bounce target is configured.
    #[serde(default)]
    pub autogenerated_msg_domain: Option<String>,

    /// Base retry delay, in seconds.
    #[serde(default = "default_initial_retry_secs")]
    pub initial_retry_secs: u64,

    /// Exponential backoff base.
    #[serde(default = "default_retry_time_scale")]
    pub retry_time_scale: f64,

    /// Minimum delay applied to deliveries recovered at startup, so a
    /// restart loop does not immediately hammer downstream targets.
    #[serde(default = "default_post_init_delay_secs")]
    pub post_init_delay_secs: u64,
}

impl QueueConfig {
    /// Minimal configuration for the given spool directory.
    #[must_use]
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            max_tries: default_max_tries(),
            workers: default_workers(),
            hostname: String::new(),
            autogenerated_msg_domain: None,
            initial_retry_secs: default_initial_retry_secs(),
            retry_time_scale: default_retry_time_scale(),
            post_init_delay_secs: default_post_init_delay_secs(),
        }
    }

    pub(crate) const fn initial_retry_time(&self) -> Duration {
        Duration::from_secs(self.initial_retry_secs)
    }

    pub(crate) const fn post_init_delay(&self) -> Duration {
        Duration::from_secs(self.post_init_delay_secs)
    }
}
