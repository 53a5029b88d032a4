use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Asset server connection and transfer tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Origin used for every call that isn't tied to a specific file's
    /// origin, and for files the server did not assign one.
    pub server_url: String,
    /// Bearer token. Empty means anonymous.
    pub token: String,
    /// Timeout of small request/response calls (not of streamed bodies).
    pub request_timeout_ms: u64,
    /// How long one readiness check may take before it is re-issued.
    pub poll_timeout_ms: u64,
    /// Pause between readiness checks that reported "not ready".
    pub poll_interval_ms: u64,
    /// Give up on a queued file after this long.
    pub queue_deadline_ms: u64,
    /// Additional attempts after a transient per-file failure.
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Attempts at telling the server to drop an abandoned ticket.
    pub cancel_attempts: u32,
    /// Uploads of a hash verified within this window are skipped.
    pub reverify_window_secs: u64,
    /// How long a forbidden hash is reported without asking the server again.
    pub forbidden_cooldown_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:6200/".to_string(),
            token: String::new(),
            request_timeout_ms: 30_000,
            poll_timeout_ms: 5_000,
            poll_interval_ms: 250,
            queue_deadline_ms: 300_000,
            retries: 3,
            retry_delay_ms: 1_000,
            cancel_attempts: 3,
            reverify_window_secs: 600,
            forbidden_cooldown_secs: 1_800,
        }
    }
}

impl TransferSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_deadline(&self) -> Duration {
        Duration::from_millis(self.queue_deadline_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reverify_window(&self) -> Duration {
        Duration::from_secs(self.reverify_window_secs)
    }

    pub fn forbidden_cooldown(&self) -> Duration {
        Duration::from_secs(self.forbidden_cooldown_secs)
    }
}
