use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplySettings {
    pub draw_poll_interval_ms: u64,
    /// How long to wait for a target to stop drawing before logging that it
    /// is taking long.
    pub draw_poll_timeout_ms: u64,
    /// Past this the apply proceeds even though the target is still drawing.
    pub draw_hard_cap_ms: u64,
    /// How long to wait for the host's "redraw finished" notification.
    pub redraw_timeout_ms: u64,
}
impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            draw_poll_interval_ms: 50,
            draw_poll_timeout_ms: 5_000,
            draw_hard_cap_ms: 30_000,
            redraw_timeout_ms: 10_000,
        }
    }
}
impl ApplySettings {
    pub fn draw_poll_interval(&self) -> Duration {
        Duration::from_millis(self.draw_poll_interval_ms.max(1))
    }

    pub fn draw_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.draw_poll_timeout_ms)
    }

    pub fn draw_hard_cap(&self) -> Duration {
        Duration::from_millis(self.draw_hard_cap_ms.max(self.draw_poll_timeout_ms))
    }

    pub fn redraw_timeout(&self) -> Duration {
        Duration::from_millis(self.redraw_timeout_ms)
    }
}
