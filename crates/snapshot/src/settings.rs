use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    /// How long a build waits for its object to finish loading.
    pub object_wait_timeout_ms: u64,
    pub object_poll_interval_ms: u64,
    /// Keep a pet's resolved files across rebuilds where the pet's state
    /// could not be re-read, until the mod service confirms they are gone.
    pub sticky_pets: bool,
}
impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            object_wait_timeout_ms: 10_000,
            object_poll_interval_ms: 100,
            sticky_pets: true,
        }
    }
}
impl SnapshotSettings {
    pub fn object_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.object_wait_timeout_ms)
    }

    pub fn object_poll_interval(&self) -> Duration {
        Duration::from_millis(self.object_poll_interval_ms.max(1))
    }
}
