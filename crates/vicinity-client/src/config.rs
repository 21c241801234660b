use std::time::Duration;

use vicinity_net::ReconnectPolicy;
use vicinity_shared::constants::{DEFAULT_RADIUS_M, HEARTBEAT_SECS};

/// Session-wide settings. Defaults match the production service; tests
/// shrink the timers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base HTTP(S) URL of the chat service.
    pub server_url: String,
    /// Chat radius in meters.
    pub radius_m: u32,
    pub heartbeat_period: Duration,
    pub policy: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            radius_m: DEFAULT_RADIUS_M,
            heartbeat_period: Duration::from_secs(HEARTBEAT_SECS),
            policy: ReconnectPolicy::default(),
        }
    }
}
