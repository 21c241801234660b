//! Periodic liveness pings for the chat socket.
//!
//! The heartbeat exists solely to keep intermediaries (load balancers, NAT
//! mappings) from reclaiming an idle connection. Liveness loss detection is
//! the socket's own job; no pong timeout is tracked here.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use vicinity_shared::protocol::ClientFrame;

/// A ticking heartbeat, owned by the connection task while Connected and
/// dropped the moment the connection leaves that state.
pub struct Heartbeat {
    interval: Interval,
}

impl Heartbeat {
    /// Starts a heartbeat whose first tick fires one full period from now.
    pub fn start(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// The frame emitted on every tick.
    pub fn frame() -> ClientFrame {
        ClientFrame::Ping
    }
}
