//! Session state shared between the facade and its background tasks.
//!
//! [`SessionState`] is wrapped in `Arc<Mutex<>>` so the connection bridge
//! task and the facade's accessors see the same log and status.

use tokio::sync::mpsc;

use vicinity_net::ConnectionCommand;
use vicinity_shared::types::{ChatItem, Coordinates, Identity, NearbyUser, SessionStatus};

/// Central session state.
///
/// Holds the user's identity, last known location, the connection command
/// channel, the ordered message log, and the nearby-user snapshot.
pub struct SessionState {
    /// Identity supplied at join time. `None` until the first join.
    pub identity: Option<Identity>,

    /// Device coordinates from the last join or rejoin.
    pub location: Option<Coordinates>,

    /// Sender half of the channel used to dispatch commands to the
    /// connection task (send frame, rejoin, stop).
    pub conn_cmd_tx: Option<mpsc::Sender<ConnectionCommand>>,

    /// Lifecycle status as last reported by the connection task.
    pub status: SessionStatus,

    /// Ordered message log; append-only, arrival order.
    pub messages: Vec<ChatItem>,

    /// Users within the chat radius; replaced wholesale on refresh.
    pub nearby: Vec<NearbyUser>,
}

impl SessionState {
    /// Create a new, un-joined session state.
    pub fn new() -> Self {
        Self {
            identity: None,
            location: None,
            conn_cmd_tx: None,
            status: SessionStatus::Idle,
            messages: Vec::new(),
            nearby: Vec::new(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
