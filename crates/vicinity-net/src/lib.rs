// Connection management for the proximity chat WebSocket and its REST collaborators.

pub mod backoff;
pub mod connection;
pub mod heartbeat;
pub mod rest;

pub use backoff::ReconnectPolicy;
pub use connection::{
    chat_ws_url, spawn_connection, ConnectionCommand, ConnectionConfig, ConnectionEvent,
};
pub use heartbeat::Heartbeat;
pub use rest::{ApiError, ProximityApi};
