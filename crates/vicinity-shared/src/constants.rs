/// WebSocket route for the proximity chat endpoint
pub const CHAT_WS_PATH: &str = "/ws/localchat";

/// REST route for posting the device location
pub const LOCATION_PATH: &str = "/location";

/// REST route for fetching nearby users
pub const NEARBY_PATH: &str = "/nearby";

/// Default chat room radius in meters (1 km)
pub const DEFAULT_RADIUS_M: u32 = 1000;

/// Heartbeat ping interval in seconds
pub const HEARTBEAT_SECS: u64 = 20;

/// Reconnect backoff base delay in milliseconds
pub const BACKOFF_BASE_MS: u64 = 1000;

/// Reconnect backoff ceiling in milliseconds
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Give up reconnecting after this many consecutive abnormal closes
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// MIME type assumed for voice payloads that do not declare one
pub const DEFAULT_VOICE_MIME: &str = "audio/webm";

/// Recording elapsed-time tick interval in seconds
pub const RECORDING_TICK_SECS: u64 = 1;
