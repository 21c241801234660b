pub mod config;
pub mod events;
pub mod session;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::SessionConfig;
pub use events::ChatEvent;
pub use session::{ChatSession, SendOutcome, SessionError};
pub use state::SessionState;

/// Installs the tracing subscriber used by embedding applications.
/// `RUST_LOG` overrides the default per-crate filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("vicinity_client=debug,vicinity_net=debug,vicinity_media=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Vicinity chat client logging initialised");
}
