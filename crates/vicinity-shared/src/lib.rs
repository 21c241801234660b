// Shared types and wire protocol for the Vicinity proximity chat client.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::VicinityError;
