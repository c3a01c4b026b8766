//! session-server
//!
//! WebSocket front end for the session engines.

pub mod auth;
pub mod config;
pub mod directory;
pub mod handler;
pub mod server;
pub mod types;

// internal, not re-exported
mod stream;

pub use auth::TokenTable;
pub use config::Config;
pub use directory::MemoryDirectory;
pub use handler::EngineHandler;
pub use server::Server;
