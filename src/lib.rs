//! StarSync: automatically rates unrated music tracks on a Plex server.
//!
//! This library exposes the internal modules for the binary and for testing.

pub mod activity_log;
pub mod auth;
pub mod config;
pub mod plex;
pub mod rating;
pub mod scheduler;
pub mod server;
pub mod settings;

// Re-export commonly used types for convenience
pub use activity_log::ActivityLog;
pub use plex::{InMemoryPlex, PlexApi, PlexClient};
pub use server::{run_server, RequestsLoggingLevel};
pub use settings::{Settings, SettingsStore};
