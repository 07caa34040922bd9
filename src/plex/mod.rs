mod api;
mod client;
mod in_memory;
mod models;

pub use api::{PlexApi, PlexError};
pub use client::PlexClient;
pub use in_memory::{InMemoryPlex, WriteStats};
pub use models::{Library, Track, TrackFilter, TrackPage, TrackQuery, TrackSort, MUSIC_SECTION_TYPE};
