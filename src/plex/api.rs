//! Abstraction over the subset of the Plex API used for rating tracks.

use async_trait::async_trait;
use thiserror::Error;

use super::models::{Library, TrackPage, TrackQuery};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlexError {
    #[error("Plex request timed out: {0}")]
    Timeout(String),

    #[error("Could not reach Plex: {0}")]
    Connection(String),

    #[error("Plex rejected the token (HTTP {0})")]
    Unauthorized(u16),

    #[error("Plex returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Could not decode Plex response: {0}")]
    Decode(String),
}

impl PlexError {
    /// Transient errors may succeed if the same request is sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            PlexError::Timeout(_) | PlexError::Connection(_) => true,
            PlexError::Status { status, .. } => *status >= 500 || *status == 429,
            PlexError::Unauthorized(_) | PlexError::Decode(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PlexError::Timeout(_) => "timeout",
            PlexError::Connection(_) => "connection",
            PlexError::Unauthorized(_) => "unauthorized",
            PlexError::Status { .. } => "status",
            PlexError::Decode(_) => "decode",
        }
    }
}

/// Operations against a Plex media server.
///
/// Implementations must be cheap to share between tasks.
#[async_trait]
pub trait PlexApi: Send + Sync {
    async fn list_libraries(&self) -> Result<Vec<Library>, PlexError>;

    /// Returns one page of tracks of the given library section.
    async fn list_tracks(
        &self,
        library_id: &str,
        query: &TrackQuery,
    ) -> Result<TrackPage, PlexError>;

    /// Sets the user rating of a track, `rating` is on the 0-10 scale.
    /// Setting the same value twice is harmless.
    async fn set_rating(&self, track_id: &str, rating: f64) -> Result<(), PlexError>;

    /// Clears the user rating of a track.
    async fn reset_rating(&self, track_id: &str) -> Result<(), PlexError>;
}
