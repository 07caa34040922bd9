use serde::{Deserialize, Serialize};

/// Plex section type of music libraries.
pub const MUSIC_SECTION_TYPE: &str = "artist";

/// A Plex library section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Library {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
        }
    }

    pub fn is_music(&self) -> bool {
        self.kind == MUSIC_SECTION_TYPE
    }
}

/// A track as returned by a library listing, always fetched fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    /// User rating on Plex's 0-10 scale, `None` when never rated.
    pub user_rating: Option<f64>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, user_rating: Option<f64>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            user_rating,
        }
    }

    /// Plex reports cleared ratings either as missing or as zero.
    pub fn is_rated(&self) -> bool {
        matches!(self.user_rating, Some(r) if r > 0.0)
    }
}

/// Which tracks a listing should return, based on their rating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFilter {
    All,
    UnratedOnly,
    RatedOnly,
}

impl TrackFilter {
    pub fn matches(&self, track: &Track) -> bool {
        match self {
            TrackFilter::All => true,
            TrackFilter::UnratedOnly => !track.is_rated(),
            TrackFilter::RatedOnly => track.is_rated(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSort {
    /// Most recently added first.
    RecentlyAdded,
}

impl TrackSort {
    pub fn as_query_value(&self) -> &'static str {
        match self {
            TrackSort::RecentlyAdded => "addedAt:desc",
        }
    }
}

/// Parameters of a single page request against a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackQuery {
    pub filter: TrackFilter,
    pub sort: TrackSort,
    pub offset: usize,
    pub size: usize,
}

impl TrackQuery {
    pub fn recently_added(filter: TrackFilter, offset: usize, size: usize) -> Self {
        Self {
            filter,
            sort: TrackSort::RecentlyAdded,
            offset,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackPage {
    pub tracks: Vec<Track>,
    /// Number of tracks matching the query across all pages.
    pub total_size: usize,
}

// Wire format of the Plex JSON API. Everything is wrapped in a MediaContainer.

#[derive(Debug, Deserialize)]
pub(crate) struct MediaContainerEnvelope<T> {
    #[serde(rename = "MediaContainer")]
    pub media_container: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SectionsContainer {
    #[serde(rename = "Directory", default)]
    pub directories: Vec<SectionDirectory>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SectionDirectory {
    pub key: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<SectionDirectory> for Library {
    fn from(dir: SectionDirectory) -> Self {
        Library {
            id: dir.key,
            name: dir.title,
            kind: dir.kind,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TracksContainer {
    #[serde(default)]
    pub size: usize,
    #[serde(rename = "totalSize")]
    pub total_size: Option<usize>,
    #[serde(rename = "Metadata", default)]
    pub metadata: Vec<TrackMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TrackMetadata {
    #[serde(rename = "ratingKey")]
    pub rating_key: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "userRating")]
    pub user_rating: Option<f64>,
}

impl From<TrackMetadata> for Track {
    fn from(meta: TrackMetadata) -> Self {
        Track {
            id: meta.rating_key,
            title: meta.title,
            user_rating: meta.user_rating,
        }
    }
}

impl From<TracksContainer> for TrackPage {
    fn from(container: TracksContainer) -> Self {
        let total_size = container
            .total_size
            .unwrap_or(container.size.max(container.metadata.len()));
        TrackPage {
            tracks: container.metadata.into_iter().map(Track::from).collect(),
            total_size,
        }
    }
}
