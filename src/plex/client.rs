//! HTTP client for the Plex media server.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::api::{PlexApi, PlexError};
use super::models::{
    Library, MediaContainerEnvelope, SectionsContainer, TrackFilter, TrackPage, TrackQuery,
    TracksContainer,
};

/// Plex metadata type of tracks.
const TRACK_METADATA_TYPE: &str = "10";
const RATING_IDENTIFIER: &str = "com.plexapp.plugins.library";
/// Longest chunk of an error body kept in `PlexError::Status`.
const ERROR_BODY_LIMIT: usize = 200;

/// `PlexApi` implementation talking to a real server with its access token.
#[derive(Clone)]
pub struct PlexClient {
    client: Client,
    base_url: String,
    token: String,
}

impl PlexClient {
    /// # Arguments
    /// * `base_url` - Plex server URL (e.g., "http://192.168.1.10:32400")
    /// * `token` - value sent as `X-Plex-Token`
    /// * `timeout` - applied to every request
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Plex HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .header("X-Plex-Token", &self.token)
            .header(header::ACCEPT, "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, PlexError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(PlexError::Unauthorized(status.as_u16()));
        }

        let mut message = response.text().await.unwrap_or_default();
        if message.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(PlexError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, PlexError> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| PlexError::Decode(e.to_string()))
    }

    async fn rate(&self, track_id: &str, rating: &str) -> Result<(), PlexError> {
        let request = self.request(Method::PUT, "/:/rate").query(&[
            ("key", track_id),
            ("identifier", RATING_IDENTIFIER),
            ("rating", rating),
        ]);
        self.send(request).await?;
        Ok(())
    }
}

fn map_transport_error(err: reqwest::Error) -> PlexError {
    if err.is_timeout() {
        PlexError::Timeout(err.to_string())
    } else if err.is_decode() {
        PlexError::Decode(err.to_string())
    } else {
        PlexError::Connection(err.to_string())
    }
}

#[async_trait]
impl PlexApi for PlexClient {
    async fn list_libraries(&self) -> Result<Vec<Library>, PlexError> {
        let envelope: MediaContainerEnvelope<SectionsContainer> = self
            .send_json(self.request(Method::GET, "/library/sections"))
            .await?;
        Ok(envelope
            .media_container
            .directories
            .into_iter()
            .map(Library::from)
            .collect())
    }

    async fn list_tracks(
        &self,
        library_id: &str,
        query: &TrackQuery,
    ) -> Result<TrackPage, PlexError> {
        let path = format!("/library/sections/{}/all", library_id);
        let mut params = vec![
            ("type", TRACK_METADATA_TYPE),
            ("sort", query.sort.as_query_value()),
        ];
        match query.filter {
            TrackFilter::All => {}
            TrackFilter::UnratedOnly => params.push(("userRating", "0")),
            TrackFilter::RatedOnly => params.push(("userRating>>", "0")),
        }

        let request = self
            .request(Method::GET, &path)
            .query(&params)
            .header("X-Plex-Container-Start", query.offset.to_string())
            .header("X-Plex-Container-Size", query.size.to_string());

        debug!(
            "Listing tracks of section {} (filter {:?}, offset {}, size {})",
            library_id, query.filter, query.offset, query.size
        );
        let envelope: MediaContainerEnvelope<TracksContainer> = self.send_json(request).await?;
        Ok(TrackPage::from(envelope.media_container))
    }

    async fn set_rating(&self, track_id: &str, rating: f64) -> Result<(), PlexError> {
        self.rate(track_id, &rating.to_string()).await
    }

    async fn reset_rating(&self, track_id: &str) -> Result<(), PlexError> {
        self.rate(track_id, "-1").await
    }
}
