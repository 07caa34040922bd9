//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all starsync endpoints.
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client with cookie-based session management
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    /// Creates a new unauthenticated client
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .cookie_store(true) // Automatically handle session cookies
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    /// Creates a client logged in as the admin
    ///
    /// # Panics
    ///
    /// Panics if authentication fails (indicates test infrastructure problem).
    pub async fn authenticated(base_url: String) -> Self {
        let client = Self::new(base_url);

        let response = client.login(TEST_USER, TEST_PASS).await;
        assert_eq!(
            response.status(),
            StatusCode::CREATED,
            "Test user authentication failed: {:?}",
            response.text().await
        );

        client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========================================================================
    // Authentication Endpoints
    // ========================================================================

    /// POST /v1/auth/login
    pub async fn login(&self, username: &str, password: &str) -> Response {
        self.client
            .post(self.url("/v1/auth/login"))
            .json(&json!({
                "username": username,
                "password": password,
            }))
            .send()
            .await
            .expect("Login request failed")
    }

    /// GET /v1/auth/logout
    pub async fn logout(&self) -> Response {
        self.client
            .get(self.url("/v1/auth/logout"))
            .send()
            .await
            .expect("Logout request failed")
    }

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(self.url("/"))
            .send()
            .await
            .expect("Home request failed")
    }

    // ========================================================================
    // Settings and Libraries
    // ========================================================================

    /// GET /v1/settings
    pub async fn get_settings(&self) -> Response {
        self.client
            .get(self.url("/v1/settings"))
            .send()
            .await
            .expect("Get settings request failed")
    }

    /// PUT /v1/settings
    pub async fn put_settings(&self, update: Value) -> Response {
        self.client
            .put(self.url("/v1/settings"))
            .json(&update)
            .send()
            .await
            .expect("Put settings request failed")
    }

    /// GET /v1/libraries
    pub async fn get_libraries(&self) -> Response {
        self.client
            .get(self.url("/v1/libraries"))
            .send()
            .await
            .expect("Get libraries request failed")
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// POST /v1/trigger/full
    pub async fn trigger_full(&self) -> Response {
        self.client
            .post(self.url("/v1/trigger/full"))
            .send()
            .await
            .expect("Trigger full request failed")
    }

    /// POST /v1/trigger/last-batch
    pub async fn trigger_last_batch(&self, library: Option<&str>) -> Response {
        let mut request = self.client.post(self.url("/v1/trigger/last-batch"));
        if let Some(library) = library {
            request = request.query(&[("library", library)]);
        }
        request
            .send()
            .await
            .expect("Trigger last batch request failed")
    }

    /// POST /v1/ratings/reset
    pub async fn reset_ratings(&self) -> Response {
        self.client
            .post(self.url("/v1/ratings/reset"))
            .send()
            .await
            .expect("Reset ratings request failed")
    }

    /// GET /v1/runs
    pub async fn get_runs(&self) -> Response {
        self.client
            .get(self.url("/v1/runs"))
            .send()
            .await
            .expect("Get runs request failed")
    }

    /// GET /v1/runs/{id}
    pub async fn get_run(&self, run_id: u64) -> Response {
        self.client
            .get(self.url(&format!("/v1/runs/{}", run_id)))
            .send()
            .await
            .expect("Get run request failed")
    }

    /// GET /v1/log
    pub async fn get_log(&self) -> Response {
        self.client
            .get(self.url("/v1/log"))
            .send()
            .await
            .expect("Get log request failed")
    }

    /// POST /plex-webhook with a raw JSON body
    pub async fn post_webhook_json(&self, payload: Value) -> Response {
        self.client
            .post(self.url("/plex-webhook"))
            .json(&payload)
            .send()
            .await
            .expect("Webhook request failed")
    }

    /// POST /plex-webhook as multipart form data, the way Plex sends it
    pub async fn post_webhook_multipart(&self, payload: &str) -> Response {
        let form = reqwest::multipart::Form::new()
            .text("payload", payload.to_string())
            .part(
                "thumb",
                reqwest::multipart::Part::bytes(vec![0xFF, 0xD8, 0xFF])
                    .file_name("thumb.jpg")
                    .mime_str("image/jpeg")
                    .expect("Invalid mime type"),
            );
        self.client
            .post(self.url("/plex-webhook"))
            .multipart(form)
            .send()
            .await
            .expect("Webhook request failed")
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Triggers a full run and returns its id, asserting it was accepted
    pub async fn start_full_run(&self) -> u64 {
        let response = self.trigger_full().await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        run_id_of(response).await
    }

    /// Polls until the run shows up in the history and returns its summary
    ///
    /// # Panics
    ///
    /// Panics if the run does not finish within `RUN_FINISH_TIMEOUT_MS`.
    pub async fn wait_for_run(&self, run_id: u64) -> Value {
        let start = std::time::Instant::now();
        loop {
            let response = self.get_run(run_id).await;
            if response.status() == StatusCode::OK {
                return response.json().await.expect("Invalid run summary");
            }
            if start.elapsed() > Duration::from_millis(RUN_FINISH_TIMEOUT_MS) {
                panic!("Run #{} did not finish in time", run_id);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Reads `run_id` from a 202 trigger response
pub async fn run_id_of(response: Response) -> u64 {
    let body: Value = response.json().await.expect("Invalid trigger response");
    body["run_id"].as_u64().expect("Missing run_id")
}
