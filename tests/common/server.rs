//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own settings file, scheduler
//! and in-memory Plex.

use super::constants::*;
use starsync::activity_log::ActivityLog;
use starsync::auth::Authenticator;
use starsync::plex::{InMemoryPlex, PlexApi, MUSIC_SECTION_TYPE};
use starsync::rating::{EngineOptions, RatingEngine, RetryPolicy};
use starsync::scheduler::create_scheduler;
use starsync::server::{make_app, RequestsLoggingLevel, ServerConfig, ServerServices};
use starsync::settings::{RatingStyle, Settings, SettingsStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Test server instance with an isolated Plex fixture and settings file
///
/// When dropped, the server and scheduler shut down and temp resources are
/// cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// The fake Plex server, for seeding tracks and inspecting ratings
    pub plex: Arc<InMemoryPlex>,

    /// Section id of the "Music" library
    pub music_library_id: String,

    /// Section id of the "Jazz" library
    pub jazz_library_id: String,

    /// Path of the persisted settings file
    pub settings_path: PathBuf,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    shutdown_token: CancellationToken,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Settings used by `TestServer::spawn`: the Music library, three stars,
/// batches of 500 and no periodic runs.
pub fn default_settings() -> Settings {
    Settings {
        libraries: vec![MUSIC_LIBRARY.to_string()],
        rating_style: RatingStyle::FiveStars,
        rating_value: 3.0,
        override_rating: false,
        batch_size: 500,
        batch_interval_minutes: 0,
    }
}

impl TestServer {
    /// Spawns a new test server on a random port with default settings
    pub async fn spawn() -> Self {
        Self::spawn_with(default_settings()).await
    }

    /// Spawns a new test server whose settings file starts from `settings`
    ///
    /// # Panics
    ///
    /// Panics if the settings are invalid, port binding fails, or the server
    /// doesn't become ready within timeout.
    pub async fn spawn_with(settings: Settings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let settings_path = temp_dir.path().join("settings.json");

        let plex = Arc::new(InMemoryPlex::new());
        let music_library_id = plex.add_library(MUSIC_LIBRARY, MUSIC_SECTION_TYPE);
        let jazz_library_id = plex.add_library(JAZZ_LIBRARY, MUSIC_SECTION_TYPE);
        plex.add_library(MOVIES_LIBRARY, "movie");

        let settings = Arc::new(
            SettingsStore::open(&settings_path, settings).expect("Failed to open settings"),
        );

        let activity = ActivityLog::default();
        let plex_api: Arc<dyn PlexApi> = plex.clone();
        let engine = RatingEngine::new(
            plex_api.clone(),
            activity.clone(),
            EngineOptions {
                concurrency: 4,
                retry_policy: RetryPolicy::new(1, Duration::from_millis(10)),
            },
        );

        let shutdown_token = CancellationToken::new();
        let (mut scheduler, scheduler_handle) = create_scheduler(
            engine,
            settings.clone(),
            activity.clone(),
            shutdown_token.clone(),
        );
        tokio::spawn(async move { scheduler.run().await });

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            host: "127.0.0.1".to_string(),
            port,
            metrics_port: 0,
            frontend_dir_path: None,
        };
        let app = make_app(
            config,
            ServerServices {
                settings,
                plex: plex_api,
                scheduler: scheduler_handle,
                activity,
                authenticator: Arc::new(Authenticator::new(TEST_USER, TEST_PASS)),
                session_secret: "e2e-session-secret".to_string(),
            },
        )
        .expect("Failed to build app");

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            plex,
            music_library_id,
            jazz_library_id,
            settings_path,
            _temp_dir: temp_dir,
            shutdown_token,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling the home endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    /// Ratings of every track in the Music library, newest first
    pub fn music_ratings(&self) -> Vec<Option<f64>> {
        self.plex
            .tracks(&self.music_library_id)
            .into_iter()
            .map(|t| t.user_rating)
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
        // TempDir will be cleaned up automatically
    }
}
