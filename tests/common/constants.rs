//! Shared constants for end-to-end tests

// ============================================================================
// Test Credentials
// ============================================================================

/// Admin username the test server is configured with
pub const TEST_USER: &str = "admin";

/// Admin password the test server is configured with
pub const TEST_PASS: &str = "adminpass123";

// ============================================================================
// Plex Fixture
// ============================================================================

/// Music library configured by default, section id "1"
pub const MUSIC_LIBRARY: &str = "Music";

/// Second music library, not configured by default, section id "2"
pub const JAZZ_LIBRARY: &str = "Jazz";

/// Non-music library, section id "3"
pub const MOVIES_LIBRARY: &str = "Movies";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time to wait for server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Polling interval when waiting for server to be ready (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 50;

/// Maximum time to wait for a run to finish (milliseconds)
pub const RUN_FINISH_TIMEOUT_MS: u64 = 10_000;

/// Default timeout for HTTP requests (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;
