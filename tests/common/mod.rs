//! Shared harness for the end-to-end tests.
//!
//! `TestServer` runs the full app against an `InMemoryPlex` on a random port,
//! `TestClient` talks to it over HTTP with a cookie store.
//!
//! ```no_run
//! mod common;
//! use common::{run_id_of, TestClient, TestServer};
//!
//! #[tokio::test]
//! async fn full_run_finishes() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::authenticated(server.base_url.clone()).await;
//!
//!     let run_id = run_id_of(client.trigger_full().await).await;
//!     let summary = client.wait_for_run(run_id).await;
//!     assert_eq!(summary["outcome"], "success");
//! }
//! ```

mod client;
mod constants;
mod server;

pub use client::{run_id_of, TestClient};
pub use constants::*;
pub use server::TestServer;
