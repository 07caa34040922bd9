//! End-to-end tests for settings and library endpoints

mod common;

use common::{TestClient, TestServer, JAZZ_LIBRARY, MOVIES_LIBRARY, MUSIC_LIBRARY};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::test]
async fn test_get_settings() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let response = client.get_settings().await;
    assert_eq!(response.status(), StatusCode::OK);

    let settings: Value = response.json().await.unwrap();
    assert_eq!(settings["libraries"], json!([MUSIC_LIBRARY]));
    assert_eq!(settings["rating_style"], "5stars");
    assert_eq!(settings["rating_value"], 3.0);
    assert_eq!(settings["override_rating"], false);
    assert_eq!(settings["batch_size"], 500);
}

#[tokio::test]
async fn test_update_settings_is_persisted() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let response = client
        .put_settings(json!({
            "libraries": [MUSIC_LIBRARY, JAZZ_LIBRARY],
            "rating_style": "5stars_half",
            "rating_value": 3.5,
            "override_rating": true,
        }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let settings: Value = response.json().await.unwrap();
    assert_eq!(settings["rating_value"], 3.5);
    assert_eq!(settings["libraries"], json!([MUSIC_LIBRARY, JAZZ_LIBRARY]));
    // Untouched keys keep their values
    assert_eq!(settings["batch_size"], 500);

    let on_disk: Value =
        serde_json::from_str(&std::fs::read_to_string(&server.settings_path).unwrap()).unwrap();
    assert_eq!(on_disk["rating_style"], "5stars_half");
    assert_eq!(on_disk["rating_value"], 3.5);
    assert_eq!(on_disk["override_rating"], true);

    let settings: Value = client.get_settings().await.json().await.unwrap();
    assert_eq!(settings["rating_style"], "5stars_half");
}

#[tokio::test]
async fn test_invalid_rating_is_rejected_and_previous_kept() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let response = client
        .put_settings(json!({ "rating_style": "5stars_half", "rating_value": 3.3 }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().is_some());

    let response = client.put_settings(json!({ "rating_value": 6 })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client.put_settings(json!({ "batch_size": 0 })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let settings: Value = client.get_settings().await.json().await.unwrap();
    assert_eq!(settings["rating_style"], "5stars");
    assert_eq!(settings["rating_value"], 3.0);
    assert_eq!(settings["batch_size"], 500);
}

#[tokio::test]
async fn test_malformed_settings_body_is_bad_request() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let response = client
        .put_settings(json!({ "rating_style": "10stars" }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client.put_settings(json!({ "batch_size": "many" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_library_names_are_rejected() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let response = client
        .put_settings(json!({ "libraries": [MUSIC_LIBRARY, "Podcasts"] }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Podcasts"));

    let response = client
        .put_settings(json!({ "libraries": [MOVIES_LIBRARY] }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_library_names_accepted_when_plex_unreachable() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;
    server.plex.set_unavailable(true);

    let response = client
        .put_settings(json!({ "libraries": ["Somewhere Else"] }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_list_music_libraries() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let response = client.get_libraries().await;
    assert_eq!(response.status(), StatusCode::OK);
    let libraries: Vec<Value> = response.json().await.unwrap();
    let names: Vec<&str> = libraries
        .iter()
        .map(|l| l["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec![MUSIC_LIBRARY, JAZZ_LIBRARY]);
}

#[tokio::test]
async fn test_interval_change_reschedules_periodic_runs() {
    let server = TestServer::spawn().await;
    let client = TestClient::authenticated(server.base_url.clone()).await;

    let status: Value = client.get_runs().await.json().await.unwrap();
    assert_eq!(status["interval_minutes"], 0);
    assert!(status["next_scheduled_at"].is_null());

    let response = client
        .put_settings(json!({ "batch_interval_minutes": 30 }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // The scheduler picks the change up asynchronously
    let mut status = Value::Null;
    for _ in 0..100 {
        status = client.get_runs().await.json().await.unwrap();
        if status["interval_minutes"] == 30 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["interval_minutes"], 30);
    assert!(status["next_scheduled_at"].is_string());

    let body: Value = client.get_log().await.json().await.unwrap();
    assert!(body["lines"]
        .as_array()
        .unwrap()
        .iter()
        .any(|l| l.as_str().unwrap().contains("Settings saved")));
}
