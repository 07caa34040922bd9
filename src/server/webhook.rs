//! Inbound Plex webhook. Plex posts `multipart/form-data` with the event as
//! JSON in a `payload` field; raw JSON and urlencoded bodies are accepted too.

use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::metrics::record_webhook_event;
use super::state::ServerState;
use crate::rating::RunTrigger;
use crate::scheduler::TriggerError;

const NEW_CONTENT_EVENT: &str = "library.new";
const PAYLOAD_FIELD: &str = "payload";
const MAX_RAW_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub event: String,
    #[serde(rename = "Metadata", default)]
    pub metadata: Option<WebhookMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookMetadata {
    #[serde(rename = "librarySectionTitle")]
    pub library_section_title: Option<String>,
}

impl WebhookPayload {
    pub fn library(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.library_section_title.as_deref())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Missing payload")]
    MissingPayload,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, format!("Bad Request: {}", self)).into_response()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WebhookAction {
    RateLastBatch(String),
    Ignore,
}

#[derive(Serialize)]
struct WebhookAccepted {
    run_id: u64,
}

#[derive(Deserialize)]
struct PayloadForm {
    payload: Option<String>,
}

pub fn parse_payload(raw: &str) -> Result<WebhookPayload, WebhookError> {
    if raw.trim().is_empty() {
        return Err(WebhookError::MissingPayload);
    }
    serde_json::from_str(raw).map_err(|err| WebhookError::MalformedPayload(err.to_string()))
}

/// A new-content event in a configured library starts a last-batch run for
/// that library. Everything else is ignored.
pub fn classify(payload: &WebhookPayload, configured_libraries: &[String]) -> WebhookAction {
    if !payload.event.eq_ignore_ascii_case(NEW_CONTENT_EVENT) {
        return WebhookAction::Ignore;
    }
    match payload.library() {
        Some(library) if configured_libraries.iter().any(|l| l == library) => {
            WebhookAction::RateLastBatch(library.to_string())
        }
        _ => WebhookAction::Ignore,
    }
}

async fn read_payload(state: &ServerState, request: Request<Body>) -> Result<String, WebhookError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| WebhookError::MalformedPayload(err.body_text()))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| WebhookError::MalformedPayload(err.body_text()))?
        {
            if field.name() == Some(PAYLOAD_FIELD) {
                return field
                    .text()
                    .await
                    .map_err(|err| WebhookError::MalformedPayload(err.body_text()));
            }
        }
        return Err(WebhookError::MissingPayload);
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = Form::<PayloadForm>::from_request(request, state)
            .await
            .map_err(|err| WebhookError::MalformedPayload(err.body_text()))?;
        return form.payload.ok_or(WebhookError::MissingPayload);
    }

    let bytes = axum::body::to_bytes(request.into_body(), MAX_RAW_BODY_BYTES)
        .await
        .map_err(|err| WebhookError::MalformedPayload(err.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn plex_webhook(State(state): State<ServerState>, request: Request<Body>) -> Response {
    let payload = match read_payload(&state, request).await.and_then(|raw| parse_payload(&raw)) {
        Ok(payload) => payload,
        Err(err) => {
            state.activity.warn(format!("Webhook rejected: {}", err));
            record_webhook_event("invalid");
            return err.into_response();
        }
    };

    state.activity.info(format!(
        "Webhook: {} in {}",
        payload.event,
        payload.library().unwrap_or("unknown library")
    ));

    let settings = state.settings.snapshot();
    let library = match classify(&payload, &settings.libraries) {
        WebhookAction::RateLastBatch(library) => library,
        WebhookAction::Ignore => {
            debug!("Ignoring webhook event {}", payload.event);
            record_webhook_event("ignored");
            return (StatusCode::OK, "Ignored").into_response();
        }
    };

    match state
        .scheduler
        .trigger_last_batch(Some(library), RunTrigger::Webhook)
        .await
    {
        Ok(run_id) => {
            record_webhook_event("triggered");
            (StatusCode::ACCEPTED, Json(WebhookAccepted { run_id })).into_response()
        }
        Err(err @ TriggerError::Busy(_)) => {
            record_webhook_event("busy");
            (StatusCode::OK, format!("Busy: {}", err)).into_response()
        }
        Err(err @ TriggerError::Unavailable) => {
            record_webhook_event("unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}
