use anyhow::{Context, Result};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

#[cfg(feature = "slowdown")]
use super::slowdown_request;
use super::{
    log_requests, metrics,
    session::{Session, COOKIE_SESSION_TOKEN_KEY},
    state::*,
    webhook::plex_webhook,
    ServerConfig,
};
use crate::activity_log::ActivityLog;
use crate::auth::Authenticator;
use crate::plex::{Library, PlexApi};
use crate::rating::RunTrigger;
use crate::scheduler::{ActiveRun, SchedulerHandle, TriggerError};
use crate::settings::{SettingsError, SettingsStore, SettingsUpdate};

/// Everything the HTTP layer needs from the rest of the service.
pub struct ServerServices {
    pub settings: Arc<SettingsStore>,
    pub plex: Arc<dyn PlexApi>,
    pub scheduler: SchedulerHandle,
    pub activity: ActivityLog,
    pub authenticator: Arc<Authenticator>,
    pub session_secret: String,
}

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
    pub run_state: &'static str,
    pub active_run: Option<ActiveRun>,
    pub logged_in: bool,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Deserialize, Debug)]
struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
struct LoginSuccessResponse {
    token: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct TriggerAccepted {
    run_id: u64,
}

#[derive(Deserialize, Debug, Default)]
struct LastBatchParams {
    library: Option<String>,
}

#[derive(Serialize)]
struct LogLines {
    lines: Vec<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn home(session: Option<Session>, State(state): State<ServerState>) -> impl IntoResponse {
    let active_run = state.scheduler.active_run();
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
        run_state: if active_run.is_some() { "running" } else { "idle" },
        active_run,
        logged_in: session.is_some(),
    };
    Json(stats)
}

async fn login(
    State(authenticator): State<GuardedAuthenticator>,
    jar: SignedCookieJar,
    Json(body): Json<LoginBody>,
) -> Response {
    debug!("login() called for {}", body.username);
    match authenticator.login(&body.username, &body.password) {
        Some(token) => {
            metrics::record_login_attempt("success");
            metrics::set_active_sessions(authenticator.active_sessions());
            let cookie = Cookie::build((COOKIE_SESSION_TOKEN_KEY, token.0.clone()))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax);
            (
                StatusCode::CREATED,
                jar.add(cookie),
                Json(LoginSuccessResponse { token: token.0 }),
            )
                .into_response()
        }
        None => {
            metrics::record_login_attempt("failure");
            warn!("Failed login attempt for {}", body.username);
            error_response(StatusCode::UNAUTHORIZED, "Invalid credentials")
        }
    }
}

async fn logout(
    State(authenticator): State<GuardedAuthenticator>,
    jar: SignedCookieJar,
    session: Session,
) -> Response {
    if !authenticator.logout(&session.token) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    metrics::set_active_sessions(authenticator.active_sessions());
    let jar = jar.remove(Cookie::build(COOKIE_SESSION_TOKEN_KEY).path("/"));
    (StatusCode::OK, jar).into_response()
}

async fn get_settings(
    _session: Session,
    State(settings): State<GuardedSettingsStore>,
) -> impl IntoResponse {
    Json(settings.snapshot().as_ref().clone())
}

/// Rejects library names Plex does not know as music libraries. When Plex
/// cannot be reached the names are accepted as they are.
async fn check_libraries_exist(plex: &GuardedPlex, requested: &[String]) -> Option<Response> {
    let available = match plex.list_libraries().await {
        Ok(libraries) => libraries,
        Err(err) => {
            metrics::record_plex_error("list_libraries", err.kind());
            warn!("Could not verify library names against Plex: {}", err);
            return None;
        }
    };

    let unknown: Vec<&str> = requested
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .filter(|name| !available.iter().any(|l| l.is_music() && l.name == *name))
        .collect();
    if unknown.is_empty() {
        None
    } else {
        Some(error_response(
            StatusCode::BAD_REQUEST,
            format!("Unknown music libraries: {}", unknown.join(", ")),
        ))
    }
}

async fn put_settings(
    _session: Session,
    State(state): State<ServerState>,
    body: Result<Json<SettingsUpdate>, JsonRejection>,
) -> Response {
    let update = match body {
        Ok(Json(update)) => update,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    if let Some(libraries) = &update.libraries {
        if let Some(response) = check_libraries_exist(&state.plex, libraries).await {
            return response;
        }
    }

    let interval_changed = update.batch_interval_minutes.is_some();
    match state.settings.update(update) {
        Ok(updated) => {
            state.activity.info(format!(
                "Settings saved: libraries [{}], {} rating {}, override {}, batch size {}, interval {} min",
                updated.libraries.join(", "),
                updated.rating_style,
                updated.rating_value,
                updated.override_rating,
                updated.batch_size,
                updated.batch_interval_minutes
            ));
            if interval_changed {
                if let Err(err) = state.scheduler.reschedule().await {
                    error!("Could not reschedule periodic runs: {}", err);
                }
            }
            Json(updated.as_ref().clone()).into_response()
        }
        Err(SettingsError::ConfigInvalid(reason)) => {
            state.activity.warn(format!("Settings rejected: {}", reason));
            error_response(StatusCode::BAD_REQUEST, reason)
        }
        Err(err) => {
            error!("Could not save settings: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not save settings")
        }
    }
}

async fn get_libraries(_session: Session, State(plex): State<GuardedPlex>) -> Response {
    match plex.list_libraries().await {
        Ok(libraries) => {
            let music: Vec<Library> = libraries.into_iter().filter(Library::is_music).collect();
            Json(music).into_response()
        }
        Err(err) => {
            metrics::record_plex_error("list_libraries", err.kind());
            error_response(
                StatusCode::BAD_GATEWAY,
                format!("Plex unavailable: {}", err),
            )
        }
    }
}

fn trigger_response(result: Result<u64, TriggerError>) -> Response {
    match result {
        Ok(run_id) => (StatusCode::ACCEPTED, Json(TriggerAccepted { run_id })).into_response(),
        Err(err @ TriggerError::Busy(_)) => error_response(StatusCode::CONFLICT, err.to_string()),
        Err(err @ TriggerError::Unavailable) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
    }
}

async fn trigger_full(_session: Session, State(scheduler): State<SchedulerHandle>) -> Response {
    trigger_response(scheduler.trigger_full_run(RunTrigger::Manual).await)
}

async fn trigger_last_batch(
    _session: Session,
    State(scheduler): State<SchedulerHandle>,
    Query(params): Query<LastBatchParams>,
) -> Response {
    let library = params.library.filter(|l| !l.trim().is_empty());
    trigger_response(
        scheduler
            .trigger_last_batch(library, RunTrigger::Manual)
            .await,
    )
}

async fn reset_ratings(_session: Session, State(scheduler): State<SchedulerHandle>) -> Response {
    trigger_response(scheduler.reset_ratings().await)
}

async fn get_runs(_session: Session, State(scheduler): State<SchedulerHandle>) -> impl IntoResponse {
    Json(scheduler.status().await)
}

async fn get_run(
    _session: Session,
    State(scheduler): State<SchedulerHandle>,
    Path(run_id): Path<u64>,
) -> Response {
    match scheduler.find_run(run_id).await {
        Some(summary) => Json(summary).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_log(_session: Session, State(activity): State<ActivityLog>) -> impl IntoResponse {
    Json(LogLines {
        lines: activity.lines(),
    })
}

async fn stream_log(
    _session: Session,
    State(activity): State<ActivityLog>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Lagging subscribers skip the lines they missed
    let stream = BroadcastStream::new(activity.subscribe())
        .filter_map(|line| line.ok())
        .map(|line| Ok(Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

impl ServerState {
    fn new(config: ServerConfig, services: ServerServices) -> ServerState {
        ServerState {
            config,
            start_time: Instant::now(),
            hash: env!("BUILD_HASH").to_owned(),
            settings: services.settings,
            plex: services.plex,
            scheduler: services.scheduler,
            activity: services.activity,
            authenticator: services.authenticator,
            cookie_key: cookie_key_from_secret(&services.session_secret),
        }
    }
}

pub fn make_app(config: ServerConfig, services: ServerServices) -> Result<Router> {
    let frontend_dir_path = config.frontend_dir_path.clone();
    let state = ServerState::new(config, services);

    let auth_routes: Router = Router::new()
        .route("/login", post(login))
        .route("/logout", get(logout))
        .with_state(state.clone());

    let api_routes: Router = Router::new()
        .route("/settings", get(get_settings).put(put_settings))
        .route("/libraries", get(get_libraries))
        .route("/trigger/full", post(trigger_full))
        .route("/trigger/last-batch", post(trigger_last_batch))
        .route("/ratings/reset", post(reset_ratings))
        .route("/runs", get(get_runs))
        .route("/runs/{id}", get(get_run))
        .route("/log", get(get_log))
        .route("/log/stream", get(stream_log))
        .with_state(state.clone());

    let home_router: Router = match frontend_dir_path {
        Some(frontend_path) => {
            let static_files_service =
                ServeDir::new(frontend_path).append_index_html_on_directories(true);
            Router::new()
                .route("/status", get(home))
                .route("/plex-webhook", post(plex_webhook))
                .with_state(state.clone())
                .fallback_service(static_files_service)
        }
        None => Router::new()
            .route("/", get(home))
            .route("/plex-webhook", post(plex_webhook))
            .with_state(state.clone()),
    };

    #[allow(unused_mut)]
    let mut app: Router = home_router
        .nest("/v1/auth", auth_routes)
        .nest("/v1", api_routes);

    #[cfg(feature = "slowdown")]
    {
        app = app.layer(middleware::from_fn(slowdown_request));
    }
    let app = app.layer(middleware::from_fn_with_state(state.clone(), log_requests));

    Ok(app)
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics::metrics_handler))
}

pub async fn run_server(config: ServerConfig, services: ServerServices) -> Result<()> {
    let host = config.host.clone();
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, services)?;

    if metrics_port != 0 {
        let metrics_listener = tokio::net::TcpListener::bind((host.as_str(), metrics_port))
            .await
            .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;
        tokio::spawn(async move {
            if let Err(err) = axum::serve(metrics_listener, make_metrics_app()).await {
                error!("Metrics server stopped: {}", err);
            }
        });
        info!("Metrics available at {}:{}/metrics", host, metrics_port);
    }

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    info!("Ready to serve at {}:{}", host, port);

    Ok(axum::serve(listener, app).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plex::InMemoryPlex;
    use crate::rating::{EngineOptions, RatingEngine};
    use crate::scheduler::create_scheduler;
    use crate::settings::Settings;
    use axum::{body::Body, http::Request};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        _dir: TempDir,
    }

    fn test_app() -> TestApp {
        test_app_with_config(ServerConfig::default())
    }

    fn test_app_with_config(config: ServerConfig) -> TestApp {
        let dir = TempDir::new().unwrap();
        let plex = Arc::new(InMemoryPlex::new());
        plex.add_music_library("Music");
        let settings = Arc::new(
            SettingsStore::open(
                dir.path().join("settings.json"),
                Settings {
                    libraries: vec!["Music".to_string()],
                    ..Settings::default()
                },
            )
            .unwrap(),
        );
        let activity = ActivityLog::default();
        let engine = RatingEngine::new(plex.clone(), activity.clone(), EngineOptions::default());
        let (_scheduler, handle) = create_scheduler(
            engine,
            settings.clone(),
            activity.clone(),
            CancellationToken::new(),
        );

        let app = make_app(
            config,
            ServerServices {
                settings,
                plex,
                scheduler: handle,
                activity,
                authenticator: Arc::new(Authenticator::new("admin", "secret")),
                session_secret: "test-secret".to_string(),
            },
        )
        .unwrap();

        TestApp { app, _dir: dir }
    }

    fn login_request(username: &str, password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(format!(
                r#"{{"username":"{}","password":"{}"}}"#,
                username, password
            )))
            .unwrap()
    }

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86_400 + 3 * 3600 + 4 * 60 + 5)),
            "2d 03:04:05"
        );
    }

    #[tokio::test]
    async fn responds_forbidden_on_protected_routes() {
        let test_app = test_app();

        let protected_routes = vec![
            ("GET", "/v1/settings"),
            ("PUT", "/v1/settings"),
            ("GET", "/v1/libraries"),
            ("POST", "/v1/trigger/full"),
            ("POST", "/v1/trigger/last-batch"),
            ("POST", "/v1/ratings/reset"),
            ("GET", "/v1/runs"),
            ("GET", "/v1/runs/1"),
            ("GET", "/v1/log"),
            ("GET", "/v1/log/stream"),
            ("GET", "/v1/auth/logout"),
        ];

        for (method, route) in protected_routes.into_iter() {
            let request = Request::builder()
                .method(method)
                .uri(route)
                .body(Body::empty())
                .unwrap();
            let response = test_app.app.clone().oneshot(request).await.unwrap();
            assert_eq!(
                response.status(),
                StatusCode::FORBIDDEN,
                "{} {}",
                method,
                route
            );
        }
    }

    #[tokio::test]
    async fn home_is_public() {
        let test_app = test_app();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["run_state"], "idle");
        assert_eq!(stats["logged_in"], false);
    }

    #[tokio::test]
    async fn serves_frontend_and_moves_status() {
        let frontend = TempDir::new().unwrap();
        std::fs::write(frontend.path().join("index.html"), "<h1>StarSync</h1>").unwrap();
        let test_app = test_app_with_config(ServerConfig {
            frontend_dir_path: Some(frontend.path().to_string_lossy().to_string()),
            ..ServerConfig::default()
        });

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<h1>StarSync</h1>");

        let request = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["run_state"], "idle");
    }

    #[tokio::test]
    async fn login_sets_cookie_and_token_opens_protected_routes() {
        let test_app = test_app();

        let response = test_app
            .app
            .clone()
            .oneshot(login_request("admin", "secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let set_cookie = response
            .headers()
            .get("set-cookie")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(set_cookie.starts_with(COOKIE_SESSION_TOKEN_KEY));

        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let login: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = login["token"].as_str().unwrap().to_string();

        let request = Request::builder()
            .uri("/v1/settings")
            .header("Authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Signed cookie works on its own
        let cookie_pair = set_cookie.split(';').next().unwrap().to_string();
        let request = Request::builder()
            .uri("/v1/log")
            .header("cookie", cookie_pair)
            .body(Body::empty())
            .unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unsigned_cookie_is_rejected() {
        let test_app = test_app();
        let response = test_app
            .app
            .clone()
            .oneshot(login_request("admin", "secret"))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let login: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = login["token"].as_str().unwrap();

        let request = Request::builder()
            .uri("/v1/settings")
            .header("cookie", format!("{}={}", COOKIE_SESSION_TOKEN_KEY, token))
            .body(Body::empty())
            .unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn bad_credentials_are_unauthorized() {
        let test_app = test_app();
        let response = test_app
            .app
            .clone()
            .oneshot(login_request("admin", "nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_needs_no_session() {
        let test_app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/plex-webhook")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"event":"media.play"}"#))
            .unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .method("POST")
            .uri("/plex-webhook")
            .body(Body::empty())
            .unwrap();
        let response = test_app.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_app_serves_metrics() {
        metrics::init_metrics();
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = make_metrics_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
