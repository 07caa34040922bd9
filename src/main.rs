use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use starsync::activity_log::ActivityLog;
use starsync::auth::Authenticator;
use starsync::config::{self, DEFAULT_HOST};
use starsync::plex::{PlexApi, PlexClient};
use starsync::rating::{EngineOptions, RatingEngine, RetryPolicy, DEFAULT_CONCURRENCY};
use starsync::scheduler::create_scheduler;
use starsync::server::{metrics, run_server, RequestsLoggingLevel, ServerConfig, ServerServices};
use starsync::settings::SettingsStore;

#[derive(Parser, Debug)]
#[clap(version, about = "Automatically rates unrated Plex music tracks")]
struct CliArgs {
    /// Path to a TOML config file. Values in it override the command line.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Path to the persisted settings JSON file.
    #[clap(long, env = "SETTINGS_PATH")]
    pub settings_path: Option<PathBuf>,

    /// The address to listen on.
    #[clap(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 5454)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping), 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Directory with a static web frontend to serve at the root path.
    #[clap(long)]
    pub frontend_dir_path: Option<String>,

    /// Base URL of the Plex server.
    #[clap(long, env = "PLEX_URL")]
    pub plex_url: Option<String>,

    #[clap(long, env = "PLEX_TOKEN", hide_env_values = true)]
    pub plex_token: Option<String>,

    /// Timeout in seconds for Plex requests.
    #[clap(long, default_value_t = 30)]
    pub plex_timeout_sec: u64,

    /// Maximum number of rating writes in flight.
    #[clap(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub rating_concurrency: usize,

    /// Retries for transient Plex failures.
    #[clap(long, default_value_t = 1)]
    pub max_retries: u32,

    #[clap(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Comma-separated names of the music libraries to rate.
    #[clap(long, env = "LIBRARY_NAME")]
    pub library_name: Option<String>,

    /// One of 1star, 5stars, 5stars_half.
    #[clap(long, env = "RATING_STYLE")]
    pub rating_style: Option<String>,

    #[clap(long, env = "TARGET_RATING")]
    pub target_rating: Option<f64>,

    #[clap(long, env = "OVERRIDE_RATING")]
    pub override_rating: Option<bool>,

    #[clap(long, env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Minutes between periodic runs, 0 disables them.
    #[clap(long, env = "BATCH_INTERVAL_MINUTES")]
    pub batch_interval_minutes: Option<u64>,

    #[clap(long, env = "APP_USERNAME")]
    pub username: Option<String>,

    /// Plaintext or an argon2 PHC string.
    #[clap(long, env = "APP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[clap(long, env = "SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            host: args.host.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level.clone(),
            frontend_dir_path: args.frontend_dir_path.clone(),
            settings_path: args.settings_path.clone(),
            plex_url: args.plex_url.clone(),
            plex_token: args.plex_token.clone(),
            plex_timeout_sec: args.plex_timeout_sec,
            rating_concurrency: args.rating_concurrency,
            max_retries: args.max_retries,
            retry_backoff_ms: args.retry_backoff_ms,
            username: args.username.clone(),
            password: args.password.clone(),
            session_secret: args.session_secret.clone(),
            settings_defaults: config::SettingsDefaults {
                libraries: args.library_name.clone(),
                rating_style: args.rating_style.clone(),
                target_rating: args.target_rating,
                override_rating: args.override_rating,
                batch_size: args.batch_size,
                batch_interval_minutes: args.batch_interval_minutes,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine, the environment may already be set
    let dotenv_path = dotenvy::dotenv().ok();

    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    if let Some(path) = dotenv_path {
        info!("Loaded environment from {:?}", path);
    }

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  settings_path: {:?}", app_config.settings_path);
    info!("  plex_url: {}", app_config.plex.url);
    info!("  listening on: {}:{}", app_config.host, app_config.port);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let settings = Arc::new(
        SettingsStore::open(&app_config.settings_path, app_config.default_settings.clone())
            .context("Failed to load settings")?,
    );
    let current = settings.snapshot();
    info!(
        "Settings ({:?}): libraries [{}], {} rating {}, override {}, batch size {}, interval {} min",
        settings.source(),
        current.libraries.join(", "),
        current.rating_style,
        current.rating_value,
        current.override_rating,
        current.batch_size,
        current.batch_interval_minutes
    );

    let plex: Arc<dyn PlexApi> = Arc::new(PlexClient::new(
        &app_config.plex.url,
        &app_config.plex.token,
        app_config.plex.timeout(),
    )?);

    let activity = ActivityLog::default();
    let engine = RatingEngine::new(
        plex.clone(),
        activity.clone(),
        EngineOptions {
            concurrency: app_config.rating.concurrency,
            retry_policy: RetryPolicy::new(
                app_config.rating.max_retries,
                Duration::from_millis(app_config.rating.retry_backoff_ms),
            ),
        },
    );

    let shutdown_token = CancellationToken::new();
    let (mut scheduler, scheduler_handle) = create_scheduler(
        engine,
        settings.clone(),
        activity.clone(),
        shutdown_token.clone(),
    );

    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        host: app_config.host.clone(),
        port: app_config.port,
        metrics_port: app_config.metrics_port,
        frontend_dir_path: app_config.frontend_dir_path.clone(),
    };
    let services = ServerServices {
        settings,
        plex,
        scheduler: scheduler_handle,
        activity,
        authenticator: Arc::new(Authenticator::from_settings(&app_config.auth)),
        session_secret: app_config.auth.session_secret.clone(),
    };

    let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });

    // Run HTTP server and scheduler concurrently
    let result = tokio::select! {
        result = run_server(server_config, services) => {
            info!("HTTP server stopped: {:?}", result);
            result
        },
        _ = &mut scheduler_task => {
            info!("Scheduler stopped");
            return Ok(());
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok(())
        }
    };

    // Lets an in-flight run stop between pages and record its summary
    shutdown_token.cancel();
    if let Err(err) = scheduler_task.await {
        error!("Scheduler task failed: {}", err);
    }

    result
}
