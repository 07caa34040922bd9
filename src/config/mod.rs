mod file_config;

pub use file_config::{FileConfig, RatingConfig};

use crate::server::RequestsLoggingLevel;
use crate::settings::{RatingStyle, Settings};
use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use rand::Rng;
use rand_distr::Alphanumeric;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.json";
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub settings_path: Option<PathBuf>,
    pub plex_url: Option<String>,
    pub plex_token: Option<String>,
    pub plex_timeout_sec: u64,
    pub rating_concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub session_secret: Option<String>,
    pub settings_defaults: SettingsDefaults,
}

/// Raw settings values from the environment, used when the settings file
/// does not exist yet or lacks a key.
#[derive(Debug, Clone, Default)]
pub struct SettingsDefaults {
    /// Comma-separated library names.
    pub libraries: Option<String>,
    pub rating_style: Option<String>,
    pub target_rating: Option<f64>,
    pub override_rating: Option<bool>,
    pub batch_size: Option<usize>,
    pub batch_interval_minutes: Option<u64>,
}

impl SettingsDefaults {
    pub fn to_settings(&self) -> Result<Settings> {
        let mut settings = Settings::default();
        if let Some(names) = &self.libraries {
            settings.libraries = names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(style) = &self.rating_style {
            settings.rating_style = style
                .parse::<RatingStyle>()
                .context("Invalid RATING_STYLE")?;
        }
        if let Some(value) = self.target_rating {
            settings.rating_value = value;
        }
        if let Some(override_rating) = self.override_rating {
            settings.override_rating = override_rating;
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = batch_size;
        }
        if let Some(minutes) = self.batch_interval_minutes {
            settings.batch_interval_minutes = minutes;
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub settings_path: PathBuf,
    pub plex: PlexSettings,
    pub rating: RatingSettings,
    pub auth: AuthSettings,
    pub default_settings: Settings,
}

#[derive(Debug, Clone)]
pub struct PlexSettings {
    pub url: String,
    pub token: String,
    pub timeout_sec: u64,
}

impl PlexSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

#[derive(Debug, Clone)]
pub struct RatingSettings {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Clone)]
pub struct AuthSettings {
    pub username: String,
    /// Argon2 PHC string or plaintext.
    pub password: String,
    pub session_secret: String,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let host = file.host.unwrap_or_else(|| cli.host.clone());
        let host = if host.trim().is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            host
        };
        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        if port == metrics_port && port != 0 {
            bail!("port and metrics_port must differ (both are {})", port);
        }

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let frontend_dir_path = file
            .frontend_dir_path
            .or_else(|| cli.frontend_dir_path.clone());

        let settings_path = file
            .settings_path
            .map(PathBuf::from)
            .or_else(|| cli.settings_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

        let plex_url = file
            .plex_url
            .or_else(|| cli.plex_url.clone())
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("plex_url must be specified via --plex-url/PLEX_URL or in config file")
            })?;
        if !plex_url.starts_with("http://") && !plex_url.starts_with("https://") {
            bail!("plex_url must start with http:// or https://, got {}", plex_url);
        }
        let plex_token = cli
            .plex_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("PLEX_TOKEN must be set"))?;
        let plex = PlexSettings {
            url: plex_url,
            token: plex_token,
            timeout_sec: file.plex_timeout_sec.unwrap_or(cli.plex_timeout_sec),
        };

        let rating_file = file.rating.unwrap_or_default();
        let rating = RatingSettings {
            concurrency: rating_file
                .concurrency
                .unwrap_or(cli.rating_concurrency)
                .max(1),
            max_retries: rating_file.max_retries.unwrap_or(cli.max_retries),
            retry_backoff_ms: rating_file.retry_backoff_ms.unwrap_or(cli.retry_backoff_ms),
        };

        let (username, password) = match (&cli.username, &cli.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u.clone(), p.clone()),
            _ => bail!("APP_USERNAME and APP_PASSWORD must be set"),
        };
        let session_secret = match &cli.session_secret {
            Some(secret) if !secret.is_empty() => secret.clone(),
            _ => {
                warn!("SESSION_SECRET not set, signing session cookies with a random key");
                rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(64)
                    .map(char::from)
                    .collect()
            }
        };

        let default_settings = cli.settings_defaults.to_settings()?;

        Ok(Self {
            host,
            port,
            metrics_port,
            logging_level,
            frontend_dir_path,
            settings_path,
            plex,
            rating,
            auth: AuthSettings {
                username,
                password,
                session_secret,
            },
            default_settings,
        })
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
