use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Two ratings closer than this are considered equal (Plex stores floats).
pub const RATING_EPSILON: f64 = 0.01;

/// Highest value on Plex's internal 0-10 rating scale.
const PLEX_MAX_RATING: f64 = 10.0;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Failed to persist settings: {0:#}")]
    Persist(anyhow::Error),
}

/// Granularity of the rating scale shown to users.
///
/// Serialized with the same identifiers the settings file has always used,
/// the descriptive names are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingStyle {
    #[serde(rename = "1star", alias = "single-star")]
    SingleStar,
    #[serde(rename = "5stars", alias = "five-star")]
    FiveStars,
    #[serde(rename = "5stars_half", alias = "five-star-half-step")]
    FiveStarsHalf,
}

impl RatingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingStyle::SingleStar => "1star",
            RatingStyle::FiveStars => "5stars",
            RatingStyle::FiveStarsHalf => "5stars_half",
        }
    }

    /// Validates `value` against this style and converts it to Plex's 0-10 scale.
    ///
    /// Values are never rounded: anything outside the style's domain is
    /// rejected with `ConfigInvalid`.
    pub fn to_plex_rating(&self, value: f64) -> Result<f64, SettingsError> {
        if !value.is_finite() {
            return Err(SettingsError::ConfigInvalid(format!(
                "rating value must be a number, got {}",
                value
            )));
        }
        match self {
            RatingStyle::SingleStar => {
                if value == 0.0 {
                    Ok(0.0)
                } else if value == 1.0 {
                    Ok(PLEX_MAX_RATING)
                } else {
                    Err(SettingsError::ConfigInvalid(format!(
                        "1star rating must be 0 or 1, got {}",
                        value
                    )))
                }
            }
            RatingStyle::FiveStars => {
                if value.fract() != 0.0 || !(1.0..=5.0).contains(&value) {
                    return Err(SettingsError::ConfigInvalid(format!(
                        "5stars rating must be an integer between 1 and 5, got {}",
                        value
                    )));
                }
                Ok(value * 2.0)
            }
            RatingStyle::FiveStarsHalf => {
                if (value * 2.0).fract() != 0.0 || !(1.0..=5.0).contains(&value) {
                    return Err(SettingsError::ConfigInvalid(format!(
                        "5stars_half rating must be between 1 and 5 in 0.5 steps, got {}",
                        value
                    )));
                }
                Ok(value * 2.0)
            }
        }
    }
}

impl fmt::Display for RatingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RatingStyle {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1star" | "single-star" => Ok(RatingStyle::SingleStar),
            "5stars" | "five-star" => Ok(RatingStyle::FiveStars),
            "5stars_half" | "five-star-half-step" => Ok(RatingStyle::FiveStarsHalf),
            other => Err(SettingsError::ConfigInvalid(format!(
                "unknown rating style '{}'",
                other
            ))),
        }
    }
}

/// User-editable settings driving every rating run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub libraries: Vec<String>,
    pub rating_style: RatingStyle,
    pub rating_value: f64,
    pub override_rating: bool,
    pub batch_size: usize,
    pub batch_interval_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            libraries: Vec::new(),
            rating_style: RatingStyle::FiveStars,
            rating_value: 3.0,
            override_rating: false,
            batch_size: 500,
            batch_interval_minutes: 60,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(pos) = self.libraries.iter().position(|l| l.trim().is_empty()) {
            return Err(SettingsError::ConfigInvalid(format!(
                "library name at position {} is empty",
                pos
            )));
        }
        if self.batch_size == 0 {
            return Err(SettingsError::ConfigInvalid(
                "batch size must be a positive integer".to_string(),
            ));
        }
        self.rating_style.to_plex_rating(self.rating_value)?;
        Ok(())
    }

    /// Target rating on Plex's 0-10 scale.
    pub fn target_plex_rating(&self) -> Result<f64, SettingsError> {
        self.rating_style.to_plex_rating(self.rating_value)
    }

    /// Interval of the periodic trigger, `None` when disabled.
    pub fn batch_interval(&self) -> Option<Duration> {
        match self.batch_interval_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        }
    }

    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(libraries) = update.libraries {
            self.libraries = libraries.into_iter().map(|l| l.trim().to_string()).collect();
        }
        if let Some(style) = update.rating_style {
            self.rating_style = style;
        }
        if let Some(value) = update.rating_value {
            self.rating_value = value;
        }
        if let Some(override_rating) = update.override_rating {
            self.override_rating = override_rating;
        }
        if let Some(batch_size) = update.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(minutes) = update.batch_interval_minutes {
            self.batch_interval_minutes = minutes;
        }
    }
}

/// Partial settings, used both for updates from the API and for the
/// on-disk settings file (absent keys keep their current value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libraries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_style: Option<RatingStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_rating: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_interval_minutes: Option<u64>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == SettingsUpdate::default()
    }
}
