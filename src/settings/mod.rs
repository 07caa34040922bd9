mod models;
mod store;

pub use models::{RatingStyle, Settings, SettingsError, SettingsUpdate, RATING_EPSILON};
pub use store::{SettingsSource, SettingsStore};
