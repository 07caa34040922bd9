use super::models::{Settings, SettingsError, SettingsUpdate};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Where the settings came from when the store was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSource {
    /// The settings file existed and was read.
    File,
    /// No settings file, one was written from the environment defaults.
    Created,
    /// The settings file could not be read or parsed, defaults are in use.
    Fallback,
}

/// Owns the current settings and their on-disk JSON representation.
///
/// Readers get a cheap `Arc` snapshot; updates are validated and written to
/// disk before becoming visible.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Arc<Settings>>,
    source: SettingsSource,
}

impl SettingsStore {
    /// Opens the settings file at `path`, layering it over `defaults`.
    ///
    /// Fails only if the resulting settings are invalid or a missing file
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>, defaults: Settings) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();

        let (settings, source) = if path.exists() {
            match read_settings_file(&path) {
                Ok(from_file) => {
                    let mut settings = defaults;
                    settings.apply(from_file);
                    (settings, SettingsSource::File)
                }
                Err(err) => {
                    warn!(
                        "Could not read settings file {:?}, using environment defaults: {:#}",
                        path, err
                    );
                    (defaults, SettingsSource::Fallback)
                }
            }
        } else {
            info!(
                "Settings file {:?} not found, creating it from environment defaults",
                path
            );
            defaults.validate()?;
            write_settings_file(&path, &defaults).map_err(SettingsError::Persist)?;
            (defaults, SettingsSource::Created)
        };

        settings.validate()?;

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(settings)),
            source,
        })
    }

    pub fn source(&self) -> SettingsSource {
        self.source
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies a partial update.
    ///
    /// The update is validated and persisted while holding the write lock, on
    /// any error the previous settings stay in effect.
    pub fn update(&self, update: SettingsUpdate) -> Result<Arc<Settings>, SettingsError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = (**guard).clone();
        next.apply(update);
        next.validate()?;

        write_settings_file(&self.path, &next).map_err(SettingsError::Persist)?;

        let next = Arc::new(next);
        *guard = next.clone();
        debug!("Settings updated and saved to {:?}", self.path);
        Ok(next)
    }
}

fn read_settings_file(path: &Path) -> anyhow::Result<SettingsUpdate> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let parsed: SettingsUpdate =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(parsed)
}

/// Writes to a sibling temp file then renames it over the target, so a crash
/// never leaves a truncated settings file behind.
fn write_settings_file(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let json = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "settings.json".into());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, json).with_context(|| format!("Failed to write {:?}", tmp_path))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move {:?} to {:?}", tmp_path, path))?;
    Ok(())
}
