//! Persisted desktop settings
//!
//! A flat key/value document (`desktop/background`, `desktop/fetched`, ...)
//! stored as JSON. [`RotationState`] is the typed view the rotation engine
//! works with; it is read once at construction and written back key by key
//! whenever the engine changes a timestamp.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

use crate::error::SettingsError;

pub const KEY_BACKGROUND: &str = "desktop/background";
pub const KEY_FETCHED: &str = "desktop/fetched";
pub const KEY_CHANGED: &str = "desktop/changed";
pub const KEY_WAIT_TIME: &str = "desktop/waitTime";
pub const KEY_STRETCH_STYLE: &str = "desktop/stretchStyle";
pub const KEY_SHOW_LABELS: &str = "desktop/showLabels";
pub const KEY_BAR_ON_TOP: &str = "bar/onTop";

const DEFAULT_BACKGROUND: &str = "inbuilt:triangles";
const DEFAULT_WAIT_MINUTES: u32 = 30;

/// Key/value settings, optionally backed by a JSON file
#[derive(Debug, Default)]
pub struct Settings {
    path: Option<PathBuf>,
    values: Map<String, Value>,
}

impl Settings {
    /// Settings that live only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load settings from `path`; a missing file yields empty settings
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(data) if data.is_empty() => Map::new(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            values,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Typed read; missing or mistyped values fall back to `default`
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring malformed setting {}: {}", key, e);
                None
            }
        }
    }

    /// Store a value and write the file through
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), serde_json::to_value(value)?);
        self.save()
    }

    fn save(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let data = serde_json::to_vec_pretty(&self.values)?;
        fs::write(path, data).map_err(|source| SettingsError::Io {
            path: path.clone(),
            source,
        })
    }
}

/// Where the desktop background comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum BackgroundSource {
    /// Vector art bundled with the shell, e.g. `inbuilt:triangles`
    Inbuilt(String),
    /// Rotating community photo feed
    Community,
    /// Arbitrary image file chosen by the user
    File(PathBuf),
}

impl From<String> for BackgroundSource {
    fn from(value: String) -> Self {
        if let Some(name) = value.strip_prefix("inbuilt:") {
            BackgroundSource::Inbuilt(name.to_string())
        } else if value.starts_with("community") {
            BackgroundSource::Community
        } else {
            BackgroundSource::File(PathBuf::from(value))
        }
    }
}

impl From<BackgroundSource> for String {
    fn from(source: BackgroundSource) -> String {
        source.to_string()
    }
}

impl std::fmt::Display for BackgroundSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundSource::Inbuilt(name) => write!(f, "inbuilt:{}", name),
            BackgroundSource::Community => write!(f, "community"),
            BackgroundSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Image placement style, stored as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum StretchStyle {
    #[default]
    Stretch,
    ZoomCrop,
    Center,
    Tile,
    ZoomFit,
}

impl From<u8> for StretchStyle {
    fn from(value: u8) -> Self {
        match value {
            1 => StretchStyle::ZoomCrop,
            2 => StretchStyle::Center,
            3 => StretchStyle::Tile,
            4 => StretchStyle::ZoomFit,
            _ => StretchStyle::Stretch,
        }
    }
}

/// Display configuration the engine reads but never writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct DisplayOptions {
    pub stretch: StretchStyle,
    pub show_labels: bool,
    pub bar_on_top: bool,
}

impl DisplayOptions {
    pub fn load(settings: &Settings) -> Self {
        Self {
            stretch: StretchStyle::from(settings.get_or::<u8>(KEY_STRETCH_STYLE, 0)),
            show_labels: settings.get_or(KEY_SHOW_LABELS, true),
            bar_on_top: settings.get_or(KEY_BAR_ON_TOP, false),
        }
    }
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            stretch: StretchStyle::Stretch,
            show_labels: true,
            bar_on_top: false,
        }
    }
}

/// In-memory mirror of the rotation keys
#[derive(Debug, Clone, PartialEq)]
pub struct RotationState {
    pub source: BackgroundSource,
    /// Last successful manifest refresh
    pub fetched: Option<DateTime<Utc>>,
    /// Last displayed-image swap
    pub changed: Option<DateTime<Utc>>,
    pub wait_minutes: u32,
    pub display: DisplayOptions,
}

impl RotationState {
    pub fn load(settings: &Settings) -> Self {
        Self {
            source: settings
                .get::<String>(KEY_BACKGROUND)
                .map(BackgroundSource::from)
                .unwrap_or_else(|| BackgroundSource::from(DEFAULT_BACKGROUND.to_string())),
            fetched: settings.get(KEY_FETCHED),
            changed: settings.get(KEY_CHANGED),
            wait_minutes: settings.get_or(KEY_WAIT_TIME, DEFAULT_WAIT_MINUTES),
            display: DisplayOptions::load(settings),
        }
    }

    /// Minutes between swaps; zero would re-fire forever
    pub fn wait_time(&self) -> Duration {
        Duration::minutes(i64::from(self.wait_minutes.max(1)))
    }

    pub fn set_fetched(
        &mut self,
        settings: &mut Settings,
        at: DateTime<Utc>,
    ) -> Result<(), SettingsError> {
        self.fetched = Some(at);
        settings.set(KEY_FETCHED, at)
    }

    pub fn set_changed(
        &mut self,
        settings: &mut Settings,
        at: DateTime<Utc>,
    ) -> Result<(), SettingsError> {
        self.changed = Some(at);
        settings.set(KEY_CHANGED, at)
    }

    pub fn set_source(
        &mut self,
        settings: &mut Settings,
        source: BackgroundSource,
    ) -> Result<(), SettingsError> {
        settings.set(KEY_BACKGROUND, source.to_string())?;
        self.source = source;
        Ok(())
    }

    pub fn set_wait_minutes(
        &mut self,
        settings: &mut Settings,
        minutes: u32,
    ) -> Result<(), SettingsError> {
        settings.set(KEY_WAIT_TIME, minutes)?;
        self.wait_minutes = minutes;
        Ok(())
    }
}
