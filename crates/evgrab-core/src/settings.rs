// Evgrab Settings Module
// Optional TOML settings file with capture defaults

use std::path::{Path, PathBuf};

use crate::event::{CaptureOptions, MAX_EVENTS};

/// Settings for evgrab, loaded from a TOML file
/// (default: ~/.config/evgrab/settings.toml).
///
/// Command-line flags take precedence over everything here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Devices captured when none are given on the command line
    devices: Vec<PathBuf>,

    /// Whether devices are grabbed exclusively
    grab: bool,

    /// Ready sources handled per wait
    max_events: usize,

    /// File these settings were read from, if any
    source_path: Option<PathBuf>,
}

/// Errors that can occur when loading settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Invalid setting value: {0}")]
    InvalidValue(String),
}

/// TOML representation for deserializing settings
#[derive(Debug, Clone, serde::Deserialize, Default)]
struct SettingsToml {
    #[serde(default)]
    capture: Option<CaptureSettings>,

    #[serde(default)]
    devices: Option<DeviceSettings>,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct CaptureSettings {
    #[serde(default)]
    grab: Option<bool>,

    #[serde(default)]
    max_events: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct DeviceSettings {
    #[serde(default)]
    paths: Vec<PathBuf>,
}

impl Settings {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            grab: true,
            max_events: MAX_EVENTS,
            source_path: None,
        }
    }

    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(&path)?;
        let mut settings = Self::from_toml(&content)?;
        settings.source_path = Some(path.as_ref().to_path_buf());
        Ok(settings)
    }

    /// Load settings from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let toml_settings: SettingsToml =
            toml::from_str(content).map_err(|e| SettingsError::TomlParse(e.to_string()))?;

        let mut settings = Self::new();

        if let Some(capture) = toml_settings.capture {
            if let Some(grab) = capture.grab {
                settings.grab = grab;
            }
            if let Some(max_events) = capture.max_events {
                settings.max_events = usize::try_from(max_events)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        SettingsError::InvalidValue(format!(
                            "max_events must be a positive integer, got {}",
                            max_events
                        ))
                    })?;
            }
        }

        if let Some(devices) = toml_settings.devices {
            settings.devices = devices.paths;
        }

        Ok(settings)
    }

    /// Get the default settings path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("evgrab").join("settings.toml"))
    }

    /// Load from default location (~/.config/evgrab/settings.toml)
    pub fn load_default() -> Result<Self, SettingsError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::from_file(path);
            }
        }
        // Return default settings if file doesn't exist
        Ok(Self::new())
    }

    pub fn devices(&self) -> &[PathBuf] {
        &self.devices
    }

    pub fn grab(&self) -> bool {
        self.grab
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Capture options derived from these settings
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            grab: self.grab,
            max_events: self.max_events,
            ..CaptureOptions::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// Create default settings content for a new installation
pub fn default_settings_content() -> &'static str {
    r#"# Evgrab Settings
# Place this file at: ~/.config/evgrab/settings.toml

[capture]
# Grab devices exclusively so no other reader sees their events
grab = true
# Ready sources handled per wait
max_events = 10

[devices]
# Devices captured when none are given on the command line
# paths = ["/dev/input/event3"]
"#
}
