//! Persisted settings
//!
//! Operator-facing state that survives restarts: the active volume path,
//! the display time zone and a short most-recent-first path history.
//! Stored as `settings.toml` in the workdir; a missing or unreadable file
//! falls back to defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DvrError, Result};

pub const SETTINGS_FILE: &str = "settings.toml";

/// Path history entries kept.
const MAX_PATH_HISTORY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Active recording volume path; empty when nothing is mounted.
    pub storage_path: String,

    /// IANA time zone used for date listings.
    pub timezone: String,

    /// Previously mounted paths, most recent first.
    pub path_history: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_path: String::new(),
            // The device class this serves is deployed on CST; matches the
            // vendor client's default.
            timezone: "Asia/Shanghai".to_string(),
            path_history: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bad settings file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DvrError::Config(format!("serialize settings: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Record a mounted path: moved (or inserted) to the history front,
    /// history bounded.
    pub fn remember_path(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        self.path_history.retain(|p| p != path);
        self.path_history.insert(0, path.to_string());
        self.path_history.truncate(MAX_PATH_HISTORY);
    }

    /// Parsed display zone; an invalid stored zone degrades to the default.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Asia::Shanghai)
    }
}

/// Validate an operator-supplied zone name.
pub fn parse_timezone(name: &str) -> Result<chrono_tz::Tz> {
    name.parse()
        .map_err(|_| DvrError::Config(format!("unknown time zone {:?}", name)))
}
