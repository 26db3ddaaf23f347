//! Runtime settings
//!
//! Settings a user can change while the server runs. They are seeded from the TOML config
//! on first start, persisted in the store's `settings` table and read by the tools and
//! pipelines on every job, so a change takes effect without a restart.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AppConfig;

/// Persisted user settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Load the analysis models when the processing worker starts
    pub warm_up_processor: bool,
    /// Run speaker analysis; when off, items only get metadata
    pub identify_speakers: bool,
    /// Browser to read remote session cookies from
    pub cookies_from_browser: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            warm_up_processor: true,
            identify_speakers: true,
            cookies_from_browser: None,
        }
    }
}

impl RuntimeSettings {
    /// Defaults taken from the static config
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            warm_up_processor: config.analysis.warm_up,
            identify_speakers: true,
            cookies_from_browser: config.download.cookies_from_browser.clone(),
        }
    }

    /// Apply a partial update. An empty browser name clears the cookie source.
    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(warm_up) = update.warm_up_processor {
            self.warm_up_processor = warm_up;
        }
        if let Some(identify) = update.identify_speakers {
            self.identify_speakers = identify;
        }
        if let Some(browser) = update.cookies_from_browser {
            let browser = browser.trim();
            self.cookies_from_browser = (!browser.is_empty()).then(|| browser.to_string());
        }
    }
}

/// Partial settings change; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub warm_up_processor: Option<bool>,
    #[serde(default)]
    pub identify_speakers: Option<bool>,
    #[serde(default)]
    pub cookies_from_browser: Option<String>,
}

/// Shared, live view of the current settings
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<RuntimeSettings>>,
}

impl SharedSettings {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self) -> RuntimeSettings {
        self.inner.read().clone()
    }

    pub fn replace(&self, settings: RuntimeSettings) {
        *self.inner.write() = settings;
    }

    pub fn identify_speakers(&self) -> bool {
        self.inner.read().identify_speakers
    }

    pub fn cookies_from_browser(&self) -> Option<String> {
        self.inner.read().cookies_from_browser.clone()
    }
}
