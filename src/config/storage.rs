//! Update Settings Storage
//!
//! Persists the bundle pointer, the fallback history and the small set of
//! update flags in a JSON file:
//! - Atomic writes using temp file + rename
//! - Thread-safe access via RwLock
//! - Default settings generation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::update::BundleRecord;

/// Settings store error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Settings result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Persisted update settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettings {
    /// Settings schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Query the test feed instead of the production feed
    #[serde(default)]
    pub use_test_feed_url: bool,

    /// Build number accepted by the last native install
    #[serde(default)]
    pub update_build_number: Option<String>,

    /// Host version the current bundle was activated on
    #[serde(default)]
    pub native_version: Option<String>,

    /// Currently active bundle
    #[serde(default)]
    pub current_bundle: Option<BundleRecord>,

    /// Superseded bundles, oldest first
    #[serde(default)]
    pub fallback_bundles: Vec<BundleRecord>,

    /// Last detached signature fetched for the native channel
    #[serde(default)]
    pub signature_document: Option<String>,

    /// Last modified timestamp
    #[serde(default = "default_timestamp")]
    pub last_modified: String,
}

fn default_version() -> u32 {
    1
}

fn default_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            use_test_feed_url: false,
            update_build_number: None,
            native_version: None,
            current_bundle: None,
            fallback_bundles: Vec::new(),
            signature_document: None,
            last_modified: default_timestamp(),
        }
    }
}

/// Settings store with thread-safe access
pub struct SettingsStore {
    settings: Arc<RwLock<UpdateSettings>>,
    path: PathBuf,
}

impl SettingsStore {
    /// Open the store, creating a default file if none exists
    pub async fn open(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let settings = if path.exists() {
            Self::load_from_file(&path).await?
        } else {
            let defaults = UpdateSettings::default();
            Self::save_to_file(&path, &defaults).await?;
            defaults
        };

        if settings.version != default_version() {
            return Err(ConfigError::Invalid(format!(
                "unsupported settings version {}",
                settings.version
            )));
        }

        Ok(Self {
            settings: Arc::new(RwLock::new(settings)),
            path,
        })
    }

    async fn load_from_file(path: &Path) -> ConfigResult<UpdateSettings> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save settings to file with atomic write
    async fn save_to_file(path: &Path, settings: &UpdateSettings) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(settings)?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, path).await?;

        Ok(())
    }

    /// Get current settings (read-only copy)
    pub async fn get(&self) -> UpdateSettings {
        self.settings.read().await.clone()
    }

    /// Apply `updater` to a copy, persist it, then commit in memory.
    ///
    /// A failed write leaves both the file and the in-memory settings as
    /// they were.
    pub async fn update<F, T>(&self, updater: F) -> ConfigResult<T>
    where
        F: FnOnce(&mut UpdateSettings) -> T,
    {
        let mut settings = self.settings.write().await;

        let mut next = settings.clone();
        let out = updater(&mut next);
        next.last_modified = default_timestamp();

        Self::save_to_file(&self.path, &next).await?;
        *settings = next;

        Ok(out)
    }

    /// Settings file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// Convenience methods for individual settings
impl SettingsStore {
    pub async fn current_bundle(&self) -> Option<BundleRecord> {
        self.settings.read().await.current_bundle.clone()
    }

    pub async fn fallback_bundles(&self) -> Vec<BundleRecord> {
        self.settings.read().await.fallback_bundles.clone()
    }

    pub async fn use_test_feed_url(&self) -> bool {
        self.settings.read().await.use_test_feed_url
    }

    pub async fn set_use_test_feed_url(&self, enabled: bool) -> ConfigResult<()> {
        self.update(|s| s.use_test_feed_url = enabled).await
    }

    /// Record the build number the user accepted for installation
    pub async fn set_update_build_number(&self, build_number: Option<String>) -> ConfigResult<()> {
        self.update(|s| s.update_build_number = build_number).await
    }

    /// Build number recorded by the previous native install, if any
    pub async fn previous_build_number(&self) -> Option<String> {
        self.settings.read().await.update_build_number.clone()
    }

    pub async fn signature_document(&self) -> Option<String> {
        self.settings.read().await.signature_document.clone()
    }

    pub async fn set_signature_document(&self, document: Option<String>) -> ConfigResult<()> {
        self.update(|s| s.signature_document = document).await
    }

    /// Forget the native-channel flags (build number, stored signature)
    pub async fn clear_update_settings(&self) -> ConfigResult<()> {
        self.update(|s| {
            s.update_build_number = None;
            s.signature_document = None;
        })
        .await
    }

    /// Forget every bundle record; the extracted directories are not touched
    pub async fn clear_bundle_records(&self) -> ConfigResult<()> {
        self.update(|s| {
            s.current_bundle = None;
            s.fallback_bundles.clear();
            s.native_version = None;
        })
        .await
    }
}
