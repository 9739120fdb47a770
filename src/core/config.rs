//! Updater configuration
//!
//! Paths, timeouts and the pinned publisher key used by every stage of the
//! update pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hex-encoded Ed25519 key of the release publisher, compiled into the binary.
pub const PUBLISHER_PUBLIC_KEY: &str =
    "5e4b4d640d9ec9eaeca7cdb6ead8459e2ade6313e1a70e4cf9072cbecf33c567";

/// Suffix appended to a native package URL to locate its signed checksum file.
pub const DEFAULT_SIGNATURE_SUFFIX: &str = ".SHA256SUMS.asc";

/// Main updater configuration
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Version of the running host application
    pub app_version: String,

    /// Staging directory for native packages
    pub native_download_dir: PathBuf,

    /// Staging directory for bundle archives
    pub bundle_download_dir: PathBuf,

    /// Root holding one extracted directory per installed bundle
    pub bundle_root: PathBuf,

    /// Persisted update settings (bundle pointer, fallback history, flags)
    pub settings_path: PathBuf,

    /// Wall-clock ceiling for a single download attempt
    pub download_timeout: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Minimum interval between two progress events
    pub progress_interval: Duration,

    /// Number of superseded bundles kept for rollback
    pub max_fallback_bundles: usize,

    /// Hex-encoded publisher key
    pub public_key: String,

    /// Suffix of the detached signature next to native packages
    pub signature_suffix: String,

    /// Delay before relaunching after an activation
    pub relaunch_delay: Duration,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        let app_version = env!("CARGO_PKG_VERSION").to_string();
        let data_dir = directories::BaseDirs::new()
            .map(|dirs| dirs.data_local_dir().join("DesktopWallet"))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::with_root(&data_dir, app_version);
        config.native_download_dir = data_dir.join("updater-cache");
        config
    }
}

impl UpdaterConfig {
    /// Place every on-disk area under a single root directory
    pub fn with_root(root: &Path, app_version: impl Into<String>) -> Self {
        let app_version = app_version.into();
        Self {
            user_agent: format!("desktop-updater/{}", app_version),
            app_version,
            native_download_dir: root.join("native-download"),
            bundle_download_dir: root.join("bundle-download"),
            bundle_root: root.join("bundles"),
            settings_path: root.join("update-settings.json"),
            download_timeout: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(100),
            max_fallback_bundles: 3,
            public_key: PUBLISHER_PUBLIC_KEY.to_string(),
            signature_suffix: DEFAULT_SIGNATURE_SUFFIX.to_string(),
            relaunch_delay: Duration::from_millis(1200),
        }
    }

    /// Override the pinned publisher key
    pub fn with_public_key(mut self, key_hex: impl Into<String>) -> Self {
        self.public_key = key_hex.into();
        self
    }

    /// Override the download wall-clock ceiling
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Override the relaunch delay
    pub fn with_relaunch_delay(mut self, delay: Duration) -> Self {
        self.relaunch_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpdaterConfig::default();
        assert_eq!(config.download_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_fallback_bundles, 3);
        assert_eq!(config.public_key, PUBLISHER_PUBLIC_KEY);
        assert_ne!(config.native_download_dir, config.bundle_download_dir);
    }

    #[test]
    fn test_with_root_keeps_areas_apart() {
        let config = UpdaterConfig::with_root(Path::new("/tmp/updater"), "5.1.0");
        assert_eq!(config.app_version, "5.1.0");
        assert!(config.bundle_root.starts_with("/tmp/updater"));
        assert!(config.settings_path.starts_with("/tmp/updater"));
        assert_ne!(config.bundle_root, config.bundle_download_dir);
        assert!(config.user_agent.ends_with("5.1.0"));
    }
}
