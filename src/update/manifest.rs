//! Release manifests, channels and bundle records
//!
//! A manifest is fetched by the host application and handed to the
//! coordinator; it is never mutated here. One manifest drives one cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::{Result, UpdaterError};
use crate::core::utils::normalize_sha256;

/// The two independent update channels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    /// Full host application installer
    Native,
    /// Hot-swappable content bundle
    Bundle,
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateChannel::Native => write!(f, "native"),
            UpdateChannel::Bundle => write!(f, "bundle"),
        }
    }
}

/// How transitions are surfaced to the user. Never changes the state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    Silent,
    Force,
    #[default]
    Manual,
    Seamless,
}

impl UpdateStrategy {
    /// Whether the user sees a prompt before installation
    pub fn shows_prompt(&self) -> bool {
        matches!(self, UpdateStrategy::Manual | UpdateStrategy::Force)
    }

    /// Whether the user may not defer the update
    pub fn is_forced(&self) -> bool {
        matches!(self, UpdateStrategy::Force)
    }
}

/// Release description supplied by the publisher's update feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    pub version: String,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    pub download_url: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the artifact
    #[serde(alias = "sha256")]
    pub content_hash: String,
    /// Cleartext-signed document vouching for `content_hash`
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub bundle_version: Option<String>,
    #[serde(default)]
    pub change_log: Option<String>,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub build_number: Option<String>,
}

impl UpdateManifest {
    /// Check the fields a cycle on `channel` depends on and normalize the hash
    pub fn validate(mut self, channel: UpdateChannel) -> Result<Self> {
        Version::parse(&self.version)?;

        self.content_hash = normalize_sha256(&self.content_hash).ok_or_else(|| {
            UpdaterError::InvalidManifest(format!(
                "content hash is not a SHA-256 hex digest: {}",
                self.content_hash
            ))
        })?;

        if self.file_size == 0 {
            return Err(UpdaterError::InvalidManifest(
                "file size must be positive".to_string(),
            ));
        }

        let url = reqwest::Url::parse(&self.download_url)
            .map_err(|e| UpdaterError::InvalidManifest(format!("download url: {}", e)))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(UpdaterError::InvalidManifest(format!(
                "unsupported url scheme: {}",
                url.scheme()
            )));
        }

        if channel == UpdateChannel::Bundle {
            if self.bundle_version.as_deref().map_or(true, str::is_empty) {
                return Err(UpdaterError::InvalidManifest(
                    "bundle manifest without bundle version".to_string(),
                ));
            }
            if self.signature.as_deref().map_or(true, str::is_empty) {
                return Err(UpdaterError::InvalidManifest(
                    "bundle manifest without signature".to_string(),
                ));
            }
        }

        Ok(self)
    }

    /// File name of the artifact inside the channel's staging directory
    pub fn artifact_file_name(&self, channel: UpdateChannel) -> String {
        match channel {
            UpdateChannel::Native => match self.url_extension() {
                Some(ext) => format!("{}.{}", self.version, ext),
                None => self.version.clone(),
            },
            UpdateChannel::Bundle => format!(
                "{}-{}.zip",
                self.version,
                self.bundle_version.as_deref().unwrap_or_default()
            ),
        }
    }

    /// Location of the detached checksum signature next to the artifact
    pub fn signature_url(&self, suffix: &str) -> String {
        format!("{}{}", self.download_url, suffix)
    }

    /// Record describing this bundle once activated
    pub fn bundle_record(&self) -> Option<BundleRecord> {
        Some(BundleRecord {
            app_version: self.version.clone(),
            bundle_version: self.bundle_version.clone()?,
            signature: self.signature.clone().unwrap_or_default(),
        })
    }

    fn url_extension(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.download_url).ok()?;
        let name = url.path_segments()?.last()?.to_string();
        Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_string)
    }
}

/// One installed content bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    pub app_version: String,
    pub bundle_version: String,
    /// Signed document covering the bundle's inner metadata file
    pub signature: String,
}

impl BundleRecord {
    /// Directory name under the bundle root
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.app_version, self.bundle_version)
    }

    /// Same app/bundle version pair, regardless of signature
    pub fn same_bundle(&self, other: &BundleRecord) -> bool {
        self.app_version == other.app_version && self.bundle_version == other.bundle_version
    }
}

impl std::fmt::Display for BundleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Semantic version representation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub prerelease: Option<String>,
}

impl Version {
    /// Parse version from string (e.g., "5.1.0" or "5.1.0-beta.1")
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('v');

        let (version_part, prerelease) = match s.split_once('-') {
            Some((v, pre)) => (v, Some(pre.to_string())),
            None => (s, None),
        };

        let parts: Vec<&str> = version_part.split('.').collect();
        if parts.len() != 3 {
            return Err(UpdaterError::InvalidManifest(format!(
                "expected 3 version components in {:?}, got {}",
                s,
                parts.len()
            )));
        }

        let component = |idx: usize| -> Result<u32> {
            parts[idx].parse().map_err(|_| {
                UpdaterError::InvalidManifest(format!("invalid version component: {}", parts[idx]))
            })
        };

        Ok(Self {
            major: component(0)?,
            minor: component(1)?,
            patch: component(2)?,
            prerelease,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref pre) = self.prerelease {
            write!(f, "{}.{}.{}-{}", self.major, self.minor, self.patch, pre)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}
