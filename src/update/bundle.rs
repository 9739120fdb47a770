//! Content bundle installer and rollback manager
//!
//! Each activated bundle lives in `<bundle_root>/<appVersion>-<bundleVersion>`.
//! Archives are extracted into a hidden staging directory and only renamed
//! into place after the signed inner metadata checks out; the current-bundle
//! pointer in the settings store moves strictly after that rename.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::download::clear_dir;
use super::manifest::{BundleRecord, UpdateChannel};
use super::native::{restart_application, AppLifecycle, Distribution};
use super::verify::{compute_sha512, verify_signature, PublisherKey, VerifiedArtifact};
use crate::config::SettingsStore;
use crate::core::config::UpdaterConfig;
use crate::core::error::{InstallError, VerifyError};

/// Signed manifest of every file in the bundle
pub const METADATA_FILE: &str = "metadata.json";
/// Directory holding the served files
pub const BUILD_DIR: &str = "build";
/// Entry document, also served for unknown routes
pub const INDEX_FILE: &str = "index.html";

const STAGING_PREFIX: &str = ".staging-";

/// Result of a pointer swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleActivation {
    pub record: BundleRecord,
    pub path: PathBuf,
    /// Bundle demoted into the fallback history
    pub previous: Option<BundleRecord>,
    /// Records pushed out of the history; their directories are gone
    pub evicted: Vec<BundleRecord>,
}

/// Owns the bundle directory tree and the bundle records
pub struct BundleInstaller {
    root: PathBuf,
    download_dir: PathBuf,
    app_version: String,
    max_fallbacks: usize,
    relaunch_delay: Duration,
    key: PublisherKey,
    settings: Arc<SettingsStore>,
    lifecycle: Arc<dyn AppLifecycle>,
    distribution: Distribution,
}

impl BundleInstaller {
    pub fn new(
        config: &UpdaterConfig,
        key: PublisherKey,
        settings: Arc<SettingsStore>,
        lifecycle: Arc<dyn AppLifecycle>,
        distribution: Distribution,
    ) -> Self {
        Self {
            root: config.bundle_root.clone(),
            download_dir: config.bundle_download_dir.clone(),
            app_version: config.app_version.clone(),
            max_fallbacks: config.max_fallback_bundles,
            relaunch_delay: config.relaunch_delay,
            key,
            settings,
            lifecycle,
            distribution,
        }
    }

    pub fn bundle_dir(&self, record: &BundleRecord) -> PathBuf {
        self.root.join(record.dir_name())
    }

    pub async fn current(&self) -> Option<BundleRecord> {
        self.settings.current_bundle().await
    }

    /// Fallback history, oldest first
    pub async fn list_fallbacks(&self) -> Vec<BundleRecord> {
        self.settings.fallback_bundles().await
    }

    /// Extract, check and activate a verified bundle archive, then relaunch
    pub async fn install_bundle(
        &self,
        artifact: &VerifiedArtifact,
    ) -> Result<BundleActivation, InstallError> {
        if artifact.channel() != UpdateChannel::Bundle {
            return Err(InstallError::WrongChannel {
                expected: UpdateChannel::Bundle,
                actual: artifact.channel(),
            });
        }
        let record = artifact
            .manifest()
            .bundle_record()
            .ok_or_else(|| InstallError::InvalidBundle {
                reason: "manifest has no bundle version".to_string(),
            })?;

        if let Some(current) = self.current().await {
            if current.same_bundle(&record) {
                return Err(InstallError::AlreadyActive {
                    name: record.dir_name(),
                });
            }
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let staging = self.root.join(format!(
            "{}{}-{}",
            STAGING_PREFIX,
            record.dir_name(),
            crate::core::utils::generate_uuid()
        ));

        tracing::info!(
            bundle = %record,
            archive = %artifact.path().display(),
            "Extracting bundle"
        );

        if let Err(e) = self.prepare(artifact.path(), &staging, &record).await {
            tracing::warn!(bundle = %record, error = %e, "Bundle rejected");
            clear_dir(&staging).await.ok();
            return Err(e);
        }

        let target = self.bundle_dir(&record);
        clear_dir(&target).await?;
        tokio::fs::rename(&staging, &target).await?;

        let activation = self.activate(record, target).await?;
        tracing::info!(
            bundle = %activation.record,
            previous = ?activation.previous.as_ref().map(BundleRecord::dir_name),
            evicted = activation.evicted.len(),
            "Bundle activated"
        );

        restart_application(self.lifecycle.as_ref(), self.distribution, self.relaunch_delay).await?;
        Ok(activation)
    }

    /// Extract into `staging` and check it against the signed inner metadata.
    ///
    /// Every file under `build/` must be listed with a matching SHA-512 and
    /// every listed file must be present.
    async fn prepare(
        &self,
        archive: &Path,
        staging: &Path,
        record: &BundleRecord,
    ) -> Result<(), InstallError> {
        let archive = archive.to_path_buf();
        let dest = staging.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(|e| InstallError::Extraction {
                reason: e.to_string(),
            })??;

        let metadata = self.read_metadata(staging, &record.signature).await?;
        if !metadata.contains_key(INDEX_FILE) {
            return Err(InstallError::InvalidBundle {
                reason: format!("{}/{} missing", BUILD_DIR, INDEX_FILE),
            });
        }
        check_build_tree(staging, &metadata).await
    }

    /// The bundle's `metadata.json` must hash to the signed digest
    async fn verify_inner(&self, dir: &Path, signature: &str) -> Result<(), InstallError> {
        let payload = verify_signature(signature, &self.key)?;
        let expected = payload.sha256()?;

        let metadata_path = dir.join(METADATA_FILE);
        let bytes = tokio::fs::read(&metadata_path)
            .await
            .map_err(|e| VerifyError::ArtifactUnreadable {
                path: metadata_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let actual = hex::encode(Sha256::digest(&bytes));

        if actual != expected {
            return Err(VerifyError::HashMismatch { expected, actual }.into());
        }
        Ok(())
    }

    /// Make `record` current and demote the previous current into history
    async fn activate(
        &self,
        record: BundleRecord,
        path: PathBuf,
    ) -> Result<BundleActivation, InstallError> {
        let max = self.max_fallbacks;
        let app_version = self.app_version.clone();
        let next = record.clone();

        let (previous, evicted) = self
            .settings
            .update(move |s| {
                let previous = s.current_bundle.replace(next.clone());
                s.fallback_bundles.retain(|r| !r.same_bundle(&next));
                if let Some(prev) = previous.as_ref().filter(|p| !p.same_bundle(&next)) {
                    s.fallback_bundles.retain(|r| !r.same_bundle(prev));
                    s.fallback_bundles.push(prev.clone());
                }

                let mut evicted = Vec::new();
                while s.fallback_bundles.len() > max {
                    evicted.push(s.fallback_bundles.remove(0));
                }
                s.native_version = Some(app_version);
                (previous, evicted)
            })
            .await?;

        for old in &evicted {
            let dir = self.bundle_dir(old);
            tracing::info!(bundle = %old, dir = %dir.display(), "Evicting fallback bundle");
            if let Err(e) = clear_dir(&dir).await {
                tracing::warn!(bundle = %old, error = %e, "Failed to delete evicted bundle");
            }
        }

        Ok(BundleActivation {
            record,
            path,
            previous,
            evicted,
        })
    }

    /// Promote a fallback bundle back to current and relaunch.
    ///
    /// Only the fallback's own directory and signature are consulted, so
    /// this works when the current bundle is missing or corrupt. The
    /// fallback's files are re-checked before the pointer moves.
    pub async fn rollback_to(
        &self,
        record: &BundleRecord,
    ) -> Result<BundleActivation, InstallError> {
        let stored = self
            .list_fallbacks()
            .await
            .into_iter()
            .find(|r| r.same_bundle(record))
            .ok_or_else(|| InstallError::UnknownFallback {
                name: record.dir_name(),
            })?;

        let dir = self.bundle_dir(&stored);
        if !dir.is_dir() {
            return Err(InstallError::MissingBundleDir {
                path: dir.display().to_string(),
            });
        }
        let metadata = self.read_metadata(&dir, &stored.signature).await?;
        check_build_tree(&dir, &metadata).await?;

        tracing::info!(bundle = %stored, "Rolling back to fallback bundle");
        let activation = self.activate(stored, dir).await?;

        restart_application(self.lifecycle.as_ref(), self.distribution, self.relaunch_delay).await?;
        Ok(activation)
    }

    /// Entry document of the current bundle, if it may be served
    pub async fn active_entry(&self) -> Option<PathBuf> {
        let settings = self.settings.get().await;
        if settings.native_version.as_deref() != Some(self.app_version.as_str()) {
            return None;
        }
        let current = settings.current_bundle?;
        let index = self.bundle_dir(&current).join(BUILD_DIR).join(INDEX_FILE);
        index.is_file().then_some(index)
    }

    /// Check one served file of the current bundle against its SHA-512.
    ///
    /// `request_path` is the URL path. Empty paths and paths the metadata
    /// does not list both resolve to the entry document, so client-side
    /// routes like `/wallet/send` are served `index.html` instead of failing.
    /// Only the entry document is ever substituted; a listed file is always
    /// checked under its own digest.
    pub async fn verify_bundle_file(&self, request_path: &str) -> Result<PathBuf, InstallError> {
        let current = self.current().await.ok_or_else(|| InstallError::InvalidBundle {
            reason: "no active bundle".to_string(),
        })?;
        let dir = self.bundle_dir(&current);
        let metadata = self.read_metadata(&dir, &current.signature).await?;

        let mut key = request_path.trim().trim_start_matches('/').replace('\\', "/");
        if key.is_empty() || !metadata.contains_key(&key) {
            key = INDEX_FILE.to_string();
        }
        let expected = metadata.get(&key).ok_or_else(|| InstallError::InvalidBundle {
            reason: format!("{} not listed in {}", key, METADATA_FILE),
        })?;

        let relative = Path::new(&key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(InstallError::InvalidBundle {
                reason: format!("illegal path {}", key),
            });
        }

        let file = dir.join(BUILD_DIR).join(relative);
        let actual = compute_sha512(&file).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            tracing::error!(file = %file.display(), "Bundle file tampered");
            return Err(VerifyError::HashMismatch {
                expected: expected.clone(),
                actual,
            }
            .into());
        }
        Ok(file)
    }

    async fn read_metadata(
        &self,
        dir: &Path,
        signature: &str,
    ) -> Result<HashMap<String, String>, InstallError> {
        self.verify_inner(dir, signature).await?;
        let raw = tokio::fs::read_to_string(dir.join(METADATA_FILE)).await?;
        serde_json::from_str(&raw).map_err(|e| InstallError::InvalidBundle {
            reason: format!("{}: {}", METADATA_FILE, e),
        })
    }

    /// Remove every extracted bundle
    pub async fn clear_extracted(&self) -> Result<(), InstallError> {
        clear_dir(&self.root).await?;
        Ok(())
    }

    /// Remove extracted bundles, downloaded archives and the bundle records
    pub async fn clear_all(&self) -> Result<(), InstallError> {
        self.clear_extracted().await?;
        clear_dir(&self.download_dir).await?;
        self.settings.clear_bundle_records().await?;
        Ok(())
    }
}

/// Compare every file under `dir/build` with its SHA-512 in `metadata`
async fn check_build_tree(
    dir: &Path,
    metadata: &HashMap<String, String>,
) -> Result<(), InstallError> {
    let build = dir.join(BUILD_DIR);
    let walk_root = build.clone();
    let files = tokio::task::spawn_blocking(move || list_files(&walk_root))
        .await
        .map_err(|e| InstallError::Extraction {
            reason: e.to_string(),
        })??;

    if let Some(missing) = metadata.keys().find(|key| !files.contains(*key)) {
        return Err(InstallError::InvalidBundle {
            reason: format!("{}/{} missing", BUILD_DIR, missing),
        });
    }

    for key in &files {
        let expected = metadata.get(key).ok_or_else(|| InstallError::InvalidBundle {
            reason: format!("{}/{} not listed in {}", BUILD_DIR, key, METADATA_FILE),
        })?;
        let file = build.join(key);
        let actual = compute_sha512(&file).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            tracing::error!(file = %file.display(), "Bundle file does not match its metadata");
            return Err(VerifyError::HashMismatch {
                expected: expected.clone(),
                actual,
            }
            .into());
        }
    }
    Ok(())
}

/// Regular files under `root` as `/`-separated relative paths
fn list_files(root: &Path) -> Result<HashSet<String>, InstallError> {
    let mut files = HashSet::new();
    if !root.is_dir() {
        return Ok(files);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                return Err(InstallError::InvalidBundle {
                    reason: format!("unexpected entry {}", path.display()),
                });
            }
            let relative = path.strip_prefix(root).map_err(|_| InstallError::InvalidBundle {
                reason: format!("entry outside bundle: {}", path.display()),
            })?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key);
        }
    }
    Ok(files)
}

/// Unpack `archive` into `dest`, refusing entries that escape it
fn extract_archive(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let extraction = |reason: String| InstallError::Extraction { reason };

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extraction(e.to_string()))?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extraction(e.to_string()))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| extraction(format!("entry escapes bundle: {}", entry.name())))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&out_path)?;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            std::io::Write::write_all(&mut out, &buffer[..n])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("bundle.zip");
        write_zip(
            &archive,
            &[("metadata.json", b"{}"), ("build/index.html", b"<html></html>")],
        );

        let dest = temp.path().join("out");
        extract_archive(&archive, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("build/index.html")).unwrap(), b"<html></html>");
        assert!(dest.join("metadata.json").is_file());
    }

    #[test]
    fn test_extract_rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"gotcha")]);

        let dest = temp.path().join("out");
        let result = extract_archive(&archive, &dest);
        assert!(matches!(result, Err(InstallError::Extraction { .. })));
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("garbage.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();
        assert!(matches!(
            extract_archive(&archive, &temp.path().join("out")),
            Err(InstallError::Extraction { .. })
        ));
    }
}
