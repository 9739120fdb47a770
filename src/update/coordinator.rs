//! Update coordinator
//!
//! Drives each channel through
//! `notify → downloadPackage → downloadSignature → verifySignature →
//! verifyPackage → ready → done`. Channels share nothing but the settings
//! store: each has its own downloader, staging directory, state and
//! session. State is readable synchronously through [`UpdateCoordinator::status`];
//! transitions and progress are pushed on the event channel returned by
//! [`UpdateCoordinator::new`].

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bundle::{BundleActivation, BundleInstaller};
use super::download::{clear_dir, partial_path, DownloadProgress, LocalArtifact, ResumableDownloader};
use super::manifest::{BundleRecord, UpdateChannel, UpdateManifest};
use super::native::{AppLifecycle, Distribution, NativeInstallOutcome, NativeInstaller};
use super::state::{UpdateEvent, UpdateFailure, UpdateSnapshot, UpdateState};
use super::verify::{verify_artifact, verify_signature, PublisherKey, VerifiedArtifact, VerifiedPayload};
use crate::config::SettingsStore;
use crate::core::config::UpdaterConfig;
use crate::core::error::{
    DownloadError, ErrorKind, ErrorRecovery, InstallError, Result, UpdaterError, VerifyError,
};

/// Mutable view of one channel
#[derive(Debug, Default)]
struct ChannelStatus {
    state: UpdateState,
    manifest: Option<UpdateManifest>,
    progress: Option<DownloadProgress>,
    last_error: Option<UpdateFailure>,
    verified: Option<VerifiedArtifact>,
}

/// Per-channel machinery; nothing in here is shared across channels
struct ChannelRunner {
    channel: UpdateChannel,
    download_dir: PathBuf,
    downloader: ResumableDownloader,
    status: Arc<RwLock<ChannelStatus>>,
    /// Held for the whole of a running stage sequence
    run_lock: tokio::sync::Mutex<()>,
    /// Cancellation for the running session, if any
    session: Mutex<Option<CancellationToken>>,
}

impl ChannelRunner {
    fn new(
        channel: UpdateChannel,
        download_dir: PathBuf,
        config: &UpdaterConfig,
        events: mpsc::UnboundedSender<UpdateEvent>,
    ) -> Result<Self> {
        let status = Arc::new(RwLock::new(ChannelStatus::default()));

        let progress_status = Arc::clone(&status);
        let downloader = ResumableDownloader::new(config)?.with_progress_callback(Arc::new(
            move |progress: DownloadProgress| {
                progress_status.write().progress = Some(progress);
                let _ = events.send(UpdateEvent::Progress { channel, progress });
            },
        ));

        Ok(Self {
            channel,
            download_dir,
            downloader,
            status,
            run_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
        })
    }

    fn state(&self) -> UpdateState {
        self.status.read().state
    }

    fn manifest(&self) -> Option<UpdateManifest> {
        self.status.read().manifest.clone()
    }

    fn artifact_path(&self, manifest: &UpdateManifest) -> PathBuf {
        self.download_dir
            .join(manifest.artifact_file_name(self.channel))
    }

    fn open_session(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.session.lock() = Some(token.clone());
        token
    }

    fn close_session(&self) {
        *self.session.lock() = None;
    }
}

/// Orchestrates both update channels
pub struct UpdateCoordinator {
    config: UpdaterConfig,
    key: PublisherKey,
    settings: Arc<SettingsStore>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    native: ChannelRunner,
    bundle: ChannelRunner,
    native_installer: NativeInstaller,
    bundle_installer: BundleInstaller,
}

impl UpdateCoordinator {
    /// Build a coordinator for the detected distribution
    pub async fn new(
        config: UpdaterConfig,
        lifecycle: Arc<dyn AppLifecycle>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UpdateEvent>)> {
        Self::with_distribution(config, lifecycle, Distribution::detect()).await
    }

    pub async fn with_distribution(
        config: UpdaterConfig,
        lifecycle: Arc<dyn AppLifecycle>,
        distribution: Distribution,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UpdateEvent>)> {
        let key = PublisherKey::from_hex(&config.public_key)?;
        let settings = Arc::new(SettingsStore::open(config.settings_path.clone()).await?);
        let (events, receiver) = mpsc::unbounded_channel();

        let native = ChannelRunner::new(
            UpdateChannel::Native,
            config.native_download_dir.clone(),
            &config,
            events.clone(),
        )?;
        let bundle = ChannelRunner::new(
            UpdateChannel::Bundle,
            config.bundle_download_dir.clone(),
            &config,
            events.clone(),
        )?;

        let native_installer = NativeInstaller::new(
            Arc::clone(&lifecycle),
            Arc::clone(&settings),
            distribution,
            config.native_download_dir.clone(),
        );
        let bundle_installer = BundleInstaller::new(
            &config,
            key.clone(),
            Arc::clone(&settings),
            lifecycle,
            distribution,
        );

        tracing::info!(
            app_version = %config.app_version,
            ?distribution,
            "Update coordinator ready"
        );

        Ok((
            Self {
                config,
                key,
                settings,
                events,
                native,
                bundle,
                native_installer,
                bundle_installer,
            },
            receiver,
        ))
    }

    fn runner(&self, channel: UpdateChannel) -> &ChannelRunner {
        match channel {
            UpdateChannel::Native => &self.native,
            UpdateChannel::Bundle => &self.bundle,
        }
    }

    /// Current state of `channel`
    pub fn status(&self, channel: UpdateChannel) -> UpdateSnapshot {
        let status = self.runner(channel).status.read();
        UpdateSnapshot {
            channel,
            state: status.state,
            version: status.manifest.as_ref().map(|m| m.version.clone()),
            strategy: status
                .manifest
                .as_ref()
                .map(|m| m.update_strategy)
                .unwrap_or_default(),
            progress: status.progress,
            last_error: status.last_error.clone(),
        }
    }

    /// Accept `manifest` and start a cycle in `notify`.
    ///
    /// The busy check and the manifest swap happen under one write lock, so
    /// of two racing calls exactly one manifest is accepted.
    pub fn begin(&self, channel: UpdateChannel, manifest: UpdateManifest) -> Result<UpdateSnapshot> {
        let runner = self.runner(channel);
        if channel == UpdateChannel::Native && self.native_installer.distribution().is_store() {
            return Err(InstallError::StoreManaged.into());
        }
        let manifest = manifest.validate(channel)?;

        let bundle_version = manifest.bundle_version.clone();
        let (from, snapshot) = {
            let mut status = runner.status.write();
            let from = status.state;
            if from.is_in_flight() {
                return Err(UpdaterError::Busy { channel });
            }
            if !from.can_transition_to(UpdateState::Notify) {
                return Err(UpdaterError::InvalidTransition {
                    from,
                    to: UpdateState::Notify,
                });
            }

            let snapshot = UpdateSnapshot {
                channel,
                state: UpdateState::Notify,
                version: Some(manifest.version.clone()),
                strategy: manifest.update_strategy,
                progress: None,
                last_error: None,
            };
            *status = ChannelStatus {
                state: UpdateState::Notify,
                manifest: Some(manifest),
                ..ChannelStatus::default()
            };
            (from, snapshot)
        };

        tracing::info!(
            %channel,
            version = ?snapshot.version,
            bundle_version = ?bundle_version,
            strategy = ?snapshot.strategy,
            "Update available"
        );
        tracing::info!(%channel, %from, to = %UpdateState::Notify, "Update state changed");
        self.emit(UpdateEvent::StateChanged {
            channel,
            from,
            to: UpdateState::Notify,
            strategy: snapshot.strategy,
        });
        Ok(snapshot)
    }

    /// Download and verify until the artifact is `ready`
    pub async fn run_to_ready(&self, channel: UpdateChannel) -> Result<UpdateSnapshot> {
        let runner = self.runner(channel);
        let _run = runner
            .run_lock
            .try_lock()
            .map_err(|_| UpdaterError::Busy { channel })?;

        let state = runner.state();
        if state != UpdateState::Notify {
            return Err(UpdaterError::InvalidTransition {
                from: state,
                to: UpdateState::DownloadPackage,
            });
        }
        let manifest = runner
            .manifest()
            .ok_or_else(|| UpdaterError::InvalidManifest("no manifest accepted".to_string()))?;

        let cancel = runner.open_session();
        let outcome = self.run_stages(runner, &manifest, &cancel).await;
        runner.close_session();
        outcome?;

        Ok(self.status(channel))
    }

    async fn run_stages(
        &self,
        runner: &ChannelRunner,
        manifest: &UpdateManifest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let channel = runner.channel;

        // downloadPackage
        self.transition(runner, UpdateState::DownloadPackage)?;
        let destination = runner.artifact_path(manifest);
        let artifact = match runner.downloader.download(manifest, &destination, cancel).await {
            Ok(artifact) => artifact,
            Err(DownloadError::Cancelled) => return Err(self.abandon(runner, DownloadError::Cancelled.into())),
            Err(e) => return Err(self.fail(runner, UpdateState::DownloadPackage, e.into())),
        };

        // downloadSignature
        self.transition(runner, UpdateState::DownloadSignature)?;
        let document = match self.fetch_signature(channel, manifest, cancel).await {
            Ok(document) => document,
            Err(UpdaterError::Download(DownloadError::Cancelled)) => {
                return Err(self.abandon(runner, DownloadError::Cancelled.into()))
            }
            Err(e) => return Err(self.fail(runner, UpdateState::DownloadSignature, e)),
        };

        // verifySignature
        self.transition(runner, UpdateState::VerifySignature)?;
        let payload = match verify_signature(&document, &self.key) {
            Ok(payload) => payload,
            Err(e) => {
                self.discard_artifact(&artifact).await;
                return Err(self.fail(runner, UpdateState::VerifySignature, e.into()));
            }
        };

        // verifyPackage
        self.transition(runner, UpdateState::VerifyPackage)?;
        let verified = match self.verify_package(channel, manifest, &artifact, payload).await {
            Ok(verified) => verified,
            Err(e) => {
                self.discard_artifact(&artifact).await;
                return Err(self.fail(runner, UpdateState::VerifyPackage, e.into()));
            }
        };

        runner.status.write().verified = Some(verified);
        self.transition(runner, UpdateState::Ready)?;
        Ok(())
    }

    /// Signed checksum document for the artifact
    async fn fetch_signature(
        &self,
        channel: UpdateChannel,
        manifest: &UpdateManifest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if let Some(inline) = manifest.signature.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(inline.to_string());
        }
        if channel == UpdateChannel::Bundle {
            return Err(VerifyError::MissingSignature.into());
        }

        let url = manifest.signature_url(&self.config.signature_suffix);
        tracing::info!(%channel, url = %url, "Downloading signature");
        let document = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
            document = self.native.downloader.fetch_text(&url) => document?,
        };
        if document.trim().is_empty() {
            return Err(VerifyError::MissingSignature.into());
        }

        self.settings
            .set_signature_document(Some(document.clone()))
            .await?;
        Ok(document)
    }

    async fn verify_package(
        &self,
        channel: UpdateChannel,
        manifest: &UpdateManifest,
        artifact: &LocalArtifact,
        payload: VerifiedPayload,
    ) -> std::result::Result<VerifiedArtifact, VerifyError> {
        verify_artifact(channel, manifest, &artifact.path, Ok(payload)).await
    }

    /// Install the `ready` artifact
    pub async fn install(&self, channel: UpdateChannel) -> Result<UpdateSnapshot> {
        let runner = self.runner(channel);
        let _run = runner
            .run_lock
            .try_lock()
            .map_err(|_| UpdaterError::Busy { channel })?;

        let verified = self.ready_artifact(runner, UpdateState::Done)?;
        let result = match channel {
            UpdateChannel::Native => self
                .native_installer
                .install_native_package(&verified)
                .await
                .map(|outcome| outcome == NativeInstallOutcome::Installed),
            UpdateChannel::Bundle => self
                .bundle_installer
                .install_bundle(&verified)
                .await
                .map(|_| true),
        };

        match result {
            Ok(true) => self.transition(runner, UpdateState::Done)?,
            // Deferred by the user; stays ready
            Ok(false) => {}
            Err(e) => return Err(self.abandon(runner, e.into())),
        }
        Ok(self.status(channel))
    }

    /// Hand the verified native package to the user
    pub async fn manual_install(&self, channel: UpdateChannel) -> Result<UpdateSnapshot> {
        if channel != UpdateChannel::Native {
            return Err(InstallError::WrongChannel {
                expected: UpdateChannel::Native,
                actual: channel,
            }
            .into());
        }
        let runner = self.runner(channel);
        let _run = runner
            .run_lock
            .try_lock()
            .map_err(|_| UpdaterError::Busy { channel })?;

        let verified = self.ready_artifact(runner, UpdateState::ManualInstall)?;
        self.native_installer.manual_install(&verified)?;
        self.transition(runner, UpdateState::ManualInstall)?;
        Ok(self.status(channel))
    }

    fn ready_artifact(&self, runner: &ChannelRunner, to: UpdateState) -> Result<VerifiedArtifact> {
        let status = runner.status.read();
        match (&status.verified, status.state) {
            (Some(verified), UpdateState::Ready) => Ok(verified.clone()),
            (_, from) => Err(UpdaterError::InvalidTransition { from, to }),
        }
    }

    /// Cancel the running download of `channel`; the partial file stays
    pub fn cancel(&self, channel: UpdateChannel) -> bool {
        match self.runner(channel).session.lock().as_ref() {
            Some(token) => {
                tracing::info!(%channel, "Cancelling update");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel, wait for the channel to settle and delete its staging area
    pub async fn clear_cache(&self, channel: UpdateChannel) -> Result<()> {
        let runner = self.runner(channel);
        self.cancel(channel);
        let _run = runner.run_lock.lock().await;

        clear_dir(&runner.download_dir).await?;
        if channel == UpdateChannel::Native {
            self.settings.set_signature_document(None).await?;
        }
        self.clear_status(runner);
        tracing::info!(%channel, "Update cache cleared");
        Ok(())
    }

    /// Abandon whatever `channel` was doing and go back to idle
    pub async fn reset(&self, channel: UpdateChannel) -> Result<()> {
        let runner = self.runner(channel);
        self.cancel(channel);
        let _run = runner.run_lock.lock().await;
        self.clear_status(runner);
        Ok(())
    }

    fn clear_status(&self, runner: &ChannelRunner) {
        let from = {
            let mut status = runner.status.write();
            let from = status.state;
            *status = ChannelStatus::default();
            from
        };
        if from != UpdateState::Idle {
            self.emit(UpdateEvent::StateChanged {
                channel: runner.channel,
                from,
                to: UpdateState::Idle,
                strategy: Default::default(),
            });
        }
    }

    /// Promote a fallback bundle back to current
    pub async fn rollback(&self, record: &BundleRecord) -> Result<BundleActivation> {
        let _run = self
            .bundle
            .run_lock
            .try_lock()
            .map_err(|_| UpdaterError::Busy {
                channel: UpdateChannel::Bundle,
            })?;
        Ok(self.bundle_installer.rollback_to(record).await?)
    }

    pub async fn list_fallbacks(&self) -> Vec<BundleRecord> {
        self.bundle_installer.list_fallbacks().await
    }

    pub async fn current_bundle(&self) -> Option<BundleRecord> {
        self.bundle_installer.current().await
    }

    /// Entry document of the active bundle, if it may be served
    pub async fn bundle_entry(&self) -> Option<PathBuf> {
        self.bundle_installer.active_entry().await
    }

    pub fn bundle_installer(&self) -> &BundleInstaller {
        &self.bundle_installer
    }

    pub async fn use_test_feed_url(&self) -> bool {
        self.settings.use_test_feed_url().await
    }

    pub async fn set_use_test_feed_url(&self, enabled: bool) -> Result<()> {
        Ok(self.settings.set_use_test_feed_url(enabled).await?)
    }

    pub async fn previous_build_number(&self) -> Option<String> {
        self.settings.previous_build_number().await
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    fn transition(&self, runner: &ChannelRunner, to: UpdateState) -> Result<()> {
        let (from, strategy) = {
            let mut status = runner.status.write();
            let from = status.state;
            if !from.can_transition_to(to) {
                return Err(UpdaterError::InvalidTransition { from, to });
            }
            status.state = to;
            let strategy = status
                .manifest
                .as_ref()
                .map(|m| m.update_strategy)
                .unwrap_or_default();
            (from, strategy)
        };

        tracing::info!(channel = %runner.channel, %from, %to, "Update state changed");
        self.emit(UpdateEvent::StateChanged {
            channel: runner.channel,
            from,
            to,
            strategy,
        });
        Ok(())
    }

    /// Move `stage` to its failure state and report `error`
    fn fail(&self, runner: &ChannelRunner, stage: UpdateState, error: UpdaterError) -> UpdaterError {
        let failed = stage.failure_state().unwrap_or(UpdateState::UpdateIncomplete);
        self.settle(runner, failed, error)
    }

    /// Give up the cycle without blaming a stage
    fn abandon(&self, runner: &ChannelRunner, error: UpdaterError) -> UpdaterError {
        self.settle(runner, UpdateState::UpdateIncomplete, error)
    }

    fn settle(&self, runner: &ChannelRunner, to: UpdateState, error: UpdaterError) -> UpdaterError {
        let failure = UpdateFailure {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        };
        tracing::warn!(
            channel = %runner.channel,
            state = %to,
            kind = %failure.kind,
            error = %error,
            "Update cycle stopped"
        );

        if let Err(e) = self.transition(runner, to) {
            tracing::error!(channel = %runner.channel, error = %e, "Could not record failure state");
        }
        runner.status.write().last_error = Some(failure.clone());

        // Cancellation is not surfaced as a failure
        if failure.kind != ErrorKind::Cancelled {
            self.emit(UpdateEvent::Failed {
                channel: runner.channel,
                state: to,
                kind: failure.kind,
                message: failure.message,
            });
        }
        error
    }

    /// Verification failures are fatal to the cached bytes
    async fn discard_artifact(&self, artifact: &LocalArtifact) {
        for path in [artifact.path.clone(), partial_path(&artifact.path)] {
            remove_if_exists(&path).await;
        }
    }

    fn emit(&self, event: UpdateEvent) {
        let _ = self.events.send(event);
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "Discarded artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to discard artifact"),
    }
}
