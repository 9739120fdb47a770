//! Update pipeline
//!
//! This module provides:
//! - Resumable artifact downloads with progress reporting
//! - Signed checksum verification against the pinned publisher key
//! - Bundle installation with a bounded fallback history and rollback
//! - Native installer hand-off and application restart
//! - A per-channel coordinator state machine

pub mod bundle;
pub mod coordinator;
pub mod download;
pub mod manifest;
pub mod native;
pub mod state;
pub mod verify;


pub use bundle::{BundleActivation, BundleInstaller};
pub use coordinator::UpdateCoordinator;
pub use download::{DownloadProgress, DownloadSession, LocalArtifact, ResumableDownloader};
pub use manifest::{BundleRecord, UpdateChannel, UpdateManifest, UpdateStrategy, Version};
pub use native::{
    AppLifecycle, Distribution, InstallDecision, InstallerCommand, InstallerKind,
    NativeInstallOutcome, NativeInstaller, SystemLifecycle,
};
pub use state::{UpdateEvent, UpdateFailure, UpdateSnapshot, UpdateState};
pub use verify::{
    verify_artifact, verify_signature, PublisherKey, SignedDocument, VerificationRecord,
    VerifiedArtifact, VerifiedPayload,
};
