//! Error types for the update pipeline
//!
//! Every failure surfaced to the UI or telemetry layer carries a stable
//! [`ErrorKind`] and a [`RecoveryAction`] so callers never need to inspect
//! raw transport errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::update::{UpdateChannel, UpdateState};

/// Result type alias for updater operations
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Main error type for the updater
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    #[error("Settings error: {0}")]
    Settings(#[from] ConfigError),

    #[error("An update cycle is already running on the {channel} channel")]
    Busy { channel: UpdateChannel },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: UpdateState, to: UpdateState },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the resumable downloader
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Download timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Server returned unexpected status: {status}")]
    BadStatus { status: u16 },

    #[error("Server answered range request at byte {actual} instead of {requested}")]
    UnexpectedRange { requested: u64, actual: u64 },

    #[error("Download incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("Server reports {reported} bytes but the manifest declares {declared}")]
    SizeMismatch { declared: u64, reported: u64 },

    #[error("Download cancelled")]
    Cancelled,

    #[error("A download to {destination} is already in progress")]
    AlreadyActive { destination: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while verifying artifacts and signed documents
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Signature document is missing")]
    MissingSignature,

    #[error("Signature document is malformed: {reason}")]
    MalformedSignature { reason: String },

    #[error("Signature does not match the publisher key")]
    SignatureMismatch,

    #[error("Signed payload is invalid: {reason}")]
    InvalidPayload { reason: String },

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Artifact unreadable: {path}, reason: {reason}")]
    ArtifactUnreadable { path: String, reason: String },
}

/// Errors raised by the bundle and native installers
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Artifact belongs to the {actual} channel, expected {expected}")]
    WrongChannel {
        expected: UpdateChannel,
        actual: UpdateChannel,
    },

    #[error("Archive extraction failed: {reason}")]
    Extraction { reason: String },

    #[error("Bundle is invalid: {reason}")]
    InvalidBundle { reason: String },

    #[error("Bundle {name} is already active")]
    AlreadyActive { name: String },

    #[error("Bundle {name} is not in the fallback history")]
    UnknownFallback { name: String },

    #[error("Bundle directory missing: {path}")]
    MissingBundleDir { path: String },

    #[error("Unsupported installer package: {path}")]
    UnsupportedPackage { path: String },

    #[error("Store distributions update themselves")]
    StoreManaged,

    #[error("Installer launch failed: {reason}")]
    LaunchFailed { reason: String },

    #[error("Verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("Settings error: {0}")]
    Settings(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, machine-readable error kind reported to the UI/telemetry layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Network,
    BadStatus,
    IncompleteDownload,
    SizeMismatch,
    HashMismatch,
    Signature,
    Install,
    Cancelled,
    Busy,
    InvalidManifest,
    Settings,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::BadStatus => "badStatus",
            ErrorKind::IncompleteDownload => "incompleteDownload",
            ErrorKind::SizeMismatch => "sizeMismatch",
            ErrorKind::HashMismatch => "hashMismatch",
            ErrorKind::Signature => "signature",
            ErrorKind::Install => "install",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidManifest => "invalidManifest",
            ErrorKind::Settings => "settings",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for error recovery strategies
pub trait ErrorRecovery {
    /// Stable kind for telemetry
    fn kind(&self) -> ErrorKind;

    /// Check if the error is transient and the cycle may be retried
    fn is_retryable(&self) -> bool;

    /// Get the recommended recovery action
    fn recovery_action(&self) -> RecoveryAction;
}

/// Recovery actions for error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Retry; the downloader resumes from the partial file
    ResumeDownload,
    /// Restart the cycle from `notify`
    RestartCycle,
    /// Throw away the cached artifact and fetch it again
    DiscardAndRefetch,
    /// Fall back to a previously activated bundle
    Rollback,
    /// Nothing to do (e.g. user cancelled)
    None,
}

impl ErrorRecovery for DownloadError {
    fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network(_) | DownloadError::Timeout { .. } | DownloadError::Io(_) => {
                ErrorKind::Network
            }
            DownloadError::BadStatus { .. } | DownloadError::UnexpectedRange { .. } => {
                ErrorKind::BadStatus
            }
            DownloadError::Incomplete { .. } => ErrorKind::IncompleteDownload,
            DownloadError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            DownloadError::Cancelled => ErrorKind::Cancelled,
            DownloadError::AlreadyActive { .. } => ErrorKind::Busy,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Network(_)
                | DownloadError::Timeout { .. }
                | DownloadError::Incomplete { .. }
                | DownloadError::Io(_)
        )
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            DownloadError::Network(_)
            | DownloadError::Timeout { .. }
            | DownloadError::Incomplete { .. }
            | DownloadError::Io(_) => RecoveryAction::ResumeDownload,
            DownloadError::UnexpectedRange { .. } | DownloadError::SizeMismatch { .. } => {
                RecoveryAction::DiscardAndRefetch
            }
            DownloadError::BadStatus { .. } => RecoveryAction::RestartCycle,
            DownloadError::Cancelled | DownloadError::AlreadyActive { .. } => RecoveryAction::None,
        }
    }
}

impl ErrorRecovery for VerifyError {
    fn kind(&self) -> ErrorKind {
        match self {
            VerifyError::HashMismatch { .. } | VerifyError::ArtifactUnreadable { .. } => {
                ErrorKind::HashMismatch
            }
            _ => ErrorKind::Signature,
        }
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn recovery_action(&self) -> RecoveryAction {
        RecoveryAction::DiscardAndRefetch
    }
}

impl ErrorRecovery for InstallError {
    fn kind(&self) -> ErrorKind {
        match self {
            InstallError::Verification(e) => e.kind(),
            InstallError::Settings(_) => ErrorKind::Settings,
            _ => ErrorKind::Install,
        }
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            InstallError::StoreManaged | InstallError::AlreadyActive { .. } => RecoveryAction::None,
            InstallError::Verification(_) => RecoveryAction::DiscardAndRefetch,
            _ => RecoveryAction::Rollback,
        }
    }
}

impl ErrorRecovery for UpdaterError {
    fn kind(&self) -> ErrorKind {
        match self {
            UpdaterError::Download(e) => e.kind(),
            UpdaterError::Verify(e) => e.kind(),
            UpdaterError::Install(e) => e.kind(),
            UpdaterError::Settings(_) => ErrorKind::Settings,
            UpdaterError::Busy { .. } => ErrorKind::Busy,
            UpdaterError::InvalidManifest(_) => ErrorKind::InvalidManifest,
            UpdaterError::InvalidTransition { .. } | UpdaterError::Io(_) => ErrorKind::Internal,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            UpdaterError::Download(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn recovery_action(&self) -> RecoveryAction {
        match self {
            UpdaterError::Download(e) => e.recovery_action(),
            UpdaterError::Verify(e) => e.recovery_action(),
            UpdaterError::Install(e) => e.recovery_action(),
            UpdaterError::Busy { .. } => RecoveryAction::None,
            _ => RecoveryAction::RestartCycle,
        }
    }
}
