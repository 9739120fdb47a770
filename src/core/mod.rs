//! Core module
//!
//! Configuration, error taxonomy and small helpers shared by the update
//! pipeline.

pub mod config;
pub mod error;
pub mod utils;

// Re-export commonly used items
pub use config::{UpdaterConfig, DEFAULT_SIGNATURE_SUFFIX, PUBLISHER_PUBLIC_KEY};
pub use error::{
    DownloadError, ErrorKind, ErrorRecovery, InstallError, RecoveryAction, Result, UpdaterError,
    VerifyError,
};
