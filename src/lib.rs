//! Desktop updater - resumable, signature-verified update pipeline
//!
//! This crate provides the update machinery of a desktop wallet installation:
//! - Resumable artifact downloads over HTTP range requests
//! - Content hash and detached signature verification
//! - Content bundle activation with a bounded rollback history
//! - Native installer hand-off with application restart
//! - A per-channel update state machine with an event stream

pub mod config;
pub mod core;
pub mod logging;
pub mod update;

// Re-export commonly used items
pub use core::config::UpdaterConfig;
pub use core::error::{ErrorKind, ErrorRecovery, Result, UpdaterError};
pub use config::{SettingsStore, UpdateSettings};
pub use logging::{LoggingConfig, LoggingSystem};
pub use update::{
    AppLifecycle, BundleRecord, Distribution, UpdateChannel, UpdateCoordinator, UpdateEvent,
    UpdateManifest, UpdateSnapshot, UpdateState,
};
