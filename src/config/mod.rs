//! Persisted update settings
//!
//! Holds the current bundle pointer, the fallback history and the update
//! flags the host application keeps between runs.

mod storage;
#[cfg(test)]
mod tests;

pub use storage::{ConfigError, ConfigResult, SettingsStore, UpdateSettings};
