//! Tests for the logging system

use super::*;
use tempfile::TempDir;

#[test]
fn test_log_level_display() {
    assert_eq!(LogLevel::Trace.to_string(), "trace");
    assert_eq!(LogLevel::Debug.to_string(), "debug");
    assert_eq!(LogLevel::Info.to_string(), "info");
    assert_eq!(LogLevel::Warn.to_string(), "warn");
    assert_eq!(LogLevel::Error.to_string(), "error");
}

#[test]
fn test_logging_config_default() {
    let config = LoggingConfig::default();
    assert_eq!(config.level, LogLevel::Info);
    assert_eq!(config.format, LogFormat::Text);
    assert_eq!(config.output, LogOutput::Both);
    assert_eq!(config.rotation, RotationStrategy::Daily);
    assert!(config.include_target);
    assert!(!config.include_thread_id);
    assert!(config.log_directory.is_some());
}

#[test]
fn test_logging_config_builder() {
    let config = LoggingConfig::new()
        .with_level(LogLevel::Debug)
        .with_format(LogFormat::Json)
        .with_output(LogOutput::File)
        .with_target(false)
        .with_thread_id(true)
        .with_file_info(true)
        .with_rotation(RotationStrategy::Hourly)
        .with_module_level("desktop_updater::update::download", LogLevel::Trace);

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.output, LogOutput::File);
    assert_eq!(config.rotation, RotationStrategy::Hourly);
    assert!(!config.include_target);
    assert!(config.include_thread_id);
    assert_eq!(
        config.module_levels.get("desktop_updater::update::download"),
        Some(&LogLevel::Trace)
    );
}

#[test]
fn test_logging_config_presets() {
    let dev = LoggingConfig::development();
    assert_eq!(dev.level, LogLevel::Debug);
    assert_eq!(dev.output, LogOutput::Console);
    assert!(dev.log_directory.is_none());

    let prod = LoggingConfig::production();
    assert_eq!(prod.format, LogFormat::Json);
    assert_eq!(prod.module_levels.get("reqwest"), Some(&LogLevel::Warn));
    assert_eq!(prod.max_files, 14);
}

#[test]
fn test_logging_config_serde() {
    let config = LoggingConfig::production();
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("\"json\""));
    assert!(json.contains("\"daily\""));

    let parsed: LoggingConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.level, config.level);
    assert_eq!(parsed.rotation, config.rotation);
}

#[test]
fn test_env_filter_accepts_module_levels() {
    let config = LoggingConfig::new()
        .with_module_level("desktop_updater::update", LogLevel::Trace)
        .with_module_level("not a module!", LogLevel::Debug);
    let filter = LoggingSystem::build_env_filter(&config);
    assert!(filter.to_string().contains("desktop_updater::update=trace"));
}

#[test]
fn test_rotation_mapping() {
    assert_eq!(rotation_for(RotationStrategy::Daily), Rotation::DAILY);
    assert_eq!(rotation_for(RotationStrategy::Hourly), Rotation::HOURLY);
    assert_eq!(rotation_for(RotationStrategy::Never), Rotation::NEVER);
}

#[test]
fn test_init_file_logging() {
    let temp = TempDir::new().unwrap();
    let config = LoggingConfig::new()
        .with_output(LogOutput::File)
        .with_log_directory(temp.path().join("logs"));

    // Another test may already own the global subscriber
    match LoggingSystem::init(config) {
        Ok(system) => {
            assert_eq!(system.log_directory(), Some(&temp.path().join("logs")));
            assert_eq!(system.log_level(), LogLevel::Info);
        }
        Err(LoggingError::InitializationError(_)) => {}
        Err(e) => panic!("unexpected error: {}", e),
    }
    assert!(temp.path().join("logs").is_dir());
}
