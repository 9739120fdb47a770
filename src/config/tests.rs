//! Tests for the settings store

use super::*;
use crate::update::BundleRecord;
use tempfile::TempDir;

async fn create_test_store() -> (SettingsStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = SettingsStore::open(temp_dir.path().join("update-settings.json"))
        .await
        .unwrap();
    (store, temp_dir)
}

fn record(bundle: &str) -> BundleRecord {
    BundleRecord {
        app_version: "5.1.0".to_string(),
        bundle_version: bundle.to_string(),
        signature: format!("sig-{}", bundle),
    }
}

#[tokio::test]
async fn test_create_default_settings() {
    let (store, _temp) = create_test_store().await;

    let settings = store.get().await;
    assert_eq!(settings.version, 1);
    assert!(!settings.use_test_feed_url);
    assert!(settings.current_bundle.is_none());
    assert!(settings.fallback_bundles.is_empty());
    assert!(store.path().exists());
}

#[tokio::test]
async fn test_update_persists_across_reopen() {
    let (store, temp) = create_test_store().await;

    store
        .update(|s| {
            s.current_bundle = Some(record("2"));
            s.fallback_bundles.push(record("1"));
        })
        .await
        .unwrap();
    drop(store);

    let reopened = SettingsStore::open(temp.path().join("update-settings.json"))
        .await
        .unwrap();
    assert_eq!(reopened.current_bundle().await, Some(record("2")));
    assert_eq!(reopened.fallback_bundles().await, vec![record("1")]);
}

#[tokio::test]
async fn test_update_returns_closure_value() {
    let (store, _temp) = create_test_store().await;

    let previous = store
        .update(|s| s.current_bundle.replace(record("7")))
        .await
        .unwrap();
    assert!(previous.is_none());
    assert_eq!(store.current_bundle().await, Some(record("7")));
}

#[tokio::test]
async fn test_failed_write_keeps_previous_settings() {
    let (store, temp) = create_test_store().await;
    store.set_use_test_feed_url(true).await.unwrap();

    // A directory squatting on the temp path makes the write fail
    std::fs::create_dir(temp.path().join("update-settings.json.tmp")).unwrap();

    let result = store.update(|s| s.current_bundle = Some(record("9"))).await;
    assert!(result.is_err());
    assert!(store.current_bundle().await.is_none());
    assert!(store.use_test_feed_url().await);
}

#[tokio::test]
async fn test_build_number_and_signature() {
    let (store, _temp) = create_test_store().await;

    assert!(store.previous_build_number().await.is_none());
    store
        .set_update_build_number(Some("2024120101".to_string()))
        .await
        .unwrap();
    store
        .set_signature_document(Some("-----BEGIN SIGNED MESSAGE-----".to_string()))
        .await
        .unwrap();
    assert_eq!(store.previous_build_number().await.as_deref(), Some("2024120101"));
    assert!(store.signature_document().await.is_some());

    store.clear_update_settings().await.unwrap();
    assert!(store.previous_build_number().await.is_none());
    assert!(store.signature_document().await.is_none());
}

#[tokio::test]
async fn test_clear_bundle_records() {
    let (store, _temp) = create_test_store().await;
    store
        .update(|s| {
            s.current_bundle = Some(record("3"));
            s.fallback_bundles = vec![record("1"), record("2")];
            s.native_version = Some("5.1.0".to_string());
        })
        .await
        .unwrap();

    store.clear_bundle_records().await.unwrap();
    let settings = store.get().await;
    assert!(settings.current_bundle.is_none());
    assert!(settings.fallback_bundles.is_empty());
    assert!(settings.native_version.is_none());
}

#[tokio::test]
async fn test_rejects_unknown_version() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("update-settings.json");
    std::fs::write(&path, r#"{"version": 42}"#).unwrap();

    let result = SettingsStore::open(&path).await;
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[tokio::test]
async fn test_settings_json_is_camel_case() {
    let (store, _temp) = create_test_store().await;
    store.set_use_test_feed_url(true).await.unwrap();

    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains("\"useTestFeedUrl\": true"));
    assert!(raw.contains("\"fallbackBundles\""));
}
