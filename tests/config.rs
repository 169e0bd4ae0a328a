use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use openfda_bulk::config::ConfigLoader;
use openfda_bulk::error::BulkError;

#[test]
fn explicit_config_file_overrides_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("openfda-bulk.json");
    fs::write(
        &path,
        r#"{
            "base_dir": "/srv/fda",
            "base_url": "https://mirror.example/drug/event/",
            "poll_interval_secs": 5,
            "max_wait_secs": 20,
            "counts": {"2024": {"q1": 31, "q2": 29}}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();

    assert_eq!(resolved.settings.poll_interval, Duration::from_secs(5));
    assert_eq!(resolved.settings.max_wait, Duration::from_secs(20));
    assert_eq!(resolved.settings.group_size, 3);
    assert_eq!(resolved.store().unwrap().root().as_str(), "/srv/fda");

    let catalog = resolved.catalog(resolved.store().unwrap());
    let descriptor = catalog.descriptor("2024q2".parse().unwrap(), 29).unwrap();
    assert_eq!(
        descriptor.url,
        "https://mirror.example/drug/event/2024q2/drug-event-0029-of-0029.json.zip"
    );
}

#[test]
fn missing_explicit_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");

    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(BulkError::ConfigRead(_))
    );
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("openfda-bulk.json");
    fs::write(&path, r#"{"counts": {"2024": {"q5": 3}}}"#).unwrap();

    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(BulkError::ConfigParse(_))
    );
}

#[test]
fn zero_retry_budget_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("openfda-bulk.json");
    fs::write(&path, r#"{"max_group_retries": 0}"#).unwrap();

    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(BulkError::ConfigParse(_))
    );
}
