use std::io::Write;

use flowline_core::config::{AppConfig, StorageBackend};
use flowline_core::error::FlowlineError;
use flowline_core::event::EventKind;

#[test]
fn test_load_full_config_from_file() {
    std::env::set_var("FLOWLINE_TEST_LOG_DIR", "/tmp/flowline-logs");
    let toml_content = r#"
[engine]
max_blocking_workers = 2
store_events = true
events_to_skip = ["step_started", "content_delta"]
stream_intermediate_steps = true

[storage]
backend = "sqlite"
path = "/tmp/flowline-test/sessions.db"

[log]
dir = "${FLOWLINE_TEST_LOG_DIR}"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_blocking_workers, 2);
    assert!(config.engine.store_events);
    assert!(config.engine.stream_intermediate_steps);
    assert_eq!(
        config.engine.events_to_skip,
        vec![EventKind::StepStarted, EventKind::ContentDelta]
    );
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(
        config.storage.resolved_path().display().to_string(),
        "/tmp/flowline-test/sessions.db"
    );

    let log = config.log.expect("log section");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(log.resolved_dir().display().to_string(), "/tmp/flowline-logs");
}

#[test]
fn test_empty_file_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.max_blocking_workers, 8);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(&dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, FlowlineError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[engine]\nmax_blocking_workers = 0\n").unwrap();
    assert!(matches!(
        AppConfig::load(tmp.path()).unwrap_err(),
        FlowlineError::Config(_)
    ));

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[storage]\nbackend = \"postgres\"\n").unwrap();
    assert!(AppConfig::load(tmp.path()).is_err());
}
