use super::settings::{PartialConsumerSettings, PartialSettings, Settings};
use super::{DEFAULT_DELAY_LEVELS, load_config_from};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.broker.delay_levels, DEFAULT_DELAY_LEVELS);
    assert_eq!(settings.producer.send_timeout_ms, 3000);
    assert_eq!(settings.producer.retry_times_when_send_failed, 2);
    assert_eq!(settings.consumer.max_redeliveries, 16);
    assert!(settings.consumer.redelivery_backoff_ms.is_none());
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_partial_merge_keeps_defaults_for_missing_values() {
    let partial = PartialSettings {
        consumer: Some(PartialConsumerSettings {
            max_redeliveries: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    let merged = partial.merge(Settings::default());
    assert_eq!(merged.consumer.max_redeliveries, 3);
    assert_eq!(merged.consumer.consume_thread_max, 64);
    assert_eq!(merged.server.port, 8080);
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("tidemq.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9876

        [producer]
        send_timeout_ms = 10000

        [consumer]
        max_redeliveries = 3
        redelivery_backoff_ms = 250
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9876);
    assert_eq!(cfg.producer.send_timeout_ms, 10000);
    assert_eq!(cfg.consumer.max_redeliveries, 3);
    assert_eq!(cfg.consumer.redelivery_backoff_ms, Some(250));
    assert_eq!(cfg.broker.delay_levels, DEFAULT_DELAY_LEVELS);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    temp_env::with_vars(
        [
            ("TIDEMQ__CONSUMER__MAX_REDELIVERIES", Some("5")),
            ("TIDEMQ__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.consumer.max_redeliveries, 5);
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.server.port, 8080);
        },
    );
}
