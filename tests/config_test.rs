//! Tests for configuration loading, overrides and validation.

use std::io::Write;
use std::time::Duration;

use huginn::config::{CacheOverrides, MonitorOverrides, RetryOverrides};
use huginn::error::{ErrorKind, Severity};
use huginn::{ConfigOverrides, Environment, HuginnConfig, HuginnError};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn defaults_match_documented_values() {
    let config = HuginnConfig::default();
    assert!(config.cache.enabled);
    assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
    assert_eq!(config.cache.max_items, 100);
    assert_eq!(config.cache.stale_while_revalidate, Duration::from_secs(30));
    assert!(!config.cache.debug);

    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.base_delay, Duration::from_secs(1));
    assert!(config.retry.use_exponential_backoff);
    assert_eq!(config.revalidation.base_delay, Duration::from_millis(500));

    assert_eq!(config.monitor.sampling_rate, 1.0);
    assert_eq!(config.monitor.error_rate_threshold, 5.0);
    assert_eq!(config.monitor.min_report_level, Severity::Critical);
}

#[test]
fn load_explicit_file() {
    let file = write_config(
        r#"
[cache]
default_ttl_ms = 60000
max_items = 25

[retry]
max_retries = 5
base_delay_ms = 200
retryable_kinds = ["connection", "timeout"]

[revalidation]
max_retries = 1

[monitor]
sampling_rate = 0.25
min_report_level = "error"
critical_kinds = ["server_internal", "permission_denied"]
max_correlation_age_ms = 60000
"#,
    );

    let config = HuginnConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
    assert_eq!(config.cache.max_items, 25);
    // unspecified fields keep their defaults
    assert_eq!(config.cache.stale_while_revalidate, Duration::from_secs(30));

    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.base_delay, Duration::from_millis(200));
    assert!(config.retry.is_retryable(ErrorKind::Timeout));
    assert!(!config.retry.is_retryable(ErrorKind::RateLimited));

    assert_eq!(config.revalidation.max_retries, 1);

    assert_eq!(config.monitor.sampling_rate, 0.25);
    assert_eq!(config.monitor.min_report_level, Severity::Error);
    assert!(config.monitor.critical_kinds.contains(&ErrorKind::PermissionDenied));
    assert_eq!(config.monitor.max_correlation_age, Duration::from_secs(60));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = HuginnConfig::load(Some(&missing)).unwrap_err();
    assert!(matches!(err, HuginnError::Configuration(_)));
}

#[test]
fn malformed_file_is_an_error() {
    let file = write_config("[cache\nmax_items = ");
    let err = HuginnConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, HuginnError::Configuration(msg) if msg.contains("parse")));
}

#[test]
fn unknown_kind_names_are_rejected() {
    let err = HuginnConfig::from_toml_str("[retry]\nretryable_kinds = [\"gremlins\"]\n").unwrap_err();
    assert!(matches!(err, HuginnError::Configuration(_)));
}

#[test]
fn production_samples_a_tenth() {
    let dev = HuginnConfig::for_environment(Environment::Development);
    let prod = HuginnConfig::for_environment(Environment::Production);
    assert_eq!(dev.monitor.sampling_rate, 1.0);
    assert_eq!(prod.monitor.sampling_rate, 0.1);
    assert_eq!(prod.cache, dev.cache);
}

#[test]
fn merge_applies_only_given_fields() {
    let base = HuginnConfig::default();
    let overrides = ConfigOverrides {
        cache: CacheOverrides {
            default_ttl_ms: Some(1_000),
            debug: Some(true),
            ..Default::default()
        },
        retry: RetryOverrides {
            max_retries: Some(0),
            ..Default::default()
        },
        monitor: MonitorOverrides {
            sampling_rate: Some(0.5),
            disabled_kinds: Some([ErrorKind::NotFound].into()),
            ..Default::default()
        },
        ..Default::default()
    };

    let merged = base.merge(&overrides);
    assert_eq!(merged.cache.default_ttl, Duration::from_secs(1));
    assert!(merged.cache.debug);
    assert_eq!(merged.cache.max_items, base.cache.max_items);
    assert_eq!(merged.retry.max_retries, 0);
    assert_eq!(merged.retry.base_delay, base.retry.base_delay);
    assert_eq!(merged.revalidation, base.revalidation);
    assert_eq!(merged.monitor.sampling_rate, 0.5);
    assert!(merged.monitor.disabled_kinds.contains(&ErrorKind::NotFound));
    assert_eq!(merged.monitor.critical_kinds, base.monitor.critical_kinds);

    // inputs are untouched
    assert_eq!(base, HuginnConfig::default());
}

#[test]
fn empty_overrides_are_identity() {
    let base = HuginnConfig::for_environment(Environment::Production);
    assert_eq!(base.merge(&ConfigOverrides::default()), base);
}

#[test]
fn overrides_parse_from_toml() {
    let overrides = ConfigOverrides::from_toml_str(
        "[cache]\nmax_items = 3\n\n[monitor]\nmin_report_level = \"warning\"\n",
    )
    .unwrap();
    assert_eq!(overrides.cache.max_items, Some(3));
    assert_eq!(overrides.cache.default_ttl_ms, None);
    assert_eq!(overrides.monitor.min_report_level, Some(Severity::Warning));
}

#[test]
fn validate_rejects_out_of_range_values() {
    let mut config = HuginnConfig::default();
    assert!(config.validate().is_ok());

    config.monitor.sampling_rate = 1.5;
    assert!(config.validate().is_err());
    config.monitor.sampling_rate = f64::NAN;
    assert!(config.validate().is_err());
    config.monitor.sampling_rate = 0.0;
    assert!(config.validate().is_ok());

    config.cache.max_items = 0;
    assert!(config.validate().is_err());
}

#[test]
fn config_round_trips_through_toml() {
    let config = HuginnConfig::for_environment(Environment::Production);
    let text = toml::to_string(&config).unwrap();
    assert!(text.contains("default_ttl_ms = 300000"));
    assert_eq!(HuginnConfig::from_toml_str(&text).unwrap(), config);
}
