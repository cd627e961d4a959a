use envd::config::{ConfigError, EnvdConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_config_file_operations() {
    let original = EnvdConfig {
        poll_interval_ms: 250,
        host_ip: "::1".to_string(),
        ..EnvdConfig::default()
    };

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    original
        .to_toml_file(temp_file.path())
        .expect("Should be able to save config to file");

    let loaded = EnvdConfig::from_toml_file(temp_file.path())
        .expect("Should be able to load config from file");
    assert_eq!(original, loaded);
    assert_eq!(loaded.poll_interval(), Duration::from_millis(250));
}

#[test]
fn test_partial_config_keeps_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
ready_timeout_secs = 5

[ports]
jupyter = 9999
"#
    )
    .unwrap();

    let config = EnvdConfig::from_toml_file(temp_file.path()).unwrap();
    assert_eq!(config.ready_timeout(), Duration::from_secs(5));
    assert_eq!(config.ports.jupyter, 9999);
    assert_eq!(config.ports.ssh, 2222);
    assert_eq!(config.ports.rstudio, 8787);
    assert_eq!(config.home_prefix, "/home/envd");
    assert_eq!(config.user, "envd");
}

#[test]
fn test_invalid_config_reports_path() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "poll_interval_ms = \"fast\"").unwrap();

    match EnvdConfig::from_toml_file(temp_file.path()) {
        Err(ConfigError::Parse { path, .. }) => assert_eq!(path, temp_file.path()),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn test_missing_config_file() {
    let err = EnvdConfig::from_toml_file("/nonexistent/envd.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
