use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;
use weft_config::{CacheKind, ConfigError, WeftConfig};
use weft_resource::ManageMemoryMode;

#[test]
fn loads_every_table_from_path() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[scheduler]
max_parallelism = 4
cache_only = true
stop_on_first_failure = true
perf_sample_interval_ms = 250

[resources]
manage_memory_mode = "suspend"
max_resource_retries = 5
minimum_available_ram_mb = 2048

[sandbox]
unexpected_file_accesses_are_errors = false
search_path_tools = ["cl.exe"]
default_timeout_ms = 60000

[fingerprint]
salt = "v2"

[cache]
kind = "disk"
root = "/var/cache/weft"

[logging]
level = "debug"
json = true
"#
    )
    .unwrap();

    let config = WeftConfig::load_from_path(file.path()).unwrap();

    assert_eq!(config.scheduler.effective_max_parallelism(), 4);
    assert!(config.scheduler.cache_only);
    assert!(config.scheduler.stop_on_first_failure);
    assert_eq!(config.scheduler.perf_sample_interval(), Duration::from_millis(250));

    assert_eq!(config.resources.manage_memory_mode, ManageMemoryMode::Suspend);
    assert_eq!(config.resources.max_resource_retries, 5);
    let thresholds = config.resources.thresholds();
    assert_eq!(thresholds.minimum_available_ram_mb, 2048);
    assert_eq!(thresholds.minimum_free_disk_mb, 1024);

    let policy = config.sandbox.observation_policy();
    assert!(!policy.unexpected_file_accesses_are_errors);
    assert!(policy.is_search_path_tool("CL.EXE"));
    assert_eq!(config.sandbox.default_timeout(), Some(Duration::from_secs(60)));

    assert_eq!(config.fingerprint.salt, "v2");
    assert_eq!(config.cache.kind, CacheKind::Disk);
    assert!(config.logging.json);
    assert!(config.validate().is_ok());
}

#[test]
fn unknown_keys_are_rejected() {
    let err = WeftConfig::load_from_str("[scheduler]\nmax_paralelism = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    assert!(err.to_string().contains("max_paralelism"), "{err}");

    let err = WeftConfig::load_from_str("[unknown]\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = WeftConfig::load_from_path(dir.path().join("weft.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }), "{err:?}");
}
