//! Configuration discovery tests
//!
//! Tests that touch ANMP_CONFIG are marked #[serial] so they do not race on
//! the process environment.

use anmp_common::config::{load_or_default, resolve_config_file, CONFIG_ENV_VAR};
use anmp_common::Error;
use serde::Deserialize;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct TestConfig {
    backend: String,
    channels: u16,
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

#[test]
#[serial]
fn test_env_var_selects_file() {
    let file = write_config("backend = \"wav\"\nchannels = 1\n");
    env::set_var(CONFIG_ENV_VAR, file.path());

    let loaded: TestConfig = load_or_default(None, CONFIG_ENV_VAR).unwrap();
    assert_eq!(
        loaded,
        TestConfig {
            backend: "wav".into(),
            channels: 1
        }
    );

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_cli_argument_beats_env_var() {
    let from_env = write_config("backend = \"jack\"\n");
    let from_cli = write_config("backend = \"null\"\n");
    env::set_var(CONFIG_ENV_VAR, from_env.path());

    let resolved = resolve_config_file(Some(from_cli.path()), CONFIG_ENV_VAR).unwrap();
    assert_eq!(resolved.as_deref(), Some(from_cli.path()));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_var_pointing_nowhere_is_error() {
    env::set_var(CONFIG_ENV_VAR, "/nonexistent/anmp/config.toml");

    let result: anmp_common::Result<TestConfig> = load_or_default(None, CONFIG_ENV_VAR);
    assert!(matches!(result, Err(Error::Config(_))));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_empty_env_var_is_ignored() {
    env::set_var(CONFIG_ENV_VAR, "");

    let resolved = resolve_config_file(None, CONFIG_ENV_VAR).unwrap();
    if let Some(path) = resolved {
        // Only a real per-user or system file may be picked up
        assert!(path.exists());
        assert_ne!(path, Path::new(""));
    }

    env::remove_var(CONFIG_ENV_VAR);
}
