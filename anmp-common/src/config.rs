//! Configuration file discovery and loading
//!
//! Resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Per-user config file (`<config_dir>/anmp/config.toml`)
//! 4. System config file (`/etc/anmp/config.toml`, Linux only)
//!
//! If nothing is found the caller falls back to its compiled-in defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "ANMP_CONFIG";

/// File name looked up inside the platform config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Locate the configuration file to load, if any.
///
/// An explicitly requested file (CLI or environment) must exist; a missing
/// explicit file is an error rather than a silent fallback to defaults.
pub fn resolve_config_file(cli_arg: Option<&Path>, env_var_name: &str) -> Result<Option<PathBuf>> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return require_existing(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return require_existing(PathBuf::from(path));
        }
    }

    // Priority 3/4: Platform locations
    Ok(default_config_locations().into_iter().find(|p| p.exists()))
}

fn require_existing(path: PathBuf) -> Result<Option<PathBuf>> {
    if path.exists() {
        Ok(Some(path))
    } else {
        Err(Error::Config(format!("Config file not found: {}", path.display())))
    }
}

/// Candidate config file locations for the platform, most specific first
pub fn default_config_locations() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("anmp").join(CONFIG_FILE_NAME));
    }

    if cfg!(target_os = "linux") {
        candidates.push(PathBuf::from("/etc/anmp").join(CONFIG_FILE_NAME));
    }

    candidates
}

/// Parse a TOML file into any deserializable configuration struct
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Loading configuration from {}", path.display());
    let content = std::fs::read_to_string(path)?;
    let parsed = toml::from_str(&content)?;
    Ok(parsed)
}

/// Resolve and load a configuration, falling back to `T::default()`
pub fn load_or_default<T>(cli_arg: Option<&Path>, env_var_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match resolve_config_file(cli_arg, env_var_name)? {
        Some(path) => load_toml(&path),
        None => {
            debug!("No configuration file found, using built-in defaults");
            Ok(T::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        level: u32,
    }

    #[test]
    fn test_cli_argument_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"cli\"\nlevel = 3").unwrap();

        let resolved = resolve_config_file(Some(file.path()), "ANMP_TEST_UNUSED_VAR").unwrap();
        assert_eq!(resolved.as_deref(), Some(file.path()));

        let loaded: Sample = load_toml(file.path()).unwrap();
        assert_eq!(loaded, Sample { name: "cli".into(), level: 3 });
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = resolve_config_file(Some(Path::new("/nonexistent/anmp.toml")), "X");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_toml_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "level = [").unwrap();

        let result: Result<Sample> = load_toml(file.path());
        assert!(matches!(result, Err(Error::Toml(_))));
    }
}
