//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::Config;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SERIAL_STREAM";

/// File name looked up in the current directory
const LOCAL_CONFIG_FILE: &str = "serial-stream.toml";

/// File name inside the per-user config directory
const CONFIG_FILE_NAME: &str = "config.toml";

const APP_DIR: &str = "serial-stream";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SERIAL_STREAM_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SERIAL_STREAM_CONFIG` environment variable (explicit path)
    /// 2. `./serial-stream.toml` (current directory)
    /// 3. `~/.config/serial-stream/config.toml` (XDG on Linux/macOS)
    /// 4. `%APPDATA%\serial-stream\config.toml` (Windows)
    /// 5. Built-in defaults (no file required)
    ///
    /// Environment variables can override any config file values.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = if let Some(ref path) = config_path {
            load_from_file(path)?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    ///
    /// Environment overrides that fail to parse are ignored.
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        let _ = apply_env_overrides(&mut config);

        Self {
            config_path: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Save the current configuration to the file it was loaded from.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("No config file path set".to_string()))?;

        save_to_file(&self.config, path)
    }

    /// Save the current configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    get_default_config_path().filter(|path| path.exists())
}

/// Get the platform-specific config directory.
fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = toml::from_str(&content)?;
    config.stream.validate()?;
    Ok(config)
}

fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read `SERIAL_STREAM_<key>`, returning the variable name with its value.
fn env_override(key: &str) -> Option<(String, String)> {
    let var = format!("{ENV_PREFIX}_{key}");
    std::env::var(&var).ok().map(|val| (var, val))
}

fn parse_number<T: FromStr>(var: &str, val: &str, what: &str) -> ConfigResult<T> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::env_parse(var, format!("Invalid {what}")))
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Parse an enum value spelled the way the config file spells it.
fn parse_enum<T: DeserializeOwned>(var: &str, val: &str) -> ConfigResult<T> {
    T::deserialize(toml::Value::String(val.trim().to_ascii_lowercase()))
        .map_err(|e| ConfigError::env_parse(var, e.to_string()))
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `SERIAL_STREAM_<SECTION>_<KEY>`
/// For example:
/// - `SERIAL_STREAM_STREAM_BAUD_RATE=115200`
/// - `SERIAL_STREAM_STREAM_PARITY=even`
/// - `SERIAL_STREAM_RUNTIME_COMPLETION_WORKERS=4`
/// - `SERIAL_STREAM_LOGGING_FORMAT=json`
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    let stream = &mut config.stream;
    if let Some((var, val)) = env_override("STREAM_BAUD_RATE") {
        stream.baud_rate = parse_number(&var, &val, "baud rate")?;
    }
    if let Some((var, val)) = env_override("STREAM_PARITY") {
        stream.parity = parse_enum(&var, &val)?;
    }
    if let Some((var, val)) = env_override("STREAM_DATA_BITS") {
        stream.data_bits = parse_number(&var, &val, "data bit count")?;
    }
    if let Some((var, val)) = env_override("STREAM_STOP_BITS") {
        stream.stop_bits = parse_enum(&var, &val)?;
    }
    if let Some((var, val)) = env_override("STREAM_HANDSHAKE") {
        stream.handshake = parse_enum(&var, &val)?;
    }
    if let Some((var, val)) = env_override("STREAM_READ_TIMEOUT_MS") {
        stream.read_timeout_ms = Some(parse_number(&var, &val, "timeout")?);
    }
    if let Some((var, val)) = env_override("STREAM_WRITE_TIMEOUT_MS") {
        stream.write_timeout_ms = Some(parse_number(&var, &val, "timeout")?);
    }
    if let Some((_, val)) = env_override("STREAM_DTR_ENABLE") {
        stream.dtr_enable = parse_flag(&val);
    }
    if let Some((_, val)) = env_override("STREAM_RTS_ENABLE") {
        stream.rts_enable = parse_flag(&val);
    }
    if let Some((_, val)) = env_override("STREAM_DISCARD_NULL") {
        stream.discard_null = parse_flag(&val);
    }

    if let Some((var, val)) = env_override("RUNTIME_COMPLETION_WORKERS") {
        config.runtime.completion_workers = parse_number(&var, &val, "worker count")?;
    }
    if let Some((var, val)) = env_override("RUNTIME_MONITOR_POLL_INTERVAL_MS") {
        config.runtime.monitor_poll_interval_ms = parse_number(&var, &val, "interval")?;
    }

    if let Some((_, val)) = env_override("LOGGING_LEVEL") {
        config.logging.level = val;
    }
    if let Some((var, val)) = env_override("LOGGING_FORMAT") {
        config.logging.format = parse_enum(&var, &val)?;
    }

    Ok(())
}

/// Get the default config directory for creating new config files.
pub fn get_default_config_dir() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join(APP_DIR))
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use crate::device::Parity;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_default_loader() {
        let loader = ConfigLoader::with_defaults();
        assert_eq!(loader.config().stream.baud_rate, 9600);
        assert!(loader.config_path.is_none());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        env::set_var("SERIAL_STREAM_STREAM_BAUD_RATE", "57600");
        env::set_var("SERIAL_STREAM_STREAM_PARITY", "Even");
        env::set_var("SERIAL_STREAM_LOGGING_FORMAT", "json");

        let loader = ConfigLoader::with_defaults();

        env::remove_var("SERIAL_STREAM_STREAM_BAUD_RATE");
        env::remove_var("SERIAL_STREAM_STREAM_PARITY");
        env::remove_var("SERIAL_STREAM_LOGGING_FORMAT");

        assert_eq!(loader.config().stream.baud_rate, 57600);
        assert_eq!(loader.config().stream.parity, Parity::Even);
        assert_eq!(loader.config().logging.format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_bad_env_value_is_reported() {
        env::set_var("SERIAL_STREAM_RUNTIME_COMPLETION_WORKERS", "many");

        let mut config = Config::default();
        let result = apply_env_overrides(&mut config);

        env::remove_var("SERIAL_STREAM_RUNTIME_COMPLETION_WORKERS");

        assert!(matches!(result, Err(ConfigError::EnvParseError { .. })));
    }
}
