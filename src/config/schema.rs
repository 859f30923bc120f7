//! Configuration schema definitions.
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes.

use super::error::{ConfigError, ConfigResult};
use crate::device::{DataBits, Handshake, Parity, StopBits, Timeout};
use crate::stream::{RuntimeOptions, StreamOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parameters applied to every opened stream
    pub stream: StreamDefaults,
    /// Completion and monitor threads
    pub runtime: RuntimeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Default stream parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    pub baud_rate: u32,
    pub parity: Parity,
    /// 5 to 8
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    /// Absent means infinite.
    pub read_timeout_ms: Option<u32>,
    /// Absent means infinite.
    pub write_timeout_ms: Option<u32>,
    pub dtr_enable: bool,
    pub rts_enable: bool,
    pub discard_null: bool,
    /// Byte substituted for characters received with a parity error
    pub parity_replace: u8,
    pub read_buffer_size: u32,
    pub write_buffer_size: u32,
    /// Short names for ports
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            dtr_enable: false,
            rts_enable: false,
            discard_null: false,
            parity_replace: b'?',
            read_buffer_size: 4096,
            write_buffer_size: 2048,
            port_aliases: HashMap::new(),
        }
    }
}

impl StreamDefaults {
    /// Check values the stream would reject at open.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.baud_rate == 0 {
            return Err(ConfigError::validation(
                "stream.baud_rate",
                "must be a positive number",
            ));
        }
        if DataBits::try_from(self.data_bits).is_err() {
            return Err(ConfigError::validation(
                "stream.data_bits",
                format!("{} is not between 5 and 8", self.data_bits),
            ));
        }
        if self.write_timeout_ms == Some(0) {
            return Err(ConfigError::validation(
                "stream.write_timeout_ms",
                "must be positive; omit it for an infinite timeout",
            ));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(ConfigError::validation(
                "stream.read_buffer_size",
                "buffer sizes must be positive",
            ));
        }
        Ok(())
    }

    /// Validated stream options.
    pub fn to_options(&self) -> ConfigResult<StreamOptions> {
        self.validate()?;
        let data_bits = DataBits::try_from(self.data_bits).map_err(|bits| {
            ConfigError::validation("stream.data_bits", format!("{bits} is not between 5 and 8"))
        })?;
        Ok(StreamOptions {
            baud_rate: self.baud_rate,
            parity: self.parity,
            data_bits,
            stop_bits: self.stop_bits,
            handshake: self.handshake,
            read_timeout: self.read_timeout_ms.map_or(Timeout::Infinite, Timeout::Millis),
            write_timeout: self.write_timeout_ms.map_or(Timeout::Infinite, Timeout::Millis),
            dtr_enable: self.dtr_enable,
            rts_enable: self.rts_enable,
            discard_null: self.discard_null,
            parity_replace: self.parity_replace,
            buffer_sizes: Some((self.read_buffer_size, self.write_buffer_size)),
        })
    }

    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Runtime configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads delivering completions and notifications
    pub completion_workers: usize,
    /// Line sampling interval of the native event monitor
    pub monitor_poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            completion_workers: 2,
            monitor_poll_interval_ms: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn to_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            completion_workers: self.completion_workers.max(1),
            monitor_poll_interval: Duration::from_millis(self.monitor_poll_interval_ms.max(1)),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "serial_stream=debug". `RUST_LOG` wins.
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stream.baud_rate, 9600);
        assert_eq!(config.stream.parity_replace, b'?');
        assert_eq!(config.runtime.completion_workers, 2);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_port_alias_resolution() {
        let mut defaults = StreamDefaults::default();
        defaults
            .port_aliases
            .insert("arduino".to_string(), "COM3".to_string());

        assert_eq!(defaults.resolve_port("arduino"), "COM3");
        assert_eq!(defaults.resolve_port("COM5"), "COM5");
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [stream]
            baud_rate = 115200
            parity = "even"
            read_timeout_ms = 500

            [logging]
            format = "json"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.stream.baud_rate, 115_200);
        assert_eq!(config.stream.parity, Parity::Even);
        assert_eq!(config.logging.format, LogFormat::Json);
        // Defaults should still work
        assert_eq!(config.stream.data_bits, 8);
        assert_eq!(config.runtime.monitor_poll_interval_ms, 10);
    }

    #[test]
    fn test_to_options() {
        let defaults = StreamDefaults {
            read_timeout_ms: Some(250),
            data_bits: 7,
            ..StreamDefaults::default()
        };

        let options = defaults.to_options().unwrap();
        assert_eq!(options.read_timeout, Timeout::Millis(250));
        assert_eq!(options.write_timeout, Timeout::Infinite);
        assert_eq!(options.data_bits, DataBits::Seven);
        assert_eq!(options.buffer_sizes, Some((4096, 2048)));
    }

    #[test]
    fn test_validation() {
        let zero_baud = StreamDefaults {
            baud_rate: 0,
            ..StreamDefaults::default()
        };
        assert!(matches!(
            zero_baud.validate(),
            Err(ConfigError::ValidationError { .. })
        ));

        let nine_bits = StreamDefaults {
            data_bits: 9,
            ..StreamDefaults::default()
        };
        assert!(nine_bits.to_options().is_err());

        let zero_write = StreamDefaults {
            write_timeout_ms: Some(0),
            ..StreamDefaults::default()
        };
        assert!(zero_write.validate().is_err());
    }
}
