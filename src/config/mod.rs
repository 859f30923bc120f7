//! Configuration module for serial-stream.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `SERIAL_STREAM_CONFIG` environment variable (explicit path)
//! 2. `./serial-stream.toml` (current directory)
//! 3. `~/.config/serial-stream/config.toml` (XDG on Linux/macOS)
//! 4. `%APPDATA%\serial-stream\config.toml` (Windows)
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! The pattern is: `SERIAL_STREAM_<SECTION>_<KEY>`
//!
//! Examples:
//! - `SERIAL_STREAM_STREAM_BAUD_RATE=115200`
//! - `SERIAL_STREAM_STREAM_HANDSHAKE=request_to_send`
//! - `SERIAL_STREAM_LOGGING_LEVEL=serial_stream=debug`
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_stream::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let options = loader.config().stream.to_options()?;
//! println!("Default baud: {}", options.baud_rate);
//! # Ok::<(), serial_stream::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{Config, LogFormat, LoggingConfig, RuntimeConfig, StreamDefaults};
