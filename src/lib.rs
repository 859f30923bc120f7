//! Serial port byte stream.
//!
//! A `SerialStream` wraps one serial adapter: every read and write is
//! submitted as a pending operation, finished on a completion worker and
//! harvested under the configured timeout, while a background monitor turns
//! hardware events into data, pin and error notifications.
//!
//! # Modules
//!
//! - `stream`: the stream itself, its I/O and lifecycle
//! - `settings`: the device configuration mirror with rollback
//! - `operation`: pending asynchronous operations
//! - `completion`: worker pool delivering completions and notifications
//! - `monitor`: the hardware event loop
//! - `events`: notification types and the observer registry
//! - `device`: the hardware surface, a native backend and an in-memory mock
//! - `async_stream`: tokio adapter
//! - `config`: TOML configuration with environment overrides
//! - `error`: stream error types
//!
//! # Example
//!
//! ```
//! use serial_stream::device::MockDevice;
//! use serial_stream::{SerialStream, StreamOptions, Timeout};
//! use std::sync::Arc;
//!
//! let device = MockDevice::loopback("MOCK0");
//! let options = StreamOptions {
//!     read_timeout: Timeout::Millis(500),
//!     ..StreamOptions::default()
//! };
//! let stream = SerialStream::open_device(Arc::new(device), &options)?;
//!
//! stream.write(b"hello", 0, 5)?;
//! let mut buf = [0u8; 5];
//! let n = stream.read(&mut buf, 0, 5)?;
//! assert_eq!(&buf[..n], &b"hello"[..n]);
//! stream.close()?;
//! # Ok::<(), serial_stream::StreamError>(())
//! ```

pub mod async_stream;
pub mod completion;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod monitor;
pub mod operation;
pub mod settings;
pub mod signal;
pub mod stream;

// Re-export commonly used types for convenience
pub use async_stream::{AsyncSerialStream, EventReceiver};
pub use completion::{CompletionPort, IoBinding};
pub use device::{
    DataBits, DeviceError, DeviceErrorKind, Handshake, MockDevice, Parity, SerialDevice, StopBits,
    Timeout,
};
pub use error::{StreamError, StreamResult, UsageError};
pub use events::{SerialData, SerialError, SerialEvent, SerialPinChange, SubscriptionId};
pub use monitor::MonitorPhase;
pub use operation::{Direction, PendingOperation};
pub use stream::{validate_port_name, RuntimeOptions, SerialStream, StreamOptions};
