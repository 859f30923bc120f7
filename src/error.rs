//! Stream-level error types.
//!
//! Every public stream operation fails with exactly one `StreamError`. Device
//! rejections are carried as `StreamError::Device`; the remaining variants
//! are raised by the stream itself before or after the device is involved.

use crate::device::{DeviceError, DeviceErrorKind};
use crate::operation::Direction;
use std::io;
use thiserror::Error;

/// Programming errors in the use of the begin/end operation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    /// The operation's result was already harvested.
    #[error("End{direction} called twice")]
    EndCalledTwice { direction: Direction },

    /// A read operation was passed to the write harvester, or vice versa.
    #[error("operation was not returned by Begin{expected}")]
    WrongOperation { expected: Direction },
}

/// Errors that can occur during stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A numeric argument is outside its legal range.
    #[error("{param}: {message}")]
    ArgumentOutOfRange { param: &'static str, message: String },

    /// A malformed argument, such as an empty port name.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call is not legal in the stream's current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The named port does not exist.
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// The stream is closed or its handle was invalidated.
    #[error("Port is not open")]
    NotOpen,

    /// The timeout elapsed before the request completed.
    #[error("The {direction} operation timed out after transferring {transferred} bytes")]
    Timeout {
        direction: Direction,
        transferred: usize,
    },

    /// An infinite-timeout asynchronous read ended without data.
    #[error("The I/O operation has been aborted")]
    OperationAborted,

    /// The device reported end of stream.
    #[error("Unexpected end of stream")]
    EndOfStream,

    /// Offset and count describe a range outside the buffer.
    #[error("Offset and count exceed the buffer length: offset {offset}, count {count}, length {len}")]
    IndexOutOfRange {
        offset: usize,
        count: usize,
        len: usize,
    },

    /// Misuse of the begin/end API.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The device or its driver refused a request.
    #[error("Device error: {0}")]
    Device(DeviceError),

    /// An I/O error outside the device layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// Create an ArgumentOutOfRange error.
    pub fn out_of_range(param: &'static str, message: impl Into<String>) -> Self {
        Self::ArgumentOutOfRange {
            param,
            message: message.into(),
        }
    }

    /// Create an InvalidOperation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Create a Timeout error.
    pub fn timeout(direction: Direction, transferred: usize) -> Self {
        Self::Timeout {
            direction,
            transferred,
        }
    }

    /// The device failure classification, if this is a device error.
    pub fn device_kind(&self) -> Option<DeviceErrorKind> {
        match self {
            Self::Device(err) => Some(err.kind()),
            _ => None,
        }
    }

    /// Whether the underlying device went away.
    pub fn is_disconnect(&self) -> bool {
        self.device_kind().is_some_and(DeviceErrorKind::is_disconnect)
    }
}

impl From<DeviceError> for StreamError {
    fn from(err: DeviceError) -> Self {
        match err.kind() {
            DeviceErrorKind::HandleEof => Self::EndOfStream,
            DeviceErrorKind::Closed => Self::NotOpen,
            DeviceErrorKind::Aborted => Self::OperationAborted,
            DeviceErrorKind::NotFound => Self::PortNotFound(err.message().to_string()),
            _ => Self::Device(err),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::Io(inner) => return io::Error::new(inner.kind(), err.to_string()),
            StreamError::ArgumentOutOfRange { .. }
            | StreamError::InvalidArgument(_)
            | StreamError::IndexOutOfRange { .. } => io::ErrorKind::InvalidInput,
            StreamError::InvalidOperation(_) | StreamError::Usage(_) => io::ErrorKind::Other,
            StreamError::PortNotFound(_) => io::ErrorKind::NotFound,
            StreamError::NotOpen => io::ErrorKind::NotConnected,
            StreamError::Timeout { .. } => io::ErrorKind::TimedOut,
            StreamError::OperationAborted => io::ErrorKind::Interrupted,
            StreamError::EndOfStream => io::ErrorKind::UnexpectedEof,
            StreamError::Device(device) => match device.kind() {
                DeviceErrorKind::AccessDenied => io::ErrorKind::PermissionDenied,
                DeviceErrorKind::DeviceRemoved | DeviceErrorKind::BadCommand => {
                    io::ErrorKind::BrokenPipe
                }
                DeviceErrorKind::InvalidParameter => io::ErrorKind::InvalidInput,
                DeviceErrorKind::Unsupported => io::ErrorKind::Unsupported,
                _ => io::ErrorKind::Other,
            },
        };
        io::Error::new(kind, err)
    }
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::out_of_range("baud_rate", "must be positive");
        assert_eq!(err.to_string(), "baud_rate: must be positive");

        let err = StreamError::Usage(UsageError::EndCalledTwice {
            direction: Direction::Read,
        });
        assert_eq!(err.to_string(), "EndRead called twice");

        let err = StreamError::timeout(Direction::Write, 3);
        assert!(err.to_string().contains("Write"));
        assert!(err.to_string().contains("3 bytes"));
    }

    #[test]
    fn test_device_error_translation() {
        let err: StreamError = DeviceError::closed().into();
        assert!(matches!(err, StreamError::NotOpen));

        let err: StreamError = DeviceError::new(DeviceErrorKind::HandleEof, "eof").into();
        assert!(matches!(err, StreamError::EndOfStream));

        let err: StreamError = DeviceError::new(DeviceErrorKind::DeviceRemoved, "gone").into();
        assert!(err.is_disconnect());
        assert_eq!(err.device_kind(), Some(DeviceErrorKind::DeviceRemoved));
    }

    #[test]
    fn test_io_error_kinds() {
        let io_err: io::Error = StreamError::timeout(Direction::Read, 0).into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);

        let io_err: io::Error = StreamError::NotOpen.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotConnected);
    }
}
