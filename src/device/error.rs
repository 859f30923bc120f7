//! Device-level error types.
//!
//! A `DeviceError` is what the hardware (or driver) reports when it refuses a
//! request. It is kept separate from the stream-level `StreamError` so device
//! backends stay free of stream semantics.

use thiserror::Error;

/// Classification of a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// The named device does not exist.
    NotFound,
    /// The driver denied access (also reported when a USB adapter is pulled).
    AccessDenied,
    /// The driver no longer understands requests for the device.
    BadCommand,
    /// The device was physically removed.
    DeviceRemoved,
    /// The handle no longer refers to an open device.
    InvalidHandle,
    /// The driver rejected a parameter value.
    InvalidParameter,
    /// End of stream was reached.
    HandleEof,
    /// The backend cannot express the requested configuration.
    Unsupported,
    /// The handle was closed by this process.
    Closed,
    /// An outstanding request was cancelled by a purge.
    Aborted,
    /// Any other platform error code.
    Other(i32),
}

impl DeviceErrorKind {
    /// Whether this kind means the device went away underneath us.
    ///
    /// The set differs between drivers; these are the ones seen in practice.
    pub fn is_disconnect(self) -> bool {
        matches!(
            self,
            Self::AccessDenied | Self::BadCommand | Self::DeviceRemoved
        )
    }

    /// Translate a raw OS error code.
    #[cfg(unix)]
    pub fn from_os_code(code: i32) -> Self {
        match code {
            libc::ENOENT => Self::NotFound,
            libc::EACCES | libc::EPERM => Self::AccessDenied,
            libc::ENXIO | libc::ENODEV | libc::EIO => Self::DeviceRemoved,
            libc::EBADF => Self::InvalidHandle,
            libc::EINVAL => Self::InvalidParameter,
            libc::ENOTTY => Self::BadCommand,
            libc::ECANCELED => Self::Aborted,
            other => Self::Other(other),
        }
    }

    /// Translate a raw OS error code.
    #[cfg(windows)]
    pub fn from_os_code(code: i32) -> Self {
        use winapi::shared::winerror;

        match code as u32 {
            winerror::ERROR_FILE_NOT_FOUND => Self::NotFound,
            winerror::ERROR_ACCESS_DENIED => Self::AccessDenied,
            winerror::ERROR_BAD_COMMAND => Self::BadCommand,
            winerror::ERROR_DEVICE_REMOVED => Self::DeviceRemoved,
            winerror::ERROR_INVALID_HANDLE => Self::InvalidHandle,
            winerror::ERROR_INVALID_PARAMETER => Self::InvalidParameter,
            winerror::ERROR_HANDLE_EOF => Self::HandleEof,
            winerror::ERROR_OPERATION_ABORTED => Self::Aborted,
            _ => Self::Other(code),
        }
    }

    /// Translate a raw OS error code.
    #[cfg(not(any(unix, windows)))]
    pub fn from_os_code(code: i32) -> Self {
        Self::Other(code)
    }
}

/// A request refused by the device or its driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({kind:?})")]
pub struct DeviceError {
    kind: DeviceErrorKind,
    message: String,
}

impl DeviceError {
    /// Create an error of the given kind.
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error returned for any request on a closed handle.
    pub fn closed() -> Self {
        Self::new(DeviceErrorKind::Closed, "device handle is closed")
    }

    /// Error completing a request cancelled by a purge.
    pub fn aborted() -> Self {
        Self::new(DeviceErrorKind::Aborted, "request aborted by purge")
    }

    /// Error returned when the backend cannot express a setting.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Unsupported, message)
    }

    /// The failure classification.
    pub fn kind(&self) -> DeviceErrorKind {
        self.kind
    }

    /// Human-readable driver message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.raw_os_error() {
            Some(code) => DeviceErrorKind::from_os_code(code),
            None => match err.kind() {
                ErrorKind::NotFound => DeviceErrorKind::NotFound,
                ErrorKind::PermissionDenied => DeviceErrorKind::AccessDenied,
                ErrorKind::BrokenPipe | ErrorKind::NotConnected => DeviceErrorKind::DeviceRemoved,
                ErrorKind::InvalidInput => DeviceErrorKind::InvalidParameter,
                ErrorKind::UnexpectedEof => DeviceErrorKind::HandleEof,
                ErrorKind::Unsupported => DeviceErrorKind::Unsupported,
                _ => DeviceErrorKind::Other(0),
            },
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serialport::Error> for DeviceError {
    fn from(err: serialport::Error) -> Self {
        let kind = match err.kind() {
            serialport::ErrorKind::NoDevice => DeviceErrorKind::DeviceRemoved,
            serialport::ErrorKind::InvalidInput => DeviceErrorKind::InvalidParameter,
            serialport::ErrorKind::Io(io_kind) => {
                return std::io::Error::new(io_kind, err.description).into();
            }
            serialport::ErrorKind::Unknown => DeviceErrorKind::Other(0),
        };
        Self::new(kind, err.description)
    }
}
