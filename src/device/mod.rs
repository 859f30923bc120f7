//! Device layer: the hardware surface a stream drives.
//!
//! `SerialDevice` is the seam between the stream and the hardware. The
//! stream talks to devices only through this trait, so the real backend
//! (`NativeDevice`, over the `serialport` crate) and the in-memory
//! `MockDevice` are interchangeable.

pub mod error;
pub mod mock;
pub mod native;
pub mod types;

pub use error::{DeviceError, DeviceErrorKind};
pub use mock::{MockDevice, MockOp};
pub use native::NativeDevice;
pub use types::*;

use crate::signal::WaitSignal;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Operations a serial adapter must support.
///
/// Every method takes `&self`: a device is shared between the caller thread,
/// the completion workers and the event monitor.
pub trait SerialDevice: Send + Sync + fmt::Debug {
    /// The device designation (e.g. `/dev/ttyUSB0` or `COM3`).
    fn name(&self) -> &str;

    /// File class of the opened device.
    fn device_class(&self) -> DeviceClass;

    /// Driver capabilities.
    fn properties(&self) -> Result<CommProperties, DeviceError>;

    /// Read the control registers as currently programmed.
    fn current_state(&self) -> Result<ControlBlock, DeviceError>;

    /// Program the control registers in one step.
    fn apply_state(&self, block: &ControlBlock) -> Result<(), DeviceError>;

    /// Program the timeout registers.
    fn apply_timeouts(&self, timeouts: &CommTimeouts) -> Result<(), DeviceError>;

    /// Drive a pin directly.
    fn escape(&self, function: EscapeFunction) -> Result<(), DeviceError>;

    /// Enter (`true`) or leave (`false`) the break condition.
    fn set_break(&self, on: bool) -> Result<(), DeviceError>;

    /// Current input line state.
    fn modem_status(&self) -> Result<ModemStatus, DeviceError>;

    /// Drain the latched transport errors, returning them with queue status.
    fn clear_errors(&self) -> Result<(LineErrors, CommStatus), DeviceError>;

    /// Queue occupancy without touching the error latch.
    fn queue_status(&self) -> Result<CommStatus, DeviceError>;

    /// Discard a driver buffer.
    fn purge(&self, purge: Purge) -> Result<(), DeviceError>;

    /// Block until the transmit buffer has drained to the wire.
    fn flush(&self) -> Result<(), DeviceError>;

    /// Request driver buffer sizes.
    fn setup_buffers(&self, read_size: u32, write_size: u32) -> Result<(), DeviceError>;

    /// Select the events `wait_event` reports. An empty mask disarms reporting.
    fn set_event_mask(&self, mask: EventMask) -> Result<(), DeviceError>;

    /// Block until one of the armed events occurs or `signal` is set.
    ///
    /// Returns an empty mask when woken by the signal.
    fn wait_event(&self, signal: &WaitSignal) -> Result<EventMask, DeviceError>;

    /// Read into `buf`, waiting according to `timeouts`.
    ///
    /// Returns `Ok(0)` when the timeout elapses with nothing received.
    fn read(&self, buf: &mut [u8], timeouts: &CommTimeouts) -> Result<usize, DeviceError>;

    /// Write `data`, waiting at most the write bound in `timeouts`.
    ///
    /// Returns the number of bytes accepted before the bound elapsed.
    fn write(&self, data: &[u8], timeouts: &CommTimeouts) -> Result<usize, DeviceError>;

    /// Release the device. Blocked calls return `DeviceErrorKind::Closed`.
    fn close(&self);
}

/// Exclusively owned handle to an open device.
///
/// Valid until closed or until a native call reports an invalid handle,
/// after which every call fails fast with `DeviceErrorKind::Closed`.
#[derive(Debug)]
pub(crate) struct DeviceHandle {
    device: Arc<dyn SerialDevice>,
    invalid: AtomicBool,
    closed: AtomicBool,
}

impl DeviceHandle {
    pub(crate) fn new(device: Arc<dyn SerialDevice>) -> Self {
        Self {
            device,
            invalid: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.device.name()
    }

    pub(crate) fn device(&self) -> &dyn SerialDevice {
        &*self.device
    }

    pub(crate) fn is_usable(&self) -> bool {
        !self.invalid.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Run a native call, invalidating the handle if the driver says it is stale.
    pub(crate) fn invoke<T>(
        &self,
        call: impl FnOnce(&dyn SerialDevice) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        if !self.is_usable() {
            return Err(DeviceError::closed());
        }
        call(&*self.device).map_err(|err| {
            if err.kind() == DeviceErrorKind::InvalidHandle {
                self.invalidate();
            }
            err
        })
    }

    /// Mark the handle permanently unusable.
    pub(crate) fn invalidate(&self) {
        if !self.invalid.swap(true, Ordering::AcqRel) {
            warn!(port = %self.name(), "device reported an invalid handle; handle disabled");
        }
    }

    /// Release the underlying device. Idempotent.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.device.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_disables_further_calls() {
        let mock = MockDevice::new("MOCK0");
        let handle = DeviceHandle::new(Arc::new(mock.clone()));

        mock.fail_next(MockOp::Flush, DeviceErrorKind::InvalidHandle);
        let err = handle.invoke(|d| d.flush()).unwrap_err();
        assert_eq!(err.kind(), DeviceErrorKind::InvalidHandle);
        assert!(handle.is_invalid());

        let err = handle.invoke(|d| d.flush()).unwrap_err();
        assert_eq!(err.kind(), DeviceErrorKind::Closed);
        assert_eq!(mock.flush_count(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mock = MockDevice::new("MOCK0");
        let handle = DeviceHandle::new(Arc::new(mock.clone()));

        handle.close();
        handle.close();

        assert!(mock.is_closed());
        assert!(!handle.is_usable());
    }
}
