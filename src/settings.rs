//! Device configuration store.
//!
//! `DeviceSettings` keeps the in-memory mirror of the adapter's control and
//! timeout registers. Every mutator validates first, snapshots every field
//! the change can touch, applies the combined block in one device call and
//! restores the snapshot if the device rejects it. The mirror therefore
//! always equals what the hardware last accepted.

use crate::device::{
    CommProperties, CommTimeouts, ControlBlock, DataBits, DeviceHandle, DtrControl,
    EscapeFunction, Handshake, Parity, RtsControl, StopBits, Timeout, DEFAULT_XOFF_CHAR,
    DEFAULT_XON_CHAR, EOF_CHAR, INFINITE_READ_CONSTANT,
};
use crate::error::{StreamError, StreamResult};
use crate::stream::StreamOptions;
use tracing::{debug, warn};

const RTS_WITH_HANDSHAKE: &str =
    "RtsEnable cannot be accessed while RTS handshaking is in use";

/// Fields a control-block mutator may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    block: ControlBlock,
    handshake: Handshake,
    rts_enable: bool,
    parity_replace: u8,
}

/// Validate a baud rate against the driver's maximum (zero means unbounded).
pub fn validate_baud_rate(baud_rate: u32, max_baud: u32) -> StreamResult<()> {
    if baud_rate == 0 || (max_baud > 0 && baud_rate > max_baud) {
        let message = if max_baud == 0 {
            "must be a positive number".to_string()
        } else {
            format!("must be between 0 and {max_baud}")
        };
        return Err(StreamError::out_of_range("baud_rate", message));
    }
    Ok(())
}

/// Validate a read timeout.
pub fn validate_read_timeout(timeout: Timeout) -> StreamResult<()> {
    match timeout {
        Timeout::Millis(ms) if ms >= INFINITE_READ_CONSTANT => Err(StreamError::out_of_range(
            "read_timeout",
            format!("must be below {INFINITE_READ_CONSTANT} ms or infinite"),
        )),
        _ => Ok(()),
    }
}

/// Validate a write timeout. Zero is illegal: every write would fail.
pub fn validate_write_timeout(timeout: Timeout) -> StreamResult<()> {
    match timeout {
        Timeout::Millis(0) => Err(StreamError::out_of_range(
            "write_timeout",
            "must be positive or infinite",
        )),
        _ => Ok(()),
    }
}

/// Error-character fields implied by a parity mode and replacement byte.
fn error_char_for(parity: Parity, parity_replace: u8) -> (bool, u8) {
    if parity == Parity::None {
        (false, 0)
    } else {
        (parity_replace != 0, parity_replace)
    }
}

/// The stream's configuration mirror.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    block: ControlBlock,
    timeouts: CommTimeouts,
    handshake: Handshake,
    rts_enable: bool,
    parity_replace: u8,
    in_break: bool,
    properties: CommProperties,
}

impl DeviceSettings {
    /// Program a freshly opened device from `options`.
    pub(crate) fn initialize(
        handle: &DeviceHandle,
        options: &StreamOptions,
        properties: CommProperties,
    ) -> StreamResult<Self> {
        validate_baud_rate(options.baud_rate, properties.max_baud)?;
        validate_read_timeout(options.read_timeout)?;
        validate_write_timeout(options.write_timeout)?;

        let current = handle.invoke(|d| d.current_state())?;
        let handshake = options.handshake;
        let (error_char_enabled, error_char) =
            error_char_for(options.parity, options.parity_replace);
        let limit = u16::try_from(properties.current_rx_queue / 4).unwrap_or(u16::MAX);

        let rts_control = if handshake.uses_rts() {
            RtsControl::Handshake
        } else if current.rts_control == RtsControl::Handshake {
            RtsControl::Disable
        } else {
            current.rts_control
        };

        let block = ControlBlock {
            baud_rate: options.baud_rate,
            data_bits: options.data_bits,
            parity: options.parity,
            stop_bits: options.stop_bits,
            binary: true,
            parity_check: options.parity != Parity::None,
            outx_cts_flow: handshake.uses_rts(),
            outx_dsr_flow: false,
            dtr_control: DtrControl::Disable,
            dsr_sensitivity: false,
            outx: handshake.uses_xon_xoff(),
            inx: handshake.uses_xon_xoff(),
            error_char_enabled,
            discard_null: options.discard_null,
            rts_control,
            abort_on_error: false,
            xon_limit: limit,
            xoff_limit: limit,
            xon_char: DEFAULT_XON_CHAR,
            xoff_char: DEFAULT_XOFF_CHAR,
            error_char,
            eof_char: EOF_CHAR,
            event_char: EOF_CHAR,
        };
        handle.invoke(|d| d.apply_state(&block))?;

        let mut settings = Self {
            block,
            timeouts: CommTimeouts::new(options.read_timeout, options.write_timeout),
            handshake,
            rts_enable: rts_control == RtsControl::Enable,
            parity_replace: options.parity_replace,
            in_break: false,
            properties,
        };

        settings.set_dtr_enable(handle, options.dtr_enable)?;
        if !handshake.uses_rts() {
            settings.set_rts_enable(handle, options.rts_enable)?;
        }

        let timeouts = settings.timeouts;
        handle.invoke(|d| d.apply_timeouts(&timeouts))?;

        debug!(
            port = %handle.name(),
            baud = block.baud_rate,
            ?handshake,
            "device configured"
        );
        Ok(settings)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            block: self.block,
            handshake: self.handshake,
            rts_enable: self.rts_enable,
            parity_replace: self.parity_replace,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.block = snapshot.block;
        self.handshake = snapshot.handshake;
        self.rts_enable = snapshot.rts_enable;
        self.parity_replace = snapshot.parity_replace;
    }

    /// Apply `change` to the mirror and push the block to the device,
    /// rolling back every snapshotted field if the device rejects it.
    fn commit(
        &mut self,
        handle: &DeviceHandle,
        property: &'static str,
        change: impl FnOnce(&mut Self),
    ) -> StreamResult<()> {
        let before = self.snapshot();
        change(self);
        if self.snapshot() == before {
            return Ok(());
        }

        let block = self.block;
        if let Err(err) = handle.invoke(|d| d.apply_state(&block)) {
            self.restore(before);
            warn!(port = %handle.name(), property, error = %err, "device rejected setting; rolled back");
            return Err(err.into());
        }
        Ok(())
    }

    fn commit_timeouts(
        &mut self,
        handle: &DeviceHandle,
        property: &'static str,
        change: impl FnOnce(&mut CommTimeouts),
    ) -> StreamResult<()> {
        let mut timeouts = self.timeouts;
        change(&mut timeouts);

        match handle.invoke(|d| d.apply_timeouts(&timeouts)) {
            Ok(()) => {
                self.timeouts = timeouts;
                Ok(())
            }
            Err(err) => {
                warn!(port = %handle.name(), property, error = %err, "device rejected timeouts; kept previous values");
                Err(err.into())
            }
        }
    }

    // ----- line format -----

    pub fn baud_rate(&self) -> u32 {
        self.block.baud_rate
    }

    pub(crate) fn set_baud_rate(&mut self, handle: &DeviceHandle, baud_rate: u32) -> StreamResult<()> {
        validate_baud_rate(baud_rate, self.properties.max_baud)?;
        self.commit(handle, "baud_rate", |s| s.block.baud_rate = baud_rate)
    }

    pub fn data_bits(&self) -> DataBits {
        self.block.data_bits
    }

    pub(crate) fn set_data_bits(&mut self, handle: &DeviceHandle, data_bits: DataBits) -> StreamResult<()> {
        self.commit(handle, "data_bits", |s| s.block.data_bits = data_bits)
    }

    pub fn parity(&self) -> Parity {
        self.block.parity
    }

    /// Enabling parity turns on error-character substitution with the
    /// current replacement byte; disabling it clears both.
    pub(crate) fn set_parity(&mut self, handle: &DeviceHandle, parity: Parity) -> StreamResult<()> {
        self.commit(handle, "parity", |s| {
            s.block.parity = parity;
            s.block.parity_check = parity != Parity::None;
            let (enabled, error_char) = error_char_for(parity, s.parity_replace);
            s.block.error_char_enabled = enabled;
            s.block.error_char = error_char;
        })
    }

    pub fn stop_bits(&self) -> StopBits {
        self.block.stop_bits
    }

    pub(crate) fn set_stop_bits(&mut self, handle: &DeviceHandle, stop_bits: StopBits) -> StreamResult<()> {
        self.commit(handle, "stop_bits", |s| s.block.stop_bits = stop_bits)
    }

    /// Byte substituted for characters received with a parity error.
    pub fn parity_replace(&self) -> u8 {
        self.parity_replace
    }

    pub(crate) fn set_parity_replace(&mut self, handle: &DeviceHandle, byte: u8) -> StreamResult<()> {
        self.commit(handle, "parity_replace", |s| {
            s.parity_replace = byte;
            let (enabled, error_char) = error_char_for(s.block.parity, byte);
            s.block.error_char_enabled = enabled;
            s.block.error_char = error_char;
        })
    }

    pub fn discard_null(&self) -> bool {
        self.block.discard_null
    }

    pub(crate) fn set_discard_null(&mut self, handle: &DeviceHandle, discard: bool) -> StreamResult<()> {
        self.commit(handle, "discard_null", |s| s.block.discard_null = discard)
    }

    // ----- flow control and pins -----

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    /// Handshake drives the XON/XOFF flags, CTS flow and RTS control together.
    pub(crate) fn set_handshake(&mut self, handle: &DeviceHandle, handshake: Handshake) -> StreamResult<()> {
        self.commit(handle, "handshake", |s| {
            s.handshake = handshake;
            s.block.inx = handshake.uses_xon_xoff();
            s.block.outx = handshake.uses_xon_xoff();
            s.block.outx_cts_flow = handshake.uses_rts();
            s.block.rts_control = if handshake.uses_rts() {
                RtsControl::Handshake
            } else if s.rts_enable {
                RtsControl::Enable
            } else {
                RtsControl::Disable
            };
        })
    }

    pub fn dtr_enable(&self) -> bool {
        self.block.dtr_control == DtrControl::Enable
    }

    /// Update the DTR control mode, then drive the pin.
    pub(crate) fn set_dtr_enable(&mut self, handle: &DeviceHandle, enable: bool) -> StreamResult<()> {
        self.commit(handle, "dtr_enable", |s| {
            s.block.dtr_control = if enable {
                DtrControl::Enable
            } else {
                DtrControl::Disable
            };
        })?;
        let pin = if enable {
            EscapeFunction::SetDtr
        } else {
            EscapeFunction::ClearDtr
        };
        handle.invoke(|d| d.escape(pin))?;
        Ok(())
    }

    /// Fails while RTS is owned by the handshake.
    pub fn rts_enable(&self) -> StreamResult<bool> {
        if self.block.rts_control == RtsControl::Handshake {
            return Err(StreamError::invalid_operation(RTS_WITH_HANDSHAKE));
        }
        Ok(self.block.rts_control == RtsControl::Enable)
    }

    /// Update the RTS control mode, then drive the pin.
    pub(crate) fn set_rts_enable(&mut self, handle: &DeviceHandle, enable: bool) -> StreamResult<()> {
        if self.handshake.uses_rts() {
            return Err(StreamError::invalid_operation(RTS_WITH_HANDSHAKE));
        }
        if enable == self.rts_enable {
            return Ok(());
        }

        self.commit(handle, "rts_enable", |s| {
            s.rts_enable = enable;
            s.block.rts_control = if enable {
                RtsControl::Enable
            } else {
                RtsControl::Disable
            };
        })?;
        let pin = if enable {
            EscapeFunction::SetRts
        } else {
            EscapeFunction::ClearRts
        };
        handle.invoke(|d| d.escape(pin))?;
        Ok(())
    }

    pub fn break_state(&self) -> bool {
        self.in_break
    }

    pub(crate) fn set_break_state(&mut self, handle: &DeviceHandle, on: bool) -> StreamResult<()> {
        handle.invoke(|d| d.set_break(on))?;
        self.in_break = on;
        Ok(())
    }

    // ----- timeouts -----

    pub fn read_timeout(&self) -> Timeout {
        self.timeouts.read_timeout()
    }

    pub(crate) fn set_read_timeout(&mut self, handle: &DeviceHandle, timeout: Timeout) -> StreamResult<()> {
        validate_read_timeout(timeout)?;
        self.commit_timeouts(handle, "read_timeout", |t| t.set_read(timeout))
    }

    pub fn write_timeout(&self) -> Timeout {
        self.timeouts.write_timeout()
    }

    pub(crate) fn set_write_timeout(&mut self, handle: &DeviceHandle, timeout: Timeout) -> StreamResult<()> {
        validate_write_timeout(timeout)?;
        self.commit_timeouts(handle, "write_timeout", |t| t.set_write(timeout))
    }

    // ----- raw views -----

    /// The control block as last accepted by the device.
    pub fn block(&self) -> &ControlBlock {
        &self.block
    }

    /// The timeout registers as last accepted by the device.
    pub fn timeouts(&self) -> CommTimeouts {
        self.timeouts
    }

    pub fn properties(&self) -> CommProperties {
        self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceErrorKind, MockDevice, MockOp, MAXDWORD};
    use std::sync::Arc;

    fn setup(options: StreamOptions) -> (MockDevice, DeviceHandle, DeviceSettings) {
        let mock = MockDevice::new("MOCK0");
        let handle = DeviceHandle::new(Arc::new(mock.clone()));
        let props = CommProperties {
            max_baud: 115_200,
            current_rx_queue: 4096,
            current_tx_queue: 2048,
        };
        let settings = DeviceSettings::initialize(&handle, &options, props).unwrap();
        (mock, handle, settings)
    }

    #[test]
    fn test_initial_block() {
        let (mock, _handle, settings) = setup(StreamOptions::default());

        let block = mock.applied_state();
        assert!(block.binary);
        assert!(!block.abort_on_error);
        assert!(!block.outx_dsr_flow);
        assert_eq!(block.xon_char, 0x11);
        assert_eq!(block.xoff_char, 0x13);
        assert_eq!(block.xon_limit, 1024);
        assert_eq!(block.xoff_limit, 1024);
        assert_eq!(block.eof_char, 0x1A);
        assert_eq!(block.event_char, 0x1A);
        assert_eq!(&block, settings.block());
    }

    #[test]
    fn test_initial_pins_follow_options() {
        let options = StreamOptions {
            dtr_enable: true,
            rts_enable: true,
            ..StreamOptions::default()
        };
        let (mock, _handle, settings) = setup(options);

        assert!(settings.dtr_enable());
        assert!(settings.rts_enable().unwrap());
        assert!(mock.dtr());
        assert!(mock.rts());
    }

    #[test]
    fn test_baud_above_max_rejected() {
        let (mock, handle, mut settings) = setup(StreamOptions::default());
        let applied = mock.apply_count();

        let err = settings.set_baud_rate(&handle, 230_400).unwrap_err();
        assert!(matches!(err, StreamError::ArgumentOutOfRange { param: "baud_rate", .. }));
        assert!(settings.set_baud_rate(&handle, 0).is_err());
        assert_eq!(mock.apply_count(), applied);
    }

    #[test]
    fn test_rejected_handshake_rolls_back_every_field() {
        let (mock, handle, mut settings) = setup(StreamOptions {
            rts_enable: true,
            ..StreamOptions::default()
        });
        let before = settings.clone();

        mock.fail_next(MockOp::ApplyState, DeviceErrorKind::InvalidParameter);
        let err = settings
            .set_handshake(&handle, Handshake::RequestToSendXOnXOff)
            .unwrap_err();

        assert_eq!(err.device_kind(), Some(DeviceErrorKind::InvalidParameter));
        assert_eq!(settings.block(), before.block());
        assert_eq!(settings.handshake(), Handshake::None);
        assert!(settings.rts_enable().unwrap());
    }

    #[test]
    fn test_parity_couples_error_char() {
        let (_mock, handle, mut settings) = setup(StreamOptions::default());

        settings.set_parity(&handle, Parity::Even).unwrap();
        assert!(settings.block().parity_check);
        assert!(settings.block().error_char_enabled);
        assert_eq!(settings.block().error_char, b'?');

        settings.set_parity(&handle, Parity::None).unwrap();
        assert!(!settings.block().error_char_enabled);
        assert_eq!(settings.block().error_char, 0);
    }

    #[test]
    fn test_parity_replace_zero_disables_substitution() {
        let (_mock, handle, mut settings) = setup(StreamOptions {
            parity: Parity::Odd,
            ..StreamOptions::default()
        });

        settings.set_parity_replace(&handle, 0).unwrap();
        assert!(!settings.block().error_char_enabled);
        assert_eq!(settings.parity_replace(), 0);
    }

    #[test]
    fn test_rts_locked_by_handshake() {
        let (_mock, handle, mut settings) = setup(StreamOptions::default());

        settings.set_handshake(&handle, Handshake::RequestToSend).unwrap();
        assert!(matches!(
            settings.set_rts_enable(&handle, true),
            Err(StreamError::InvalidOperation(_))
        ));
        assert!(settings.rts_enable().is_err());

        settings.set_handshake(&handle, Handshake::None).unwrap();
        settings.set_rts_enable(&handle, true).unwrap();
        assert!(settings.rts_enable().unwrap());
    }

    #[test]
    fn test_dtr_drives_pin() {
        let (mock, handle, mut settings) = setup(StreamOptions::default());

        settings.set_dtr_enable(&handle, true).unwrap();
        assert!(mock.dtr());
        assert_eq!(mock.escapes().last(), Some(&EscapeFunction::SetDtr));
    }

    #[test]
    fn test_timeout_registers() {
        let (mock, handle, mut settings) = setup(StreamOptions::default());

        settings.set_read_timeout(&handle, Timeout::Millis(500)).unwrap();
        let registers = mock.timeouts();
        assert_eq!(registers.read_interval, MAXDWORD);
        assert_eq!(registers.read_total_multiplier, MAXDWORD);
        assert_eq!(registers.read_total_constant, 500);
        assert_eq!(settings.read_timeout(), Timeout::Millis(500));

        settings.set_read_timeout(&handle, Timeout::Infinite).unwrap();
        assert_eq!(mock.timeouts().read_total_constant, INFINITE_READ_CONSTANT);
        assert_eq!(settings.read_timeout(), Timeout::Infinite);
    }

    #[test]
    fn test_zero_write_timeout_rejected() {
        let (_mock, handle, mut settings) = setup(StreamOptions::default());

        let err = settings
            .set_write_timeout(&handle, Timeout::IMMEDIATE)
            .unwrap_err();
        assert!(matches!(err, StreamError::ArgumentOutOfRange { param: "write_timeout", .. }));
        assert_eq!(settings.write_timeout(), Timeout::Infinite);
    }

    #[test]
    fn test_rejected_timeouts_keep_previous_values() {
        let (mock, handle, mut settings) = setup(StreamOptions::default());

        mock.fail_next(MockOp::ApplyTimeouts, DeviceErrorKind::InvalidParameter);
        assert!(settings.set_write_timeout(&handle, Timeout::Millis(100)).is_err());
        assert_eq!(settings.write_timeout(), Timeout::Infinite);
    }

    #[test]
    fn test_break_state_tracked() {
        let (mock, handle, mut settings) = setup(StreamOptions::default());

        settings.set_break_state(&handle, true).unwrap();
        assert!(settings.break_state());
        assert!(mock.in_break());

        mock.fail_next(MockOp::SetBreak, DeviceErrorKind::InvalidParameter);
        assert!(settings.set_break_state(&handle, false).is_err());
        assert!(settings.break_state());
    }
}
