//! Hardware backend over the `serialport` crate.
//!
//! The portable `serialport` API has no overlapped I/O and no hardware event
//! register, so this backend emulates both: reads and writes run in bounded
//! slices that re-check for close and abort, and `wait_event` samples the
//! input lines and receive queue at the configured poll interval.

use super::error::{DeviceError, DeviceErrorKind};
use super::types::*;
use super::SerialDevice;
use crate::signal::WaitSignal;
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Receive queue size reported to the stream.
const RX_QUEUE_SIZE: u32 = 4096;
/// Transmit queue size reported to the stream.
const TX_QUEUE_SIZE: u32 = 2048;

type Port = Mutex<Option<Box<dyn SerialPort>>>;

#[derive(Debug, Default, Clone, Copy)]
struct LineSample {
    modem: ModemStatus,
    in_queue: u32,
}

/// A real serial port.
///
/// The port is cloned into three handles so that a blocked read, a blocked
/// write and control requests (pins, status, event sampling) never wait on
/// each other.
///
/// Events are synthesized from line samples, which limits what is seen:
///
/// - `RXCHAR` fires when the receive queue is non-empty and its length
///   differs from the previous sample. A reader that drains the queue
///   between two samples, followed by the same number of new bytes, goes
///   unreported.
/// - `RXFLAG` (the end-of-file character), `BREAK` and `ERR` are never
///   raised, and `clear_errors` always reports no line errors, because the
///   portable API exposes none of them.
/// - `max_baud` is reported as 0 (unknown).
pub struct NativeDevice {
    name: String,
    class: DeviceClass,
    poll_interval: Duration,
    reader: Port,
    writer: Port,
    control: Port,
    block: Mutex<ControlBlock>,
    event_mask: AtomicU32,
    last_sample: Mutex<Option<LineSample>>,
    /// Bumped by aborting purges; in-flight transfers compare and bail out.
    read_aborts: AtomicU64,
    write_aborts: AtomicU64,
    closed: AtomicBool,
}

impl NativeDevice {
    /// Open `name` for exclusive use.
    ///
    /// `poll_interval` bounds how long a blocked call takes to notice close,
    /// and how often line state is sampled for events.
    ///
    /// # Example
    /// ```no_run
    /// use serial_stream::device::NativeDevice;
    /// use std::time::Duration;
    ///
    /// let device = NativeDevice::open("/dev/ttyUSB0", Duration::from_millis(10))?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(name: &str, poll_interval: Duration) -> Result<Self, DeviceError> {
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let control = serialport::new(name, 9600)
            .timeout(poll_interval)
            .open()
            .map_err(|err| match err.kind() {
                serialport::ErrorKind::NoDevice => DeviceError::new(
                    DeviceErrorKind::NotFound,
                    format!("{name}: {}", err.description),
                ),
                _ => DeviceError::from(err),
            })?;
        let reader = control.try_clone()?;
        let writer = control.try_clone()?;

        let block = ControlBlock {
            baud_rate: control.baud_rate()?,
            ..ControlBlock::default()
        };

        debug!(port = %name, "native device opened");
        Ok(Self {
            name: name.to_string(),
            class: probe_class(name),
            poll_interval,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            control: Mutex::new(Some(control)),
            block: Mutex::new(block),
            event_mask: AtomicU32::new(0),
            last_sample: Mutex::new(None),
            read_aborts: AtomicU64::new(0),
            write_aborts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn with_port<T>(
        &self,
        port: &Port,
        f: impl FnOnce(&mut Box<dyn SerialPort>) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::closed());
        }
        let mut guard = port.lock();
        match guard.as_mut() {
            Some(port) => f(port),
            None => Err(DeviceError::closed()),
        }
    }

    fn check_open(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DeviceError::closed())
        } else {
            Ok(())
        }
    }

    fn sample(&self) -> Result<LineSample, DeviceError> {
        self.with_port(&self.control, |port| {
            Ok(LineSample {
                modem: read_modem(port)?,
                in_queue: port.bytes_to_read()?,
            })
        })
    }
}

#[cfg(unix)]
fn probe_class(name: &str) -> DeviceClass {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(name) {
        Ok(meta) if meta.file_type().is_char_device() => DeviceClass::Character,
        Ok(_) => DeviceClass::Other,
        Err(_) => DeviceClass::Unknown,
    }
}

#[cfg(not(unix))]
fn probe_class(_name: &str) -> DeviceClass {
    // The driver refuses to open anything but a communications device.
    DeviceClass::Character
}

fn read_modem(port: &mut Box<dyn SerialPort>) -> Result<ModemStatus, DeviceError> {
    Ok(ModemStatus {
        cts: port.read_clear_to_send()?,
        dsr: port.read_data_set_ready()?,
        ring: port.read_ring_indicator()?,
        rlsd: port.read_carrier_detect()?,
    })
}

/// The setters `apply_state` drives, split out so a rejected step can be undone.
trait LineControl {
    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()>;
    fn set_data_bits(&mut self, data_bits: serialport::DataBits) -> serialport::Result<()>;
    fn set_parity(&mut self, parity: serialport::Parity) -> serialport::Result<()>;
    fn set_stop_bits(&mut self, stop_bits: serialport::StopBits) -> serialport::Result<()>;
    fn set_flow_control(&mut self, flow: serialport::FlowControl) -> serialport::Result<()>;
    fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()>;
    fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()>;
}

impl LineControl for Box<dyn SerialPort> {
    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()> {
        SerialPort::set_baud_rate(&mut **self, baud_rate)
    }

    fn set_data_bits(&mut self, data_bits: serialport::DataBits) -> serialport::Result<()> {
        SerialPort::set_data_bits(&mut **self, data_bits)
    }

    fn set_parity(&mut self, parity: serialport::Parity) -> serialport::Result<()> {
        SerialPort::set_parity(&mut **self, parity)
    }

    fn set_stop_bits(&mut self, stop_bits: serialport::StopBits) -> serialport::Result<()> {
        SerialPort::set_stop_bits(&mut **self, stop_bits)
    }

    fn set_flow_control(&mut self, flow: serialport::FlowControl) -> serialport::Result<()> {
        SerialPort::set_flow_control(&mut **self, flow)
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()> {
        SerialPort::write_data_terminal_ready(&mut **self, level)
    }

    fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()> {
        SerialPort::write_request_to_send(&mut **self, level)
    }
}

/// A control block translated into `serialport` terms.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LineSettings {
    baud_rate: u32,
    data_bits: serialport::DataBits,
    parity: serialport::Parity,
    stop_bits: serialport::StopBits,
    flow: serialport::FlowControl,
    dtr: Option<bool>,
    rts: Option<bool>,
}

impl LineSettings {
    fn from_block(block: &ControlBlock) -> Result<Self, DeviceError> {
        Ok(Self {
            baud_rate: block.baud_rate,
            data_bits: to_data_bits(block.data_bits),
            parity: to_parity(block.parity)?,
            stop_bits: to_stop_bits(block.stop_bits)?,
            flow: to_flow_control(block)?,
            dtr: match block.dtr_control {
                DtrControl::Enable => Some(true),
                DtrControl::Disable => Some(false),
                DtrControl::Handshake => None,
            },
            rts: match block.rts_control {
                RtsControl::Enable => Some(true),
                RtsControl::Disable => Some(false),
                RtsControl::Handshake | RtsControl::Toggle => None,
            },
        })
    }
}

fn program_line<P: LineControl + ?Sized>(
    port: &mut P,
    line: &LineSettings,
) -> Result<(), DeviceError> {
    port.set_baud_rate(line.baud_rate)?;
    port.set_data_bits(line.data_bits)?;
    port.set_parity(line.parity)?;
    port.set_stop_bits(line.stop_bits)?;
    port.set_flow_control(line.flow)?;
    if let Some(level) = line.dtr {
        port.write_data_terminal_ready(level)?;
    }
    if let Some(level) = line.rts {
        port.write_request_to_send(level)?;
    }
    Ok(())
}

/// Program `line`; if any step is refused, put `previous` back before
/// returning the original error, so the port is never left half-applied.
fn apply_line<P: LineControl + ?Sized>(
    port: &mut P,
    line: &LineSettings,
    previous: Option<&LineSettings>,
) -> Result<(), DeviceError> {
    let Err(err) = program_line(port, line) else {
        return Ok(());
    };
    if let Some(previous) = previous {
        if let Err(restore) = program_line(port, previous) {
            warn!(error = %restore, "could not restore line settings after a rejected change");
        }
    }
    Err(err)
}

fn to_data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn to_parity(parity: Parity) -> Result<serialport::Parity, DeviceError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark | Parity::Space => Err(DeviceError::unsupported(format!(
            "{parity:?} parity is not supported by this backend"
        ))),
    }
}

fn to_stop_bits(stop_bits: StopBits) -> Result<serialport::StopBits, DeviceError> {
    match stop_bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(DeviceError::unsupported(
            "1.5 stop bits are not supported by this backend",
        )),
    }
}

fn to_flow_control(block: &ControlBlock) -> Result<serialport::FlowControl, DeviceError> {
    let software = block.outx || block.inx;
    match (block.outx_cts_flow, software) {
        (false, false) => Ok(serialport::FlowControl::None),
        (false, true) => Ok(serialport::FlowControl::Software),
        (true, false) => Ok(serialport::FlowControl::Hardware),
        (true, true) => Err(DeviceError::unsupported(
            "combined RTS and XON/XOFF flow control is not supported by this backend",
        )),
    }
}

fn line_events(before: LineSample, after: LineSample) -> EventMask {
    let mut events = EventMask::empty();
    if after.in_queue > 0 && after.in_queue != before.in_queue {
        events |= EventMask::RXCHAR;
    }
    if after.modem.cts != before.modem.cts {
        events |= EventMask::CTS;
    }
    if after.modem.dsr != before.modem.dsr {
        events |= EventMask::DSR;
    }
    if after.modem.rlsd != before.modem.rlsd {
        events |= EventMask::RLSD;
    }
    if after.modem.ring && !before.modem.ring {
        events |= EventMask::RING;
    }
    events
}

/// Compact `buf` in place without its zero bytes, returning the new length.
fn drop_nulls(buf: &mut [u8]) -> usize {
    let mut kept = 0;
    for i in 0..buf.len() {
        if buf[i] != 0 {
            buf[kept] = buf[i];
            kept += 1;
        }
    }
    kept
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

impl SerialDevice for NativeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_class(&self) -> DeviceClass {
        self.class
    }

    fn properties(&self) -> Result<CommProperties, DeviceError> {
        self.check_open()?;
        Ok(CommProperties {
            max_baud: 0,
            current_rx_queue: RX_QUEUE_SIZE,
            current_tx_queue: TX_QUEUE_SIZE,
        })
    }

    fn current_state(&self) -> Result<ControlBlock, DeviceError> {
        self.check_open()?;
        Ok(*self.block.lock())
    }

    fn apply_state(&self, block: &ControlBlock) -> Result<(), DeviceError> {
        let line = LineSettings::from_block(block)?;
        let previous = LineSettings::from_block(&self.block.lock()).ok();

        self.with_port(&self.control, |port| {
            apply_line(port, &line, previous.as_ref())
        })?;

        *self.block.lock() = *block;
        Ok(())
    }

    fn apply_timeouts(&self, _timeouts: &CommTimeouts) -> Result<(), DeviceError> {
        // Timeouts travel with each read and write request.
        self.check_open()
    }

    fn escape(&self, function: EscapeFunction) -> Result<(), DeviceError> {
        self.with_port(&self.control, |port| {
            match function {
                EscapeFunction::SetDtr => port.write_data_terminal_ready(true)?,
                EscapeFunction::ClearDtr => port.write_data_terminal_ready(false)?,
                EscapeFunction::SetRts => port.write_request_to_send(true)?,
                EscapeFunction::ClearRts => port.write_request_to_send(false)?,
            }
            Ok(())
        })
    }

    fn set_break(&self, on: bool) -> Result<(), DeviceError> {
        self.with_port(&self.control, |port| {
            if on {
                port.set_break()?;
            } else {
                port.clear_break()?;
            }
            Ok(())
        })
    }

    fn modem_status(&self) -> Result<ModemStatus, DeviceError> {
        self.with_port(&self.control, read_modem)
    }

    fn clear_errors(&self) -> Result<(LineErrors, CommStatus), DeviceError> {
        // Line errors are not exposed portably; report only queue status.
        Ok((LineErrors::default(), self.queue_status()?))
    }

    fn queue_status(&self) -> Result<CommStatus, DeviceError> {
        self.with_port(&self.control, |port| {
            Ok(CommStatus {
                in_queue: port.bytes_to_read()?,
                out_queue: port.bytes_to_write()?,
            })
        })
    }

    fn purge(&self, purge: Purge) -> Result<(), DeviceError> {
        let (buffer, aborts) = if purge.is_input() {
            (serialport::ClearBuffer::Input, &self.read_aborts)
        } else {
            (serialport::ClearBuffer::Output, &self.write_aborts)
        };
        if purge.aborts() {
            aborts.fetch_add(1, Ordering::AcqRel);
        }
        self.with_port(&self.control, |port| Ok(port.clear(buffer)?))
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.with_port(&self.writer, |port| Ok(port.flush()?))
    }

    fn setup_buffers(&self, _read_size: u32, _write_size: u32) -> Result<(), DeviceError> {
        // Buffer sizes are advisory and the portable API has no knob for them.
        self.check_open()
    }

    fn set_event_mask(&self, mask: EventMask) -> Result<(), DeviceError> {
        self.check_open()?;
        self.event_mask.store(mask.bits(), Ordering::Release);
        if mask.is_empty() {
            *self.last_sample.lock() = None;
        }
        Ok(())
    }

    fn wait_event(&self, signal: &WaitSignal) -> Result<EventMask, DeviceError> {
        loop {
            self.check_open()?;
            if signal.wait_timeout(self.poll_interval) {
                return Ok(EventMask::empty());
            }

            let armed = self.event_mask.load(Ordering::Acquire);
            if armed == 0 {
                continue;
            }

            let sample = self.sample()?;
            let previous = self.last_sample.lock().replace(sample);
            let Some(previous) = previous else {
                continue;
            };

            let events = line_events(previous, sample) & EventMask::from_bits(armed);
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }

    fn read(&self, buf: &mut [u8], timeouts: &CommTimeouts) -> Result<usize, DeviceError> {
        let discard_null = self.block.lock().discard_null;
        let deadline = match timeouts.read_wait() {
            ReadWait::Immediate => None,
            ReadWait::Within(bound) => Some(Instant::now() + bound),
        };
        let generation = self.read_aborts.load(Ordering::Acquire);

        self.with_port(&self.reader, |port| loop {
            self.check_open()?;
            if self.read_aborts.load(Ordering::Acquire) != generation {
                return Err(DeviceError::aborted());
            }

            let slice = match deadline {
                None => {
                    if port.bytes_to_read()? == 0 {
                        return Ok(0);
                    }
                    self.poll_interval
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(0);
                    }
                    remaining.min(self.poll_interval)
                }
            };
            port.set_timeout(slice)?;

            match port.read(buf) {
                Ok(0) => {}
                Ok(n) if discard_null => {
                    let kept = drop_nulls(&mut buf[..n]);
                    if kept > 0 {
                        return Ok(kept);
                    }
                }
                Ok(n) => return Ok(n),
                Err(err) if is_timeout(&err) => {}
                Err(err) => return Err(err.into()),
            }

            if deadline.is_none() {
                return Ok(0);
            }
        })
    }

    fn write(&self, data: &[u8], timeouts: &CommTimeouts) -> Result<usize, DeviceError> {
        let deadline = timeouts.write_bound().map(|bound| Instant::now() + bound);
        let generation = self.write_aborts.load(Ordering::Acquire);

        self.with_port(&self.writer, |port| {
            let mut written = 0;
            while written < data.len() {
                self.check_open()?;
                if self.write_aborts.load(Ordering::Acquire) != generation {
                    return Err(DeviceError::aborted());
                }
                let slice = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        remaining.min(self.poll_interval)
                    }
                    None => self.poll_interval,
                };
                port.set_timeout(slice)?;

                match port.write(&data[written..]) {
                    Ok(n) => written += n,
                    Err(err) if is_timeout(&err) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(written)
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Blocked calls notice the flag within one poll interval.
        self.control.lock().take();
        self.writer.lock().take();
        self.reader.lock().take();
        debug!(port = %self.name, "native device closed");
    }
}

impl std::fmt::Debug for NativeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDevice")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
