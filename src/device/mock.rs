//! In-memory serial device for testing.
//!
//! `MockDevice` simulates an adapter without hardware: a receive queue, a
//! transmit log, input lines, latched line errors and an event register.
//! Any native call can be made to fail, once or persistently, to exercise
//! rollback and teardown paths.

use super::error::{DeviceError, DeviceErrorKind};
use super::types::*;
use super::SerialDevice;
use crate::signal::WaitSignal;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Native calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Properties,
    CurrentState,
    ApplyState,
    ApplyTimeouts,
    Escape,
    SetBreak,
    ModemStatus,
    ClearErrors,
    QueueStatus,
    Purge,
    Flush,
    SetupBuffers,
    SetEventMask,
    WaitEvent,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    kind: DeviceErrorKind,
    persistent: bool,
}

/// How often a blocked `wait_event` re-checks the caller's signal.
const SIGNAL_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct MockState {
    class: DeviceClass,
    properties: CommProperties,
    block: ControlBlock,
    apply_count: usize,
    timeouts: CommTimeouts,
    rx: VecDeque<u8>,
    tx_log: Vec<Vec<u8>>,
    loopback: bool,
    hold_writes: bool,
    out_queue: u32,
    modem: ModemStatus,
    line_errors: LineErrors,
    event_mask: EventMask,
    pending_events: EventMask,
    in_break: bool,
    dtr: bool,
    rts: bool,
    escapes: Vec<EscapeFunction>,
    purges: Vec<Purge>,
    /// Bumped by each aborting purge; a blocked request that sees its side
    /// change fails with `Aborted`.
    read_aborts: u64,
    write_aborts: u64,
    flushes: usize,
    buffer_sizes: Option<(u32, u32)>,
    failures: HashMap<MockOp, Failure>,
    closed: bool,
    removed: bool,
}

impl MockState {
    fn check(&mut self, op: MockOp) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::closed());
        }
        if self.removed {
            return Err(DeviceError::new(
                DeviceErrorKind::DeviceRemoved,
                "device was removed",
            ));
        }
        if let Some(failure) = self.failures.get(&op).copied() {
            if !failure.persistent {
                self.failures.remove(&op);
            }
            return Err(DeviceError::new(
                failure.kind,
                format!("injected {op:?} failure"),
            ));
        }
        Ok(())
    }

    fn raise(&mut self, events: EventMask) {
        self.pending_events |= events;
    }

    fn take_rx(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(0) if self.block.discard_null => continue,
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn receive(&mut self, data: &[u8]) {
        self.rx.extend(data);
        if !data.is_empty() {
            self.raise(EventMask::RXCHAR);
        }
        if data.contains(&self.block.event_char) {
            self.raise(EventMask::RXFLAG);
        }
    }
}

#[derive(Debug)]
struct MockShared {
    state: Mutex<MockState>,
    changed: Condvar,
}

/// Mock serial device.
///
/// Clones share the same simulated hardware, so a test keeps one clone to
/// drive and inspect the device while the stream owns another.
///
/// # Example
/// ```
/// use serial_stream::device::{CommTimeouts, MockDevice, SerialDevice, Timeout};
///
/// let device = MockDevice::new("MOCK0");
/// device.enqueue_rx(b"Hello");
///
/// let mut buf = [0u8; 8];
/// let timeouts = CommTimeouts::default().with_read(Timeout::IMMEDIATE);
/// let n = device.read(&mut buf, &timeouts).unwrap();
/// assert_eq!(&buf[..n], b"Hello");
/// ```
#[derive(Clone)]
pub struct MockDevice {
    name: String,
    shared: Arc<MockShared>,
}

impl MockDevice {
    /// Create a mock character device with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let state = MockState {
            class: DeviceClass::Character,
            properties: CommProperties {
                max_baud: 0,
                current_rx_queue: 4096,
                current_tx_queue: 2048,
            },
            block: ControlBlock {
                rts_control: RtsControl::Enable,
                dtr_control: DtrControl::Enable,
                ..ControlBlock::default()
            },
            apply_count: 0,
            timeouts: CommTimeouts::default(),
            rx: VecDeque::new(),
            tx_log: Vec::new(),
            loopback: false,
            hold_writes: false,
            out_queue: 0,
            modem: ModemStatus::default(),
            line_errors: LineErrors::default(),
            event_mask: EventMask::empty(),
            pending_events: EventMask::empty(),
            in_break: false,
            dtr: false,
            rts: false,
            escapes: Vec::new(),
            purges: Vec::new(),
            read_aborts: 0,
            write_aborts: 0,
            flushes: 0,
            buffer_sizes: None,
            failures: HashMap::new(),
            closed: false,
            removed: false,
        };
        Self {
            name: name.into(),
            shared: Arc::new(MockShared {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    /// A device whose writes are echoed back into its receive queue.
    pub fn loopback(name: impl Into<String>) -> Self {
        let device = Self::new(name);
        device.set_loopback(true);
        device
    }

    fn update<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let result = f(&mut self.shared.state.lock());
        self.shared.changed.notify_all();
        result
    }

    fn inspect<R>(&self, f: impl FnOnce(&MockState) -> R) -> R {
        f(&self.shared.state.lock())
    }

    // ----- scripting -----

    /// Echo written bytes into the receive queue.
    pub fn set_loopback(&self, enabled: bool) {
        self.update(|s| s.loopback = enabled);
    }

    /// Make writes stall (as if flow control held them) until released.
    pub fn set_hold_writes(&self, hold: bool) {
        self.update(|s| s.hold_writes = hold);
    }

    /// Report the given device class at open.
    pub fn set_device_class(&self, class: DeviceClass) {
        self.update(|s| s.class = class);
    }

    /// Report the given maximum baud rate.
    pub fn set_max_baud(&self, max_baud: u32) {
        self.update(|s| s.properties.max_baud = max_baud);
    }

    /// Set the bytes-to-write count reported by the driver.
    pub fn set_out_queue(&self, bytes: u32) {
        self.update(|s| s.out_queue = bytes);
    }

    /// Deliver bytes as if received on the wire.
    pub fn enqueue_rx(&self, data: &[u8]) {
        self.update(|s| s.receive(data));
    }

    /// Change the input lines, raising the matching pin events.
    pub fn set_modem_status(&self, status: ModemStatus) {
        self.update(|s| {
            let before = s.modem;
            if before.cts != status.cts {
                s.raise(EventMask::CTS);
            }
            if before.dsr != status.dsr {
                s.raise(EventMask::DSR);
            }
            if before.rlsd != status.rlsd {
                s.raise(EventMask::RLSD);
            }
            if status.ring && !before.ring {
                s.raise(EventMask::RING);
            }
            s.modem = status;
        });
    }

    /// Latch transport errors and raise the error event.
    pub fn inject_line_errors(&self, errors: LineErrors) {
        self.update(|s| {
            s.line_errors = errors;
            s.raise(EventMask::ERR);
        });
    }

    /// Raise arbitrary events.
    pub fn raise_events(&self, events: EventMask) {
        self.update(|s| s.raise(events));
    }

    /// Fail the next call of `op` with `kind`.
    pub fn fail_next(&self, op: MockOp, kind: DeviceErrorKind) {
        self.update(|s| {
            s.failures.insert(
                op,
                Failure {
                    kind,
                    persistent: false,
                },
            )
        });
    }

    /// Fail every call of `op` with `kind` until cleared.
    pub fn fail_always(&self, op: MockOp, kind: DeviceErrorKind) {
        self.update(|s| {
            s.failures.insert(
                op,
                Failure {
                    kind,
                    persistent: true,
                },
            )
        });
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        self.update(|s| s.failures.clear());
    }

    /// Simulate the adapter being unplugged.
    pub fn disconnect(&self) {
        self.update(|s| s.removed = true);
    }

    // ----- inspection -----

    /// The control block last accepted.
    pub fn applied_state(&self) -> ControlBlock {
        self.inspect(|s| s.block)
    }

    /// How many times the control block was successfully applied.
    pub fn apply_count(&self) -> usize {
        self.inspect(|s| s.apply_count)
    }

    /// The timeout registers last accepted.
    pub fn timeouts(&self) -> CommTimeouts {
        self.inspect(|s| s.timeouts)
    }

    /// Every write, one entry per accepted request.
    pub fn tx_log(&self) -> Vec<Vec<u8>> {
        self.inspect(|s| s.tx_log.clone())
    }

    /// All written bytes concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.inspect(|s| s.tx_log.concat())
    }

    /// Bytes waiting in the receive queue.
    pub fn rx_len(&self) -> usize {
        self.inspect(|s| s.rx.len())
    }

    pub fn dtr(&self) -> bool {
        self.inspect(|s| s.dtr)
    }

    pub fn rts(&self) -> bool {
        self.inspect(|s| s.rts)
    }

    pub fn in_break(&self) -> bool {
        self.inspect(|s| s.in_break)
    }

    /// Pin commands received, in order.
    pub fn escapes(&self) -> Vec<EscapeFunction> {
        self.inspect(|s| s.escapes.clone())
    }

    /// Buffer purges received, in order.
    pub fn purges(&self) -> Vec<Purge> {
        self.inspect(|s| s.purges.clone())
    }

    pub fn flush_count(&self) -> usize {
        self.inspect(|s| s.flushes)
    }

    pub fn buffer_sizes(&self) -> Option<(u32, u32)> {
        self.inspect(|s| s.buffer_sizes)
    }

    pub fn event_mask(&self) -> EventMask {
        self.inspect(|s| s.event_mask)
    }

    pub fn is_closed(&self) -> bool {
        self.inspect(|s| s.closed)
    }
}

impl SerialDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_class(&self) -> DeviceClass {
        self.inspect(|s| s.class)
    }

    fn properties(&self) -> Result<CommProperties, DeviceError> {
        self.update(|s| {
            s.check(MockOp::Properties)?;
            Ok(s.properties)
        })
    }

    fn current_state(&self) -> Result<ControlBlock, DeviceError> {
        self.update(|s| {
            s.check(MockOp::CurrentState)?;
            Ok(s.block)
        })
    }

    fn apply_state(&self, block: &ControlBlock) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::ApplyState)?;
            if block.baud_rate == 0 {
                return Err(DeviceError::new(
                    DeviceErrorKind::InvalidParameter,
                    "baud rate must be non-zero",
                ));
            }
            match block.dtr_control {
                DtrControl::Enable => s.dtr = true,
                DtrControl::Disable => s.dtr = false,
                DtrControl::Handshake => {}
            }
            match block.rts_control {
                RtsControl::Enable => s.rts = true,
                RtsControl::Disable => s.rts = false,
                RtsControl::Handshake | RtsControl::Toggle => {}
            }
            s.block = *block;
            s.apply_count += 1;
            Ok(())
        })
    }

    fn apply_timeouts(&self, timeouts: &CommTimeouts) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::ApplyTimeouts)?;
            s.timeouts = *timeouts;
            Ok(())
        })
    }

    fn escape(&self, function: EscapeFunction) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::Escape)?;
            match function {
                EscapeFunction::SetDtr => s.dtr = true,
                EscapeFunction::ClearDtr => s.dtr = false,
                EscapeFunction::SetRts => s.rts = true,
                EscapeFunction::ClearRts => s.rts = false,
            }
            s.escapes.push(function);
            Ok(())
        })
    }

    fn set_break(&self, on: bool) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::SetBreak)?;
            s.in_break = on;
            Ok(())
        })
    }

    fn modem_status(&self) -> Result<ModemStatus, DeviceError> {
        self.update(|s| {
            s.check(MockOp::ModemStatus)?;
            Ok(s.modem)
        })
    }

    fn clear_errors(&self) -> Result<(LineErrors, CommStatus), DeviceError> {
        self.update(|s| {
            s.check(MockOp::ClearErrors)?;
            let errors = std::mem::take(&mut s.line_errors);
            let status = CommStatus {
                in_queue: s.rx.len() as u32,
                out_queue: s.out_queue,
            };
            Ok((errors, status))
        })
    }

    fn queue_status(&self) -> Result<CommStatus, DeviceError> {
        self.update(|s| {
            s.check(MockOp::QueueStatus)?;
            Ok(CommStatus {
                in_queue: s.rx.len() as u32,
                out_queue: s.out_queue,
            })
        })
    }

    fn purge(&self, purge: Purge) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::Purge)?;
            match purge {
                Purge::Input => s.rx.clear(),
                Purge::Output => s.out_queue = 0,
                Purge::AbortInput => {
                    s.rx.clear();
                    s.read_aborts += 1;
                }
                Purge::AbortOutput => {
                    s.out_queue = 0;
                    s.write_aborts += 1;
                }
            }
            s.purges.push(purge);
            Ok(())
        })
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::Flush)?;
            s.flushes += 1;
            Ok(())
        })
    }

    fn setup_buffers(&self, read_size: u32, write_size: u32) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::SetupBuffers)?;
            s.buffer_sizes = Some((read_size, write_size));
            Ok(())
        })
    }

    fn set_event_mask(&self, mask: EventMask) -> Result<(), DeviceError> {
        self.update(|s| {
            s.check(MockOp::SetEventMask)?;
            s.event_mask = mask;
            s.pending_events = s.pending_events & mask;
            Ok(())
        })
    }

    fn wait_event(&self, signal: &WaitSignal) -> Result<EventMask, DeviceError> {
        loop {
            {
                let mut state = self.shared.state.lock();
                state.check(MockOp::WaitEvent)?;
                let ready = state.pending_events & state.event_mask;
                if !ready.is_empty() {
                    state.pending_events = EventMask::empty();
                    return Ok(ready);
                }
            }
            if signal.wait_timeout(SIGNAL_POLL) {
                return Ok(EventMask::empty());
            }
        }
    }

    fn read(&self, buf: &mut [u8], timeouts: &CommTimeouts) -> Result<usize, DeviceError> {
        let deadline = match timeouts.read_wait() {
            ReadWait::Immediate => None,
            ReadWait::Within(bound) => Some(Instant::now() + bound),
        };

        let mut state = self.shared.state.lock();
        let generation = state.read_aborts;
        loop {
            state.check(MockOp::Read)?;
            if state.read_aborts != generation {
                return Err(DeviceError::aborted());
            }
            let n = state.take_rx(buf);
            if n > 0 {
                return Ok(n);
            }
            let Some(deadline) = deadline else {
                return Ok(0);
            };
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                state.check(MockOp::Read)?;
                return Ok(state.take_rx(buf));
            }
        }
    }

    fn write(&self, data: &[u8], timeouts: &CommTimeouts) -> Result<usize, DeviceError> {
        let deadline = timeouts.write_bound().map(|bound| Instant::now() + bound);

        let mut state = self.shared.state.lock();
        state.check(MockOp::Write)?;
        let generation = state.write_aborts;
        while state.hold_writes {
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        state.check(MockOp::Write)?;
                        if state.hold_writes {
                            return Ok(0);
                        }
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
            state.check(MockOp::Write)?;
            if state.write_aborts != generation {
                return Err(DeviceError::aborted());
            }
        }

        state.tx_log.push(data.to_vec());
        if state.loopback {
            state.receive(data);
        }
        drop(state);
        self.shared.changed.notify_all();
        Ok(data.len())
    }

    fn close(&self) {
        self.update(|s| s.closed = true);
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("name", &self.name)
            .field("rx_len", &self.rx_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn immediate() -> CommTimeouts {
        CommTimeouts::default().with_read(Timeout::IMMEDIATE)
    }

    #[test]
    fn test_enqueue_and_read() {
        let device = MockDevice::new("MOCK0");
        device.enqueue_rx(b"Hello");

        let mut buf = [0u8; 10];
        let n = device.read(&mut buf, &immediate()).unwrap();
        assert_eq!(&buf[..n], b"Hello");
    }

    #[test]
    fn test_immediate_read_with_nothing_buffered() {
        let device = MockDevice::new("MOCK0");
        let mut buf = [0u8; 4];
        assert_eq!(device.read(&mut buf, &immediate()).unwrap(), 0);
    }

    #[test]
    fn test_bounded_read_times_out_with_zero() {
        let device = MockDevice::new("MOCK0");
        let timeouts = CommTimeouts::default().with_read(Timeout::Millis(20));

        let started = Instant::now();
        let mut buf = [0u8; 4];
        assert_eq!(device.read(&mut buf, &timeouts).unwrap(), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocked_read_wakes_on_data() {
        let device = MockDevice::new("MOCK0");
        let feeder = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            feeder.enqueue_rx(b"ok");
        });

        let mut buf = [0u8; 4];
        let n = device.read(&mut buf, &CommTimeouts::default()).unwrap();
        handle.join().unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[test]
    fn test_close_unblocks_read() {
        let device = MockDevice::new("MOCK0");
        let closer = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        let mut buf = [0u8; 4];
        let err = device.read(&mut buf, &CommTimeouts::default()).unwrap_err();
        handle.join().unwrap();
        assert_eq!(err.kind(), DeviceErrorKind::Closed);
    }

    #[test]
    fn test_abort_purge_fails_blocked_read() {
        let device = MockDevice::new("MOCK0");
        let purger = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            purger.purge(Purge::AbortInput).unwrap();
        });

        let mut buf = [0u8; 4];
        let err = device.read(&mut buf, &CommTimeouts::default()).unwrap_err();
        handle.join().unwrap();
        assert_eq!(err.kind(), DeviceErrorKind::Aborted);
    }

    #[test]
    fn test_plain_purge_leaves_blocked_read_waiting() {
        let device = MockDevice::new("MOCK0");
        let feeder = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            feeder.purge(Purge::Input).unwrap();
            thread::sleep(Duration::from_millis(10));
            feeder.enqueue_rx(b"z");
        });

        let mut buf = [0u8; 4];
        let n = device.read(&mut buf, &CommTimeouts::default()).unwrap();
        handle.join().unwrap();
        assert_eq!(&buf[..n], b"z");
    }

    #[test]
    fn test_abort_purge_fails_held_write() {
        let device = MockDevice::new("MOCK0");
        device.set_hold_writes(true);
        let purger = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            purger.purge(Purge::AbortOutput).unwrap();
        });

        let err = device.write(b"x", &CommTimeouts::default()).unwrap_err();
        handle.join().unwrap();
        assert_eq!(err.kind(), DeviceErrorKind::Aborted);
        assert!(device.tx_log().is_empty());
    }

    #[test]
    fn test_discard_null_drops_zero_bytes() {
        let device = MockDevice::new("MOCK0");
        let block = ControlBlock {
            discard_null: true,
            ..device.applied_state()
        };
        device.apply_state(&block).unwrap();
        device.enqueue_rx(&[1, 0, 2, 0, 3]);

        let mut buf = [0u8; 8];
        let n = device.read(&mut buf, &immediate()).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[test]
    fn test_loopback_echoes_writes() {
        let device = MockDevice::loopback("MOCK0");
        device.write(b"ping", &CommTimeouts::default()).unwrap();

        assert_eq!(device.tx_log(), vec![b"ping".to_vec()]);
        assert_eq!(device.rx_len(), 4);
    }

    #[test]
    fn test_held_write_times_out_with_zero() {
        let device = MockDevice::new("MOCK0");
        device.set_hold_writes(true);
        let timeouts = CommTimeouts::default().with_write(Timeout::Millis(20));

        assert_eq!(device.write(b"x", &timeouts).unwrap(), 0);
        assert!(device.tx_log().is_empty());
    }

    #[test]
    fn test_one_shot_failure() {
        let device = MockDevice::new("MOCK0");
        device.fail_next(MockOp::ApplyState, DeviceErrorKind::InvalidParameter);

        let block = device.applied_state();
        assert!(device.apply_state(&block).is_err());
        assert!(device.apply_state(&block).is_ok());
        assert_eq!(device.apply_count(), 1);
    }

    #[test]
    fn test_wait_event_reports_armed_events_only() {
        let device = MockDevice::new("MOCK0");
        device.set_event_mask(EventMask::CTS).unwrap();
        device.raise_events(EventMask::CTS | EventMask::RING);

        let signal = WaitSignal::new();
        assert_eq!(device.wait_event(&signal).unwrap(), EventMask::CTS);
    }

    #[test]
    fn test_wait_event_returns_empty_when_signalled() {
        let device = MockDevice::new("MOCK0");
        device.set_event_mask(EventMask::ALL).unwrap();

        let signal = WaitSignal::new();
        signal.set();
        assert!(device.wait_event(&signal).unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_fails_every_call() {
        let device = MockDevice::new("MOCK0");
        device.disconnect();

        let err = device.modem_status().unwrap_err();
        assert_eq!(err.kind(), DeviceErrorKind::DeviceRemoved);
    }
}
