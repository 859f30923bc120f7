//! Reads and writes.
//!
//! Every transfer is a `PendingOperation`. A read whose bytes are already
//! buffered completes inline during submission; everything else is handed
//! to the completion port together with the device handle and the timeout
//! registers in force at submission, and finished by `complete_read` or
//! `complete_write` on a worker thread. The blocking calls submit and then
//! harvest on the caller's thread.

use super::SerialStream;
use crate::device::{CommTimeouts, DeviceHandle, Purge, Timeout};
use crate::error::{StreamError, StreamResult};
use crate::operation::{Direction, PendingOperation};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

const BREAK_STATE: &str = "the port is in the break state";

/// Context handed to a completion routine.
struct IoRequest {
    op: PendingOperation,
    handle: Arc<DeviceHandle>,
    timeouts: CommTimeouts,
}

fn complete_read(request: IoRequest) {
    let IoRequest {
        op,
        handle,
        timeouts,
    } = request;
    let result = op.with_data(|buf| handle.invoke(|d| d.read(&mut buf[..], &timeouts)));
    if let Err(err) = &result {
        trace!(port = %handle.name(), error = %err, "read completed with error");
    }
    op.complete(result.map_err(StreamError::from), false);
}

fn complete_write(request: IoRequest) {
    let IoRequest {
        op,
        handle,
        timeouts,
    } = request;
    let result = op.with_data(|data| handle.invoke(|d| d.write(data, &timeouts)));
    if let Err(err) = &result {
        trace!(port = %handle.name(), error = %err, "write completed with error");
    }
    op.complete(result.map_err(StreamError::from), false);
}

/// Reject an `offset`/`count` pair that does not fit in a buffer of `len` bytes.
fn check_bounds(len: usize, offset: usize, count: usize) -> StreamResult<()> {
    if offset > len || count > len - offset {
        return Err(StreamError::IndexOutOfRange { offset, count, len });
    }
    Ok(())
}

pub(super) fn check_buffer_sizes(read_size: u32, write_size: u32) -> StreamResult<()> {
    if read_size == 0 {
        return Err(StreamError::out_of_range("read_size", "must be positive"));
    }
    if write_size == 0 {
        return Err(StreamError::out_of_range("write_size", "must be positive"));
    }
    Ok(())
}

/// An operation that finished during submission without touching the device.
fn completed(op: PendingOperation) -> PendingOperation {
    op.complete(Ok(0), true);
    op
}

impl SerialStream {
    fn submit(
        &self,
        handle: Arc<DeviceHandle>,
        op: PendingOperation,
        timeouts: CommTimeouts,
    ) -> StreamResult<PendingOperation> {
        let routine: fn(IoRequest) = match op.direction() {
            Direction::Read => complete_read,
            Direction::Write => complete_write,
        };
        let request = IoRequest {
            op: op.clone(),
            handle,
            timeouts,
        };
        match self.shared.binding.submit(request, routine) {
            Ok(()) => Ok(op),
            Err(_rejected) => Err(StreamError::NotOpen),
        }
    }

    fn begin_read_core(
        &self,
        handle: &Arc<DeviceHandle>,
        count: usize,
        timeouts: CommTimeouts,
        infinite: bool,
    ) -> StreamResult<PendingOperation> {
        let op = PendingOperation::read(count, infinite);

        let buffered = handle.invoke(|d| d.queue_status())?.in_queue as usize;
        if buffered >= count {
            let immediate = timeouts.with_read(Timeout::IMMEDIATE);
            let n = op.with_data(|buf| handle.invoke(|d| d.read(&mut buf[..], &immediate)))?;
            if n > 0 {
                op.complete(Ok(n), true);
                return Ok(op);
            }
        }

        self.submit(Arc::clone(handle), op, timeouts)
    }

    fn begin_write_core(
        &self,
        handle: &Arc<DeviceHandle>,
        data: &[u8],
        timeouts: CommTimeouts,
        infinite: bool,
    ) -> StreamResult<PendingOperation> {
        let op = PendingOperation::write(data.to_vec(), infinite);
        self.submit(Arc::clone(handle), op, timeouts)
    }

    /// Wait for `op` and take its outcome.
    ///
    /// A transfer aborted because the stream is closing reports `NotOpen`.
    fn harvest(&self, op: &PendingOperation) -> StreamResult<usize> {
        op.wait_outcome().map_err(|err| match err {
            StreamError::OperationAborted if self.shared.closing.load(Ordering::Acquire) => {
                StreamError::NotOpen
            }
            other => other,
        })
    }

    fn check_not_in_break(&self) -> StreamResult<()> {
        if self.break_state() {
            return Err(StreamError::invalid_operation(BREAK_STATE));
        }
        Ok(())
    }

    // ----- blocking transfers -----

    /// Read up to `count` bytes into `buf[offset..]`.
    ///
    /// Returns as soon as at least one byte is available. Fails with
    /// `Timeout` when the read timeout elapses with nothing received; with
    /// an infinite timeout it keeps waiting until data arrives or the stream
    /// closes.
    pub fn read(&self, buf: &mut [u8], offset: usize, count: usize) -> StreamResult<usize> {
        check_bounds(buf.len(), offset, count)?;
        if count == 0 {
            return Ok(0);
        }

        let handle = self.handle()?;
        let timeouts = self.shared.settings.lock().timeouts();
        let infinite = timeouts.read_timeout() == Timeout::Infinite;

        loop {
            let op = self.begin_read_core(&handle, count, timeouts, infinite)?;
            op.claim(Direction::Read)?;
            let n = self.harvest(&op)?;
            if n > 0 {
                op.with_data(|data| buf[offset..offset + n].copy_from_slice(&data[..n]));
                return Ok(n);
            }
            if !infinite {
                return Err(StreamError::timeout(Direction::Read, 0));
            }
            if !handle.is_usable() {
                return Err(StreamError::NotOpen);
            }
        }
    }

    /// Read a single byte.
    pub fn read_byte(&self) -> StreamResult<u8> {
        let mut byte = [0u8; 1];
        self.read(&mut byte, 0, 1)?;
        Ok(byte[0])
    }

    /// Write `buf[offset..offset + count]`.
    ///
    /// Either every byte is accepted or the call fails; a write cut short by
    /// the write timeout reports how many bytes went out.
    pub fn write(&self, buf: &[u8], offset: usize, count: usize) -> StreamResult<()> {
        self.check_not_in_break()?;
        check_bounds(buf.len(), offset, count)?;
        if count == 0 {
            return Ok(());
        }

        let handle = self.handle()?;
        let timeouts = self.shared.settings.lock().timeouts();
        let infinite = timeouts.write_timeout() == Timeout::Infinite;

        let op = self.begin_write_core(&handle, &buf[offset..offset + count], timeouts, infinite)?;
        op.claim(Direction::Write)?;
        let n = self.harvest(&op)?;
        if n < count {
            return Err(StreamError::timeout(Direction::Write, n));
        }
        Ok(())
    }

    /// Write a single byte.
    pub fn write_byte(&self, byte: u8) -> StreamResult<()> {
        self.write(&[byte], 0, 1)
    }

    // ----- begin/end -----

    /// Start reading up to `count` bytes without a timeout.
    ///
    /// The returned operation is harvested with [`end_read`](Self::end_read),
    /// possibly from another thread.
    pub fn begin_read(&self, count: usize) -> StreamResult<PendingOperation> {
        let handle = self.handle()?;
        if count == 0 {
            return Ok(completed(PendingOperation::read(0, true)));
        }
        let timeouts = self
            .shared
            .settings
            .lock()
            .timeouts()
            .with_read(Timeout::Infinite);
        self.begin_read_core(&handle, count, timeouts, true)
    }

    /// Wait for a read started by [`begin_read`](Self::begin_read) and take its bytes.
    ///
    /// Fails with `Usage` when called twice for the same operation or with
    /// a write operation. Harvesting stays legal after the stream is closed.
    pub fn end_read(&self, op: &PendingOperation) -> StreamResult<Vec<u8>> {
        op.claim(Direction::Read)?;
        let n = self.harvest(op)?;
        if n == 0 && op.is_infinite() && op.requested() > 0 {
            return Err(StreamError::OperationAborted);
        }
        let mut data = op.take_data();
        data.truncate(n);
        Ok(data)
    }

    /// Start writing `data` without a timeout.
    pub fn begin_write(&self, data: &[u8]) -> StreamResult<PendingOperation> {
        self.check_not_in_break()?;
        let handle = self.handle()?;
        if data.is_empty() {
            return Ok(completed(PendingOperation::write(Vec::new(), true)));
        }
        let timeouts = self
            .shared
            .settings
            .lock()
            .timeouts()
            .with_write(Timeout::Infinite);
        self.begin_write_core(&handle, data, timeouts, true)
    }

    /// Wait for a write started by [`begin_write`](Self::begin_write).
    ///
    /// Returns the number of bytes written.
    pub fn end_write(&self, op: &PendingOperation) -> StreamResult<usize> {
        op.claim(Direction::Write)?;
        self.harvest(op)
    }

    // ----- buffers -----

    /// Block until the driver's transmit buffer has drained.
    pub fn flush(&self) -> StreamResult<()> {
        let handle = self.handle()?;
        handle.invoke(|d| d.flush())?;
        Ok(())
    }

    /// Drop everything in the driver's receive buffer.
    pub fn discard_input_buffer(&self) -> StreamResult<()> {
        let handle = self.handle()?;
        handle.invoke(|d| d.purge(Purge::Input))?;
        Ok(())
    }

    /// Drop everything in the driver's transmit buffer.
    pub fn discard_output_buffer(&self) -> StreamResult<()> {
        let handle = self.handle()?;
        handle.invoke(|d| d.purge(Purge::Output))?;
        Ok(())
    }

    /// Request driver buffer sizes. Both must be positive.
    pub fn set_buffer_sizes(&self, read_size: u32, write_size: u32) -> StreamResult<()> {
        check_buffer_sizes(read_size, write_size)?;
        let handle = self.handle()?;
        handle.invoke(|d| d.setup_buffers(read_size, write_size))?;
        Ok(())
    }
}

impl io::Read for &SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        SerialStream::read(*self, buf, 0, len).map_err(io::Error::from)
    }
}

impl io::Write for &SerialStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SerialStream::write(*self, buf, 0, buf.len())
            .map(|()| buf.len())
            .map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        SerialStream::flush(*self).map_err(io::Error::from)
    }
}

impl io::Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for SerialStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceErrorKind, MockDevice, MockOp};
    use crate::error::UsageError;
    use crate::stream::StreamOptions;

    fn open(mock: &MockDevice, read_timeout: Timeout) -> SerialStream {
        let options = StreamOptions {
            read_timeout,
            ..StreamOptions::default()
        };
        SerialStream::open_device(Arc::new(mock.clone()), &options).unwrap()
    }

    #[test]
    fn test_check_bounds() {
        assert!(check_bounds(8, 0, 8).is_ok());
        assert!(check_bounds(8, 8, 0).is_ok());
        assert!(matches!(
            check_bounds(8, 4, 5),
            Err(StreamError::IndexOutOfRange { offset: 4, count: 5, len: 8 })
        ));
        assert!(check_bounds(8, 9, 0).is_err());
    }

    #[test]
    fn test_buffered_read_completes_inline() {
        let mock = MockDevice::new("MOCK0");
        let stream = open(&mock, Timeout::Millis(100));
        mock.enqueue_rx(b"abcd");

        let op = stream.begin_read(4).unwrap();

        assert!(op.completed_synchronously());
        assert_eq!(stream.end_read(&op).unwrap(), b"abcd");
    }

    #[test]
    fn test_end_read_twice_is_usage_error() {
        let mock = MockDevice::new("MOCK0");
        let stream = open(&mock, Timeout::Millis(100));
        mock.enqueue_rx(b"x");

        let op = stream.begin_read(1).unwrap();
        stream.end_read(&op).unwrap();

        assert!(matches!(
            stream.end_read(&op),
            Err(StreamError::Usage(UsageError::EndCalledTwice { direction: Direction::Read }))
        ));
    }

    #[test]
    fn test_zero_count_never_touches_device() {
        let mock = MockDevice::new("MOCK0");
        let stream = open(&mock, Timeout::Millis(100));
        mock.fail_always(MockOp::Read, DeviceErrorKind::InvalidParameter);
        mock.fail_always(MockOp::QueueStatus, DeviceErrorKind::InvalidParameter);

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf, 2, 0).unwrap(), 0);
    }
}
