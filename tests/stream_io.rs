//! Blocking and begin/end I/O against the mock device.
//!
//! Tests follow the Arrange-Act-Assert pattern.

mod common;

use common::{open_loopback, open_mock, wait_until, EventLog, SETTLE};
use serial_stream::completion::DEFAULT_WORKERS;
use serial_stream::device::{DeviceErrorKind, EventMask, MockOp};
use serial_stream::{
    Direction, SerialEvent, SerialPinChange, SerialStream, StreamError, StreamOptions, Timeout,
    UsageError,
};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_loopback_round_trip_within_timeout() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(500));

    // Act
    stream.write(b"hello", 0, 5).unwrap();
    let mut buf = [0u8; 5];
    let started = Instant::now();
    let n = stream.read(&mut buf, 0, 5).unwrap();

    // Assert
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_read_times_out_cleanly_when_nothing_arrives() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(100));
    let mut buf = [0u8; 5];

    // Act
    let started = Instant::now();
    let result = stream.read(&mut buf, 0, 5);
    let elapsed = started.elapsed();

    // Assert
    assert!(matches!(
        result,
        Err(StreamError::Timeout {
            direction: Direction::Read,
            transferred: 0
        })
    ));
    assert!(elapsed >= Duration::from_millis(90), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "hung: {elapsed:?}");
}

#[test]
fn test_zero_read_timeout_returns_buffered_bytes_or_times_out() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions {
        read_timeout: Timeout::IMMEDIATE,
        ..StreamOptions::default()
    });
    let mut buf = [0u8; 8];

    // Act + Assert: nothing buffered
    assert!(matches!(
        stream.read(&mut buf, 0, 8),
        Err(StreamError::Timeout { .. })
    ));

    // Act + Assert: partial data is returned immediately
    mock.enqueue_rx(b"abc");
    assert_eq!(stream.read(&mut buf, 0, 8).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
}

#[test]
fn test_read_honours_offset() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions {
        read_timeout: Timeout::Millis(100),
        ..StreamOptions::default()
    });
    mock.enqueue_rx(b"xy");
    let mut buf = [b'-'; 6];

    // Act
    let n = stream.read(&mut buf, 3, 3).unwrap();

    // Assert
    assert_eq!(n, 2);
    assert_eq!(&buf, b"---xy-");
}

#[test]
fn test_zero_count_touches_nothing() {
    // Arrange
    let (mock, stream) = open_loopback(Timeout::Infinite);
    mock.fail_always(MockOp::Read, DeviceErrorKind::InvalidParameter);
    mock.fail_always(MockOp::Write, DeviceErrorKind::InvalidParameter);
    let mut buf = [0u8; 4];

    // Act + Assert
    assert_eq!(stream.read(&mut buf, 4, 0).unwrap(), 0);
    assert!(stream.write(&buf, 0, 0).is_ok());
    assert!(mock.tx_log().is_empty());
}

#[test]
fn test_out_of_range_buffer_rejected_before_device_call() {
    // Arrange
    let (mock, stream) = open_loopback(Timeout::Millis(50));
    let mut buf = [0u8; 4];

    // Act
    let read = stream.read(&mut buf, 2, 3);
    let write = stream.write(&buf, 5, 0);

    // Assert
    assert!(matches!(
        read,
        Err(StreamError::IndexOutOfRange {
            offset: 2,
            count: 3,
            len: 4
        })
    ));
    assert!(matches!(write, Err(StreamError::IndexOutOfRange { .. })));
    assert!(mock.tx_log().is_empty());
}

#[test]
fn test_write_in_break_state_fails() {
    // Arrange
    let (mock, stream) = open_loopback(Timeout::Millis(50));
    stream.set_break_state(true).unwrap();

    // Act
    let blocking = stream.write(b"x", 0, 1);
    let single = stream.write_byte(b'y');
    let begun = stream.begin_write(b"z");

    // Assert
    assert!(matches!(blocking, Err(StreamError::InvalidOperation(_))));
    assert!(matches!(single, Err(StreamError::InvalidOperation(_))));
    assert!(matches!(begun, Err(StreamError::InvalidOperation(_))));
    assert!(mock.in_break());
    assert!(mock.tx_log().is_empty());

    stream.set_break_state(false).unwrap();
    assert!(stream.write(b"x", 0, 1).is_ok());
}

#[test]
fn test_stalled_write_times_out() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions {
        write_timeout: Timeout::Millis(50),
        ..StreamOptions::default()
    });
    mock.set_hold_writes(true);

    // Act
    let result = stream.write(b"abc", 0, 3);

    // Assert
    assert!(matches!(
        result,
        Err(StreamError::Timeout {
            direction: Direction::Write,
            transferred: 0
        })
    ));
}

#[test]
fn test_single_byte_forms() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(500));

    // Act
    stream.write_byte(0x42).unwrap();
    let byte = stream.read_byte().unwrap();

    // Assert
    assert_eq!(byte, 0x42);
}

#[test]
fn test_discard_null_drops_zero_bytes() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions {
        discard_null: true,
        read_timeout: Timeout::Millis(100),
        ..StreamOptions::default()
    });
    mock.enqueue_rx(&[b'a', 0, b'b', 0]);
    let mut buf = [0u8; 4];

    // Act
    let n = stream.read(&mut buf, 0, 4).unwrap();

    // Assert
    assert_eq!(&buf[..n], b"ab");
}

#[test]
fn test_begin_read_completes_on_worker_and_is_harvested_once() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions::default());

    // Act
    let op = stream.begin_read(3).unwrap();
    assert!(!op.is_completed());
    mock.enqueue_rx(b"abc");
    let data = stream.end_read(&op).unwrap();

    // Assert
    assert_eq!(data, b"abc");
    assert!(!op.completed_synchronously());
    assert!(matches!(
        stream.end_read(&op),
        Err(StreamError::Usage(UsageError::EndCalledTwice {
            direction: Direction::Read
        }))
    ));
}

#[test]
fn test_wrong_operation_kind_is_usage_error_and_does_not_consume() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(100));
    let write = stream.begin_write(b"ok").unwrap();

    // Act
    let wrong = stream.end_read(&write);
    let right = stream.end_write(&write);

    // Assert
    assert!(matches!(
        wrong,
        Err(StreamError::Usage(UsageError::WrongOperation {
            expected: Direction::Read
        }))
    ));
    assert_eq!(right.unwrap(), 2);
}

#[test]
fn test_harvest_from_another_thread() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions::default());
    let stream = Arc::new(stream);
    let op = stream.begin_read(2).unwrap();

    // Act
    let harvester = {
        let stream = Arc::clone(&stream);
        let op = op.clone();
        thread::spawn(move || stream.end_read(&op))
    };
    mock.enqueue_rx(b"hi");

    // Assert
    assert_eq!(harvester.join().unwrap().unwrap(), b"hi");
}

#[test]
fn test_close_unblocks_infinite_read() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Infinite);
    let stream = Arc::new(stream);
    let reader = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            let mut buf = [0u8; 4];
            stream.read(&mut buf, 0, 4)
        })
    };
    thread::sleep(Duration::from_millis(50));

    // Act
    let started = Instant::now();
    stream.close().unwrap();
    let result = reader.join().unwrap();

    // Assert
    assert!(matches!(result, Err(StreamError::NotOpen)));
    assert!(started.elapsed() < SETTLE);
}

#[test]
fn test_pending_operation_harvestable_after_close() {
    // Arrange
    let (_mock, stream) = open_mock(&StreamOptions::default());
    let op = stream.begin_read(8).unwrap();

    // Act
    stream.close().unwrap();
    let completed = op.wait_timeout(SETTLE);
    let harvested = stream.end_read(&op);

    // Assert
    assert!(completed);
    assert!(matches!(harvested, Err(StreamError::NotOpen)));
}

#[test]
fn test_operations_after_close_fail_with_not_open() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(50));
    stream.close().unwrap();
    let mut buf = [0u8; 1];

    // Act + Assert
    assert!(matches!(stream.read(&mut buf, 0, 1), Err(StreamError::NotOpen)));
    assert!(matches!(stream.write(b"x", 0, 1), Err(StreamError::NotOpen)));
    assert!(matches!(stream.begin_read(1), Err(StreamError::NotOpen)));
    assert!(matches!(stream.flush(), Err(StreamError::NotOpen)));
    assert!(matches!(stream.set_baud_rate(19_200), Err(StreamError::NotOpen)));
}

#[test]
fn test_invalid_handle_disables_stream() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions {
        read_timeout: Timeout::Millis(50),
        ..StreamOptions::default()
    });
    mock.fail_next(MockOp::Flush, DeviceErrorKind::InvalidHandle);

    // Act
    let first = stream.flush();
    let second = stream.discard_input_buffer();

    // Assert
    assert_eq!(first.unwrap_err().device_kind(), Some(DeviceErrorKind::InvalidHandle));
    assert!(matches!(second, Err(StreamError::NotOpen)));
    assert!(!stream.is_open());
}

#[test]
fn test_buffer_management() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions::default());
    mock.enqueue_rx(b"stale");
    mock.set_out_queue(12);

    // Act
    let to_read = stream.bytes_to_read().unwrap();
    let to_write = stream.bytes_to_write().unwrap();
    stream.discard_input_buffer().unwrap();
    stream.discard_output_buffer().unwrap();
    stream.flush().unwrap();
    stream.set_buffer_sizes(8192, 1024).unwrap();

    // Assert
    assert_eq!(to_read, 5);
    assert_eq!(to_write, 12);
    assert_eq!(stream.bytes_to_read().unwrap(), 0);
    assert_eq!(stream.bytes_to_write().unwrap(), 0);
    assert_eq!(mock.flush_count(), 1);
    assert_eq!(mock.buffer_sizes(), Some((8192, 1024)));
    assert!(matches!(
        stream.set_buffer_sizes(0, 1024),
        Err(StreamError::ArgumentOutOfRange { param: "read_size", .. })
    ));
}

#[test]
fn test_std_io_traits() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(500));

    // Act
    (&stream).write_all(b"io!").unwrap();
    (&stream).flush().unwrap();
    let mut buf = [0u8; 3];
    (&stream).read_exact(&mut buf).unwrap();

    // Assert
    assert_eq!(&buf, b"io!");
}

#[test]
fn test_std_io_timeout_kind() {
    // Arrange
    let (_mock, mut stream) = open_loopback(Timeout::Millis(20));
    let mut buf = [0u8; 1];

    // Act
    let err = Read::read(&mut stream, &mut buf).unwrap_err();

    // Assert
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}

#[test]
fn test_concurrent_reader_and_writer() {
    // Arrange
    let (_mock, stream) = open_loopback(Timeout::Millis(1000));
    let stream = Arc::new(stream);
    let payload: Vec<u8> = (0..=255u8).collect();

    // Act
    let writer = {
        let stream = Arc::clone(&stream);
        let payload = payload.clone();
        thread::spawn(move || {
            for chunk in payload.chunks(32) {
                stream.write(chunk, 0, chunk.len()).unwrap();
            }
        })
    };
    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < payload.len() {
        let len = buf.len();
        let n = stream.read(&mut buf, 0, len).unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap();

    // Assert
    assert_eq!(received, payload);
    assert!(wait_until(SETTLE, || stream.bytes_to_read().unwrap() == 0));
}

#[test]
fn test_stream_is_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SerialStream>();
}

#[test]
fn test_bounded_write_completes_while_pending_reads_outnumber_workers() {
    // Arrange
    let (mock, stream) = open_mock(&StreamOptions {
        write_timeout: Timeout::Millis(200),
        ..StreamOptions::default()
    });
    let stream = Arc::new(stream);
    let log = EventLog::attach(&stream);
    let reads: Vec<_> = (0..DEFAULT_WORKERS + 1)
        .map(|_| stream.begin_read(1).unwrap())
        .collect();

    // Act
    let (done_tx, done_rx) = mpsc::channel();
    {
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            let _ = done_tx.send(stream.write(b"hello", 0, 5));
        });
    }
    let written = done_rx.recv_timeout(SETTLE);

    mock.set_hold_writes(true);
    let started = Instant::now();
    let stalled = stream.write(b"late", 0, 4);
    let stalled_for = started.elapsed();
    mock.set_hold_writes(false);

    mock.raise_events(EventMask::CTS);

    // Assert
    assert!(matches!(written, Ok(Ok(()))), "write did not finish: {written:?}");
    assert_eq!(mock.written(), b"hello");
    assert!(matches!(
        stalled,
        Err(StreamError::Timeout {
            direction: Direction::Write,
            transferred: 0
        })
    ));
    assert!(stalled_for < SETTLE);
    assert!(log.wait_for_event(SerialEvent::PinChanged(SerialPinChange::CtsChanged)));
    assert!(reads.iter().all(|op| !op.is_completed()));

    stream.close().unwrap();
    for op in &reads {
        assert!(matches!(stream.end_read(op), Err(StreamError::NotOpen)));
    }
}
