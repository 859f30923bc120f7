//! Shared test utilities for serial-stream integration tests.
//!
//! This module provides:
//! - Builders that open a stream over a scripted `MockDevice`
//! - An event log that records notifications delivered to an observer
//! - Polling helpers for conditions reached on background threads

#![allow(dead_code)]

use parking_lot::Mutex;
use serial_stream::device::CommProperties;
use serial_stream::{MockDevice, SerialEvent, SerialStream, StreamOptions, Timeout};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Generous bound for anything that happens on a background thread.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Open a stream over a fresh mock device.
///
/// Returns the device clone used to script and inspect the hardware.
pub fn open_mock(options: &StreamOptions) -> (MockDevice, SerialStream) {
    let mock = MockDevice::new("MOCK0");
    let stream = SerialStream::open_device(Arc::new(mock.clone()), options)
        .expect("mock stream should open");
    (mock, stream)
}

/// Open a stream over a loopback mock with the given read timeout.
pub fn open_loopback(read_timeout: Timeout) -> (MockDevice, SerialStream) {
    let mock = MockDevice::loopback("LOOP0");
    let options = StreamOptions {
        read_timeout,
        ..StreamOptions::default()
    };
    let stream = SerialStream::open_device(Arc::new(mock.clone()), &options)
        .expect("loopback stream should open");
    (mock, stream)
}

/// Properties of a typical USB adapter.
pub fn usb_adapter_properties() -> CommProperties {
    CommProperties {
        max_baud: 115_200,
        current_rx_queue: 4096,
        current_tx_queue: 2048,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Records every notification a stream raises, with the raising thread's name.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<(SerialEvent, Option<String>)>>>,
}

impl EventLog {
    /// Subscribe a new log to `stream`.
    pub fn attach(stream: &SerialStream) -> Self {
        let log = Self::default();
        let sink = Arc::clone(&log.entries);
        stream.subscribe(move |event| {
            let thread = thread::current().name().map(str::to_string);
            sink.lock().push((event, thread));
        });
        log
    }

    pub fn events(&self) -> Vec<SerialEvent> {
        self.entries.lock().iter().map(|(event, _)| *event).collect()
    }

    pub fn threads(&self) -> Vec<Option<String>> {
        self.entries.lock().iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Wait until at least `count` notifications have arrived.
    pub fn wait_for(&self, count: usize) -> bool {
        wait_until(SETTLE, || self.len() >= count)
    }

    /// Wait until `event` has been recorded.
    pub fn wait_for_event(&self, event: SerialEvent) -> bool {
        wait_until(SETTLE, || self.events().contains(&event))
    }
}
