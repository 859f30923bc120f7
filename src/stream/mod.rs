//! The serial stream.
//!
//! `SerialStream` owns one device handle, its configuration mirror, the
//! observer registry and the event monitor thread. I/O lives in [`io`],
//! open and close in [`lifecycle`].

mod io;
mod lifecycle;

pub use lifecycle::validate_port_name;

use crate::completion::{CompletionPort, IoBinding, DEFAULT_WORKERS};
use crate::device::{
    CommProperties, DataBits, DeviceHandle, Handshake, Parity, StopBits, Timeout,
};
use crate::error::{StreamError, StreamResult};
use crate::events::{EventHub, SerialEvent, SubscriptionId};
use crate::monitor::{MonitorPhase, MonitorState};
use crate::settings::DeviceSettings;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Parameters applied when a stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    pub read_timeout: Timeout,
    pub write_timeout: Timeout,
    pub dtr_enable: bool,
    /// Ignored when the handshake drives RTS.
    pub rts_enable: bool,
    pub discard_null: bool,
    /// Byte substituted for characters received with a parity error.
    pub parity_replace: u8,
    /// Driver buffer sizes requested at open, if any.
    pub buffer_sizes: Option<(u32, u32)>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            read_timeout: Timeout::Infinite,
            write_timeout: Timeout::Infinite,
            dtr_enable: false,
            rts_enable: false,
            discard_null: false,
            parity_replace: b'?',
            buffer_sizes: None,
        }
    }
}

/// Threads backing a stream opened by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Resident workers in the stream's private completion port. The port
    /// starts extra workers while every resident one is busy.
    pub completion_workers: usize,
    /// How often the native backend samples the lines for events.
    pub monitor_poll_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            completion_workers: DEFAULT_WORKERS,
            monitor_poll_interval: Duration::from_millis(10),
        }
    }
}

/// State reachable from the monitor and completion workers.
pub(crate) struct StreamShared {
    port_name: String,
    handle: RwLock<Option<Arc<DeviceHandle>>>,
    settings: Mutex<DeviceSettings>,
    events: EventHub,
    /// Held while raising notifications and while the handle is released.
    notify_lock: ReentrantMutex<()>,
    monitor: Arc<MonitorState>,
    binding: IoBinding,
    owned_port: Option<CompletionPort>,
    closing: AtomicBool,
}

impl StreamShared {
    /// Deliver notifications unless the stream is closing or closed.
    pub(crate) fn raise(&self, events: &[SerialEvent]) {
        let _guard = self.notify_lock.lock();
        for event in events {
            if self.closing.load(Ordering::Acquire) || self.handle.read().is_none() {
                return;
            }
            self.events.emit(*event);
        }
    }
}

/// A serial port byte stream.
///
/// Every method takes `&self`, so a stream can be shared between a reader
/// thread and a writer thread behind an `Arc`.
pub struct SerialStream {
    shared: Arc<StreamShared>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialStream {
    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    /// Whether the stream still holds a usable device handle.
    pub fn is_open(&self) -> bool {
        self.shared
            .handle
            .read()
            .as_ref()
            .is_some_and(|handle| handle.is_usable())
    }

    /// Where the event monitor is in its lifecycle.
    pub fn monitor_phase(&self) -> MonitorPhase {
        self.shared.monitor.phase()
    }

    fn handle(&self) -> StreamResult<Arc<DeviceHandle>> {
        match self.shared.handle.read().as_ref() {
            Some(handle) if handle.is_usable() => Ok(Arc::clone(handle)),
            _ => Err(StreamError::NotOpen),
        }
    }

    fn configure<T>(
        &self,
        change: impl FnOnce(&mut DeviceSettings, &DeviceHandle) -> StreamResult<T>,
    ) -> StreamResult<T> {
        let handle = self.handle()?;
        let mut settings = self.shared.settings.lock();
        change(&mut settings, &handle)
    }

    fn settings<T>(&self, view: impl FnOnce(&DeviceSettings) -> T) -> T {
        view(&self.shared.settings.lock())
    }

    // ----- notifications -----

    /// Register an observer for data, pin and error notifications.
    ///
    /// Observers run on a completion worker, never on the monitor thread.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(SerialEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    // ----- configuration -----

    pub fn baud_rate(&self) -> u32 {
        self.settings(DeviceSettings::baud_rate)
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> StreamResult<()> {
        self.configure(|s, h| s.set_baud_rate(h, baud_rate))
    }

    pub fn parity(&self) -> Parity {
        self.settings(DeviceSettings::parity)
    }

    pub fn set_parity(&self, parity: Parity) -> StreamResult<()> {
        self.configure(|s, h| s.set_parity(h, parity))
    }

    pub fn data_bits(&self) -> DataBits {
        self.settings(DeviceSettings::data_bits)
    }

    pub fn set_data_bits(&self, data_bits: DataBits) -> StreamResult<()> {
        self.configure(|s, h| s.set_data_bits(h, data_bits))
    }

    pub fn stop_bits(&self) -> StopBits {
        self.settings(DeviceSettings::stop_bits)
    }

    pub fn set_stop_bits(&self, stop_bits: StopBits) -> StreamResult<()> {
        self.configure(|s, h| s.set_stop_bits(h, stop_bits))
    }

    pub fn handshake(&self) -> Handshake {
        self.settings(DeviceSettings::handshake)
    }

    pub fn set_handshake(&self, handshake: Handshake) -> StreamResult<()> {
        self.configure(|s, h| s.set_handshake(h, handshake))
    }

    pub fn parity_replace(&self) -> u8 {
        self.settings(DeviceSettings::parity_replace)
    }

    pub fn set_parity_replace(&self, byte: u8) -> StreamResult<()> {
        self.configure(|s, h| s.set_parity_replace(h, byte))
    }

    pub fn discard_null(&self) -> bool {
        self.settings(DeviceSettings::discard_null)
    }

    pub fn set_discard_null(&self, discard: bool) -> StreamResult<()> {
        self.configure(|s, h| s.set_discard_null(h, discard))
    }

    pub fn dtr_enable(&self) -> bool {
        self.settings(DeviceSettings::dtr_enable)
    }

    pub fn set_dtr_enable(&self, enable: bool) -> StreamResult<()> {
        self.configure(|s, h| s.set_dtr_enable(h, enable))
    }

    /// Fails with `InvalidOperation` while the handshake drives RTS.
    pub fn rts_enable(&self) -> StreamResult<bool> {
        self.settings(DeviceSettings::rts_enable)
    }

    pub fn set_rts_enable(&self, enable: bool) -> StreamResult<()> {
        self.configure(|s, h| s.set_rts_enable(h, enable))
    }

    pub fn break_state(&self) -> bool {
        self.settings(DeviceSettings::break_state)
    }

    /// Hold the transmit line in the break condition, or release it.
    pub fn set_break_state(&self, on: bool) -> StreamResult<()> {
        self.configure(|s, h| s.set_break_state(h, on))
    }

    pub fn read_timeout(&self) -> Timeout {
        self.settings(DeviceSettings::read_timeout)
    }

    pub fn set_read_timeout(&self, timeout: Timeout) -> StreamResult<()> {
        self.configure(|s, h| s.set_read_timeout(h, timeout))
    }

    pub fn write_timeout(&self) -> Timeout {
        self.settings(DeviceSettings::write_timeout)
    }

    pub fn set_write_timeout(&self, timeout: Timeout) -> StreamResult<()> {
        self.configure(|s, h| s.set_write_timeout(h, timeout))
    }

    /// Driver capabilities captured at open.
    pub fn properties(&self) -> CommProperties {
        self.settings(DeviceSettings::properties)
    }

    // ----- line state -----

    /// Carrier detect.
    pub fn cd_holding(&self) -> StreamResult<bool> {
        let handle = self.handle()?;
        Ok(handle.invoke(|d| d.modem_status())?.rlsd)
    }

    pub fn cts_holding(&self) -> StreamResult<bool> {
        let handle = self.handle()?;
        Ok(handle.invoke(|d| d.modem_status())?.cts)
    }

    pub fn dsr_holding(&self) -> StreamResult<bool> {
        let handle = self.handle()?;
        Ok(handle.invoke(|d| d.modem_status())?.dsr)
    }

    /// Bytes waiting in the driver's receive queue.
    pub fn bytes_to_read(&self) -> StreamResult<u32> {
        let handle = self.handle()?;
        Ok(handle.invoke(|d| d.queue_status())?.in_queue)
    }

    /// Bytes waiting in the driver's transmit queue.
    pub fn bytes_to_write(&self) -> StreamResult<u32> {
        let handle = self.handle()?;
        Ok(handle.invoke(|d| d.queue_status())?.out_queue)
    }
}

impl fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialStream")
            .field("port", &self.shared.port_name)
            .field("open", &self.is_open())
            .field("monitor", &self.monitor_phase())
            .finish()
    }
}
