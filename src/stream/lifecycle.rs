//! Opening and closing a stream.

use super::{RuntimeOptions, SerialStream, StreamOptions, StreamShared};
use crate::completion::CompletionPort;
use crate::device::{
    DeviceClass, DeviceError, DeviceErrorKind, DeviceHandle, EscapeFunction, EventMask,
    NativeDevice, Purge, SerialDevice,
};
use crate::error::{StreamError, StreamResult};
use crate::events::EventHub;
use crate::monitor::{EventLoopRunner, MonitorState};
use crate::settings::DeviceSettings;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// How much a close may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    /// Explicit close: report failures and join the monitor.
    Deterministic,
    /// Drop: suppress failures and leave the monitor to exit on its own.
    BestEffort,
}

/// Check a port name before any device is touched.
pub fn validate_port_name(name: &str) -> StreamResult<()> {
    check_designation(name)?;
    #[cfg(windows)]
    {
        let upper = name.to_ascii_uppercase();
        let bare = upper.strip_prefix(r"\\.\").unwrap_or(&upper);
        let is_com = bare
            .strip_prefix("COM")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_com {
            return Err(StreamError::InvalidArgument(format!(
                "port name {name} must be of the form COMn"
            )));
        }
    }
    Ok(())
}

fn check_designation(name: &str) -> StreamResult<()> {
    if name.is_empty() {
        return Err(StreamError::InvalidArgument(
            "port name must not be empty".to_string(),
        ));
    }
    if name.contains('\0') {
        return Err(StreamError::InvalidArgument(format!(
            "port name {name:?} contains a NUL character"
        )));
    }
    Ok(())
}

/// Probe failures that mean the handle is not a serial adapter.
fn not_a_serial_port(name: &str, err: DeviceError) -> StreamError {
    match err.kind() {
        DeviceErrorKind::InvalidParameter | DeviceErrorKind::InvalidHandle => {
            StreamError::InvalidArgument(format!("{name} is not a serial port"))
        }
        _ => err.into(),
    }
}

impl SerialStream {
    /// Open a named port with default runtime settings.
    ///
    /// # Example
    /// ```no_run
    /// use serial_stream::{SerialStream, StreamOptions, Timeout};
    ///
    /// let options = StreamOptions {
    ///     baud_rate: 115_200,
    ///     read_timeout: Timeout::Millis(500),
    ///     ..StreamOptions::default()
    /// };
    /// let stream = SerialStream::open("/dev/ttyUSB0", &options)?;
    /// stream.write(b"AT\r", 0, 3)?;
    /// # Ok::<(), serial_stream::StreamError>(())
    /// ```
    pub fn open(port_name: &str, options: &StreamOptions) -> StreamResult<Self> {
        Self::open_with_runtime(port_name, options, &RuntimeOptions::default())
    }

    /// Open a named port, starting a private completion port sized by `runtime`.
    pub fn open_with_runtime(
        port_name: &str,
        options: &StreamOptions,
        runtime: &RuntimeOptions,
    ) -> StreamResult<Self> {
        validate_port_name(port_name)?;
        let device = NativeDevice::open(port_name, runtime.monitor_poll_interval)?;
        let port = CompletionPort::named("serial-completion", runtime.completion_workers)?;
        Self::open_inner(Arc::new(device), options, port, true)
    }

    /// Open a stream over an already acquired device.
    pub fn open_device(device: Arc<dyn SerialDevice>, options: &StreamOptions) -> StreamResult<Self> {
        let runtime = RuntimeOptions::default();
        let port = match CompletionPort::named("serial-completion", runtime.completion_workers) {
            Ok(port) => port,
            Err(err) => {
                device.close();
                return Err(err.into());
            }
        };
        Self::open_inner(device, options, port, true)
    }

    /// Open a stream over `device`, delivering completions on a shared port.
    ///
    /// The port is not shut down when the stream closes.
    pub fn open_device_on(
        device: Arc<dyn SerialDevice>,
        options: &StreamOptions,
        port: &CompletionPort,
    ) -> StreamResult<Self> {
        Self::open_inner(device, options, port.clone(), false)
    }

    fn open_inner(
        device: Arc<dyn SerialDevice>,
        options: &StreamOptions,
        port: CompletionPort,
        owned: bool,
    ) -> StreamResult<Self> {
        let handle = Arc::new(DeviceHandle::new(device));
        match Self::initialize(&handle, options, &port, owned) {
            Ok(stream) => Ok(stream),
            Err(err) => {
                warn!(port = %handle.name(), error = %err, "open failed; releasing device");
                handle.close();
                if owned {
                    port.shutdown();
                }
                Err(err)
            }
        }
    }

    fn initialize(
        handle: &Arc<DeviceHandle>,
        options: &StreamOptions,
        port: &CompletionPort,
        owned: bool,
    ) -> StreamResult<Self> {
        let name = handle.name().to_string();
        check_designation(&name)?;

        if handle.device().device_class() == DeviceClass::Other {
            return Err(StreamError::InvalidArgument(format!(
                "{name} is not a serial port"
            )));
        }
        let properties = handle
            .invoke(|d| d.properties())
            .map_err(|err| not_a_serial_port(&name, err))?;
        handle
            .invoke(|d| d.modem_status())
            .map_err(|err| not_a_serial_port(&name, err))?;

        let binding = port.bind();
        let settings = DeviceSettings::initialize(handle, options, properties)?;

        if let Some((read_size, write_size)) = options.buffer_sizes {
            super::io::check_buffer_sizes(read_size, write_size)?;
            handle.invoke(|d| d.setup_buffers(read_size, write_size))?;
        }

        handle.invoke(|d| d.set_event_mask(EventMask::ALL))?;

        let monitor = Arc::new(MonitorState::new());
        let shared = Arc::new(StreamShared {
            port_name: name.clone(),
            handle: RwLock::new(Some(Arc::clone(handle))),
            settings: Mutex::new(settings),
            events: EventHub::new(),
            notify_lock: ReentrantMutex::new(()),
            monitor: Arc::clone(&monitor),
            binding: binding.clone(),
            owned_port: owned.then(|| port.clone()),
            closing: AtomicBool::new(false),
        });

        let runner = EventLoopRunner::new(
            Arc::clone(handle),
            Arc::downgrade(&shared),
            monitor,
            binding,
        );
        let task = runner.spawn()?;

        info!(
            port = %name,
            baud = options.baud_rate,
            handshake = ?options.handshake,
            "serial stream opened"
        );
        Ok(Self {
            shared,
            monitor_task: Mutex::new(Some(task)),
        })
    }

    /// Close the stream.
    ///
    /// Teardown always runs to completion; the first failure that is not a
    /// disconnect is reported afterwards. Closing twice is a no-op.
    pub fn close(&self) -> StreamResult<()> {
        self.shutdown(CloseMode::Deterministic)
    }

    fn shutdown(&self, mode: CloseMode) -> StreamResult<()> {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(handle) = shared.handle.read().clone() else {
            return Ok(());
        };
        let port = handle.name().to_string();
        let mut first_error: Option<StreamError> = None;
        let mut record = |step: &'static str, err: DeviceError| match mode {
            CloseMode::Deterministic => {
                warn!(%port, step, error = %err, "close step failed");
                first_error.get_or_insert(err.into());
            }
            CloseMode::BestEffort => {
                debug!(%port, step, error = %err, "close step failed; ignored");
            }
        };

        shared.monitor.request_shutdown();
        if let Err(err) = handle.invoke(|d| d.set_event_mask(EventMask::empty())) {
            debug!(%port, error = %err, "could not disarm events");
        }

        let mut skip_device = false;
        match handle.invoke(|d| d.escape(EscapeFunction::ClearDtr)) {
            Ok(()) => {}
            Err(err) if err.kind().is_disconnect() || err.kind() == DeviceErrorKind::Closed => {
                warn!(%port, error = %err, "device unavailable during close; skipping flush and purge");
                skip_device = true;
            }
            Err(err) => {
                if mode == CloseMode::BestEffort {
                    skip_device = true;
                }
                record("clear_dtr", err);
            }
        }

        if !skip_device && handle.is_usable() {
            if let Err(err) = handle.invoke(|d| d.flush()) {
                record("flush", err);
            }
        }

        shared.monitor.signal();

        if !skip_device {
            for purge in [Purge::AbortInput, Purge::AbortOutput] {
                if let Err(err) = handle.invoke(|d| d.purge(purge)) {
                    if err.kind() != DeviceErrorKind::Closed {
                        record("purge", err);
                    }
                }
            }
        }

        if mode == CloseMode::Deterministic {
            self.join_monitor(&port);
        }

        // Closing the device fails any transfer still blocked in it, including
        // one issued by an observer that is holding the notification lock.
        handle.close();
        {
            let _guard = shared.notify_lock.lock();
            shared.handle.write().take();
            shared.binding.release();
        }

        if let Some(owned) = &shared.owned_port {
            owned.shutdown();
        }

        info!(%port, ?mode, "serial stream closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn join_monitor(&self, port: &str) {
        let Some(task) = self.monitor_task.lock().take() else {
            return;
        };
        if task.thread().id() == thread::current().id() {
            return;
        }
        if task.join().is_err() {
            warn!(%port, "event monitor panicked");
        }
    }
}

impl Drop for SerialStream {
    fn drop(&mut self) {
        let _ = self.shutdown(CloseMode::BestEffort);
    }
}
