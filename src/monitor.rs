//! Event monitor loop.
//!
//! One dedicated thread per open stream waits for hardware events, drains
//! the error latch when needed and hands classified notifications to the
//! completion port. The loop holds only a weak reference to the stream, so
//! it never keeps a dropped stream alive.

use crate::completion::IoBinding;
use crate::device::{DeviceErrorKind, DeviceHandle, EventMask};
use crate::events::{classify_data, classify_errors, classify_pins, SerialEvent};
use crate::signal::WaitSignal;
use crate::stream::StreamShared;
use std::sync::atomic::{self, AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Lifecycle of the monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Running,
    /// Shutdown was requested; the loop has not exited yet.
    Draining,
    Stopped,
}

impl MonitorPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::Stopped => 2,
        }
    }
}

/// State shared between the monitor thread and the lifecycle coordinator.
#[derive(Debug)]
pub(crate) struct MonitorState {
    shutdown: AtomicBool,
    phase: AtomicU8,
    wait: WaitSignal,
}

impl MonitorState {
    pub(crate) fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            phase: AtomicU8::new(MonitorPhase::Running.as_u8()),
            wait: WaitSignal::new(),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ask the loop to stop. It exits at its next check.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        atomic::fence(Ordering::SeqCst);
        let _ = self.phase.compare_exchange(
            MonitorPhase::Running.as_u8(),
            MonitorPhase::Draining.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Unblock a pending hardware event wait.
    pub(crate) fn signal(&self) {
        self.wait.set();
    }

    pub(crate) fn phase(&self) -> MonitorPhase {
        MonitorPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn stopped(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.phase
            .store(MonitorPhase::Stopped.as_u8(), Ordering::Release);
    }
}

/// The monitor loop body.
pub(crate) struct EventLoopRunner {
    handle: Arc<DeviceHandle>,
    stream: Weak<StreamShared>,
    state: Arc<MonitorState>,
    binding: IoBinding,
}

impl EventLoopRunner {
    pub(crate) fn new(
        handle: Arc<DeviceHandle>,
        stream: Weak<StreamShared>,
        state: Arc<MonitorState>,
        binding: IoBinding,
    ) -> Self {
        Self {
            handle,
            stream,
            state,
            binding,
        }
    }

    /// Start the loop on its own thread.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("serial-events".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let port = self.handle.name().to_string();
        debug!(%port, "event monitor started");

        while !self.state.is_shutdown() {
            self.state.wait.reset();
            if self.state.is_shutdown() {
                break;
            }

            match self.handle.invoke(|d| d.wait_event(&self.state.wait)) {
                Ok(mask) => {
                    if !mask.is_empty() && !self.state.is_shutdown() {
                        self.call_events(mask);
                    }
                }
                Err(err) if err.kind().is_disconnect() => {
                    warn!(%port, error = %err, "device disconnected; event monitor stopping");
                    self.state.request_shutdown();
                    break;
                }
                Err(err)
                    if err.kind() == DeviceErrorKind::InvalidParameter
                        && self.state.is_shutdown() =>
                {
                    break;
                }
                Err(err) if err.kind() == DeviceErrorKind::Closed => break,
                Err(err) => {
                    warn!(%port, error = %err, "event wait failed; event monitor stopping");
                    self.state.request_shutdown();
                    break;
                }
            }
        }

        self.state.stopped();
        debug!(%port, "event monitor stopped");
    }

    /// Classify one event mask and queue its notifications.
    fn call_events(&self, mask: EventMask) {
        let mut events = Vec::new();

        if mask.intersects(EventMask::ERR | EventMask::RXCHAR) {
            match self.handle.invoke(|d| d.clear_errors()) {
                Ok((errors, _status)) => {
                    events.extend(
                        classify_errors(&errors)
                            .into_iter()
                            .map(SerialEvent::ErrorReceived),
                    );
                }
                Err(err) => {
                    warn!(port = %self.handle.name(), error = %err, "failed to drain line errors; event monitor stopping");
                    self.state.request_shutdown();
                    return;
                }
            }
        }

        events.extend(classify_pins(mask).into_iter().map(SerialEvent::PinChanged));
        events.extend(classify_data(mask).into_iter().map(SerialEvent::DataReceived));
        if events.is_empty() {
            return;
        }

        let stream = Weak::clone(&self.stream);
        let queued = self.binding.dispatch(move || {
            if let Some(stream) = stream.upgrade() {
                stream.raise(&events);
            }
        });
        if !queued {
            debug!(port = %self.handle.name(), "completion port closed; notifications dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_moves_to_draining() {
        let state = MonitorState::new();
        assert_eq!(state.phase(), MonitorPhase::Running);

        state.request_shutdown();
        assert!(state.is_shutdown());
        assert_eq!(state.phase(), MonitorPhase::Draining);

        state.stopped();
        state.request_shutdown();
        assert_eq!(state.phase(), MonitorPhase::Stopped);
    }
}
