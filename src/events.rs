//! Notifications raised by an open stream.
//!
//! The monitor classifies each hardware event mask into three independent
//! categories and raises one notification per recognised reason, in a fixed
//! order within each category.

use crate::device::{EventMask, LineErrors};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transport error reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialError {
    /// The transmit buffer is full.
    TxFull,
    /// The receive buffer overflowed.
    RxOver,
    /// A character-buffer overrun; the next character is lost.
    Overrun,
    /// A parity error was detected.
    RxParity,
    /// A framing error was detected.
    Frame,
}

/// Pin and line change reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialPinChange {
    CtsChanged,
    DsrChanged,
    /// Carrier detect changed.
    CdChanged,
    Ring,
    Break,
}

/// Received-data reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialData {
    /// Characters were received.
    Chars,
    /// The end-of-file character was received.
    Eof,
}

/// A notification delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialEvent {
    DataReceived(SerialData),
    PinChanged(SerialPinChange),
    ErrorReceived(SerialError),
}

/// Error notifications for drained line errors, in raise order.
pub fn classify_errors(errors: &LineErrors) -> Vec<SerialError> {
    [
        (errors.tx_full, SerialError::TxFull),
        (errors.rx_over, SerialError::RxOver),
        (errors.overrun, SerialError::Overrun),
        (errors.rx_parity, SerialError::RxParity),
        (errors.frame, SerialError::Frame),
    ]
    .into_iter()
    .filter_map(|(set, reason)| set.then_some(reason))
    .collect()
}

/// Pin notifications for an event mask, in raise order.
pub fn classify_pins(mask: EventMask) -> Vec<SerialPinChange> {
    [
        (EventMask::CTS, SerialPinChange::CtsChanged),
        (EventMask::DSR, SerialPinChange::DsrChanged),
        (EventMask::RLSD, SerialPinChange::CdChanged),
        (EventMask::RING, SerialPinChange::Ring),
        (EventMask::BREAK, SerialPinChange::Break),
    ]
    .into_iter()
    .filter_map(|(bit, reason)| mask.contains(bit).then_some(reason))
    .collect()
}

/// Data notifications for an event mask, in raise order.
pub fn classify_data(mask: EventMask) -> Vec<SerialData> {
    [
        (EventMask::RXCHAR, SerialData::Chars),
        (EventMask::RXFLAG, SerialData::Eof),
    ]
    .into_iter()
    .filter_map(|(bit, reason)| mask.contains(bit).then_some(reason))
    .collect()
}

/// Identifies an observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(SerialEvent) + Send + Sync>;

/// Observer registry.
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It is called on a completion worker thread.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(SerialEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.read().is_empty()
    }

    /// Deliver `event` to every observer.
    ///
    /// Observers are snapshotted first, so one may unsubscribe itself.
    pub fn emit(&self, event: SerialEvent) {
        let observers: Vec<Observer> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(event);
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_error_order() {
        let errors = LineErrors {
            frame: true,
            overrun: true,
            rx_over: false,
            rx_parity: true,
            tx_full: true,
        };

        assert_eq!(
            classify_errors(&errors),
            vec![
                SerialError::TxFull,
                SerialError::Overrun,
                SerialError::RxParity,
                SerialError::Frame
            ]
        );
    }

    #[test]
    fn test_pin_and_data_classification() {
        let mask = EventMask::BREAK | EventMask::CTS | EventMask::RLSD | EventMask::RXFLAG;

        assert_eq!(
            classify_pins(mask),
            vec![
                SerialPinChange::CtsChanged,
                SerialPinChange::CdChanged,
                SerialPinChange::Break
            ]
        );
        assert_eq!(classify_data(mask), vec![SerialData::Eof]);
        assert!(classify_data(EventMask::CTS).is_empty());
    }

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = hub.subscribe(move |event| sink.lock().push(event));
        hub.emit(SerialEvent::DataReceived(SerialData::Chars));

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(SerialEvent::PinChanged(SerialPinChange::Ring));

        assert_eq!(
            *seen.lock(),
            vec![SerialEvent::DataReceived(SerialData::Chars)]
        );
    }
}
