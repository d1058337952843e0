//! Monitoring events.
//!
//! Runtime anomalies that are recovered locally (an interrupt nobody
//! claimed, a deferred handler that panicked, a scatter-gather map that
//! failed half-way) are not returned to any caller. They are reported as
//! [`Event`]s through an [`EventSink`] supplied by whoever embeds the core.

use core::fmt;

use parking_lot::Mutex;

use crate::id::DeviceId;

/// Kind of a monitoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An interrupt fired and no registered handler claimed it.
    UnclaimedInterrupt,
    /// An immediate interrupt handler panicked.
    ImmediateHandlerPanicked,
    /// A deferred interrupt handler panicked.
    DeferredHandlerPanicked,
    /// A scatter-gather mapping failed part-way and was rolled back.
    PartialMapFailure,
    /// A fatal resource could not be acquired during probe.
    ResourceAcquisitionFailed,
    /// An optional resource (clock, regulator) was not available.
    OptionalResourceMissing,
}

impl EventKind {
    /// Returns the `log` level the event is reported at by [`LogSink`].
    #[must_use]
    pub fn level(self) -> log::Level {
        match self {
            Self::DeferredHandlerPanicked
            | Self::ImmediateHandlerPanicked
            | Self::ResourceAcquisitionFailed => log::Level::Error,
            Self::UnclaimedInterrupt | Self::PartialMapFailure => log::Level::Warn,
            Self::OptionalResourceMissing => log::Level::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnclaimedInterrupt => f.write_str("unclaimed interrupt"),
            Self::ImmediateHandlerPanicked => f.write_str("immediate handler panicked"),
            Self::DeferredHandlerPanicked => f.write_str("deferred handler panicked"),
            Self::PartialMapFailure => f.write_str("partial map failure"),
            Self::ResourceAcquisitionFailed => f.write_str("resource acquisition failed"),
            Self::OptionalResourceMissing => f.write_str("optional resource missing"),
        }
    }
}

/// A single monitoring event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Device the event is attributed to, if known.
    pub device: Option<DeviceId>,
    /// Human-readable detail.
    pub message: String,
}

impl Event {
    /// Creates an event that is not attributed to a device.
    #[must_use]
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            device: None,
            message: message.into(),
        }
    }

    /// Attributes the event to `device`.
    #[must_use]
    pub fn with_device(mut self, device: Option<DeviceId>) -> Self {
        self.device = device;
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(dev) => write!(f, "[{dev}] {}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Receiver of monitoring events.
///
/// `emit` may be called from an immediate interrupt context and must not
/// block for long.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: Event);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events to the `log` facade under the `platdev::event` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        log::log!(target: "platdev::event", event.kind.level(), "{event}");
    }
}

/// Keeps every event in memory. Useful for tests and for post-mortem dumps.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Returns the number of recorded events of the given kind.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Removes and returns all recorded events.
    pub fn take(&self) -> Vec<Event> {
        core::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        log::log!(target: "platdev::event", event.kind.level(), "{event}");
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_and_without_device() {
        let ev = Event::new(EventKind::UnclaimedInterrupt, "line 5");
        assert_eq!(format!("{ev}"), "unclaimed interrupt: line 5");
        let ev = ev.with_device(Some(DeviceId::new(3)));
        assert_eq!(format!("{ev}"), "[dev3] unclaimed interrupt: line 5");
    }

    #[test]
    fn recording_sink_counts_by_kind() {
        let sink = RecordingSink::new();
        sink.emit(Event::new(EventKind::UnclaimedInterrupt, "a"));
        sink.emit(Event::new(EventKind::PartialMapFailure, "b"));
        sink.emit(Event::new(EventKind::UnclaimedInterrupt, "c"));
        assert_eq!(sink.count(EventKind::UnclaimedInterrupt), 2);
        assert_eq!(sink.count(EventKind::PartialMapFailure), 1);
        assert_eq!(sink.take().len(), 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn panics_are_reported_as_errors() {
        assert_eq!(
            EventKind::DeferredHandlerPanicked.level(),
            log::Level::Error
        );
        assert_eq!(EventKind::UnclaimedInterrupt.level(), log::Level::Warn);
    }
}
