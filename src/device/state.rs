use std::time::Instant;

use super::DeviceStateValue;

/// How an observation relates to the previous belief about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    InitialObservation,
    Unchanged,
    Changed,
}

/// The engine's belief about the device: last observed value plus whether
/// anything has been observed at all. Written only from the inbound-message
/// path; everyone else takes snapshots.
#[derive(Debug, Default)]
pub struct ObservedState {
    received: bool,
    value: Option<DeviceStateValue>,
    last_changed_at: Option<Instant>,
}

impl ObservedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation and classify it. `last_changed_at` moves only
    /// when the value actually changes, not on every message.
    pub fn observe(&mut self, value: DeviceStateValue) -> TransitionKind {
        let kind = match self.value {
            None => TransitionKind::InitialObservation,
            Some(prev) if prev == value => TransitionKind::Unchanged,
            Some(_) => TransitionKind::Changed,
        };
        if kind != TransitionKind::Unchanged {
            self.last_changed_at = Some(Instant::now());
        }
        self.received = true;
        self.value = Some(value);
        kind
    }

    pub fn received(&self) -> bool {
        self.received
    }

    /// Last known value; `None` until the first valid observation.
    pub fn value(&self) -> Option<DeviceStateValue> {
        self.value
    }

    pub fn last_changed_at(&self) -> Option<Instant> {
        self.last_changed_at
    }
}
