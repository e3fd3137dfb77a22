//! Events published by the driver

use crossbeam::channel::Sender;

use crate::types::{ButtonState, ConnectionState, Reading};

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Reading(Reading),
    /// Battery level in percent (0-100)
    BatteryChanged(u8),
    VersionStringChanged(String),
    Button(ButtonState),
    ConnectionStateChanged(ConnectionState),
    /// `true` while inventory parameters are being pushed to the reader
    Configuring(bool),
}

/// Receives every event the driver produces.
///
/// Called from the driver's worker threads; implementations must not block
/// for long.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: ReaderEvent);
}

impl EventSink for Sender<ReaderEvent> {
    fn publish(&self, event: ReaderEvent) {
        if self.send(event).is_err() {
            log::debug!("Event receiver dropped");
        }
    }
}
