//! Notification channel decoding and trigger debounce

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::debug;

use crate::types::{DecodeError, byte_at, bytes_to_hex, u16_be_at};

pub const BATTERY: u8 = 0xA0;
pub const TRIGGER: u8 = 0xA1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BatteryVoltage { millivolts: u16 },
    TriggerPressed,
    TriggerReleased,
    /// Error report from the reader, payload as hex
    Error(String),
}

/// Decode a notification payload. Unknown codes yield `None`.
pub fn decode_notification(payload: &[u8]) -> Result<Option<Notification>, DecodeError> {
    let notification = match (byte_at(payload, 0)?, byte_at(payload, 1)?) {
        (BATTERY, 0x00) => Some(Notification::BatteryVoltage {
            millivolts: u16_be_at(payload, 2)?,
        }),
        (TRIGGER, 0x01) => Some(Notification::Error(bytes_to_hex(&payload[2..]))),
        (TRIGGER, 0x02) => Some(Notification::TriggerPressed),
        (TRIGGER, 0x03) => Some(Notification::TriggerReleased),
        _ => None,
    };
    Ok(notification)
}

/// Resolved trigger gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Press {
    Single,
    Double,
}

/// Result of a trigger release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// No press is waiting to be resolved
    pub idle: bool,
}

/// Debounces trigger presses into single and double presses.
///
/// Every press arms a deadline one window later. When a deadline passes the
/// number of presses seen so far decides the gesture and the count resets, so
/// two presses inside one window resolve to a double press and the second
/// deadline finds nothing to do.
#[derive(Debug)]
pub struct ButtonTracker {
    window: Duration,
    pressed: bool,
    press_count: u32,
    deadlines: VecDeque<Instant>,
}

impl ButtonTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pressed: false,
            press_count: 0,
            deadlines: VecDeque::new(),
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    pub fn press_count(&self) -> u32 {
        self.press_count
    }

    pub fn press(&mut self, now: Instant) {
        self.pressed = true;
        self.press_count += 1;
        self.deadlines.push_back(now + self.window);
        debug!("Trigger pressed ({} in window)", self.press_count);
    }

    pub fn release(&mut self) -> Release {
        self.pressed = false;
        Release {
            idle: self.press_count == 0,
        }
    }

    /// Fire every deadline at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<Press> {
        let mut presses = Vec::new();
        while self.deadlines.front().is_some_and(|deadline| *deadline <= now) {
            self.deadlines.pop_front();
            match self.press_count {
                0 => {}
                1 => presses.push(Press::Single),
                2 => presses.push(Press::Double),
                n => debug!("Ignoring {} presses in one window", n),
            }
            self.press_count = 0;
        }
        presses
    }

    /// Drop pending deadlines (e.g. after a disconnect)
    pub fn reset(&mut self) {
        self.pressed = false;
        self.press_count = 0;
        self.deadlines.clear();
    }
}
