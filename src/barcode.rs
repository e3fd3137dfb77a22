//! Barcode channel payloads

use crate::types::{DecodeError, byte_at};

pub const STATUS: u8 = 0x90;
pub const DATA: u8 = 0x91;

/// Terminates the last fragment of a scan
pub const TERMINATOR: u8 = 0x0D;
/// Sent by the engine in place of data when a scan is cancelled
pub const CANCEL_SENTINEL: char = '\u{06}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarcodeStatus {
    PoweredOn,
    PoweredOff,
    TriggerAccepted,
}

/// Decode a `0x90` status payload
pub fn decode_status(payload: &[u8]) -> Result<Option<BarcodeStatus>, DecodeError> {
    let status = match (byte_at(payload, 1)?, byte_at(payload, 2)?) {
        (0x00, 0x00) => Some(BarcodeStatus::PoweredOn),
        (0x01, 0x00) => Some(BarcodeStatus::PoweredOff),
        (0x02, 0x00) => Some(BarcodeStatus::TriggerAccepted),
        _ => None,
    };
    Ok(status)
}

/// A `0x91 0x00` scan is split over several frames when it is longer than
/// three bytes and not yet terminated
pub fn is_multi_fragment(payload: &[u8]) -> bool {
    payload.len() > 3 && payload.last() != Some(&TERMINATOR)
}

/// True when the text of a first fragment means "no scan"
pub fn is_cancelled(text: &str) -> bool {
    text.trim().is_empty() || text.contains(CANCEL_SENTINEL)
}
