//! Types for reader operations

use thiserror::Error;

/// Source of a [`Reading`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    Rfid,
    Barcode,
}

/// A decoded tag or barcode read.
///
/// Readings are built once a logical packet has been fully reassembled and are
/// handed to the event sink by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: ReadingKind,
    /// EPC as an uppercase hex string (empty for barcodes)
    pub tag_id: String,
    /// Protocol Control word as an uppercase hex string (empty for barcodes)
    pub pc: String,
    /// Narrowband RSSI in dBm (0 for barcodes)
    pub rssi: i32,
    /// Barcode payload (empty for RFID reads)
    pub asset_number: String,
}

impl Reading {
    pub(crate) fn rfid(tag_id: String, pc: String, rssi: i32) -> Self {
        Self {
            kind: ReadingKind::Rfid,
            tag_id,
            pc,
            rssi,
            asset_number: String::new(),
        }
    }

    pub(crate) fn barcode(asset_number: String) -> Self {
        Self {
            kind: ReadingKind::Barcode,
            tag_id: String::new(),
            pc: String::new(),
            rssi: 0,
            asset_number,
        }
    }
}

/// Trigger button report published to the event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Off,
    Single,
    Double,
}

/// Link state reported by the BLE collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Both the uplink and downlink characteristics are available
    Ready,
    Disconnected,
}

/// Gen2 tag memory banks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gen2MemoryBank {
    Reserved = 0x00,
    Epc = 0x01,
    Tid = 0x02,
    User = 0x03,
}

/// Anti-collision algorithm used during inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QAlgorithm {
    Fixed,
    #[default]
    Dynamic,
}

/// Gen2 inventoried flag to query for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InventoryTarget {
    #[default]
    A,
    B,
}

/// Inventory session parameters set through `set_rfid_parameters`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfidParameters {
    /// Gen2 session (0-3)
    pub session: u8,
    pub target: InventoryTarget,
    pub q_algorithm: QAlgorithm,
    /// Starting Q (0-15)
    pub q: u8,
}

impl Default for RfidParameters {
    fn default() -> Self {
        Self {
            session: 0,
            target: InventoryTarget::A,
            q_algorithm: QAlgorithm::Dynamic,
            q: 7,
        }
    }
}

/// Errors returned by reader operations
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Transport layer error (BLE write failed)
    #[error("transport error: {0}")]
    Transport(String),
    /// Invalid parameter passed to a function
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Frame payloads carry a single length byte
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
    #[error("reader is not connected")]
    NotConnected,
    /// A worker queue was closed (driver shut down)
    #[error("command queue closed")]
    QueueClosed,
    /// The command queue stayed full for the whole enqueue timeout
    #[error("command queue full")]
    QueueFull,
    #[error("worker error: {0}")]
    Worker(String),
}

/// Reasons an uplink packet could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet truncated: needed {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },
    #[error("implausible packet length {0}")]
    OversizeLength(u16),
    #[error("EPC end index {end} outside payload of {len} bytes")]
    EpcOutOfBounds { end: usize, len: usize },
    #[error("barcode payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Convert bytes to uppercase hex string
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Bounds-checked byte access used by all decoders
pub(crate) fn byte_at(data: &[u8], index: usize) -> Result<u8, DecodeError> {
    data.get(index).copied().ok_or(DecodeError::Truncated {
        needed: index + 1,
        len: data.len(),
    })
}

/// Little-endian 16-bit word at `index`
pub(crate) fn u16_le_at(data: &[u8], index: usize) -> Result<u16, DecodeError> {
    Ok(u16::from(byte_at(data, index)?) | (u16::from(byte_at(data, index + 1)?) << 8))
}

/// Big-endian 16-bit word at `index`
pub(crate) fn u16_be_at(data: &[u8], index: usize) -> Result<u16, DecodeError> {
    Ok((u16::from(byte_at(data, index)?) << 8) | u16::from(byte_at(data, index + 1)?))
}

/// An EPC left-padded to whole 16-bit words together with its PC word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedEpc {
    /// Uppercase hex, length a multiple of 4
    pub epc: String,
    /// PC word as 4 uppercase hex digits
    pub pc: String,
}

impl PaddedEpc {
    /// Longest EPC the 5-bit PC length field can describe
    const MAX_WORDS: usize = 31;

    pub fn from_hex(epc: &str) -> Result<Self, ReaderError> {
        let epc = epc.trim();
        if !epc.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReaderError::InvalidParameter(format!(
                "EPC is not a hex string: {epc:?}"
            )));
        }

        let words = epc.len().div_ceil(4);
        if words > Self::MAX_WORDS {
            return Err(ReaderError::InvalidParameter(format!(
                "EPC of {} words exceeds {} words",
                words,
                Self::MAX_WORDS
            )));
        }

        let padded = format!("{:0>width$}", epc.to_ascii_uppercase(), width = words * 4);
        Ok(Self {
            epc: padded,
            pc: format!("{:04X}", (words as u16) << 11),
        })
    }
}

/// Parse an optional hex access password (empty means 0)
pub(crate) fn parse_access_password(password: &str) -> Result<u32, ReaderError> {
    let password = password.trim();
    if password.is_empty() {
        return Ok(0);
    }
    if password.len() > 8 {
        return Err(ReaderError::InvalidParameter(
            "Access password is longer than 8 hex digits".into(),
        ));
    }
    u32::from_str_radix(password, 16)
        .map_err(|e| ReaderError::InvalidParameter(format!("Access password: {e}")))
}
