//! Packet codec for the CS108 BLE link.
//!
//! Every downlink write is an 8-byte header followed by the payload:
//!
//! | Byte | Field            |
//! |------|------------------|
//! | 0    | prefix (`0xA7`)  |
//! | 1    | connection type  |
//! | 2    | payload length   |
//! | 3    | channel          |
//! | 4    | reserved         |
//! | 5    | link direction   |
//! | 6-7  | CRC (zero = off) |
//!
//! Register requests sent to the RFID module swap the byte order of the
//! address and (by default) the data word relative to the register map.

use crate::types::{DecodeError, ReaderError, byte_at};

pub const PREFIX: u8 = 0xA7;
pub const CONNECTION_BLUETOOTH: u8 = 0xB3;
pub const RESERVE: u8 = 0x82;
pub const DIRECTION_DOWN: u8 = 0x37;
pub const DIRECTION_UP: u8 = 0x9E;
pub const HEADER_LEN: usize = 8;

/// Firmware command opcode for the RFID module
pub const RFID_COMMAND: [u8; 2] = [0x80, 0x02];
pub const REG_REQ: u8 = 0x70;

pub const RFID_POWER_ON: [u8; 2] = [0x80, 0x00];
pub const RFID_POWER_OFF: [u8; 2] = [0x80, 0x01];
pub const BARCODE_POWER_ON: [u8; 2] = [0x90, 0x00];
pub const BARCODE_POWER_OFF: [u8; 2] = [0x90, 0x01];
pub const BARCODE_RAW_DATA: [u8; 2] = [0x90, 0x03];
pub const BATTERY_VOLTAGE: [u8; 2] = [0xA0, 0x00];

// Barcode engine serial commands, wrapped in BARCODE_RAW_DATA
pub const BARCODE_CMD_START_CONTINUE_MODE: &[u8] = &[0x1B, 0x33];
pub const BARCODE_CMD_STOP_CONTINUE_MODE: &[u8] = &[0x1B, 0x30];
pub const BARCODE_CMD_SYS_MODE_ENTER: &[u8] = b"nls0006010;";
pub const BARCODE_CMD_SCAN_CYCLE_TIME_3000: &[u8] = b"nls0313030=3000;";
pub const BARCODE_CMD_PERM_TRIGGER_MODE: &[u8] = b"nls0302000;";
pub const BARCODE_CMD_SYS_MODE_EXIT: &[u8] = b"nls0006000;";

/// Destination / source of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Rfid = 0xC2,
    Barcode = 0x6A,
    Notify = 0xD9,
    Silab = 0xE8,
    Bluetooth = 0x5F,
}

impl Channel {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xC2 => Some(Self::Rfid),
            0x6A => Some(Self::Barcode),
            0xD9 => Some(Self::Notify),
            0xE8 => Some(Self::Silab),
            0x5F => Some(Self::Bluetooth),
            _ => None,
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub prefix: u8,
    pub connection_type: u8,
    pub payload_len: u8,
    /// Raw channel byte; see [`FrameHeader::channel`]
    pub channel_byte: u8,
    /// Reserved on the downlink, a sequence number on the uplink
    pub reserved: u8,
    pub direction: u8,
    pub crc: [u8; 2],
}

impl FrameHeader {
    pub fn channel(&self) -> Option<Channel> {
        Channel::from_byte(self.channel_byte)
    }
}

/// Build a downlink frame around `payload`
pub fn build_frame(payload: &[u8], channel: Channel) -> Result<Vec<u8>, ReaderError> {
    let len = u8::try_from(payload.len()).map_err(|_| ReaderError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[
        PREFIX,
        CONNECTION_BLUETOOTH,
        len,
        channel as u8,
        RESERVE,
        DIRECTION_DOWN,
        0x00, // CRC disabled
        0x00,
    ]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse the 8-byte header at the start of `frame`
pub fn parse_header(frame: &[u8]) -> Result<FrameHeader, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            len: frame.len(),
        });
    }
    Ok(FrameHeader {
        prefix: frame[0],
        connection_type: frame[1],
        payload_len: frame[2],
        channel_byte: frame[3],
        reserved: frame[4],
        direction: frame[5],
        crc: [frame[6], frame[7]],
    })
}

/// A read or write of one 32-bit RFID module register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRequest {
    pub write: bool,
    pub address: u16,
    pub data: u32,
    /// When false the data word is sent in natural (MSB-first) order
    pub reverse_data: bool,
}

impl RegisterRequest {
    pub const LEN: usize = 10;

    pub fn write(address: u16, data: u32) -> Self {
        Self {
            write: true,
            address,
            data,
            reverse_data: true,
        }
    }

    /// Register write whose data is already in wire order (mask and tag-write registers)
    pub fn write_raw(address: u16, data: u32) -> Self {
        Self {
            reverse_data: false,
            ..Self::write(address, data)
        }
    }

    pub fn read(address: u16) -> Self {
        Self {
            write: false,
            ..Self::write(address, 0)
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        build_register_request(self.write, self.address, self.data, self.reverse_data)
    }

    /// Decode a request built by [`build_register_request`]. The caller states
    /// whether the data word was reversed, as it is not recorded on the wire.
    pub fn parse(bytes: &[u8], reverse_data: bool) -> Result<Self, DecodeError> {
        if bytes.len() < Self::LEN {
            return Err(DecodeError::Truncated {
                needed: Self::LEN,
                len: bytes.len(),
            });
        }
        let address = u16::from_le_bytes([bytes[4], bytes[5]]);
        let word = [bytes[6], bytes[7], bytes[8], bytes[9]];
        let data = if reverse_data {
            u32::from_le_bytes(word)
        } else {
            u32::from_be_bytes(word)
        };
        Ok(Self {
            write: byte_at(bytes, 3)? != 0,
            address,
            data,
            reverse_data,
        })
    }
}

/// Build the RFID firmware payload for a register read or write
pub fn build_register_request(
    write: bool,
    address: u16,
    data: u32,
    reverse_data: bool,
) -> [u8; RegisterRequest::LEN] {
    let mut out = [0u8; RegisterRequest::LEN];
    out[..2].copy_from_slice(&RFID_COMMAND);
    out[2] = REG_REQ;
    out[3] = u8::from(write);
    out[4..6].copy_from_slice(&address.to_le_bytes());
    if reverse_data {
        out[6..].copy_from_slice(&data.to_le_bytes());
    } else {
        out[6..].copy_from_slice(&data.to_be_bytes());
    }
    out
}

/// Payloads understood by the RFID module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfidCommand {
    PowerOn,
    PowerOff,
    Register(RegisterRequest),
    Abort,
    Reset,
}

impl RfidCommand {
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Self::PowerOn => RFID_POWER_ON.to_vec(),
            Self::PowerOff => RFID_POWER_OFF.to_vec(),
            Self::Register(request) => request.to_bytes().to_vec(),
            Self::Abort => Self::control(0x03),
            Self::Reset => Self::control(0x02),
        }
    }

    fn control(kind: u8) -> Vec<u8> {
        let mut payload = RFID_COMMAND.to_vec();
        payload.extend_from_slice(&[0x40, kind, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        payload
    }

    pub fn frame(&self) -> Result<Vec<u8>, ReaderError> {
        build_frame(&self.payload(), Channel::Rfid)
    }
}

impl From<RegisterRequest> for RfidCommand {
    fn from(request: RegisterRequest) -> Self {
        Self::Register(request)
    }
}

/// Payload wrapping a raw barcode engine command
pub fn barcode_raw(command: &[u8]) -> Vec<u8> {
    let mut payload = BARCODE_RAW_DATA.to_vec();
    payload.extend_from_slice(command);
    payload
}
