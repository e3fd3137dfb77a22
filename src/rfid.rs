//! RFID channel packet decoding.
//!
//! Uplink RFID payloads start with a two-byte module code. `0x80 xx` are
//! responses to module power and firmware commands; `0x81 0x00` carries a
//! firmware packet with an 8-byte little-endian header:
//!
//! | Byte | Field                         |
//! |------|-------------------------------|
//! | 0    | packet version                |
//! | 1    | flags                         |
//! | 2-3  | packet type                   |
//! | 4-5  | length (words or bytes)       |
//! | 6-7  | reserved                      |
//!
//! Payload CRCs are not verified.

use log::{debug, warn};

use crate::types::{DecodeError, Reading, byte_at, bytes_to_hex, u16_be_at, u16_le_at};

pub const MODULE_RESPONSE: u8 = 0x80;
pub const MODULE_UPLINK: u8 = 0x81;

pub const VERSION_INFO: u8 = 0x00;
pub const VERSION_TAG_ACCESS: u8 = 0x01;
pub const VERSION_COMMAND: u8 = 0x02;
pub const VERSION_INVENTORY: u8 = 0x03;
pub const VERSION_COMPACT_INVENTORY: u8 = 0x04;
pub const VERSION_CONTROL: u8 = 0x40;
pub const VERSION_REGISTER: u8 = 0x70;

pub const TYPE_COMMAND_BEGIN: [u16; 2] = [0x0000, 0x8000];
pub const TYPE_COMMAND_END: [u16; 2] = [0x0001, 0x8001];
pub const TYPE_INVENTORY: [u16; 2] = [0x0005, 0x8005];
pub const TYPE_TAG_ACCESS: u16 = 0x0006;
pub const TYPE_ANTENNA_CYCLE_END: [u16; 2] = [0x0007, 0x8007];

const CONTROL_RESET: u8 = 0x02;
const CONTROL_ABORT: u8 = 0x03;

/// Size of a tag-access packet when another packet is chained after it
const TAG_ACCESS_LEN: usize = 20;
/// Offset of the PC word in a full inventory packet
const INVENTORY_DATA_OFFSET: usize = 20;

/// Gen2 operation reported in a tag-access packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCommand {
    Read,
    Write,
    Kill,
    Lock,
    Eas,
    Unknown(u8),
}

impl AccessCommand {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0xC2 => Self::Read,
            0xC3 => Self::Write,
            0xC4 => Self::Kill,
            0xC5 => Self::Lock,
            0x04 => Self::Eas,
            other => Self::Unknown(other),
        }
    }
}

/// Everything the RFID channel can report
#[derive(Debug, Clone, PartialEq)]
pub enum RfidEvent {
    PowerOn { success: bool },
    PowerOff { success: bool },
    /// Short acknowledgement of a firmware command; frees the pipeline
    CommandAccepted,
    CommandRejected,
    CommandBegin,
    CommandEnd { success: bool, status: u16 },
    AntennaCycleEnd,
    AbortResponse,
    ResetResponse,
    FirmwareVersion { major: u8, minor: u16, build: u16 },
    TagAccess { command: AccessCommand, success: bool, error_code: u8 },
    Tag(Reading),
}

/// Header shared by all `0x81 0x00` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub flags: u8,
    pub packet_type: u16,
    pub length: u16,
    pub reserved: u16,
}

impl PacketHeader {
    pub const LEN: usize = 8;

    pub fn parse(packet: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            version: byte_at(packet, 0)?,
            flags: byte_at(packet, 1)?,
            packet_type: u16_le_at(packet, 2)?,
            length: u16_le_at(packet, 4)?,
            reserved: u16_le_at(packet, 6)?,
        })
    }
}

/// Convert a narrowband RSSI byte (5-bit exponent, 3-bit mantissa) to dBm
pub fn narrowband_rssi(byte: u8, offset: f64) -> f64 {
    let mantissa = f64::from(byte & 0x07);
    let exponent = i32::from((byte & 0xF8) >> 3);
    20.0 * (2f64.powi(exponent) * (1.0 + mantissa / 8.0)).log10() - offset
}

/// Decode a `0x80` module response
pub fn decode_module_response(payload: &[u8]) -> Result<Option<RfidEvent>, DecodeError> {
    let event = match (byte_at(payload, 1)?, byte_at(payload, 2)?) {
        (0x00, 0x00) => Some(RfidEvent::PowerOn { success: true }),
        (0x00, 0xFF) => Some(RfidEvent::PowerOn { success: false }),
        (0x01, 0x00) => Some(RfidEvent::PowerOff { success: true }),
        (0x01, 0xFF) => Some(RfidEvent::PowerOff { success: false }),
        (0x02, 0x00 | 0x01) => {
            // Register accesses are acknowledged with a short response and
            // never produce a command-end packet
            if payload.len() - 2 <= 6 {
                Some(RfidEvent::CommandAccepted)
            } else {
                debug!("Firmware command response: {:02X?}", payload);
                None
            }
        }
        (0x02, 0xFF) => Some(RfidEvent::CommandRejected),
        _ => None,
    };
    Ok(event)
}

/// Decode a version `0x40` control response (no length field)
pub fn decode_control(header: &PacketHeader) -> Option<RfidEvent> {
    match header.flags {
        CONTROL_RESET => Some(RfidEvent::ResetResponse),
        CONTROL_ABORT => Some(RfidEvent::AbortResponse),
        _ => None,
    }
}

/// Decode a version `0x00`/`0x70` register read response
pub fn decode_info(header: &PacketHeader) -> Option<RfidEvent> {
    if header.flags != 0x00 {
        return None;
    }
    let address = header.packet_type;
    let data = (u32::from(header.reserved) << 16) | u32::from(header.length);
    match address {
        0x0000 => Some(RfidEvent::FirmwareVersion {
            major: (data >> 24) as u8,
            minor: ((data >> 12) & 0x7FF) as u16,
            build: (data & 0x7FF) as u16,
        }),
        _ => {
            debug!("Register 0x{:04X} = 0x{:08X}", address, data);
            None
        }
    }
}

/// Decode a complete (reassembled) firmware packet.
///
/// A tag-access packet may be followed by another packet in the same buffer;
/// chained packets are walked with an advancing offset.
pub fn decode_packet(packet: &[u8], rssi_offset: f64) -> Result<Vec<RfidEvent>, DecodeError> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < packet.len() {
        let current = &packet[offset..];
        let decoded = decode_single(current, rssi_offset);
        let (mut decoded, next) = match decoded {
            Ok(result) => result,
            Err(e) if offset > 0 => {
                warn!("Dropping chained packet at offset {}: {}", offset, e);
                break;
            }
            Err(e) => return Err(e),
        };
        events.append(&mut decoded);
        match next {
            Some(len) => offset += len,
            None => break,
        }
    }

    Ok(events)
}

/// Decode one packet; returns the events and, for chained packets, how far to advance
fn decode_single(
    packet: &[u8],
    rssi_offset: f64,
) -> Result<(Vec<RfidEvent>, Option<usize>), DecodeError> {
    let header = PacketHeader::parse(packet)?;

    match header.version {
        VERSION_TAG_ACCESS if header.packet_type == TYPE_TAG_ACCESS => {
            let command = AccessCommand::from_byte(byte_at(packet, 12)?);
            let error_code = byte_at(packet, 13)?;
            let success = header.flags & 0x0F == 0;
            if !success {
                warn!(
                    "Tag access {:?} failed with flags 0x{:02X} and error code 0x{:02X}",
                    command, header.flags, error_code
                );
            }
            let event = RfidEvent::TagAccess {
                command,
                success,
                error_code,
            };
            let chained = header.length == 3 && packet.len() > TAG_ACCESS_LEN;
            Ok((vec![event], chained.then_some(TAG_ACCESS_LEN)))
        }
        VERSION_COMMAND => {
            let event = if TYPE_COMMAND_BEGIN.contains(&header.packet_type) {
                Some(RfidEvent::CommandBegin)
            } else if TYPE_COMMAND_END.contains(&header.packet_type) {
                let status = u16_le_at(packet, 12)?;
                Some(RfidEvent::CommandEnd {
                    success: status == 0,
                    status,
                })
            } else if TYPE_ANTENNA_CYCLE_END.contains(&header.packet_type) {
                Some(RfidEvent::AntennaCycleEnd)
            } else {
                None
            };
            Ok((event.into_iter().collect(), None))
        }
        VERSION_INVENTORY if TYPE_INVENTORY.contains(&header.packet_type) => {
            let reading = decode_inventory(packet, rssi_offset)?;
            Ok((vec![RfidEvent::Tag(reading)], None))
        }
        VERSION_COMPACT_INVENTORY if TYPE_INVENTORY.contains(&header.packet_type) => {
            let readings = decode_compact_inventory(packet, &header, rssi_offset)?;
            Ok((readings.into_iter().map(RfidEvent::Tag).collect(), None))
        }
        VERSION_CONTROL => Ok((decode_control(&header).into_iter().collect(), None)),
        VERSION_INFO | VERSION_REGISTER => Ok((decode_info(&header).into_iter().collect(), None)),
        _ => {
            debug!(
                "Ignoring packet version 0x{:02X} type 0x{:04X}",
                header.version, header.packet_type
            );
            Ok((Vec::new(), None))
        }
    }
}

/// Legacy inventory packet: exactly one tag
fn decode_inventory(packet: &[u8], rssi_offset: f64) -> Result<Reading, DecodeError> {
    let ms_counter = u32::from(u16_le_at(packet, 8)?) | (u32::from(u16_le_at(packet, 10)?) << 16);
    let wideband_rssi = byte_at(packet, 12)?;
    let narrowband_rssi_byte = byte_at(packet, 13)?;
    let phase = byte_at(packet, 14)?;
    let channel_index = byte_at(packet, 15)?;

    let data = packet.get(INVENTORY_DATA_OFFSET..).unwrap_or_default();
    let pc = u16_be_at(data, 0)?;
    let epc_len = usize::from(pc >> 11) * 2;
    let epc_end = 2 + epc_len;
    if epc_end > data.len() {
        return Err(DecodeError::EpcOutOfBounds {
            end: epc_end,
            len: data.len(),
        });
    }

    debug!(
        "Inventory: ms={} wb=0x{:02X} phase={} channel={}",
        ms_counter, wideband_rssi, phase, channel_index
    );

    Ok(Reading::rfid(
        bytes_to_hex(&data[2..epc_end]),
        bytes_to_hex(&data[..2]),
        narrowband_rssi(narrowband_rssi_byte, rssi_offset) as i32,
    ))
}

/// Compact inventory packet: `PC, EPC, NB_RSSI` records back to back
fn decode_compact_inventory(
    packet: &[u8],
    header: &PacketHeader,
    rssi_offset: f64,
) -> Result<Vec<Reading>, DecodeError> {
    let end = packet
        .len()
        .min(PacketHeader::LEN + usize::from(header.length));
    let data = packet.get(PacketHeader::LEN..end).unwrap_or_default();

    let mut readings = Vec::new();
    let mut index = 0;
    while index + 1 < data.len() {
        let pc = u16_be_at(data, index)?;
        let epc_len = usize::from(pc >> 11) * 2;
        let epc_start = index + 2;
        let rssi_index = epc_start + epc_len;
        if rssi_index >= data.len() {
            return Err(DecodeError::EpcOutOfBounds {
                end: rssi_index,
                len: data.len(),
            });
        }

        readings.push(Reading::rfid(
            bytes_to_hex(&data[epc_start..rssi_index]),
            bytes_to_hex(&data[index..epc_start]),
            narrowband_rssi(data[rssi_index], rssi_offset) as i32,
        ));
        index = rssi_index + 1;
    }

    Ok(readings)
}
