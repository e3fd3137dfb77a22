//! Reassembly of logical packets split across BLE notifications.
//!
//! Only the first fragment of a logical packet carries a frame header; the
//! rest arrive as bare bytes. Each channel that can span fragments keeps its
//! own state so the dispatcher can route headerless buffers.

use log::{debug, warn};

use crate::barcode::{self, BarcodeStatus};
use crate::rfid::{self, PacketHeader, RfidEvent};
use crate::types::{DecodeError, Reading, byte_at};

/// Nothing a reader sends legitimately grows past this many bytes
const MAX_REASSEMBLED_LEN: usize = 4096;

/// Progress of one multi-fragment packet
#[derive(Debug, Default)]
pub struct ReassemblyState {
    in_progress: bool,
    /// Bytes still expected; completion when this reaches zero or below
    remaining: isize,
    buffer: Vec<u8>,
    /// Version byte of the packet being assembled
    packet_type: u8,
}

impl ReassemblyState {
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn remaining(&self) -> isize {
        self.remaining
    }

    pub fn packet_type(&self) -> u8 {
        self.packet_type
    }

    pub fn begin(&mut self, packet_type: u8, partial: &[u8], remaining: isize) {
        self.in_progress = true;
        self.packet_type = packet_type;
        self.remaining = remaining;
        self.buffer.clear();
        self.buffer.extend_from_slice(partial);
    }

    /// Append a continuation fragment; returns the packet once complete
    pub fn append(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        if !self.in_progress {
            return None;
        }
        self.buffer.extend_from_slice(fragment);
        self.remaining -= fragment.len() as isize;

        if self.buffer.len() > MAX_REASSEMBLED_LEN {
            warn!(
                "Discarding runaway reassembly of {} bytes (packet type 0x{:02X})",
                self.buffer.len(),
                self.packet_type
            );
            self.reset();
            return None;
        }

        if self.remaining <= 0 {
            self.in_progress = false;
            self.remaining = 0;
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    pub fn reset(&mut self) {
        self.in_progress = false;
        self.remaining = 0;
        self.buffer.clear();
    }
}

/// Reassembles RFID firmware packets
#[derive(Debug)]
pub struct RfidAssembler {
    state: ReassemblyState,
    rssi_offset: f64,
    max_packet_words: u16,
}

impl RfidAssembler {
    pub fn new(rssi_offset: f64, max_packet_words: u16) -> Self {
        Self {
            state: ReassemblyState::default(),
            rssi_offset,
            max_packet_words,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state.in_progress()
    }

    pub fn state(&self) -> &ReassemblyState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Handle the payload of a framed RFID notification. `declared_len` is the
    /// payload length from the frame header, which may exceed what arrived.
    pub fn push_first(
        &mut self,
        payload: &[u8],
        declared_len: usize,
    ) -> Result<Vec<RfidEvent>, DecodeError> {
        // A new header means any previous packet will never complete
        if self.state.in_progress() {
            warn!("New RFID packet while reassembling; dropping partial packet");
            self.state.reset();
        }

        match byte_at(payload, 0)? {
            rfid::MODULE_RESPONSE => Ok(rfid::decode_module_response(payload)?.into_iter().collect()),
            rfid::MODULE_UPLINK if byte_at(payload, 1)? == 0x00 => {
                self.first_packet(&payload[2..], payload.len(), declared_len)
            }
            other => {
                debug!("Ignoring RFID payload starting 0x{:02X}", other);
                Ok(Vec::new())
            }
        }
    }

    fn first_packet(
        &mut self,
        packet: &[u8],
        payload_len: usize,
        declared_len: usize,
    ) -> Result<Vec<RfidEvent>, DecodeError> {
        let header = PacketHeader::parse(packet)?;

        match header.version {
            rfid::VERSION_CONTROL => return Ok(rfid::decode_control(&header).into_iter().collect()),
            // Register responses carry data where the length field would be
            rfid::VERSION_INFO | rfid::VERSION_REGISTER => {
                return Ok(rfid::decode_info(&header).into_iter().collect());
            }
            _ => {}
        }
        // Compact packets count bytes, everything else 32-bit words
        let max_length = if header.version == rfid::VERSION_COMPACT_INVENTORY {
            u32::from(self.max_packet_words) * 4
        } else {
            u32::from(self.max_packet_words)
        };
        if u32::from(header.length) > max_length {
            return Err(DecodeError::OversizeLength(header.length));
        }

        let remaining = match header.version {
            rfid::VERSION_INVENTORY if !rfid::TYPE_INVENTORY.contains(&header.packet_type) => {
                return Ok(Vec::new());
            }
            rfid::VERSION_COMPACT_INVENTORY => {
                if !rfid::TYPE_INVENTORY.contains(&header.packet_type) {
                    return Ok(Vec::new());
                }
                // Compact packets count bytes after the 8-byte header
                let present = packet.len().saturating_sub(PacketHeader::LEN);
                header.length as isize - present as isize
            }
            rfid::VERSION_TAG_ACCESS | rfid::VERSION_COMMAND | rfid::VERSION_INVENTORY => {
                declared_len as isize - payload_len as isize
            }
            other => {
                debug!("Ignoring RFID packet version 0x{:02X}", other);
                return Ok(Vec::new());
            }
        };

        if remaining > 0 {
            self.state.begin(header.version, packet, remaining);
            Ok(Vec::new())
        } else {
            rfid::decode_packet(packet, self.rssi_offset)
        }
    }

    /// Handle a headerless fragment of the packet in progress
    pub fn push_continuation(&mut self, fragment: &[u8]) -> Result<Vec<RfidEvent>, DecodeError> {
        match self.state.append(fragment) {
            Some(packet) => rfid::decode_packet(&packet, self.rssi_offset),
            None => Ok(Vec::new()),
        }
    }
}

/// Output of the barcode channel
#[derive(Debug, Clone, PartialEq)]
pub enum BarcodeEvent {
    Status(BarcodeStatus),
    Reading(Reading),
}

/// Accumulates barcode text until the terminating carriage return
#[derive(Debug, Default)]
pub struct BarcodeAssembler {
    in_progress: bool,
    /// Raw scan bytes; decoded once complete so split characters survive
    text: Option<Vec<u8>>,
}

impl BarcodeAssembler {
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn reset(&mut self) {
        self.in_progress = false;
        self.text = None;
    }

    pub fn push_first(&mut self, payload: &[u8]) -> Result<Vec<BarcodeEvent>, DecodeError> {
        match byte_at(payload, 0)? {
            barcode::STATUS => Ok(barcode::decode_status(payload)?
                .map(BarcodeEvent::Status)
                .into_iter()
                .collect()),
            barcode::DATA if byte_at(payload, 1)? == 0x00 => {
                self.reset();
                let data = &payload[2..];
                let first = String::from_utf8_lossy(data);
                if barcode::is_cancelled(&first) {
                    debug!("Barcode scan cancelled");
                    return Ok(Vec::new());
                }
                self.text = Some(data.to_vec());
                self.in_progress = barcode::is_multi_fragment(payload);
                self.finish()
            }
            other => {
                debug!("Ignoring barcode payload starting 0x{:02X}", other);
                Ok(Vec::new())
            }
        }
    }

    pub fn push_continuation(&mut self, fragment: &[u8]) -> Result<Vec<BarcodeEvent>, DecodeError> {
        if let Some(text) = self.text.as_mut() {
            text.extend_from_slice(fragment);
        }
        if fragment.last() == Some(&barcode::TERMINATOR) {
            self.in_progress = false;
        }
        self.finish()
    }

    fn finish(&mut self) -> Result<Vec<BarcodeEvent>, DecodeError> {
        if self.in_progress {
            return Ok(Vec::new());
        }
        let Some(bytes) = self.text.take() else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(vec![BarcodeEvent::Reading(Reading::barcode(
            text.trim().to_string(),
        ))])
    }
}
