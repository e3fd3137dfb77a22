//! Routes raw BLE notifications to the per-channel decoders

use log::{debug, trace, warn};

use crate::config::ReaderConfig;
use crate::notify::{self, Notification};
use crate::protocol::{self, Channel, HEADER_LEN};
use crate::reassembly::{BarcodeAssembler, BarcodeEvent, RfidAssembler};
use crate::rfid::RfidEvent;

/// A decoded uplink item
#[derive(Debug, Clone, PartialEq)]
pub enum Uplink {
    Rfid(RfidEvent),
    Barcode(BarcodeEvent),
    Notify(Notification),
}

/// Stateful demultiplexer for uplink notifications.
///
/// While a channel is mid-reassembly every incoming buffer belongs to it, since
/// continuation fragments carry no header to route on.
#[derive(Debug)]
pub struct UplinkDispatcher {
    rfid: RfidAssembler,
    barcode: BarcodeAssembler,
    /// Sequence number of the last framed uplink
    sequence: u8,
}

impl UplinkDispatcher {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            rfid: RfidAssembler::new(config.rssi_offset, config.max_packet_words),
            barcode: BarcodeAssembler::default(),
            sequence: 0,
        }
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn in_progress(&self) -> bool {
        self.rfid.in_progress() || self.barcode.in_progress()
    }

    /// Drop any partial packets (link lost)
    pub fn reset(&mut self) {
        self.rfid.reset();
        self.barcode.reset();
    }

    /// Decode one notification. Malformed input is logged and yields nothing.
    pub fn dispatch(&mut self, data: &[u8]) -> Vec<Uplink> {
        trace!("Uplink {:02X?}", data);

        if self.rfid.in_progress() {
            return match self.rfid.push_continuation(data) {
                Ok(events) => events.into_iter().map(Uplink::Rfid).collect(),
                Err(e) => {
                    warn!("Failed to decode reassembled RFID packet: {}", e);
                    Vec::new()
                }
            };
        }
        if self.barcode.in_progress() {
            return match self.barcode.push_continuation(data) {
                Ok(events) => events.into_iter().map(Uplink::Barcode).collect(),
                Err(e) => {
                    warn!("Failed to decode barcode: {}", e);
                    Vec::new()
                }
            };
        }

        if data.len() <= HEADER_LEN {
            debug!("Ignoring short uplink of {} bytes", data.len());
            return Vec::new();
        }
        let header = match protocol::parse_header(data) {
            Ok(header) => header,
            Err(e) => {
                warn!("Bad uplink header: {}", e);
                return Vec::new();
            }
        };
        self.sequence = header.reserved;
        let payload = &data[HEADER_LEN..];

        match header.channel() {
            Some(Channel::Rfid) => {
                match self.rfid.push_first(payload, usize::from(header.payload_len)) {
                    Ok(events) => events.into_iter().map(Uplink::Rfid).collect(),
                    Err(e) => {
                        warn!("Failed to decode RFID packet: {}", e);
                        Vec::new()
                    }
                }
            }
            Some(Channel::Barcode) => match self.barcode.push_first(payload) {
                Ok(events) => events.into_iter().map(Uplink::Barcode).collect(),
                Err(e) => {
                    warn!("Failed to decode barcode: {}", e);
                    Vec::new()
                }
            },
            Some(Channel::Notify) => match notify::decode_notification(payload) {
                Ok(notification) => notification.into_iter().map(Uplink::Notify).collect(),
                Err(e) => {
                    warn!("Failed to decode notification: {}", e);
                    Vec::new()
                }
            },
            Some(channel @ (Channel::Silab | Channel::Bluetooth)) => {
                debug!("Ignoring {:?} uplink", channel);
                Vec::new()
            }
            None => {
                debug!("Unknown uplink channel 0x{:02X}", header.channel_byte);
                Vec::new()
            }
        }
    }
}

/// Wrap `payload` in an uplink frame (reader to host)
#[cfg(test)]
pub(crate) fn uplink_frame(payload: &[u8], channel: Channel) -> Vec<u8> {
    let mut frame = vec![
        protocol::PREFIX,
        protocol::CONNECTION_BLUETOOTH,
        payload.len() as u8,
        channel as u8,
        0x01,
        protocol::DIRECTION_UP,
        0x00,
        0x00,
    ];
    frame.extend_from_slice(payload);
    frame
}
