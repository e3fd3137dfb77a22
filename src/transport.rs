/// Link-layer acknowledgement requested for a downlink write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// Trait for the BLE link to the reader.
///
/// The implementation owns discovery, connection and characteristic
/// subscription. The driver only writes frames to the downlink characteristic;
/// uplink notifications and connection changes are pushed into the driver via
/// [`CslReader::on_uplink_data`](crate::CslReader::on_uplink_data) and
/// [`CslReader::on_connection_state_changed`](crate::CslReader::on_connection_state_changed).
pub trait BleTransport: Send + Sync + 'static {
    /// Error type for transport operations
    type Error: std::fmt::Debug;

    /// Write a frame to the downlink characteristic
    fn send_down(&self, data: &[u8], mode: WriteMode) -> Result<(), Self::Error>;
}
