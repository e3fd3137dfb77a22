//! Driver for CSL CS108 handheld RFID and barcode readers over Bluetooth LE.
//!
//! The crate owns the CS108 wire protocol: framing, register commands, a
//! serialized RFID command pipeline, reassembly of multi-fragment uplink
//! packets, inventory session configuration and trigger handling. The BLE
//! link itself is supplied by the caller through [`BleTransport`].
//!
//! # Features
//!
//! - `serde` - `Serialize`/`Deserialize` for [`ReaderConfig`]
//!
//! # Example
//!
//! ```ignore
//! use csl_rfid::{ConnectionState, CslReader, ReaderEvent, RfidParameters};
//!
//! let (events_tx, events) = crossbeam::channel::unbounded();
//! let reader = CslReader::new(my_ble_link, events_tx)?;
//!
//! // From the BLE stack's callbacks:
//! reader.on_connection_state_changed(ConnectionState::Ready);
//! reader.on_uplink_data(&notification_bytes)?;
//!
//! reader.set_rfid_parameters(RfidParameters::default())?;
//! reader.start_continuous_inventory()?;
//! for event in events {
//!     if let ReaderEvent::Reading(reading) = event {
//!         println!("{} {} dBm", reading.tag_id, reading.rssi);
//!     }
//! }
//! ```

mod barcode;
mod config;
mod dispatcher;
mod events;
mod notify;
mod pipeline;
pub mod protocol;
mod reader;
mod reassembly;
pub mod registers;
mod rfid;
mod session;
mod transport;
mod types;
mod worker;

// Re-exports
pub use barcode::BarcodeStatus;
pub use config::ReaderConfig;
pub use dispatcher::{Uplink, UplinkDispatcher};
pub use events::{EventSink, ReaderEvent};
pub use notify::{ButtonTracker, Notification, Press, Release};
pub use pipeline::{CommandCompletion, CommandPipeline, PipelineTiming};
pub use reader::{CslReader, TriggerSettings};
pub use reassembly::{BarcodeAssembler, BarcodeEvent, ReassemblyState, RfidAssembler};
pub use rfid::{AccessCommand, PacketHeader, RfidEvent, narrowband_rssi};
pub use session::{BurnRequest, InventorySession, SessionConfig};
pub use transport::{BleTransport, WriteMode};
pub use types::{
    ButtonState, ConnectionState, DecodeError, Gen2MemoryBank, InventoryTarget, PaddedEpc,
    QAlgorithm, Reading, ReadingKind, ReaderError, RfidParameters,
};
pub use worker::WorkerThread;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::uplink_frame;
    use crate::protocol::{Channel, RegisterRequest, RfidCommand};
    use crate::registers::*;
    use crate::rfid::tests::{EPC, compact_packet};
    use crossbeam::channel::{self, Receiver};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Transport that records every frame written
    #[derive(Default)]
    struct MockTransport {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl BleTransport for MockTransport {
        type Error = std::io::Error;

        fn send_down(&self, data: &[u8], _mode: WriteMode) -> Result<(), Self::Error> {
            self.frames.lock().push(data.to_vec());
            Ok(())
        }
    }

    /// Transport whose writes always fail
    struct FailingTransport;

    impl BleTransport for FailingTransport {
        type Error = std::io::Error;

        fn send_down(&self, _data: &[u8], _mode: WriteMode) -> Result<(), Self::Error> {
            Err(std::io::Error::other("characteristic gone"))
        }
    }

    type Frames = Arc<Mutex<Vec<Vec<u8>>>>;

    fn test_config() -> ReaderConfig {
        ReaderConfig::default()
            .with_command_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(1))
            .with_double_press_window(Duration::from_millis(60))
    }

    fn reader() -> (
        CslReader<MockTransport, channel::Sender<ReaderEvent>>,
        Frames,
        Receiver<ReaderEvent>,
    ) {
        let transport = MockTransport::default();
        let frames = Arc::clone(&transport.frames);
        let (tx, rx) = channel::unbounded();
        let reader = CslReader::with_config(transport, tx, test_config()).unwrap();
        (reader, frames, rx)
    }

    /// Reader with the link up and the connect sequence flushed
    fn connected() -> (
        CslReader<MockTransport, channel::Sender<ReaderEvent>>,
        Frames,
        Receiver<ReaderEvent>,
    ) {
        let (reader, frames, rx) = reader();
        reader.on_connection_state_changed(ConnectionState::Ready);
        assert!(wait_until(|| frames.lock().len() >= 6));
        settle();
        frames.lock().clear();
        while rx.try_recv().is_ok() {}
        (reader, frames, rx)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Long enough for queued commands to drain through the watchdog
    fn settle() {
        thread::sleep(Duration::from_millis(150));
    }

    /// Reader whose commands only move on when acknowledged
    fn acked_reader() -> (
        CslReader<MockTransport, channel::Sender<ReaderEvent>>,
        Frames,
        Receiver<ReaderEvent>,
    ) {
        let config = test_config().with_command_timeout(Duration::from_secs(5));
        let transport = MockTransport::default();
        let frames = Arc::clone(&transport.frames);
        let (tx, rx) = channel::unbounded();
        let reader = CslReader::with_config(transport, tx, config).unwrap();
        reader.on_connection_state_changed(ConnectionState::Ready);
        (reader, frames, rx)
    }

    /// Acknowledge commands until `done` holds
    fn ack_until<T: BleTransport>(
        reader: &CslReader<T, channel::Sender<ReaderEvent>>,
        done: impl Fn() -> bool,
    ) -> bool {
        wait_until(|| {
            if done() {
                return true;
            }
            reader.on_uplink_data(&short_ack()).unwrap();
            false
        })
    }

    fn next_event(
        rx: &Receiver<ReaderEvent>,
        matches: impl Fn(&ReaderEvent) -> bool,
    ) -> Option<ReaderEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while let Ok(event) = rx.recv_deadline(deadline) {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Register writes sent on the RFID channel, in order
    fn register_writes(frames: &Frames) -> Vec<(u16, u32)> {
        frames
            .lock()
            .iter()
            .filter(|f| f[3] == Channel::Rfid as u8 && f.len() == 18 && f[10] == 0x70 && f[11] == 1)
            .filter_map(|f| RegisterRequest::parse(&f[8..], true).ok())
            .map(|r| (r.address, r.data))
            .collect()
    }

    fn payloads(frames: &Frames, channel: Channel) -> Vec<Vec<u8>> {
        frames
            .lock()
            .iter()
            .filter(|f| f[3] == channel as u8)
            .map(|f| f[8..].to_vec())
            .collect()
    }

    fn abort_count(frames: &Frames) -> usize {
        let abort = RfidCommand::Abort.payload();
        payloads(frames, Channel::Rfid)
            .iter()
            .filter(|p| **p == abort)
            .count()
    }

    fn short_ack() -> Vec<u8> {
        uplink_frame(&[0x80, 0x02, 0x00], Channel::Rfid)
    }

    fn command_end(status: u16) -> Vec<u8> {
        let mut payload = vec![0x81, 0x00, 0x02, 0x00, 0x01, 0x80, 0x02, 0x00, 0x00, 0x00];
        payload.extend_from_slice(&[0, 0, 0, 0]);
        payload.extend_from_slice(&status.to_le_bytes());
        payload.extend_from_slice(&[0, 0]);
        uplink_frame(&payload, Channel::Rfid)
    }

    fn compact_frame(records: &[(&[u8], u8)]) -> Vec<u8> {
        let mut payload = vec![0x81, 0x00];
        payload.extend_from_slice(&compact_packet(records));
        uplink_frame(&payload, Channel::Rfid)
    }

    // ===================
    // Connection tests
    // ===================

    #[test]
    fn test_ready_runs_connect_sequence() {
        let (reader, frames, rx) = reader();
        reader.on_connection_state_changed(ConnectionState::Ready);

        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::ConnectionStateChanged(_))),
            Some(ReaderEvent::ConnectionStateChanged(ConnectionState::Ready))
        );
        assert!(reader.is_connected());
        let version_read = RegisterRequest::read(FIRMWARE_VER).to_bytes().to_vec();
        assert!(wait_until(|| payloads(&frames, Channel::Rfid).contains(&version_read)));

        assert!(payloads(&frames, Channel::Barcode).contains(&protocol::BARCODE_POWER_ON.to_vec()));
        assert!(payloads(&frames, Channel::Notify).contains(&protocol::BATTERY_VOLTAGE.to_vec()));

        // Abort pair, power on, then the version read, all through the pipeline
        let rfid = payloads(&frames, Channel::Rfid);
        assert_eq!(
            rfid,
            vec![
                RfidCommand::Abort.payload(),
                RfidCommand::Abort.payload(),
                protocol::RFID_POWER_ON.to_vec(),
                version_read,
            ]
        );
    }

    #[test]
    fn test_version_read_waits_for_command_in_flight() {
        let (reader, frames, _rx) = acked_reader();
        assert!(wait_until(|| abort_count(&frames) == 1));

        reader.update_version_info().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(payloads(&frames, Channel::Rfid), vec![RfidCommand::Abort.payload()]);
        // The battery request does not go through the RFID module
        assert!(payloads(&frames, Channel::Notify).contains(&protocol::BATTERY_VOLTAGE.to_vec()));

        let version_read = RegisterRequest::read(FIRMWARE_VER).to_bytes().to_vec();
        assert!(ack_until(&reader, || payloads(&frames, Channel::Rfid)
            .contains(&version_read)));
        let rfid = payloads(&frames, Channel::Rfid);
        let power_on = rfid.iter().position(|p| *p == protocol::RFID_POWER_ON.to_vec());
        let first_read = rfid.iter().position(|p| *p == version_read);
        assert!(power_on.is_some());
        assert!(power_on < first_read);
    }

    #[test]
    fn test_ready_twice_is_ignored() {
        let (reader, frames, _rx) = connected();
        reader.on_connection_state_changed(ConnectionState::Ready);
        thread::sleep(Duration::from_millis(50));
        assert!(frames.lock().is_empty());
    }

    #[test]
    fn test_power_on_response_aborts_and_requests_version() {
        let (reader, frames, _rx) = connected();
        reader
            .on_uplink_data(&uplink_frame(&[0x80, 0x00, 0x00], Channel::Rfid))
            .unwrap();
        assert!(wait_until(|| abort_count(&frames) == 2));
        assert!(payloads(&frames, Channel::Notify).contains(&protocol::BATTERY_VOLTAGE.to_vec()));
    }

    #[test]
    fn test_disconnected_reader_rejects_direct_sends() {
        let (reader, frames, rx) = reader();
        assert!(matches!(reader.read_barcode(), Err(ReaderError::NotConnected)));
        assert!(matches!(
            reader.update_battery_status(),
            Err(ReaderError::NotConnected)
        ));

        // Queued commands are dropped by the pipeline while the link is down
        reader.start_continuous_inventory().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(frames.lock().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_link_lost_publishes_state() {
        let (reader, _frames, rx) = connected();
        reader.on_connection_state_changed(ConnectionState::Disconnected);
        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::ConnectionStateChanged(_))),
            Some(ReaderEvent::ConnectionStateChanged(ConnectionState::Disconnected))
        );
        assert!(!reader.is_connected());
    }

    #[test]
    fn test_link_loss_drops_partial_packet() {
        let (reader, _frames, rx) = connected();
        let frame = compact_frame(&[(&EPC[..], 0x28)]);
        reader.on_uplink_data(&frame[..20]).unwrap();
        reader.on_connection_state_changed(ConnectionState::Disconnected);
        reader.on_connection_state_changed(ConnectionState::Ready);

        // On its own the tail is not a frame
        reader.on_uplink_data(&frame[20..]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_iter().all(|e| !matches!(e, ReaderEvent::Reading(_))));

        reader.on_uplink_data(&frame).unwrap();
        assert!(next_event(&rx, |e| matches!(e, ReaderEvent::Reading(_))).is_some());
    }

    #[test]
    fn test_disconnect_powers_modules_off() {
        let (reader, frames, _rx) = connected();
        reader.disconnect().unwrap();
        assert!(wait_until(|| payloads(&frames, Channel::Rfid)
            .contains(&protocol::RFID_POWER_OFF.to_vec())));
        assert!(payloads(&frames, Channel::Barcode).contains(&protocol::BARCODE_POWER_OFF.to_vec()));
    }

    #[test]
    fn test_transport_failure_surfaces_on_direct_send() {
        let (tx, _rx) = channel::unbounded();
        let reader = CslReader::with_config(FailingTransport, tx, test_config()).unwrap();
        reader.on_connection_state_changed(ConnectionState::Ready);
        assert!(matches!(reader.read_barcode(), Err(ReaderError::Transport(_))));
    }

    // ===================
    // Inventory tests
    // ===================

    #[test]
    fn test_inventory_readings_published() {
        let (reader, _frames, rx) = connected();
        let frame = compact_frame(&[(&EPC[..], 0x28), (&[0xAA, 0xBB][..], 0x00)]);
        reader.on_uplink_data(&frame[..20]).unwrap();
        reader.on_uplink_data(&frame[20..]).unwrap();

        let first = next_event(&rx, |e| matches!(e, ReaderEvent::Reading(_)));
        let second = next_event(&rx, |e| matches!(e, ReaderEvent::Reading(_)));
        match (first, second) {
            (Some(ReaderEvent::Reading(a)), Some(ReaderEvent::Reading(b))) => {
                assert_eq!(a.kind, ReadingKind::Rfid);
                assert_eq!(a.tag_id, "E20068160000006012345678");
                assert_eq!(a.rssi, -89);
                assert_eq!(b.tag_id, "AABB");
                assert_eq!(b.pc, "0800");
            }
            other => panic!("expected two readings, got {:?}", other),
        }
    }

    #[test]
    fn test_start_and_stop_inventory() {
        let (reader, frames, _rx) = connected();
        reader.start_continuous_inventory().unwrap();
        assert!(wait_until(|| register_writes(&frames)
            .contains(&(HST_CMD, CMD_START_INVENTORY))));
        assert!(reader.session_config().reader_on);

        reader.stop_continuous_inventory().unwrap();
        assert!(wait_until(|| abort_count(&frames) == 2));
        assert!(!reader.session_config().reader_on);
    }

    #[test]
    fn test_commands_wait_for_ack() {
        let (reader, frames, _rx) = acked_reader();

        // First abort of the connect sequence is in flight
        assert!(wait_until(|| abort_count(&frames) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(abort_count(&frames), 1);

        reader.on_uplink_data(&short_ack()).unwrap();
        assert!(wait_until(|| abort_count(&frames) == 2));
    }

    #[test]
    fn test_read_tag_stops_after_first_batch() {
        let (reader, frames, rx) = connected();
        reader.read_tag("").unwrap();
        assert!(wait_until(|| register_writes(&frames)
            .contains(&(HST_CMD, CMD_START_INVENTORY))));
        assert!(reader.session_config().read_one);

        reader
            .on_uplink_data(&compact_frame(&[(&EPC[..], 0x28)]))
            .unwrap();
        assert!(next_event(&rx, |e| matches!(e, ReaderEvent::Reading(_))).is_some());
        assert!(wait_until(|| abort_count(&frames) == 2));
        assert!(!reader.session_config().read_one);
    }

    #[test]
    fn test_set_rfid_parameters_reports_configuring() {
        let (reader, frames, rx) = connected();
        reader.set_rfid_parameters(RfidParameters::default()).unwrap();
        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::Configuring(_))),
            Some(ReaderEvent::Configuring(true))
        );
        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::Configuring(_))),
            Some(ReaderEvent::Configuring(false))
        );
        let writes = register_writes(&frames);
        assert_eq!(writes[0], (CURRENT_PROFILE, PROFILE_LONGEST_RANGE));
        assert!(writes.contains(&(ANT_CYCLES, ANT_CYCLES_CONTINUOUS)));
    }

    // ===================
    // Power tests
    // ===================

    #[test]
    fn test_set_rfid_power_clamps() {
        let (reader, frames, _rx) = connected();
        reader.set_rfid_power(40).unwrap();
        assert_eq!(reader.rfid_power(), 30);
        assert!(wait_until(|| register_writes(&frames)
            == vec![(ANT_PORT_POWER, 300), (ANT_PORT_DWELL, 0)]));

        reader.set_rfid_power(1).unwrap();
        assert_eq!(reader.rfid_power(), 5);
        assert_eq!(reader.min_rfid_power(), 50);
        assert_eq!(reader.max_rfid_power(), 300);
    }

    #[test]
    fn test_slider_conversions() {
        let (reader, _frames, _rx) = reader();
        assert_eq!(reader.output_power_from_slider(0.0), 5);
        assert_eq!(reader.output_power_from_slider(1.0), 30);
        assert_eq!(reader.output_power_from_slider(0.5), 17);
        assert!((reader.slider_from_output_power(30) - 1.0).abs() < 0.01);
        assert!(reader.slider_from_output_power(5).abs() < 0.01);
    }

    #[test]
    fn test_seek_tag_uses_max_power() {
        let (reader, _frames, _rx) = reader();
        reader.seek_tag("DEADBEEF").unwrap();
        let config = reader.session_config();
        assert!(config.seek_mode);
        assert_eq!(config.output_power, 300);
        assert_eq!(config.tag_to_seek, "DEADBEEF");
    }

    // ===================
    // Write tests
    // ===================

    #[test]
    fn test_write_epc_completion_follows_command_end() {
        let (reader, frames, _rx) = acked_reader();
        let completion = reader.write_epc("1234ABCD", "", "").unwrap();
        assert!(ack_until(&reader, || register_writes(&frames)
            .contains(&(HST_CMD, CMD_WRITE))));
        // Acknowledged but not finished
        reader.on_uplink_data(&short_ack()).unwrap();
        assert_eq!(completion.wait(Duration::from_millis(30)), None);

        reader.on_uplink_data(&command_end(0)).unwrap();
        assert_eq!(completion.wait(Duration::from_secs(1)), Some(true));

        let writes = register_writes(&frames);
        assert_eq!(writes.last(), Some(&(HST_CMD, CMD_WRITE)));
        assert!(writes.contains(&(TAGACC_CNT, 3)));
    }

    #[test]
    fn test_write_epc_failed_command_end() {
        let (reader, frames, _rx) = acked_reader();
        let completion = reader.write_epc("ABCD", "", "").unwrap();
        assert!(ack_until(&reader, || register_writes(&frames)
            .contains(&(HST_CMD, CMD_WRITE))));
        reader.on_uplink_data(&command_end(0x0001)).unwrap();
        assert_eq!(completion.wait(Duration::from_secs(1)), Some(false));
    }

    #[test]
    fn test_write_epc_watchdog_fails_completion() {
        let (reader, _frames, _rx) = connected();
        let completion = reader.write_epc("ABCD", "", "").unwrap();
        assert_eq!(completion.wait(Duration::from_secs(2)), Some(false));
    }

    #[test]
    fn test_link_loss_fails_write_in_flight() {
        let (reader, frames, _rx) = acked_reader();
        let completion = reader.write_epc("ABCD", "", "").unwrap();
        assert!(ack_until(&reader, || register_writes(&frames)
            .contains(&(HST_CMD, CMD_WRITE))));

        reader.on_connection_state_changed(ConnectionState::Disconnected);
        assert_eq!(completion.wait(Duration::from_secs(1)), Some(false));

        // A command end after reconnecting belongs to another command
        reader.on_connection_state_changed(ConnectionState::Ready);
        reader.on_uplink_data(&command_end(0)).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(completion.try_result(), Some(false));
    }

    #[test]
    fn test_write_empty_epc_rejected() {
        let (reader, frames, _rx) = connected();
        assert!(matches!(
            reader.write_epc("", "", ""),
            Err(ReaderError::InvalidParameter(_))
        ));
        thread::sleep(Duration::from_millis(30));
        assert!(frames.lock().is_empty());
    }

    // ===================
    // Barcode tests
    // ===================

    #[test]
    fn test_barcode_reading_stops_engine() {
        let (reader, frames, rx) = connected();
        reader
            .on_uplink_data(&uplink_frame(b"\x91\x00ABC-", Channel::Barcode))
            .unwrap();
        reader.on_uplink_data(b"0042\r").unwrap();

        match next_event(&rx, |e| matches!(e, ReaderEvent::Reading(_))) {
            Some(ReaderEvent::Reading(reading)) => {
                assert_eq!(reading.kind, ReadingKind::Barcode);
                assert_eq!(reading.asset_number, "ABC-0042");
            }
            other => panic!("expected barcode reading, got {:?}", other),
        }
        let stop = protocol::barcode_raw(protocol::BARCODE_CMD_STOP_CONTINUE_MODE);
        assert!(wait_until(|| payloads(&frames, Channel::Barcode).contains(&stop)));
    }

    #[test]
    fn test_barcode_status_tracks_engine() {
        let (reader, _frames, _rx) = connected();
        reader
            .on_uplink_data(&uplink_frame(&[0x90, 0x00, 0x00], Channel::Barcode))
            .unwrap();
        assert!(wait_until(|| reader.barcode_on()));
        reader
            .on_uplink_data(&uplink_frame(&[0x90, 0x01, 0x00], Channel::Barcode))
            .unwrap();
        assert!(wait_until(|| !reader.barcode_on()));
    }

    // ===================
    // Notification tests
    // ===================

    #[test]
    fn test_battery_notification() {
        let (reader, _frames, rx) = connected();
        reader
            .on_uplink_data(&uplink_frame(&[0xA0, 0x00, 0x0E, 0xA6], Channel::Notify))
            .unwrap();

        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::BatteryChanged(_))),
            Some(ReaderEvent::BatteryChanged(50))
        );
        match next_event(&rx, |e| matches!(e, ReaderEvent::VersionStringChanged(_))) {
            Some(ReaderEvent::VersionStringChanged(version)) => {
                assert!(version.starts_with("Manufacturer: CSL\n"));
                assert!(version.ends_with("Battery Level: 50%"));
            }
            other => panic!("expected version string, got {:?}", other),
        }
        assert_eq!(reader.battery_level(), Some(50));
    }

    #[test]
    fn test_firmware_version_in_version_string() {
        let (reader, _frames, rx) = connected();
        let data: u32 = (2 << 24) | (6 << 12) | 44;
        let mut payload = vec![0x81, 0x00, 0x70, 0x00, 0x00, 0x00];
        payload.extend_from_slice(&((data & 0xFFFF) as u16).to_le_bytes());
        payload.extend_from_slice(&((data >> 16) as u16).to_le_bytes());
        reader
            .on_uplink_data(&uplink_frame(&payload, Channel::Rfid))
            .unwrap();

        assert!(next_event(&rx, |e| matches!(e, ReaderEvent::VersionStringChanged(_))).is_some());
        assert!(reader.version_string().contains("Firmware: 2.6.44"));
    }

    // ===================
    // Trigger tests
    // ===================

    fn trigger(pressed: bool) -> Vec<u8> {
        uplink_frame(&[0xA1, if pressed { 0x02 } else { 0x03 }], Channel::Notify)
    }

    #[test]
    fn test_single_press_starts_inventory() {
        let (reader, frames, rx) = connected();
        reader.enable_trigger_defaults(true, true, true);
        reader.on_uplink_data(&trigger(true)).unwrap();
        reader.on_uplink_data(&trigger(false)).unwrap();

        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::Button(_))),
            Some(ReaderEvent::Button(ButtonState::Single))
        );
        assert!(wait_until(|| register_writes(&frames)
            .contains(&(HST_CMD, CMD_START_INVENTORY))));
    }

    #[test]
    fn test_double_press_starts_barcode() {
        let (reader, frames, rx) = connected();
        reader.enable_trigger_defaults(true, true, true);
        for pressed in [true, false, true, false] {
            reader.on_uplink_data(&trigger(pressed)).unwrap();
        }

        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::Button(_))),
            Some(ReaderEvent::Button(ButtonState::Double))
        );
        let start = protocol::barcode_raw(protocol::BARCODE_CMD_START_CONTINUE_MODE);
        assert!(wait_until(|| payloads(&frames, Channel::Barcode).contains(&start)));
    }

    #[test]
    fn test_press_after_closed_window_starts_new_gesture() {
        // Slow polling leaves the uplink worker waiting past the first window
        let config = test_config()
            .with_poll_interval(Duration::from_millis(200))
            .with_double_press_window(Duration::from_millis(60));
        let (tx, rx) = channel::unbounded();
        let reader = CslReader::with_config(MockTransport::default(), tx, config).unwrap();
        reader.enable_trigger_defaults(false, false, true);

        reader.on_uplink_data(&trigger(true)).unwrap();
        reader.on_uplink_data(&trigger(false)).unwrap();
        thread::sleep(Duration::from_millis(100));
        reader.on_uplink_data(&trigger(true)).unwrap();
        reader.on_uplink_data(&trigger(false)).unwrap();

        for _ in 0..2 {
            assert_eq!(
                next_event(&rx, |e| matches!(e, ReaderEvent::Button(_))),
                Some(ReaderEvent::Button(ButtonState::Single))
            );
        }
    }

    #[test]
    fn test_release_after_hold_stops_and_reports_off() {
        let (reader, frames, rx) = connected();
        reader.enable_trigger_defaults(true, true, true);
        reader.on_uplink_data(&trigger(true)).unwrap();
        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::Button(_))),
            Some(ReaderEvent::Button(ButtonState::Single))
        );
        assert!(wait_until(|| reader.session_config().reader_on));

        reader.on_uplink_data(&trigger(false)).unwrap();
        assert_eq!(
            next_event(&rx, |e| matches!(e, ReaderEvent::Button(_))),
            Some(ReaderEvent::Button(ButtonState::Off))
        );
        assert!(wait_until(|| abort_count(&frames) >= 2));
        assert!(!reader.session_config().reader_on);
    }

    #[test]
    fn test_trigger_actions_disabled() {
        let (reader, frames, rx) = connected();
        reader.enable_trigger_defaults(false, false, false);
        reader.on_uplink_data(&trigger(true)).unwrap();
        reader.on_uplink_data(&trigger(false)).unwrap();
        thread::sleep(Duration::from_millis(150));

        assert!(!register_writes(&frames).contains(&(HST_CMD, CMD_START_INVENTORY)));
        assert!(rx.try_iter().all(|e| !matches!(e, ReaderEvent::Button(_))));

        reader.reset_trigger_to_defaults();
        assert_eq!(reader.trigger_settings(), TriggerSettings::default());
    }

    // ===================
    // Lifecycle tests
    // ===================

    #[test]
    fn test_reset_device_queues_reset() {
        let (reader, frames, _rx) = connected();
        reader.reset_device().unwrap();
        assert!(wait_until(|| payloads(&frames, Channel::Rfid)
            .contains(&RfidCommand::Reset.payload())));
        let enter = protocol::barcode_raw(protocol::BARCODE_CMD_SYS_MODE_ENTER);
        assert_eq!(payloads(&frames, Channel::Barcode)[0], enter);
    }

    #[test]
    fn test_shutdown_closes_queues() {
        let (mut reader, _frames, _rx) = connected();
        reader.shutdown();
        assert!(matches!(
            reader.on_uplink_data(&short_ack()),
            Err(ReaderError::QueueClosed)
        ));
        assert!(matches!(
            reader.start_continuous_inventory(),
            Err(ReaderError::QueueClosed)
        ));
        // Idempotent, and Drop runs it again
        reader.shutdown();
    }
}
