use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::barcode::BarcodeStatus;
use crate::config::ReaderConfig;
use crate::dispatcher::{Uplink, UplinkDispatcher};
use crate::events::{EventSink, ReaderEvent};
use crate::notify::{ButtonTracker, Notification, Press};
use crate::pipeline::{CommandCompletion, CommandPipeline, PipelineTiming};
use crate::protocol::{self, Channel, RegisterRequest, RfidCommand};
use crate::reassembly::BarcodeEvent;
use crate::registers::FIRMWARE_VER;
use crate::rfid::RfidEvent;
use crate::session::{BurnRequest, InventorySession, SessionConfig};
use crate::transport::{BleTransport, WriteMode};
use crate::types::{ButtonState, ConnectionState, Reading, ReaderError, RfidParameters};
use crate::worker::WorkerThread;

/// What the trigger button does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSettings {
    /// Single press starts continuous inventory
    pub single_press: bool,
    /// Double press starts a barcode scan
    pub double_press: bool,
    /// Publish [`ReaderEvent::Button`] for presses and releases
    pub notify: bool,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            single_press: true,
            double_press: true,
            notify: false,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceStatus {
    battery: Option<u8>,
    firmware: String,
    serial_number: String,
}

impl DeviceStatus {
    fn version_string(&self) -> String {
        format!(
            "Manufacturer: CSL\nSerial Number: {}\nFirmware: {}\nBattery Level: {}%",
            self.serial_number,
            self.firmware,
            self.battery.unwrap_or(0)
        )
    }
}

enum UplinkInput {
    Data(Vec<u8>),
    /// Drop partial packets and pending button presses
    LinkLost,
}

/// State shared by the API and both worker threads
struct ReaderCore<T: BleTransport, S: EventSink> {
    transport: Arc<T>,
    sink: Arc<S>,
    config: ReaderConfig,
    pipeline: Arc<CommandPipeline>,
    session: Mutex<InventorySession>,
    status: Mutex<DeviceStatus>,
    triggers: Mutex<TriggerSettings>,
    link_ready: Arc<AtomicBool>,
    barcode_on: AtomicBool,
    configuring: Arc<AtomicBool>,
    closed: AtomicBool,
}

/// Driver for a CSL CS108 handheld reader.
///
/// Frames are written through the [`BleTransport`]; everything the reader
/// reports is published to the [`EventSink`]. Uplink decoding and the RFID
/// command pipeline each run on their own thread, so all methods take `&self`
/// and return without waiting for the reader.
pub struct CslReader<T: BleTransport, S: EventSink> {
    core: Arc<ReaderCore<T, S>>,
    uplink_tx: Sender<UplinkInput>,
    uplink_worker: WorkerThread,
    command_worker: WorkerThread,
}

impl<T: BleTransport, S: EventSink> CslReader<T, S> {
    /// Create a driver with the default configuration
    pub fn new(transport: T, sink: S) -> Result<Self, ReaderError> {
        Self::with_config(transport, sink, ReaderConfig::default())
    }

    pub fn with_config(transport: T, sink: S, config: ReaderConfig) -> Result<Self, ReaderError> {
        let core = Arc::new(ReaderCore {
            transport: Arc::new(transport),
            sink: Arc::new(sink),
            pipeline: Arc::new(CommandPipeline::new(
                config.command_queue_capacity,
                config.command_timeout,
            )),
            session: Mutex::new(InventorySession::new(config.default_power)),
            status: Mutex::new(DeviceStatus::default()),
            triggers: Mutex::new(TriggerSettings::default()),
            link_ready: Arc::new(AtomicBool::new(false)),
            barcode_on: AtomicBool::new(false),
            configuring: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            config,
        });

        let command_worker = {
            let pipeline = Arc::clone(&core.pipeline);
            let transport = Arc::clone(&core.transport);
            let link_ready = Arc::clone(&core.link_ready);
            let configuring = Arc::clone(&core.configuring);
            let sink = Arc::clone(&core.sink);
            let timing = PipelineTiming {
                command_timeout: core.config.command_timeout,
                poll_interval: core.config.poll_interval,
            };
            WorkerThread::spawn("csl-rfid-commands", move |shutdown| {
                pipeline.run(&*transport, &link_ready, &shutdown, timing, || {
                    if configuring.swap(false, Ordering::AcqRel) {
                        sink.publish(ReaderEvent::Configuring(false));
                    }
                });
            })?
        };

        let (uplink_tx, uplink_rx) = channel::bounded(core.config.uplink_queue_capacity);
        let uplink_worker = {
            let core = Arc::clone(&core);
            WorkerThread::spawn("csl-rfid-uplink", move |shutdown| {
                core.run_uplink(uplink_rx, &shutdown);
            })?
        };

        Ok(Self {
            core,
            uplink_tx,
            uplink_worker,
            command_worker,
        })
    }

    // ===================
    // Link
    // ===================

    /// Queue one uplink notification for decoding. Safe to call from the BLE
    /// callback context; never decodes inline.
    pub fn on_uplink_data(&self, data: &[u8]) -> Result<(), ReaderError> {
        self.uplink_tx
            .send_timeout(
                UplinkInput::Data(data.to_vec()),
                self.core.config.uplink_enqueue_timeout,
            )
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    warn!("Uplink queue full; dropping {} bytes", data.len());
                    ReaderError::QueueFull
                }
                SendTimeoutError::Disconnected(_) => ReaderError::QueueClosed,
            })
    }

    pub fn on_connection_state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Ready => self.core.link_up(),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.core.link_down(state);
                // Queued behind any data already received, so partial packets
                // from the old link are dropped in order
                if let Err(e) = self
                    .uplink_tx
                    .send_timeout(UplinkInput::LinkLost, self.core.config.uplink_enqueue_timeout)
                {
                    warn!("Could not queue uplink reset after link loss: {}", e);
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.link_ready.load(Ordering::Acquire)
    }

    /// Power both modules down. The caller closes the BLE link afterwards.
    pub fn disconnect(&self) -> Result<(), ReaderError> {
        if self.is_connected() {
            self.core.barcode_module_power(false)?;
            self.core.enqueue(RfidCommand::PowerOff)?;
        }
        Ok(())
    }

    /// Stop both worker threads. Further calls return [`ReaderError::QueueClosed`].
    pub fn shutdown(&mut self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down reader driver");
        self.uplink_worker.stop();
        self.command_worker.stop();
        self.core.pipeline.clear_queue();
    }

    // ===================
    // Modules
    // ===================

    pub fn rfid_module_power(&self, on: bool) -> Result<(), ReaderError> {
        self.core.enqueue(if on {
            RfidCommand::PowerOn
        } else {
            RfidCommand::PowerOff
        })
    }

    pub fn barcode_module_power(&self, on: bool) -> Result<(), ReaderError> {
        self.core.barcode_module_power(on)
    }

    pub fn barcode_factory_reset(&self) -> Result<(), ReaderError> {
        self.core.barcode_factory_reset()
    }

    /// Soft reset of the RFID module; inventory settings are re-sent on the
    /// next [`set_rfid_parameters`](Self::set_rfid_parameters)
    pub fn reset_device(&self) -> Result<(), ReaderError> {
        info!("Resetting reader");
        self.core.barcode_factory_reset()?;
        let commands = self.core.session.lock().reset();
        self.core.enqueue_all(commands)
    }

    // ===================
    // Status
    // ===================

    pub fn update_battery_status(&self) -> Result<(), ReaderError> {
        self.core.update_battery_status()
    }

    /// Request the firmware version and battery level; answers arrive as
    /// [`ReaderEvent::VersionStringChanged`]
    pub fn update_version_info(&self) -> Result<(), ReaderError> {
        self.core.update_version_info()
    }

    pub fn version_string(&self) -> String {
        self.core.status.lock().version_string()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.core.status.lock().battery
    }

    pub fn session_config(&self) -> SessionConfig {
        self.core.session.lock().config().clone()
    }

    pub fn barcode_on(&self) -> bool {
        self.core.barcode_on.load(Ordering::Acquire)
    }

    // ===================
    // Output power
    // ===================

    /// Set output power in dBm (clamped to the configured range)
    pub fn set_rfid_power(&self, dbm: i32) -> Result<(), ReaderError> {
        let power = self.core.config.limit_power(dbm.saturating_mul(10));
        info!("Setting output power to {}.{} dBm", power / 10, power % 10);
        let commands = self.core.session.lock().set_power(power);
        self.core.enqueue_all(commands)
    }

    /// Output power in whole dBm
    pub fn rfid_power(&self) -> i32 {
        self.core.session.lock().config().output_power / 10
    }

    /// Lowest output power in 0.1 dBm
    pub fn min_rfid_power(&self) -> i32 {
        self.core.config.min_power
    }

    /// Highest output power in 0.1 dBm
    pub fn max_rfid_power(&self) -> i32 {
        self.core.config.max_power
    }

    /// Map a 0.0-1.0 slider position to whole dBm
    pub fn output_power_from_slider(&self, position: f32) -> i32 {
        let min = self.core.config.min_power;
        let range = (self.core.config.max_power - min) as f32;
        (position * range + min as f32 + 0.5) as i32 / 10
    }

    /// Inverse of [`output_power_from_slider`](Self::output_power_from_slider)
    pub fn slider_from_output_power(&self, dbm: i32) -> f32 {
        let min = self.core.config.min_power as f32;
        let range = (self.core.config.max_power - self.core.config.min_power) as f32;
        if range <= 0.0 {
            return 0.0;
        }
        (dbm as f32 * 10.0 - min - 0.5) / range
    }

    // ===================
    // Tag operations
    // ===================

    /// Write a new EPC (with a matching PC word) to the tag matching
    /// `tag_filter`, or to any tag when the filter is empty
    pub fn write_epc(
        &self,
        epc: &str,
        tag_filter: &str,
        access_password: &str,
    ) -> Result<CommandCompletion, ReaderError> {
        let request = BurnRequest::epc(epc, tag_filter, access_password)?;
        self.burn_tag(&request)
    }

    /// Write PC and EPC words to the EPC bank. The completion resolves when
    /// the reader reports the write finished.
    pub fn burn_tag(&self, request: &BurnRequest) -> Result<CommandCompletion, ReaderError> {
        self.core.ensure_open()?;
        let commands = self.core.session.lock().burn(request)?;
        self.core.enqueue_all(commands)?;
        self.core
            .pipeline
            .enqueue_with_completion(InventorySession::write_command().frame()?)
    }

    /// Restrict the next inventories to `filter` at full power; an empty
    /// filter turns seeking off
    pub fn seek_tag(&self, filter: &str) -> Result<(), ReaderError> {
        self.core
            .session
            .lock()
            .seek(filter, self.core.config.max_power)
    }

    /// Inventory until one tag (matching `filter` when given) is read
    pub fn read_tag(&self, filter: &str) -> Result<(), ReaderError> {
        let commands = self.core.session.lock().read_one(filter)?;
        self.core.enqueue_all(commands)
    }

    pub fn set_rfid_parameters(&self, params: RfidParameters) -> Result<(), ReaderError> {
        self.core.ensure_open()?;
        self.core.sink.publish(ReaderEvent::Configuring(true));
        let commands = self.core.session.lock().configure(params);
        let result = self.core.enqueue_all(commands);
        // The command worker reports Configuring(false) once the queue drains
        self.core.configuring.store(true, Ordering::Release);
        result
    }

    pub fn start_continuous_inventory(&self) -> Result<(), ReaderError> {
        self.core.start_inventory()
    }

    pub fn stop_continuous_inventory(&self) -> Result<(), ReaderError> {
        self.core.stop_inventory()
    }

    /// Stop whatever the reader is doing
    pub fn abort(&self) -> Result<(), ReaderError> {
        self.core.abort()
    }

    // ===================
    // Barcode
    // ===================

    pub fn read_barcode(&self) -> Result<(), ReaderError> {
        self.core.read_barcode()
    }

    pub fn abort_barcode(&self) -> Result<(), ReaderError> {
        self.core.abort_barcode()
    }

    // ===================
    // Trigger
    // ===================

    pub fn enable_trigger_defaults(&self, single_press: bool, double_press: bool, notify: bool) {
        *self.core.triggers.lock() = TriggerSettings {
            single_press,
            double_press,
            notify,
        };
    }

    pub fn reset_trigger_to_defaults(&self) {
        *self.core.triggers.lock() = TriggerSettings::default();
    }

    pub fn trigger_settings(&self) -> TriggerSettings {
        *self.core.triggers.lock()
    }
}

impl<T: BleTransport, S: EventSink> Drop for CslReader<T, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: BleTransport, S: EventSink> ReaderCore<T, S> {
    fn ensure_open(&self) -> Result<(), ReaderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReaderError::QueueClosed);
        }
        Ok(())
    }

    /// Write a frame immediately, bypassing the RFID pipeline
    fn send_direct(&self, payload: &[u8], channel: Channel) -> Result<(), ReaderError> {
        self.ensure_open()?;
        if !self.link_ready.load(Ordering::Acquire) {
            return Err(ReaderError::NotConnected);
        }
        let frame = protocol::build_frame(payload, channel)?;
        debug!("Sending {:?} frame {:02X?}", channel, frame);
        self.transport
            .send_down(&frame, WriteMode::WithResponse)
            .map_err(|e| ReaderError::Transport(format!("{:?}", e)))
    }

    fn enqueue(&self, command: RfidCommand) -> Result<(), ReaderError> {
        self.ensure_open()?;
        self.pipeline.enqueue(command.frame()?)
    }

    fn enqueue_all(&self, commands: Vec<RfidCommand>) -> Result<(), ReaderError> {
        commands.into_iter().try_for_each(|command| self.enqueue(command))
    }

    fn barcode_module_power(&self, on: bool) -> Result<(), ReaderError> {
        let payload = if on {
            protocol::BARCODE_POWER_ON
        } else {
            protocol::BARCODE_POWER_OFF
        };
        self.send_direct(&payload, Channel::Barcode)
    }

    fn barcode_factory_reset(&self) -> Result<(), ReaderError> {
        [
            protocol::BARCODE_CMD_SYS_MODE_ENTER,
            protocol::BARCODE_CMD_SCAN_CYCLE_TIME_3000,
            protocol::BARCODE_CMD_PERM_TRIGGER_MODE,
            protocol::BARCODE_CMD_SYS_MODE_EXIT,
        ]
        .into_iter()
        .try_for_each(|command| self.send_direct(&protocol::barcode_raw(command), Channel::Barcode))
    }

    fn read_barcode(&self) -> Result<(), ReaderError> {
        self.send_direct(
            &protocol::barcode_raw(protocol::BARCODE_CMD_START_CONTINUE_MODE),
            Channel::Barcode,
        )
    }

    fn abort_barcode(&self) -> Result<(), ReaderError> {
        self.send_direct(
            &protocol::barcode_raw(protocol::BARCODE_CMD_STOP_CONTINUE_MODE),
            Channel::Barcode,
        )
    }

    fn update_battery_status(&self) -> Result<(), ReaderError> {
        self.send_direct(&protocol::BATTERY_VOLTAGE, Channel::Notify)
    }

    fn update_version_info(&self) -> Result<(), ReaderError> {
        if !self.link_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        // Through the pipeline: the reader acknowledges it like any RFID command
        self.enqueue(RegisterRequest::read(FIRMWARE_VER).into())?;
        self.update_battery_status()
    }

    fn abort_rfid(&self) -> Result<(), ReaderError> {
        let commands = self.session.lock().abort();
        self.enqueue_all(commands)
    }

    fn start_inventory(&self) -> Result<(), ReaderError> {
        let commands = self.session.lock().start_inventory()?;
        self.enqueue_all(commands)
    }

    fn stop_inventory(&self) -> Result<(), ReaderError> {
        let commands = self.session.lock().stop_inventory();
        self.enqueue_all(commands)
    }

    fn abort(&self) -> Result<(), ReaderError> {
        if self.session.lock().config().reader_on {
            self.stop_inventory()?;
        }
        if self.barcode_on.load(Ordering::Acquire) {
            self.abort_barcode()?;
        }
        Ok(())
    }

    fn publish_version_string(&self) {
        let version = self.status.lock().version_string();
        self.sink.publish(ReaderEvent::VersionStringChanged(version));
    }

    // ===================
    // Connection
    // ===================

    fn link_up(&self) {
        if self.link_ready.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Reader link ready");

        // Stop anything left running from a previous session
        log_err("abort", self.abort_rfid());
        self.sink
            .publish(ReaderEvent::ConnectionStateChanged(ConnectionState::Ready));

        log_err("RFID power on", self.enqueue(RfidCommand::PowerOn));
        log_err("barcode power on", self.barcode_module_power(true));
        log_err("version request", self.update_version_info());
    }

    fn link_down(&self, state: ConnectionState) {
        let was_ready = self.link_ready.swap(false, Ordering::AcqRel);
        if was_ready {
            info!("Reader link lost ({:?})", state);
        }
        self.pipeline.clear_queue();
        // A write in flight will never see its command end
        self.pipeline.fail_pending();
        self.pipeline.command_cleared();
        self.barcode_on.store(false, Ordering::Release);
        self.session.lock().set_reader_on(false);
        self.sink.publish(ReaderEvent::ConnectionStateChanged(state));
    }

    // ===================
    // Uplink
    // ===================

    fn run_uplink(&self, rx: Receiver<UplinkInput>, shutdown: &AtomicBool) {
        let mut dispatcher = UplinkDispatcher::new(&self.config);
        let mut button = ButtonTracker::new(self.config.double_press_window);

        while !shutdown.load(Ordering::Acquire) {
            match rx.recv_timeout(self.config.poll_interval) {
                Ok(UplinkInput::Data(data)) => {
                    // Close windows that ended while waiting before counting new presses
                    for press in button.expire(Instant::now()) {
                        self.on_button_press(press);
                    }
                    let items = dispatcher.dispatch(&data);
                    self.handle_uplink(items, &mut button, Instant::now());
                }
                Ok(UplinkInput::LinkLost) => {
                    dispatcher.reset();
                    button.reset();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            for press in button.expire(Instant::now()) {
                self.on_button_press(press);
            }
        }
        debug!("Uplink worker stopped");
    }

    fn handle_uplink(&self, items: Vec<Uplink>, button: &mut ButtonTracker, now: Instant) {
        let mut readings = Vec::new();
        for item in items {
            match item {
                Uplink::Rfid(event) => self.on_rfid_event(event, &mut readings),
                Uplink::Barcode(event) => self.on_barcode_event(event, &mut readings),
                Uplink::Notify(notification) => self.on_notification(notification, button, now),
            }
        }
        if !readings.is_empty() {
            self.publish_readings(readings);
        }
    }

    fn publish_readings(&self, readings: Vec<Reading>) {
        let read_one = self.session.lock().take_read_one();
        if read_one {
            debug!("Read-one satisfied; stopping inventory");
            log_err("stop inventory", self.stop_inventory());
        }
        for reading in readings {
            self.sink.publish(ReaderEvent::Reading(reading));
        }
    }

    fn on_rfid_event(&self, event: RfidEvent, readings: &mut Vec<Reading>) {
        match event {
            RfidEvent::PowerOn { success: true } => {
                info!("RFID module powered on");
                log_err("abort", self.abort_rfid());
                log_err("version request", self.update_version_info());
            }
            RfidEvent::PowerOn { success: false } => error!("RFID module failed to power on"),
            RfidEvent::PowerOff { success: true } => info!("RFID module powered off"),
            RfidEvent::PowerOff { success: false } => warn!("RFID module failed to power off"),
            RfidEvent::CommandAccepted => self.pipeline.command_cleared(),
            RfidEvent::CommandRejected => {
                warn!("RFID command rejected");
                self.pipeline.command_cleared();
            }
            RfidEvent::CommandBegin => debug!("Command begin"),
            RfidEvent::CommandEnd { success, status } => {
                if success {
                    debug!("Command end");
                } else {
                    warn!("Command ended with status 0x{:04X}", status);
                }
                self.pipeline.command_ended(success);
            }
            RfidEvent::AntennaCycleEnd => debug!("Antenna cycle end"),
            RfidEvent::AbortResponse => debug!("Abort acknowledged"),
            RfidEvent::ResetResponse => info!("Reset acknowledged"),
            RfidEvent::FirmwareVersion {
                major,
                minor,
                build,
            } => {
                info!("RFID firmware {}.{}.{}", major, minor, build);
                self.status.lock().firmware = format!("{major}.{minor}.{build}");
                self.publish_version_string();
            }
            RfidEvent::TagAccess {
                command,
                success,
                error_code,
            } => {
                if success {
                    info!("Tag access {:?} succeeded", command);
                } else {
                    warn!("Tag access {:?} failed (0x{:02X})", command, error_code);
                }
            }
            RfidEvent::Tag(reading) => readings.push(reading),
        }
    }

    fn on_barcode_event(&self, event: BarcodeEvent, readings: &mut Vec<Reading>) {
        match event {
            BarcodeEvent::Status(BarcodeStatus::PoweredOn) => {
                info!("Barcode module on");
                self.barcode_on.store(true, Ordering::Release);
            }
            BarcodeEvent::Status(BarcodeStatus::PoweredOff) => {
                info!("Barcode module off");
                self.barcode_on.store(false, Ordering::Release);
            }
            BarcodeEvent::Status(BarcodeStatus::TriggerAccepted) => debug!("Barcode trigger accepted"),
            BarcodeEvent::Reading(reading) => {
                debug!("Barcode {}", reading.asset_number);
                // One scan per trigger
                log_err("stop barcode", self.abort_barcode());
                readings.push(reading);
            }
        }
    }

    fn on_notification(&self, notification: Notification, button: &mut ButtonTracker, now: Instant) {
        match notification {
            Notification::BatteryVoltage { millivolts } => {
                let percent = self.config.battery_percent(millivolts);
                debug!("Battery {} mV ({}%)", millivolts, percent);
                self.status.lock().battery = Some(percent);
                self.sink.publish(ReaderEvent::BatteryChanged(percent));
                self.publish_version_string();
            }
            Notification::TriggerPressed => button.press(now),
            Notification::TriggerReleased => {
                let release = button.release();
                if self.barcode_on.load(Ordering::Acquire) {
                    log_err("stop barcode", self.abort_barcode());
                } else if self.session.lock().config().reader_on {
                    log_err("stop inventory", self.stop_inventory());
                }
                if release.idle {
                    log_err("abort", self.abort());
                    if self.triggers.lock().notify {
                        self.sink.publish(ReaderEvent::Button(ButtonState::Off));
                    }
                }
            }
            Notification::Error(payload) => error!("Reader reported error {}", payload),
        }
    }

    fn on_button_press(&self, press: Press) {
        let triggers = *self.triggers.lock();
        match press {
            Press::Single => {
                if triggers.single_press {
                    log_err("start inventory", self.start_inventory());
                }
                if triggers.notify {
                    self.sink.publish(ReaderEvent::Button(ButtonState::Single));
                }
            }
            Press::Double => {
                if triggers.double_press {
                    log_err("barcode scan", self.read_barcode());
                }
                if triggers.notify {
                    self.sink.publish(ReaderEvent::Button(ButtonState::Double));
                }
            }
        }
    }
}

fn log_err(what: &str, result: Result<(), ReaderError>) {
    if let Err(e) = result {
        warn!("{} failed: {}", what, e);
    }
}
