//! Calibration constants and timing knobs

use std::time::Duration;

/// Driver configuration.
///
/// The defaults match the CS108 reference hardware.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReaderConfig {
    /// Battery voltage reported as 0%
    pub battery_min_mv: u16,
    /// Battery voltage reported as 100%
    pub battery_max_mv: u16,
    /// Subtracted from the computed narrowband RSSI
    pub rssi_offset: f64,
    /// Output power limits in 0.1 dBm
    pub min_power: i32,
    pub max_power: i32,
    pub default_power: i32,
    /// Window after a trigger press during which a second press counts as a double press
    pub double_press_window: Duration,
    /// How long a sent RFID command may stay in flight without a command-end
    pub command_timeout: Duration,
    /// Granularity at which the workers check their shutdown flags
    pub poll_interval: Duration,
    /// Longest time `on_uplink_data` waits for room in the uplink queue
    pub uplink_enqueue_timeout: Duration,
    /// Largest plausible packet length field, in 32-bit words
    pub max_packet_words: u16,
    pub uplink_queue_capacity: usize,
    pub command_queue_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            battery_min_mv: 3400,
            battery_max_mv: 4100,
            rssi_offset: 120.0,
            min_power: 50,
            max_power: 300,
            default_power: 300,
            double_press_window: Duration::from_millis(500),
            command_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            uplink_enqueue_timeout: Duration::from_secs(1),
            max_packet_words: 80,
            uplink_queue_capacity: 512,
            command_queue_capacity: 256,
        }
    }
}

impl ReaderConfig {
    pub fn with_battery_range(mut self, min_mv: u16, max_mv: u16) -> Self {
        self.battery_min_mv = min_mv;
        self.battery_max_mv = max_mv;
        self
    }

    pub fn with_rssi_offset(mut self, offset: f64) -> Self {
        self.rssi_offset = offset;
        self
    }

    pub fn with_power_range(mut self, min: i32, max: i32) -> Self {
        self.min_power = min;
        self.max_power = max;
        self.default_power = self.default_power.clamp(min, max);
        self
    }

    pub fn with_double_press_window(mut self, window: Duration) -> Self {
        self.double_press_window = window;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Clamp a power value in 0.1 dBm to the configured range
    pub fn limit_power(&self, power: i32) -> i32 {
        power.clamp(self.min_power, self.max_power)
    }

    /// Map a battery voltage to a 0-100 percentage
    pub fn battery_percent(&self, millivolts: u16) -> u8 {
        let min = f64::from(self.battery_min_mv);
        let max = f64::from(self.battery_max_mv);
        if max <= min {
            return 0;
        }
        let percent = 100.0 * (f64::from(millivolts) - min) / (max - min);
        percent.clamp(0.0, 100.0) as u8
    }
}
