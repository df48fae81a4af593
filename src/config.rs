// SpeedSense: Hardware & System Configuration
// Target: ESP32 DevKit (Hall sensor on GPIO15, Bluedroid BLE)

use std::time::Duration;

// ---------------------------------------------------------------------------
// GPIO Pin Definitions
// ---------------------------------------------------------------------------
pub const PIN_HALL: i32 = 15; // Hall sensor output (INPUT_PULLUP, rising edge)

// ---------------------------------------------------------------------------
// Wheel Geometry
// ---------------------------------------------------------------------------
pub const WHEEL_DIAMETER_MM: f64 = 698.5; // 28" road wheel

/// Wheel circumference in micrometres (diameter × π), computed once at boot so
/// the pulse ISR only ever does integer arithmetic.
pub fn wheel_circumference_um() -> u32 {
    (WHEEL_DIAMETER_MM * 1000.0 * core::f64::consts::PI) as u32
}

// ---------------------------------------------------------------------------
// Speed Reporting
// ---------------------------------------------------------------------------
pub const SPEED_FLOOR_CENTI_KMH: u32 = 300; // below 3.00 km/h report 0.00
pub const INITIAL_INTERVAL_MS: u32 = 1000;  // assumed interval before the first pulse

// ---------------------------------------------------------------------------
// Timing (milliseconds)
// ---------------------------------------------------------------------------
pub const LOOP_TICK_MS: u64 = 50;
pub const SWEEP_INTERVAL_MS: u32 = 500;
pub const ADVERTISE_SETTLE_MS: u64 = 200;
pub const ADVERTISE_INTERVAL_MS: u32 = 500;

// ---------------------------------------------------------------------------
// BLE Identity (Nordic UART Service)
// ---------------------------------------------------------------------------
pub const DEVICE_NAME: &str = "ESP32_SPEED";
pub const UART_SERVICE_UUID: u128 = 0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E;
pub const UART_TX_UUID: u128 = 0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E; // notify
pub const UART_RX_UUID: u128 = 0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E; // write
pub const GATT_APP_ID: u16 = 0;
pub const RX_MAX_LEN: u16 = 128;
pub const REGISTRATION_TIMEOUT_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Capacities
// ---------------------------------------------------------------------------
pub const JOB_QUEUE_DEPTH: usize = 8;
pub const MAX_CONNECTIONS: usize = 4; // matches CONFIG_BT_ACL_CONNECTIONS

/// Durations driving the main scheduler loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub tick: Duration,
    pub sweep_interval_ms: u32,
    pub advertise_settle: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(LOOP_TICK_MS),
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            advertise_settle: Duration::from_millis(ADVERTISE_SETTLE_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circumference_matches_diameter_times_pi() {
        // 698.5 mm × π ≈ 2194.4 mm
        let c = wheel_circumference_um();
        assert!((2_194_390..=2_194_410).contains(&c), "got {c}");
    }
}
