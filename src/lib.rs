// SpeedSense: BLE Wheel-Speed Sensor
//
// One Hall pulse per wheel revolution becomes a km/h reading streamed to a
// phone over the Nordic UART service.  Everything except the ESP-IDF bindings
// (`drivers`, `ble::esp`) builds and tests on the host.

pub mod ble;
pub mod config;
pub mod deferred;
#[cfg(target_os = "espidf")]
pub mod drivers;
pub mod events;
pub mod speed;
pub mod tasks;
