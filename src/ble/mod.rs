// SpeedSense: BLE Peripheral
//
// Serial-over-BLE (Nordic UART) peripheral: a UART-style GATT service, the
// advertising state machine, and the radio seam they drive.

pub mod advertising;
#[cfg(target_os = "espidf")]
pub mod esp;
pub mod uart;

use core::fmt::{self, Write as _};

use crate::events::{AttrHandle, ConnHandle};

/// The radio operations the firmware needs from the BLE stack.
///
/// Only ever called from normal (non-interrupt) context.
pub trait BleStack {
    type Error: fmt::Display;

    fn notify(&mut self, conn: ConnHandle, attr: AttrHandle, data: &[u8]) -> Result<(), Self::Error>;

    fn stop_advertising(&mut self) -> Result<(), Self::Error>;

    /// Start broadcasting `adv`, optionally answering scans with `scan_response`.
    fn start_advertising(&mut self, adv: &[u8], scan_response: Option<&[u8]>) -> Result<(), Self::Error>;
}

/// Service identifier in any of the three Bluetooth UUID widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceUuid {
    Uuid16(u16),
    Uuid32(u32),
    Uuid128(u128),
}

impl ServiceUuid {
    /// Little-endian bytes as they appear over the air.
    pub fn to_le_bytes(&self) -> heapless::Vec<u8, 16> {
        let mut out = heapless::Vec::new();
        let _ = match self {
            Self::Uuid16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uuid32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uuid128(v) => out.extend_from_slice(&v.to_le_bytes()),
        };
        out
    }
}

/// `AA:BB:CC:DD:EE:FF`
pub fn format_mac(mac: &[u8; 6]) -> heapless::String<17> {
    let mut out = heapless::String::new();
    for (i, b) in mac.iter().enumerate() {
        if i > 0 {
            let _ = out.push(':');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}
