// SpeedSense: System Events & Data Types

use crate::speed::SpeedSample;

/// Connection handle assigned by the BLE stack (`conn_id` in Bluedroid).
pub type ConnHandle = u16;

/// GATT attribute handle.
pub type AttrHandle = u16;

// ---------------------------------------------------------------------------
// Deferred Jobs, posted from ISR / stack callbacks, run by the main loop
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Notify connected peers with a speed reading.
    SendSpeed(SpeedSample),
    /// Ask the main loop for a fresh advertising cycle.
    RequestAdvertise,
}

// ---------------------------------------------------------------------------
// GATT Server Events, as seen by the UART service
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattEvent<'a> {
    Connect(ConnHandle),
    Disconnect(ConnHandle),
    Write {
        conn: ConnHandle,
        attr: AttrHandle,
        data: &'a [u8],
    },
}
