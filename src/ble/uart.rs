// SpeedSense: UART Peripheral Service
//
// Two characteristics under the Nordic UART service: TX (notify, device→peer)
// carries speed readings, RX (write, peer→device) is logged only.  Owns the set
// of live connections and asks for a new advertising cycle whenever a peer
// drops.

use crate::ble::BleStack;
use crate::config::MAX_CONNECTIONS;
use crate::deferred::{AdvertiseRequest, JobQueue};
use crate::events::{AttrHandle, ConnHandle, GattEvent, Job};

// ---------------------------------------------------------------------------
// Connection set
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Default)]
pub struct ConnectionSet {
    handles: heapless::Vec<ConnHandle, MAX_CONNECTIONS>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the handle could not be tracked (set full).
    pub fn insert(&mut self, conn: ConnHandle) -> bool {
        if self.contains(conn) {
            return true;
        }
        self.handles.push(conn).is_ok()
    }

    /// Returns `true` if the handle was present.
    pub fn remove(&mut self, conn: ConnHandle) -> bool {
        let before = self.handles.len();
        self.handles.retain(|&h| h != conn);
        self.handles.len() != before
    }

    pub fn contains(&self, conn: ConnHandle) -> bool {
        self.handles.contains(&conn)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ConnHandle> + '_ {
        self.handles.iter().copied()
    }
}

/// Outcome of one `send` across all connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// `None` until the stack has finished registering the characteristics.
pub type SharedService = std::sync::Mutex<Option<UartService>>;

pub struct UartService {
    tx_handle: AttrHandle,
    rx_handle: AttrHandle,
    connections: ConnectionSet,
}

impl UartService {
    /// Called once the stack has registered both characteristics.  Requests
    /// the first advertising cycle.
    pub fn new(tx_handle: AttrHandle, rx_handle: AttrHandle, advertise: &AdvertiseRequest) -> Self {
        log::info!("UART service ready (tx={}, rx={})", tx_handle, rx_handle);
        advertise.request();
        Self {
            tx_handle,
            rx_handle,
            connections: ConnectionSet::new(),
        }
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    /// Runs in the stack's callback context: never touches the radio, and
    /// hands the re-advertise request to the main loop through `jobs`.  If
    /// the queue is full the request goes straight to `advertise`, so a
    /// disconnect is never lost.
    pub fn handle_event<const N: usize>(
        &mut self,
        event: GattEvent<'_>,
        jobs: &JobQueue<N>,
        advertise: &AdvertiseRequest,
    ) {
        match event {
            GattEvent::Connect(conn) => {
                if self.connections.insert(conn) {
                    log::info!("BLE: Connected, handle = {}", conn);
                } else {
                    log::warn!("BLE: Connection table full, not tracking handle {}", conn);
                }
            }
            GattEvent::Disconnect(conn) => {
                self.connections.remove(conn);
                log::info!("BLE: Disconnected, handle = {}", conn);
                if jobs.try_defer(Job::RequestAdvertise).is_err() {
                    log::warn!("BLE: Job queue full, raising re-advertise flag directly");
                    advertise.request();
                }
            }
            GattEvent::Write { conn, attr, data } if attr == self.rx_handle => {
                let text = String::from_utf8_lossy(data);
                log::info!("BLE: Received on RX from {}: {}", conn, text.trim());
            }
            GattEvent::Write { attr, .. } => {
                log::debug!("BLE: Ignoring write to handle {}", attr);
            }
        }
    }

    /// Notify every connected peer.  A failure on one handle is logged and
    /// does not stop delivery to the others.
    pub fn send<S: BleStack>(&self, stack: &mut S, text: &str) -> Delivery {
        let mut delivery = Delivery::default();
        for conn in self.connections.iter() {
            match stack.notify(conn, self.tx_handle, text.as_bytes()) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    log::warn!("BLE: Notify error on handle {}: {}", conn, e);
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}
