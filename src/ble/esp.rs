// SpeedSense: ESP-IDF (Bluedroid) BLE Binding
//
// Registers the UART GATT service through esp-idf-svc, forwards connection and
// write events to `UartService`, and implements `BleStack` with GATTS notify
// plus GAP raw advertising data (AD buffers are built by `AdvertisingPayload`).

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use esp_idf_svc::bt::ble::gap::EspBleGap;
use esp_idf_svc::bt::ble::gatt::server::{EspGatts, GattsEvent};
use esp_idf_svc::bt::ble::gatt::{
    AutoResponse, GattCharacteristic, GattDescriptor, GattId, GattInterface, GattServiceId,
    GattStatus, Handle, Permission, Property,
};
use esp_idf_svc::bt::{Ble, BtDriver, BtUuid};
use esp_idf_svc::sys::{self, esp, EspError};

use crate::ble::uart::{SharedService, UartService};
use crate::ble::{format_mac, BleStack};
use crate::config::*;
use crate::deferred::{AdvertiseRequest, JobQueue};
use crate::events::{AttrHandle, ConnHandle, GattEvent};

pub type Driver = BtDriver<'static, Ble>;
pub type Gatts = EspGatts<'static, Ble, Arc<Driver>>;
pub type Gap = EspBleGap<'static, Ble, Arc<Driver>>;

const CCCD_UUID: u16 = 0x2902;
const SERVICE_NUM_HANDLES: u16 = 8;

/// Log the Bluetooth MAC (diagnostics only; failure is not fatal).
pub fn log_mac() {
    let mut mac = [0u8; 6];
    let ret = unsafe { sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_BT) };
    match esp!(ret) {
        Ok(()) => log::info!("BLE MAC address: {}", format_mac(&mac)),
        Err(e) => log::warn!("Failed to get BLE MAC: {}", e),
    }
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------
pub struct EspRadio {
    gatts: Arc<Gatts>,
    gap: Arc<Gap>,
    gatt_if: GattInterface,
}

fn adv_params() -> sys::esp_ble_adv_params_t {
    let interval = (ADVERTISE_INTERVAL_MS * 1000 / 625) as u16; // 0.625 ms units
    sys::esp_ble_adv_params_t {
        adv_int_min: interval,
        adv_int_max: interval,
        adv_type: sys::esp_ble_adv_type_t_ADV_TYPE_IND,
        own_addr_type: sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        channel_map: sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
        adv_filter_policy: sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
        ..unsafe { core::mem::zeroed() }
    }
}

impl BleStack for EspRadio {
    type Error = EspError;

    fn notify(&mut self, conn: ConnHandle, attr: AttrHandle, data: &[u8]) -> Result<(), EspError> {
        self.gatts.notify(self.gatt_if, conn, attr, data)
    }

    fn stop_advertising(&mut self) -> Result<(), EspError> {
        self.gap.stop_advertising()
    }

    fn start_advertising(&mut self, adv: &[u8], scan_response: Option<&[u8]>) -> Result<(), EspError> {
        self.gap.set_raw_adv_conf(adv)?;
        if let Some(rsp) = scan_response {
            self.gap.set_raw_scan_rsp_conf(rsp)?;
        }
        // EspBleGap::start_advertising has no interval parameter.
        let mut params = adv_params();
        esp!(unsafe { sys::esp_ble_gap_start_advertising(&mut params) })
    }
}

// ---------------------------------------------------------------------------
// GATT server
// ---------------------------------------------------------------------------
#[derive(Debug, Default)]
struct Registration {
    gatt_if: Option<GattInterface>,
    tx: Option<Handle>,
    rx: Option<Handle>,
}

pub struct UartServer {
    gatts: Arc<Gatts>,
    gap: Arc<Gap>,
    registration: Mutex<Registration>,
    service: &'static SharedService,
    jobs: &'static JobQueue,
    advertise: &'static AdvertiseRequest,
}

impl UartServer {
    /// Subscribe to GAP/GATTS events and register the application.  The
    /// service comes up asynchronously; see [`wait_ready`](Self::wait_ready).
    pub fn start(
        bt: Arc<Driver>,
        service: &'static SharedService,
        jobs: &'static JobQueue,
        advertise: &'static AdvertiseRequest,
    ) -> anyhow::Result<Arc<Self>> {
        let server = Arc::new(Self {
            gatts: Arc::new(EspGatts::new(bt.clone())?),
            gap: Arc::new(EspBleGap::new(bt)?),
            registration: Mutex::new(Registration::default()),
            service,
            jobs,
            advertise,
        });

        server.gap.subscribe(|event| log::debug!("GAP: {:?}", event))?;

        let gatts_server = server.clone();
        server.gatts.subscribe(move |(gatt_if, event)| {
            if let Err(e) = gatts_server.on_gatts_event(gatt_if, event) {
                log::error!("GATTS: {}", e);
            }
        })?;

        server.gatts.register_app(GATT_APP_ID)?;
        Ok(server)
    }

    /// Block until both characteristics are registered, then hand out the
    /// radio for the main loop.
    pub fn wait_ready(&self, timeout: Duration) -> anyhow::Result<EspRadio> {
        let start = Instant::now();
        loop {
            if let Some(gatt_if) = self.ready_interface() {
                return Ok(EspRadio {
                    gatts: self.gatts.clone(),
                    gap: self.gap.clone(),
                    gatt_if,
                });
            }
            if start.elapsed() > timeout {
                anyhow::bail!("GATT service registration timed out");
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn ready_interface(&self) -> Option<GattInterface> {
        let reg = self.registration.lock().unwrap_or_else(PoisonError::into_inner);
        match *reg {
            Registration {
                gatt_if: Some(gatt_if),
                tx: Some(_),
                rx: Some(_),
            } => Some(gatt_if),
            _ => None,
        }
    }

    fn on_gatts_event(&self, gatt_if: GattInterface, event: GattsEvent) -> Result<(), EspError> {
        match event {
            GattsEvent::ServiceRegistered { status, app_id } => {
                if check_status("app registration", status) && app_id == GATT_APP_ID {
                    self.create_service(gatt_if)?;
                }
            }
            GattsEvent::ServiceCreated { status, service_handle, .. } => {
                if check_status("service creation", status) {
                    self.gatts.start_service(service_handle)?;
                    self.add_tx(service_handle)?;
                }
            }
            GattsEvent::CharacteristicAdded { status, attr_handle, service_handle, .. } => {
                if check_status("characteristic", status) {
                    self.on_characteristic(service_handle, attr_handle)?;
                }
            }
            GattsEvent::DescriptorAdded { status, attr_handle, .. } => {
                if check_status("descriptor", status) {
                    log::debug!("TX client configuration descriptor at {}", attr_handle);
                }
            }
            GattsEvent::PeerConnected { conn_id, .. } => {
                self.dispatch(GattEvent::Connect(conn_id));
            }
            GattsEvent::PeerDisconnected { conn_id, .. } => {
                self.dispatch(GattEvent::Disconnect(conn_id));
            }
            GattsEvent::Write { conn_id, trans_id, handle, need_rsp, value, .. } => {
                if need_rsp {
                    self.gatts.send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, None)?;
                }
                self.dispatch(GattEvent::Write {
                    conn: conn_id,
                    attr: handle,
                    data: value,
                });
            }
            _ => (),
        }
        Ok(())
    }

    fn dispatch(&self, event: GattEvent<'_>) {
        let mut guard = self.service.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(service) => service.handle_event(event, self.jobs, self.advertise),
            None => log::warn!("GATTS: event before service ready: {:?}", event),
        }
    }

    fn create_service(&self, gatt_if: GattInterface) -> Result<(), EspError> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gatt_if = Some(gatt_if);
        self.gap.set_device_name(DEVICE_NAME)?;
        self.gatts.create_service(
            gatt_if,
            &GattServiceId {
                id: GattId {
                    uuid: BtUuid::uuid128(UART_SERVICE_UUID),
                    inst_id: 0,
                },
                is_primary: true,
            },
            SERVICE_NUM_HANDLES,
        )
    }

    fn add_tx(&self, service_handle: Handle) -> Result<(), EspError> {
        self.gatts.add_characteristic(
            service_handle,
            &GattCharacteristic {
                uuid: BtUuid::uuid128(UART_TX_UUID),
                permissions: Permission::Read.into(),
                properties: Property::Notify.into(),
                max_len: 20,
                // Reads are answered by the stack; only RX writes reach us.
                auto_rsp: AutoResponse::ByGatt,
            },
            &[],
        )
    }

    fn add_rx(&self, service_handle: Handle) -> Result<(), EspError> {
        self.gatts.add_characteristic(
            service_handle,
            &GattCharacteristic {
                uuid: BtUuid::uuid128(UART_RX_UUID),
                permissions: Permission::Write.into(),
                properties: Property::Write.into(),
                max_len: RX_MAX_LEN as _,
                auto_rsp: AutoResponse::ByApp,
            },
            &[],
        )
    }

    /// Characteristics are added one at a time: TX first, then RX.
    fn on_characteristic(&self, service_handle: Handle, attr_handle: Handle) -> Result<(), EspError> {
        let mut reg = self.registration.lock().unwrap_or_else(PoisonError::into_inner);
        match (reg.tx, reg.rx) {
            (None, _) => {
                reg.tx = Some(attr_handle);
                drop(reg);
                self.gatts.add_descriptor(
                    service_handle,
                    &GattDescriptor {
                        uuid: BtUuid::uuid16(CCCD_UUID),
                        permissions: Permission::Read | Permission::Write,
                    },
                )?;
                self.add_rx(service_handle)
            }
            (Some(tx), None) => {
                reg.rx = Some(attr_handle);
                drop(reg);
                let service = UartService::new(tx, attr_handle, self.advertise);
                *self.service.lock().unwrap_or_else(PoisonError::into_inner) = Some(service);
                Ok(())
            }
            (Some(_), Some(_)) => {
                log::warn!("GATTS: unexpected characteristic {}", attr_handle);
                Ok(())
            }
        }
    }
}

fn check_status(what: &str, status: GattStatus) -> bool {
    if matches!(status, GattStatus::Ok) {
        true
    } else {
        log::error!("GATTS: {} failed: {:?}", what, status);
        false
    }
}
