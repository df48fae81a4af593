// SpeedSense: Advertising
//
// Builds the advertisement / scan-response buffers once at service setup, and
// runs the stop → settle → start cycle whenever the main loop picks up a
// pending advertise request.

use std::thread;
use std::time::Duration;

use crate::ble::{BleStack, ServiceUuid};

/// Legacy advertising PDU payload limit.
pub const MAX_ADV_LEN: usize = 31;

pub type AdvBuffer = heapless::Vec<u8, MAX_ADV_LEN>;

// AD types (Bluetooth Core Supplement, Part A)
const AD_FLAGS: u8 = 0x01;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_COMPLETE_NAME: u8 = 0x09;

const FLAG_LE_GENERAL_DISC: u8 = 0x02;
const FLAG_BR_EDR_NOT_SUPPORTED: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("advertising element of {needed} bytes does not fit ({free} free)")]
    TooLong { needed: usize, free: usize },
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingPayload {
    adv_data: AdvBuffer,
    scan_response: AdvBuffer,
}

fn append(buf: &mut AdvBuffer, ad_type: u8, value: &[u8]) -> Result<(), PayloadError> {
    let needed = value.len() + 2;
    let free = MAX_ADV_LEN - buf.len();
    if needed > free {
        return Err(PayloadError::TooLong { needed, free });
    }
    // Length byte counts the type byte plus the value.
    let _ = buf.push(value.len() as u8 + 1);
    let _ = buf.push(ad_type);
    let _ = buf.extend_from_slice(value);
    Ok(())
}

fn uuid_ad_type(uuid: &ServiceUuid) -> u8 {
    match uuid {
        ServiceUuid::Uuid16(_) => AD_COMPLETE_UUID16,
        ServiceUuid::Uuid32(_) => AD_COMPLETE_UUID32,
        ServiceUuid::Uuid128(_) => AD_COMPLETE_UUID128,
    }
}

impl AdvertisingPayload {
    /// Flags + complete local name in the advertisement; the service UUID in
    /// the scan response.
    pub fn new(name: &str, service: ServiceUuid) -> Result<Self, PayloadError> {
        let mut adv_data = AdvBuffer::new();
        append(
            &mut adv_data,
            AD_FLAGS,
            &[FLAG_LE_GENERAL_DISC | FLAG_BR_EDR_NOT_SUPPORTED],
        )?;
        append(&mut adv_data, AD_COMPLETE_NAME, name.as_bytes())?;

        let mut scan_response = AdvBuffer::new();
        append(&mut scan_response, uuid_ad_type(&service), &service.to_le_bytes())?;

        Ok(Self {
            adv_data,
            scan_response,
        })
    }

    pub fn adv_data(&self) -> &[u8] {
        &self.adv_data
    }

    pub fn scan_response(&self) -> &[u8] {
        &self.scan_response
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertisingState {
    #[default]
    Idle,
    Advertising,
}

/// Ways of starting the broadcast, tried in order until one is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStrategy {
    WithScanResponse,
    AdvertisementOnly,
}

pub const START_STRATEGIES: [StartStrategy; 2] =
    [StartStrategy::WithScanResponse, StartStrategy::AdvertisementOnly];

pub struct Advertiser {
    name: heapless::String<29>,
    payload: AdvertisingPayload,
    state: AdvertisingState,
}

impl Advertiser {
    pub fn new(name: &str, service: ServiceUuid) -> Result<Self, PayloadError> {
        let payload = AdvertisingPayload::new(name, service)?;
        // Name length is already bounded by the payload check.
        let mut stored = heapless::String::new();
        let _ = stored.push_str(name);
        Ok(Self {
            name: stored,
            payload,
            state: AdvertisingState::Idle,
        })
    }

    pub fn state(&self) -> AdvertisingState {
        self.state
    }

    pub fn payload(&self) -> &AdvertisingPayload {
        &self.payload
    }

    /// Stop whatever is running, wait `settle`, then start with the first
    /// strategy the stack accepts.  Failure leaves the machine `Idle`.
    pub fn restart<S: BleStack>(&mut self, stack: &mut S, settle: Duration) -> AdvertisingState {
        // Not advertising at the moment is fine.
        if let Err(e) = stack.stop_advertising() {
            log::debug!("Advertising stop ignored: {}", e);
        }
        self.state = AdvertisingState::Idle;

        if !settle.is_zero() {
            thread::sleep(settle);
        }

        for strategy in START_STRATEGIES {
            let scan_response = match strategy {
                StartStrategy::WithScanResponse => Some(self.payload.scan_response()),
                StartStrategy::AdvertisementOnly => None,
            };
            match stack.start_advertising(self.payload.adv_data(), scan_response) {
                Ok(()) => {
                    match strategy {
                        StartStrategy::WithScanResponse => {
                            log::info!("Advertising started with name: {}", self.name)
                        }
                        StartStrategy::AdvertisementOnly => {
                            log::info!("Advertising started (no scan response) with name: {}", self.name)
                        }
                    }
                    self.state = AdvertisingState::Advertising;
                    return self.state;
                }
                Err(e) => log::warn!("Advertising start ({:?}) failed: {}", strategy, e),
            }
        }

        log::error!("Advertising failed, waiting for the next request");
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEVICE_NAME, UART_SERVICE_UUID};
    use crate::events::{AttrHandle, ConnHandle};

    #[derive(Default)]
    struct AdvRecorder {
        stop_fails: bool,
        reject_scan_response: bool,
        reject_all: bool,
        stops: usize,
        starts: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    }

    impl BleStack for AdvRecorder {
        type Error = &'static str;

        fn notify(&mut self, _: ConnHandle, _: AttrHandle, _: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn stop_advertising(&mut self) -> Result<(), Self::Error> {
            self.stops += 1;
            if self.stop_fails {
                Err("not advertising")
            } else {
                Ok(())
            }
        }

        fn start_advertising(&mut self, adv: &[u8], scan_response: Option<&[u8]>) -> Result<(), Self::Error> {
            self.starts.push((adv.to_vec(), scan_response.map(<[u8]>::to_vec)));
            if self.reject_all || (self.reject_scan_response && scan_response.is_some()) {
                Err("rejected")
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn advertisement_carries_flags_and_name() {
        let payload = AdvertisingPayload::new("ESP32_SPEED", ServiceUuid::Uuid16(0x180F)).unwrap();
        let mut expected = vec![0x02, 0x01, 0x06, 12, 0x09];
        expected.extend_from_slice(b"ESP32_SPEED");
        assert_eq!(payload.adv_data(), expected.as_slice());
    }

    #[test]
    fn scan_response_type_follows_uuid_width() {
        let p16 = AdvertisingPayload::new("x", ServiceUuid::Uuid16(0x180F)).unwrap();
        assert_eq!(p16.scan_response(), &[3, AD_COMPLETE_UUID16, 0x0F, 0x18]);

        let p32 = AdvertisingPayload::new("x", ServiceUuid::Uuid32(0x0102_0304)).unwrap();
        assert_eq!(p32.scan_response(), &[5, AD_COMPLETE_UUID32, 4, 3, 2, 1]);

        let p128 = AdvertisingPayload::new("x", ServiceUuid::Uuid128(UART_SERVICE_UUID)).unwrap();
        assert_eq!(p128.scan_response().len(), 18);
        assert_eq!(&p128.scan_response()[..2], &[17, AD_COMPLETE_UUID128]);
        assert_eq!(
            &p128.scan_response()[2..],
            ServiceUuid::Uuid128(UART_SERVICE_UUID).to_le_bytes().as_slice()
        );
    }

    #[test]
    fn overlong_name_is_rejected() {
        let name = "a-device-name-that-is-far-too-long";
        let err = AdvertisingPayload::new(name, ServiceUuid::Uuid16(1)).unwrap_err();
        assert!(matches!(err, PayloadError::TooLong { .. }));
    }

    #[test]
    fn restart_starts_with_full_payload() {
        let mut adv = Advertiser::new(DEVICE_NAME, ServiceUuid::Uuid128(UART_SERVICE_UUID)).unwrap();
        let mut stack = AdvRecorder::default();

        assert_eq!(adv.state(), AdvertisingState::Idle);
        let state = adv.restart(&mut stack, Duration::ZERO);

        assert_eq!(state, AdvertisingState::Advertising);
        assert_eq!(stack.stops, 1);
        assert_eq!(stack.starts.len(), 1);
        assert_eq!(stack.starts[0].0, adv.payload().adv_data());
        assert_eq!(stack.starts[0].1.as_deref(), Some(adv.payload().scan_response()));
    }

    #[test]
    fn stop_failure_is_tolerated() {
        let mut adv = Advertiser::new(DEVICE_NAME, ServiceUuid::Uuid128(UART_SERVICE_UUID)).unwrap();
        let mut stack = AdvRecorder {
            stop_fails: true,
            ..Default::default()
        };
        assert_eq!(adv.restart(&mut stack, Duration::ZERO), AdvertisingState::Advertising);
    }

    #[test]
    fn falls_back_to_advertisement_only() {
        let mut adv = Advertiser::new(DEVICE_NAME, ServiceUuid::Uuid128(UART_SERVICE_UUID)).unwrap();
        let mut stack = AdvRecorder {
            reject_scan_response: true,
            ..Default::default()
        };

        assert_eq!(adv.restart(&mut stack, Duration::ZERO), AdvertisingState::Advertising);
        assert_eq!(stack.starts.len(), 2);
        assert!(stack.starts[0].1.is_some());
        assert!(stack.starts[1].1.is_none());
    }

    #[test]
    fn exhausted_strategies_leave_idle() {
        let mut adv = Advertiser::new(DEVICE_NAME, ServiceUuid::Uuid128(UART_SERVICE_UUID)).unwrap();
        let mut stack = AdvRecorder::default();
        adv.restart(&mut stack, Duration::ZERO);
        assert_eq!(adv.state(), AdvertisingState::Advertising);

        stack.reject_all = true;
        assert_eq!(adv.restart(&mut stack, Duration::ZERO), AdvertisingState::Idle);
        assert_eq!(stack.starts.len(), 1 + START_STRATEGIES.len());
    }
}
