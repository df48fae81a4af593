// SpeedSense: Firmware Entry Point
//
// Boot sequence:
//   1. Bring up logging, NVS and the Bluetooth controller.
//   2. Log the BLE MAC address.
//   3. Register the UART GATT service and wait for its handles.
//   4. Seed the speed estimator and arm the Hall sensor interrupt.
//   5. Run the scheduler loop on the main task (never returns).

#[cfg(target_os = "espidf")]
mod firmware {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use esp_idf_hal::gpio::InputPin;
    use esp_idf_hal::prelude::*;
    use esp_idf_svc::bt::{Ble, BtDriver};
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use speedsense::ble::advertising::Advertiser;
    use speedsense::ble::esp::{log_mac, UartServer};
    use speedsense::ble::uart::SharedService;
    use speedsense::ble::ServiceUuid;
    use speedsense::config::*;
    use speedsense::deferred::{AdvertiseRequest, JobQueue};
    use speedsense::drivers::hall::{HallContext, HallSensor};
    use speedsense::drivers::now_ms;
    use speedsense::speed::{SharedEstimator, SpeedEstimator};
    use speedsense::tasks::scheduler::{Scheduler, Shared};

    // ---- State shared across ISR / BLE callbacks / main loop -------------
    static ESTIMATOR: SharedEstimator = SharedEstimator::new();
    static JOBS: JobQueue = JobQueue::new();
    static ADVERTISE: AdvertiseRequest = AdvertiseRequest::new();
    static SERVICE: SharedService = Mutex::new(None);
    static HALL_CTX: HallContext = HallContext {
        estimator: &ESTIMATOR,
        jobs: &JOBS,
    };

    pub fn run() -> anyhow::Result<()> {
        // Link esp-idf-sys runtime patches and initialise logging.
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
        log::info!("SpeedSense firmware starting…");

        // ---- Peripherals --------------------------------------------------
        let peripherals = Peripherals::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        // ---- Bluetooth ----------------------------------------------------
        let bt = Arc::new(BtDriver::<Ble>::new(peripherals.modem, Some(nvs))?);
        log_mac();

        let server = UartServer::start(bt, &SERVICE, &JOBS, &ADVERTISE)?;
        let radio = server.wait_ready(Duration::from_millis(REGISTRATION_TIMEOUT_MS))?;
        let advertiser = Advertiser::new(DEVICE_NAME, ServiceUuid::Uuid128(UART_SERVICE_UUID))?;

        // ---- Speed estimator + Hall interrupt -----------------------------
        ESTIMATOR.init(SpeedEstimator::new(wheel_circumference_um(), now_ms()));
        let _hall = HallSensor::new(peripherals.pins.gpio15.downgrade_input(), &HALL_CTX)?;
        log::info!(
            "Wheel circumference {} µm, sweep every {} ms",
            wheel_circumference_um(),
            SWEEP_INTERVAL_MS
        );

        // ---- Main loop ----------------------------------------------------
        let shared = Shared {
            service: &SERVICE,
            estimator: &ESTIMATOR,
            jobs: &JOBS,
            advertise: &ADVERTISE,
        };
        Scheduler::new(radio, advertiser, shared, LoopTiming::default(), now_ms()).run(now_ms)
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("speedsense is ESP-IDF firmware; host builds only run the library tests");
}
