// SpeedSense: Hall Sensor Driver
//
// Rising-edge GPIO interrupt, one per wheel revolution.  The ISR only updates
// the shared estimator and defers a send job; it never logs and never touches
// the BLE stack.

use core::ffi::c_void;

use esp_idf_hal::gpio::{AnyInputPin, Input, InterruptType, PinDriver};
use esp_idf_sys::{esp, EspError};

use crate::config::*;
use crate::deferred::JobQueue;
use crate::events::Job;
use crate::speed::SharedEstimator;

/// Everything the ISR may touch; both are lock-free.
pub struct HallContext {
    pub estimator: &'static SharedEstimator,
    pub jobs: &'static JobQueue,
}

unsafe extern "C" fn hall_isr(arg: *mut c_void) {
    // SAFETY: `arg` is the `&'static HallContext` registered in `HallSensor::new`.
    let ctx = unsafe { &*(arg as *const HallContext) };
    if let Some(sample) = ctx.estimator.on_pulse(super::now_ms()) {
        ctx.jobs.defer(Job::SendSpeed(sample));
    }
}

pub struct HallSensor {
    _pin: PinDriver<'static, AnyInputPin, Input>,
}

impl HallSensor {
    pub fn new(pin: AnyInputPin, ctx: &'static HallContext) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_interrupt_type(InterruptType::PosEdge)?;

        unsafe {
            // Pull-up via the raw API: PinDriver::set_pull needs an IO pin type.
            esp!(esp_idf_sys::gpio_set_pull_mode(
                PIN_HALL,
                esp_idf_sys::gpio_pull_mode_t_GPIO_PULLUP_ONLY,
            ))?;

            // The shared ISR service may already be installed by another driver.
            let ret = esp_idf_sys::gpio_install_isr_service(0);
            if let Some(err) = EspError::from(ret) {
                if err.code() != esp_idf_sys::ESP_ERR_INVALID_STATE as esp_idf_sys::esp_err_t {
                    return Err(err.into());
                }
            }

            // Raw handler instead of PinDriver::subscribe, which disarms the
            // interrupt after every edge.
            esp!(esp_idf_sys::gpio_isr_handler_add(
                PIN_HALL,
                Some(hall_isr),
                ctx as *const HallContext as *mut c_void,
            ))?;
            esp!(esp_idf_sys::gpio_intr_enable(PIN_HALL))?;
        }

        log::info!("Hall sensor armed on GPIO{} (rising edge, pull-up)", PIN_HALL);
        Ok(Self { _pin: pin })
    }
}

impl Drop for HallSensor {
    fn drop(&mut self) {
        unsafe {
            esp_idf_sys::gpio_isr_handler_remove(PIN_HALL);
        }
    }
}
