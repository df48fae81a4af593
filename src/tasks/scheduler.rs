// SpeedSense: Main Scheduler Loop
//
// The single control thread.  Each tick:
//   1. runs an advertising cycle if one was requested,
//   2. drains jobs deferred by the Hall ISR and the BLE callbacks,
//   3. every sweep interval, decays a stale speed estimate,
// then sleeps for the fixed tick so the radio and idle tasks get the CPU.

use std::sync::PoisonError;
use std::thread;

use crate::ble::advertising::Advertiser;
use crate::ble::uart::SharedService;
use crate::ble::BleStack;
use crate::config::{LoopTiming, JOB_QUEUE_DEPTH};
use crate::deferred::{AdvertiseRequest, JobQueue};
use crate::events::Job;
use crate::speed::{ticks_diff, SharedEstimator, SpeedSample};

/// State the loop shares with interrupt and BLE-callback context.
#[derive(Clone, Copy)]
pub struct Shared<'a, const N: usize = JOB_QUEUE_DEPTH> {
    pub service: &'a SharedService,
    pub estimator: &'a SharedEstimator,
    pub jobs: &'a JobQueue<N>,
    pub advertise: &'a AdvertiseRequest,
}

pub struct Scheduler<'a, S: BleStack, const N: usize = JOB_QUEUE_DEPTH> {
    stack: S,
    advertiser: Advertiser,
    shared: Shared<'a, N>,
    timing: LoopTiming,
    last_sweep_ms: u32,
}

impl<'a, S: BleStack, const N: usize> Scheduler<'a, S, N> {
    pub fn new(stack: S, advertiser: Advertiser, shared: Shared<'a, N>, timing: LoopTiming, now_ms: u32) -> Self {
        Self {
            stack,
            advertiser,
            shared,
            timing,
            last_sweep_ms: now_ms,
        }
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn advertiser(&self) -> &Advertiser {
        &self.advertiser
    }

    /// One pass of the loop body, without the trailing sleep.
    pub fn tick(&mut self, now_ms: u32) {
        if self.shared.advertise.take() {
            self.advertiser.restart(&mut self.stack, self.timing.advertise_settle);
        }

        while let Some(job) = self.shared.jobs.pop() {
            match job {
                Job::SendSpeed(sample) => self.send_speed(sample),
                Job::RequestAdvertise => self.shared.advertise.request(),
            }
        }

        let dropped = self.shared.jobs.take_dropped();
        if dropped > 0 {
            log::warn!("Deferred queue full, {} job(s) dropped", dropped);
        }

        if ticks_diff(now_ms, self.last_sweep_ms) >= self.timing.sweep_interval_ms as i32 {
            self.last_sweep_ms = now_ms;
            // Already outside interrupt context, so deliver directly.
            if let Some(sample) = self.shared.estimator.on_sweep(now_ms) {
                self.send_speed(sample);
            }
        }
    }

    /// Never returns; `now_ms` supplies the monotonic clock.
    pub fn run(mut self, now_ms: impl Fn() -> u32) -> ! {
        log::info!("Scheduler started (tick {:?})", self.timing.tick);
        loop {
            self.tick(now_ms());
            thread::sleep(self.timing.tick);
        }
    }

    fn send_speed(&mut self, sample: SpeedSample) {
        let msg = sample.to_message();
        let guard = self.shared.service.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(service) = guard.as_ref() {
            if !service.connections().is_empty() {
                service.send(&mut self.stack, &msg);
            }
        }
        log::info!("Speed sent: {}", msg.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::ble::advertising::AdvertisingState;
    use crate::ble::uart::UartService;
    use crate::ble::ServiceUuid;
    use crate::config::{DEVICE_NAME, UART_SERVICE_UUID};
    use crate::events::{AttrHandle, ConnHandle, GattEvent};
    use crate::speed::SpeedEstimator;

    const C_UM: u32 = 2_194_401;

    #[derive(Default)]
    struct Radio {
        notified: Vec<(ConnHandle, String)>,
        adv_starts: usize,
    }

    impl BleStack for Radio {
        type Error = &'static str;

        fn notify(&mut self, conn: ConnHandle, _: AttrHandle, data: &[u8]) -> Result<(), Self::Error> {
            self.notified.push((conn, String::from_utf8_lossy(data).into_owned()));
            Ok(())
        }

        fn stop_advertising(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn start_advertising(&mut self, _: &[u8], _: Option<&[u8]>) -> Result<(), Self::Error> {
            self.adv_starts += 1;
            Ok(())
        }
    }

    struct Fixture {
        service: SharedService,
        estimator: SharedEstimator,
        jobs: JobQueue<8>,
        advertise: AdvertiseRequest,
    }

    impl Fixture {
        fn new() -> Self {
            let advertise = AdvertiseRequest::new();
            let service = UartService::new(1, 2, &advertise);
            let estimator = SharedEstimator::new();
            estimator.init(SpeedEstimator::new(C_UM, 0));
            Self {
                service: Mutex::new(Some(service)),
                estimator,
                jobs: JobQueue::new(),
                advertise,
            }
        }

        fn scheduler(&self) -> Scheduler<'_, Radio, 8> {
            let advertiser = Advertiser::new(DEVICE_NAME, ServiceUuid::Uuid128(UART_SERVICE_UUID)).unwrap();
            let timing = LoopTiming {
                tick: Duration::ZERO,
                advertise_settle: Duration::ZERO,
                ..LoopTiming::default()
            };
            let shared = Shared {
                service: &self.service,
                estimator: &self.estimator,
                jobs: &self.jobs,
                advertise: &self.advertise,
            };
            Scheduler::new(Radio::default(), advertiser, shared, timing, 0)
        }

        fn event(&self, event: GattEvent<'_>) {
            self.service
                .lock()
                .unwrap()
                .as_mut()
                .unwrap()
                .handle_event(event, &self.jobs, &self.advertise);
        }
    }

    #[test]
    fn first_tick_starts_advertising() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler();
        sched.tick(0);
        assert_eq!(sched.stack().adv_starts, 1);
        assert_eq!(sched.advertiser().state(), AdvertisingState::Advertising);

        sched.tick(50);
        assert_eq!(sched.stack().adv_starts, 1);
    }

    #[test]
    fn deferred_speed_reaches_peers() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler();
        fx.event(GattEvent::Connect(7));

        let sample = fx.estimator.on_pulse(250).unwrap();
        fx.jobs.defer(Job::SendSpeed(sample));
        sched.tick(260);

        assert_eq!(sched.stack().notified, vec![(7, "31.59\n".to_string())]);
    }

    #[test]
    fn sweep_waits_for_its_interval() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler();
        fx.event(GattEvent::Connect(7));
        fx.estimator.on_pulse(100);

        // Stale after 100 ms, but the sweep only runs every 500 ms.
        sched.tick(300);
        assert!(sched.stack().notified.is_empty());

        sched.tick(500);
        assert_eq!(sched.stack().notified.len(), 1);
    }

    #[test]
    fn disconnect_readvertises_on_following_tick() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler();
        sched.tick(0);
        fx.event(GattEvent::Connect(3));
        fx.event(GattEvent::Disconnect(3));
        fx.event(GattEvent::Disconnect(3));

        // Drains the two requests into a single pending flag.
        sched.tick(50);
        assert!(fx.advertise.is_pending());
        assert_eq!(sched.stack().adv_starts, 1);

        sched.tick(100);
        assert_eq!(sched.stack().adv_starts, 2);
        sched.tick(150);
        assert_eq!(sched.stack().adv_starts, 2);
    }

    #[test]
    fn no_notify_without_connections() {
        let fx = Fixture::new();
        let mut sched = fx.scheduler();
        fx.jobs.defer(Job::SendSpeed(SpeedSample::from_centi_kmh(1234)));
        sched.tick(10);
        assert!(sched.stack().notified.is_empty());
        assert!(fx.jobs.is_empty());
    }
}
