// SpeedSense: Speed Estimator
//
// Converts the interval between two Hall pulses into a speed, and decays the
// estimate toward zero when pulses stop arriving.  All arithmetic is integer
// so `on_pulse` can run inside the GPIO ISR.

use core::fmt::Write as _;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::config::*;

/// Newline-terminated ASCII reading, e.g. `"12.34\n"`.
pub type SpeedMessage = heapless::String<16>;

// ---------------------------------------------------------------------------
// Speed sample (fixed-point, hundredths of km/h)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeedSample {
    centi_kmh: u32,
}

impl SpeedSample {
    pub const ZERO: Self = Self { centi_kmh: 0 };

    /// `circumference / (dt / 1000) * 3.6`, truncated to hundredths.
    ///
    /// With the circumference in µm this reduces to `c_um * 36 / (100 * dt)`.
    pub fn from_interval(circumference_um: u32, dt_ms: u32) -> Self {
        let dt_ms = dt_ms.max(1) as u64;
        let centi = circumference_um as u64 * 36 / (100 * dt_ms);
        Self {
            centi_kmh: centi.min(u32::MAX as u64) as u32,
        }
    }

    pub fn from_centi_kmh(centi_kmh: u32) -> Self {
        Self { centi_kmh }
    }

    pub fn centi_kmh(&self) -> u32 {
        self.centi_kmh
    }

    pub fn kmh(&self) -> f32 {
        self.centi_kmh as f32 / 100.0
    }

    /// Speeds under the floor read as standstill.
    pub fn reported(&self) -> Self {
        if self.centi_kmh < SPEED_FLOOR_CENTI_KMH {
            Self::ZERO
        } else {
            *self
        }
    }

    /// Wire form of the reported value.
    pub fn to_message(&self) -> SpeedMessage {
        let centi = self.reported().centi_kmh;
        let mut msg = SpeedMessage::new();
        // 10 digits + '.' + 2 digits + '\n' always fits in 16 bytes.
        let _ = write!(msg, "{}.{:02}\n", centi / 100, centi % 100);
        msg
    }
}

// ---------------------------------------------------------------------------
// Estimator state
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedEstimator {
    circumference_um: u32,
    last_pulse_ms: u32,
    last_interval_ms: u32,
}

/// Signed difference of two wrapping millisecond timestamps.
pub fn ticks_diff(now: u32, earlier: u32) -> i32 {
    now.wrapping_sub(earlier) as i32
}

impl SpeedEstimator {
    pub fn new(circumference_um: u32, now_ms: u32) -> Self {
        Self {
            circumference_um,
            last_pulse_ms: now_ms,
            last_interval_ms: INITIAL_INTERVAL_MS,
        }
    }

    pub fn last_pulse_ms(&self) -> u32 {
        self.last_pulse_ms
    }

    pub fn last_interval_ms(&self) -> u32 {
        self.last_interval_ms
    }

    /// Record a wheel revolution at `now_ms`.
    ///
    /// A zero or negative interval (same millisecond, or a timestamp that went
    /// backwards) is clamped to 1 ms.  Very short positive intervals are not
    /// filtered.
    pub fn on_pulse(&mut self, now_ms: u32) -> SpeedSample {
        let dt = ticks_diff(now_ms, self.last_pulse_ms).max(1) as u32;
        self.last_pulse_ms = now_ms;
        self.last_interval_ms = dt;
        SpeedSample::from_interval(self.circumference_um, dt)
    }

    /// Periodic staleness check.
    ///
    /// Once the time since the last pulse exceeds the last observed interval,
    /// the wheel must be turning slower than that interval implies, so the
    /// elapsed time itself bounds the speed from above.  Elapsed time is
    /// always forward, so it stays valid across any number of timer wraps.
    pub fn on_sweep(&self, now_ms: u32) -> Option<SpeedSample> {
        let elapsed = now_ms.wrapping_sub(self.last_pulse_ms);
        // A pulse stamped just after `now_ms` was read shows up as a near-full
        // wrap; treat it as fresh.
        let ahead = elapsed.wrapping_neg();
        if elapsed <= self.last_interval_ms || ahead <= self.last_interval_ms {
            return None;
        }
        Some(SpeedSample::from_interval(self.circumference_um, elapsed))
    }
}

// ---------------------------------------------------------------------------
// ISR-shared estimator
// ---------------------------------------------------------------------------

/// Estimator shared between the Hall ISR and the main loop, without locks.
///
/// The ISR is the only writer once the sensor is armed.  Writers bump `seq`
/// to odd before touching the fields and back to even afterwards; readers
/// retry until they see the same even value on both sides of their loads.
pub struct SharedEstimator {
    seq: AtomicU32,
    /// Zero until [`init`](Self::init).
    circumference_um: AtomicU32,
    last_pulse_ms: AtomicU32,
    last_interval_ms: AtomicU32,
}

impl SharedEstimator {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            circumference_um: AtomicU32::new(0),
            last_pulse_ms: AtomicU32::new(0),
            last_interval_ms: AtomicU32::new(0),
        }
    }

    pub fn init(&self, estimator: SpeedEstimator) {
        self.store(&estimator);
    }

    /// `None` until [`init`](Self::init) has run.  Lock-free; ISR-safe.
    pub fn on_pulse(&self, now_ms: u32) -> Option<SpeedSample> {
        let mut est = self.snapshot()?;
        let sample = est.on_pulse(now_ms);
        self.store(&est);
        Some(sample)
    }

    pub fn on_sweep(&self, now_ms: u32) -> Option<SpeedSample> {
        self.snapshot()?.on_sweep(now_ms)
    }

    pub fn snapshot(&self) -> Option<SpeedEstimator> {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let est = SpeedEstimator {
                    circumference_um: self.circumference_um.load(Ordering::Relaxed),
                    last_pulse_ms: self.last_pulse_ms.load(Ordering::Relaxed),
                    last_interval_ms: self.last_interval_ms.load(Ordering::Relaxed),
                };
                fence(Ordering::Acquire);
                if self.seq.load(Ordering::Relaxed) == before {
                    return (est.circumference_um != 0).then_some(est);
                }
            }
            core::hint::spin_loop();
        }
    }

    fn store(&self, est: &SpeedEstimator) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.circumference_um.store(est.circumference_um, Ordering::Relaxed);
        self.last_pulse_ms.store(est.last_pulse_ms, Ordering::Relaxed);
        self.last_interval_ms.store(est.last_interval_ms, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}

impl Default for SharedEstimator {
    fn default() -> Self {
        Self::new()
    }
}
