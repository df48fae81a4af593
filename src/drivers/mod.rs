pub mod hall;

// ---------------------------------------------------------------------------
// Utility: milliseconds since boot (wraps at ~49 days, callers use ticks_diff)
// ---------------------------------------------------------------------------
pub fn now_ms() -> u32 {
    // esp_timer_get_time is ISR-safe.
    unsafe { (esp_idf_sys::esp_timer_get_time() / 1000) as u32 }
}
